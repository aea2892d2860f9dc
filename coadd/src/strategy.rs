//! The common interface of the coadd strategies and configuration dispatch.
//!
//! Every strategy runs in two phases: supplementary data that needs the whole
//! patch (templates, clip regions) is built first, then the coadd itself is
//! assembled from it.

use log::info;
use serde::{Deserialize, Serialize};
use shared::image_proc::{MaskPlaneRegistry, AABB};

use crate::assemble::{assemble_coadd, CoaddResult};
use crate::compare_warp::{CompareWarpAssembler, CompareWarpSupplementary};
use crate::config::{AssembleCoaddConfig, CompareWarpConfig, DcrConfig, SafeClipConfig};
use crate::dcr::{DcrAssembler, DcrCoadds, DcrSupplementary};
use crate::epoch::{prepare_inputs, EpochSource, PreparedInputs, WarpType};
use crate::error::{CoaddError, ConfigError};
use crate::safe_clip::SafeClipAssembler;

/// A way of turning prepared epochs into coadds.
pub trait CoaddStrategy {
    /// Data computed once per patch before assembly
    type Supplementary;
    type Output;

    fn name(&self) -> &'static str;

    /// Settings used to weight the inputs and build the final coadd.
    fn assemble_config(&self) -> &AssembleCoaddConfig;

    fn make_supplementary_data(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
    ) -> Result<Self::Supplementary, CoaddError>;

    fn assemble(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
        supplementary: &Self::Supplementary,
    ) -> Result<Self::Output, CoaddError>;

    /// Weight the inputs, build the supplementary data and assemble.
    fn run(
        &self,
        source: &dyn EpochSource,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
    ) -> Result<Self::Output, CoaddError> {
        let inputs = prepare_inputs(source, self.assemble_config(), registry, WarpType::Direct)?;
        info!(
            "{}: assembling {bbox} from {} of {} epochs",
            self.name(),
            inputs.len(),
            source.len()
        );
        let supplementary = self.make_supplementary_data(source, &inputs, bbox, registry)?;
        CoaddStrategy::assemble(self, source, &inputs, bbox, registry, &supplementary)
    }
}

/// Plain statistic stacking without artifact rejection.
#[derive(Debug, Clone)]
pub struct BaseAssembler {
    config: AssembleCoaddConfig,
}

impl BaseAssembler {
    pub fn new(config: AssembleCoaddConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl CoaddStrategy for BaseAssembler {
    type Supplementary = ();
    type Output = CoaddResult;

    fn name(&self) -> &'static str {
        "Base"
    }

    fn assemble_config(&self) -> &AssembleCoaddConfig {
        &self.config
    }

    fn make_supplementary_data(
        &self,
        _source: &dyn EpochSource,
        _inputs: &PreparedInputs,
        _bbox: &AABB,
        _registry: &MaskPlaneRegistry,
    ) -> Result<(), CoaddError> {
        Ok(())
    }

    fn assemble(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
        _supplementary: &(),
    ) -> Result<CoaddResult, CoaddError> {
        assemble_coadd(source, inputs, bbox, &self.config, registry, None, WarpType::Direct)
    }
}

impl CoaddStrategy for SafeClipAssembler {
    type Supplementary = ();
    type Output = CoaddResult;

    fn name(&self) -> &'static str {
        "Safe-Clip"
    }

    fn assemble_config(&self) -> &AssembleCoaddConfig {
        &self.config().assemble
    }

    fn make_supplementary_data(
        &self,
        _source: &dyn EpochSource,
        _inputs: &PreparedInputs,
        _bbox: &AABB,
        _registry: &MaskPlaneRegistry,
    ) -> Result<(), CoaddError> {
        Ok(())
    }

    fn assemble(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
        _supplementary: &(),
    ) -> Result<CoaddResult, CoaddError> {
        SafeClipAssembler::assemble(self, source, inputs, bbox, registry)
    }
}

impl CoaddStrategy for CompareWarpAssembler {
    type Supplementary = CompareWarpSupplementary;
    type Output = CoaddResult;

    fn name(&self) -> &'static str {
        "Compare-Warp"
    }

    fn assemble_config(&self) -> &AssembleCoaddConfig {
        &self.config().assemble
    }

    fn make_supplementary_data(
        &self,
        source: &dyn EpochSource,
        _inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
    ) -> Result<CompareWarpSupplementary, CoaddError> {
        CompareWarpAssembler::make_supplementary_data(self, source, bbox, registry)
    }

    fn assemble(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
        supplementary: &CompareWarpSupplementary,
    ) -> Result<CoaddResult, CoaddError> {
        CompareWarpAssembler::assemble(self, source, inputs, bbox, registry, supplementary)
    }
}

impl CoaddStrategy for DcrAssembler {
    type Supplementary = DcrSupplementary;
    type Output = DcrCoadds;

    fn name(&self) -> &'static str {
        "DCR"
    }

    fn assemble_config(&self) -> &AssembleCoaddConfig {
        &self.config().compare_warp.assemble
    }

    fn make_supplementary_data(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
    ) -> Result<DcrSupplementary, CoaddError> {
        DcrAssembler::make_supplementary_data(self, source, inputs, bbox, registry)
    }

    fn assemble(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
        supplementary: &DcrSupplementary,
    ) -> Result<DcrCoadds, CoaddError> {
        DcrAssembler::assemble(self, source, inputs, bbox, registry, supplementary)
    }
}

/// Result of any strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum CoaddOutput {
    Single(CoaddResult),
    Dcr(DcrCoadds),
}

impl CoaddOutput {
    /// Every coadd produced, in sub-band order for DCR.
    pub fn coadds(&self) -> Vec<&CoaddResult> {
        match self {
            CoaddOutput::Single(result) => vec![result],
            CoaddOutput::Dcr(coadds) => coadds.iter().collect(),
        }
    }
}

/// A strategy and its configuration, as read from a configuration file.
///
/// ```json
/// { "method": "compare_warp", "max_num_epochs": 3 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AssemblyMethod {
    Base(AssembleCoaddConfig),
    SafeClip(SafeClipConfig),
    CompareWarp(CompareWarpConfig),
    Dcr(DcrConfig),
}

impl Default for AssemblyMethod {
    fn default() -> Self {
        AssemblyMethod::Base(AssembleCoaddConfig::default())
    }
}

impl AssemblyMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AssemblyMethod::Base(_) => "base",
            AssemblyMethod::SafeClip(_) => "safe_clip",
            AssemblyMethod::CompareWarp(_) => "compare_warp",
            AssemblyMethod::Dcr(_) => "dcr",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            AssemblyMethod::Base(config) => config.validate(),
            AssemblyMethod::SafeClip(config) => config.validate(),
            AssemblyMethod::CompareWarp(config) => config.validate(),
            AssemblyMethod::Dcr(config) => config.validate(),
        }
    }

    /// Build the configured strategy and run it over `bbox`.
    pub fn run(
        &self,
        source: &dyn EpochSource,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
    ) -> Result<CoaddOutput, CoaddError> {
        match self {
            AssemblyMethod::Base(config) => BaseAssembler::new(config.clone())?
                .run(source, bbox, registry)
                .map(CoaddOutput::Single),
            AssemblyMethod::SafeClip(config) => SafeClipAssembler::new(config.clone())?
                .run(source, bbox, registry)
                .map(CoaddOutput::Single),
            AssemblyMethod::CompareWarp(config) => CompareWarpAssembler::new(config.clone())?
                .run(source, bbox, registry)
                .map(CoaddOutput::Single),
            AssemblyMethod::Dcr(config) => DcrAssembler::new(config.clone())?
                .run(source, bbox, registry)
                .map(CoaddOutput::Dcr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Statistic;

    #[test]
    fn test_method_from_json() {
        let method: AssemblyMethod =
            serde_json::from_str(r#"{"method": "compare_warp", "max_num_epochs": 3}"#).unwrap();
        match &method {
            AssemblyMethod::CompareWarp(config) => {
                assert_eq!(config.max_num_epochs, 3);
                assert_eq!(config.assemble.statistic, Statistic::Mean);
            }
            other => panic!("unexpected method {}", other.name()),
        }
        assert!(method.validate().is_ok());

        let method: AssemblyMethod = serde_json::from_str(r#"{"method": "dcr"}"#).unwrap();
        assert_eq!(method.name(), "dcr");
    }

    #[test]
    fn test_method_round_trip_keeps_tag() {
        let json = serde_json::to_string(&AssemblyMethod::default()).unwrap();
        assert!(json.contains(r#""method":"base""#));
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert!(serde_json::from_str::<AssemblyMethod>(r#"{"method": "median_only"}"#).is_err());
    }

    #[test]
    fn test_invalid_safe_clip_statistic() {
        let mut config = SafeClipConfig::default();
        config.assemble.statistic = Statistic::Median;
        assert!(AssemblyMethod::SafeClip(config).validate().is_err());
    }
}
