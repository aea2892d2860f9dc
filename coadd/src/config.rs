//! Configuration for coadd assembly and the rejection strategies.
//!
//! Every struct deserializes with `#[serde(default)]`, so a JSON file only
//! needs to name the fields it changes. Defaults reproduce the settings the
//! survey pipeline runs with. `validate()` is called before any tile is
//! processed; a configuration error is the only class of error that aborts
//! an assembly up front.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::image_proc::detection::{DetectionConfig, Polarity, ThresholdType};
use shared::image_proc::mask::planes;
use shared::image_proc::MaskPlaneRegistry;
use shared::ImageSize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;
use crate::stack::{Statistic, StatsControl};

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn check_fraction(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        })
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        })
    }
}

/// Settings of the tiled assembler and the statistics stacker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssembleCoaddConfig {
    pub statistic: Statistic,
    pub sigma_clip: f64,
    pub clip_iter: usize,
    /// Propagate input variances rather than the sample scatter
    pub calc_error_from_input_variance: bool,
    /// Tile size the output patch is processed in
    pub subregion_size: ImageSize,
    /// Planes that exclude a pixel from the statistic
    pub bad_mask_planes: Vec<String>,
    /// Planes cleared from every input before stacking
    pub remove_mask_planes: Vec<String>,
    /// Rejected-weight fraction above which a plane still reaches the output
    pub mask_propagation_thresholds: BTreeMap<String, f64>,
    /// Interpolate over NO_DATA pixels of the finished coadd
    pub do_interp: bool,
    /// Also produce a per-pixel count of contributing epochs
    pub do_n_image: bool,
    /// Use NO_DATA overlay regions to clear bad bits first
    pub use_psf_matched_polygons: bool,
    /// Weight epochs by inverse mean variance
    pub weighted: bool,
}

impl Default for AssembleCoaddConfig {
    fn default() -> Self {
        Self {
            statistic: Statistic::MeanClip,
            sigma_clip: 3.0,
            clip_iter: 2,
            calc_error_from_input_variance: true,
            subregion_size: ImageSize::from_width_height(2000, 2000),
            bad_mask_planes: strings(&[planes::NO_DATA, planes::BAD, planes::SAT, planes::EDGE]),
            remove_mask_planes: strings(&["NOT_DEBLENDED"]),
            mask_propagation_thresholds: BTreeMap::from([(planes::SAT.to_string(), 0.1)]),
            do_interp: true,
            do_n_image: false,
            use_psf_matched_polygons: false,
            weighted: true,
        }
    }
}

impl AssembleCoaddConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("sigma_clip", self.sigma_clip)?;
        if self.subregion_size.is_empty() {
            return Err(ConfigError::EmptySubregion(self.subregion_size.to_string()));
        }
        for threshold in self.mask_propagation_thresholds.values() {
            check_fraction("mask_propagation_thresholds", *threshold)?;
        }
        if self.do_interp && self.statistic.is_variance() {
            return Err(ConfigError::InterpolationUnsupported(
                self.statistic.to_string(),
            ));
        }
        Ok(())
    }

    /// Bitmask of the bad planes, registering any that are new.
    pub fn bad_mask(&self, registry: &MaskPlaneRegistry) -> Result<u32, ConfigError> {
        Ok(registry.add_planes(&self.bad_mask_planes)?)
    }

    /// Bitmask of the planes removed from inputs before stacking.
    pub fn remove_mask(&self, registry: &MaskPlaneRegistry) -> Result<u32, ConfigError> {
        Ok(registry.add_planes(&self.remove_mask_planes)?)
    }

    pub fn stats_control(&self, registry: &MaskPlaneRegistry) -> Result<StatsControl, ConfigError> {
        let mask_propagation_thresholds = self
            .mask_propagation_thresholds
            .iter()
            .map(|(name, &threshold)| Ok((1u32 << registry.add_plane(name)?, threshold)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(StatsControl {
            and_mask: self.bad_mask(registry)?,
            sigma_clip: self.sigma_clip,
            clip_iter: self.clip_iter,
            mask_propagation_thresholds,
            weighted: self.weighted,
            calc_error_from_input_variance: self.calc_error_from_input_variance,
            no_data_bit: registry.plane_bit(planes::NO_DATA)?,
        })
    }

    /// Copy with `plane` added to the bad planes.
    pub fn with_bad_plane(&self, plane: &str) -> Self {
        let mut config = self.clone();
        if !config.bad_mask_planes.iter().any(|p| p == plane) {
            config.bad_mask_planes.push(plane.to_string());
        }
        config
    }

    /// Copy with a different statistic and clipping.
    pub fn with_statistic(&self, statistic: Statistic, sigma_clip: f64, clip_iter: usize) -> Self {
        Self {
            statistic,
            sigma_clip,
            clip_iter,
            ..self.clone()
        }
    }
}

/// Safe-Clip: clip regions that differ between a mean and a clipped-mean coadd
/// and are detected in only one or two epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeClipConfig {
    /// Settings of the final coadd; the statistic must be MEAN
    pub assemble: AssembleCoaddConfig,
    pub clip_detection: DetectionConfig,
    pub min_clip_foot_overlap: f64,
    pub min_clip_foot_overlap_single: f64,
    pub min_clip_foot_overlap_double: f64,
    pub max_clip_foot_overlap_double: f64,
    pub min_big_overlap: usize,
    /// Clipping of the clipped-mean coadd the mean coadd is compared against
    pub sigma_clip: f64,
    pub clip_iter: usize,
}

impl Default for SafeClipConfig {
    fn default() -> Self {
        Self {
            assemble: AssembleCoaddConfig {
                statistic: Statistic::Mean,
                ..Default::default()
            },
            clip_detection: DetectionConfig {
                threshold: 2.0,
                threshold_type: ThresholdType::PixelStdev,
                polarity: Polarity::Both,
                min_pixels: 4,
                n_grow: 2,
                smoothing_sigma: 1.0,
            },
            min_clip_foot_overlap: 0.6,
            min_clip_foot_overlap_single: 0.5,
            min_clip_foot_overlap_double: 0.45,
            max_clip_foot_overlap_double: 0.15,
            min_big_overlap: 100,
            sigma_clip: 1.5,
            clip_iter: 3,
        }
    }
}

impl SafeClipConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.assemble.validate()?;
        if self.assemble.statistic != Statistic::Mean {
            return Err(ConfigError::StatisticMismatch {
                strategy: "Safe-Clip",
                required: Statistic::Mean.to_string(),
                got: self.assemble.statistic.to_string(),
            });
        }
        self.clip_detection.validate()?;
        check_fraction("min_clip_foot_overlap", self.min_clip_foot_overlap)?;
        check_fraction("min_clip_foot_overlap_single", self.min_clip_foot_overlap_single)?;
        check_fraction("min_clip_foot_overlap_double", self.min_clip_foot_overlap_double)?;
        check_fraction("max_clip_foot_overlap_double", self.max_clip_foot_overlap_double)?;
        check_positive("sigma_clip", self.sigma_clip)?;
        Ok(())
    }
}

/// Compare-Warp: mask transient differences between PSF-matched epochs and a
/// static-sky template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareWarpConfig {
    /// Settings of the final coadd
    pub assemble: AssembleCoaddConfig,
    /// Settings of the PSF-matched static-sky template
    pub template: AssembleCoaddConfig,
    pub detect: DetectionConfig,
    pub detect_template: DetectionConfig,
    pub max_num_epochs: usize,
    pub max_fraction_epochs_low: f64,
    pub max_fraction_epochs_high: f64,
    pub spatial_threshold: f64,
    pub do_scale_warp_variance: bool,
    pub do_preserve_contained_by_source: bool,
    pub do_prefilter_artifacts: bool,
    pub prefilter_artifacts_mask_planes: Vec<String>,
    pub prefilter_artifacts_ratio: f64,
}

impl Default for CompareWarpConfig {
    fn default() -> Self {
        // PSF matching erodes the usable area, so EDGE is carried through
        // overlays instead of rejecting pixels outright.
        let assemble = AssembleCoaddConfig {
            statistic: Statistic::Mean,
            bad_mask_planes: strings(&[planes::NO_DATA, planes::BAD, planes::SAT]),
            remove_mask_planes: strings(&["NOT_DEBLENDED", planes::EDGE]),
            use_psf_matched_polygons: true,
            ..Default::default()
        };
        let template = AssembleCoaddConfig {
            statistic: Statistic::MeanClip,
            sigma_clip: 2.5,
            clip_iter: 3,
            calc_error_from_input_variance: false,
            bad_mask_planes: strings(&[planes::NO_DATA]),
            ..Default::default()
        };
        let detect = DetectionConfig {
            threshold: 5.0,
            threshold_type: ThresholdType::PixelStdev,
            polarity: Polarity::Both,
            min_pixels: 4,
            n_grow: 2,
            smoothing_sigma: 1.0,
        };
        let detect_template = DetectionConfig {
            polarity: Polarity::Positive,
            ..detect.clone()
        };
        Self {
            assemble,
            template,
            detect,
            detect_template,
            max_num_epochs: 2,
            max_fraction_epochs_low: 0.4,
            max_fraction_epochs_high: 0.03,
            spatial_threshold: 0.5,
            do_scale_warp_variance: true,
            do_preserve_contained_by_source: true,
            do_prefilter_artifacts: true,
            prefilter_artifacts_mask_planes: strings(&[
                planes::NO_DATA,
                planes::BAD,
                planes::SAT,
                planes::SUSPECT,
            ]),
            prefilter_artifacts_ratio: 0.05,
        }
    }
}

impl CompareWarpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.assemble.validate()?;
        if self.assemble.statistic != Statistic::Mean {
            return Err(ConfigError::StatisticMismatch {
                strategy: "Compare-Warp",
                required: Statistic::Mean.to_string(),
                got: self.assemble.statistic.to_string(),
            });
        }
        self.template.validate()?;
        self.detect.validate()?;
        self.detect_template.validate()?;
        check_fraction("max_fraction_epochs_low", self.max_fraction_epochs_low)?;
        check_fraction("max_fraction_epochs_high", self.max_fraction_epochs_high)?;
        check_fraction("spatial_threshold", self.spatial_threshold)?;
        check_fraction("prefilter_artifacts_ratio", self.prefilter_artifacts_ratio)?;
        Ok(())
    }
}

/// DCR: iterative forward modeling of per-sub-band models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcrConfig {
    /// Template and artifact rejection settings
    pub compare_warp: CompareWarpConfig,
    pub dcr_num_subbands: usize,
    pub max_num_iter: usize,
    pub min_num_iter: usize,
    pub convergence_threshold: f64,
    /// Restrict the convergence metric to these planes when any are present
    pub convergence_mask_planes: Vec<String>,
    /// A model update may change a pixel by at most this factor
    pub model_clamp_factor: f64,
    /// Sub-band models may differ from their mean by at most this factor
    pub clamp_frequency: f64,
    /// Noise floor of the clamps in units of the background scatter
    pub regularize_sigma: f64,
    pub use_gain: bool,
    pub min_gain: f64,
    pub max_gain: f64,
    pub use_airmass_weight: bool,
    /// Extra pixels around each tile to keep shifted flux in view
    pub buffer_size: usize,
    /// Effective wavelength of the filter in nm
    pub lambda_eff: f64,
    /// Filter width in nm; `None` means 20% of `lambda_eff`
    pub filter_width: Option<f64>,
    /// Arcseconds per pixel of the output grid
    pub pixel_scale: f64,
}

impl Default for DcrConfig {
    fn default() -> Self {
        Self {
            compare_warp: CompareWarpConfig::default(),
            dcr_num_subbands: 3,
            max_num_iter: 40,
            min_num_iter: 1,
            convergence_threshold: 0.001,
            convergence_mask_planes: strings(&[planes::DETECTED]),
            model_clamp_factor: 2.0,
            clamp_frequency: 4.0,
            regularize_sigma: 3.0,
            use_gain: true,
            min_gain: 0.5,
            max_gain: 2.0,
            use_airmass_weight: false,
            buffer_size: 5,
            lambda_eff: 478.0,
            filter_width: None,
            pixel_scale: 0.2,
        }
    }
}

impl DcrConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compare_warp.validate()?;
        if self.dcr_num_subbands == 0 {
            return Err(ConfigError::InvalidValue {
                name: "dcr_num_subbands",
                value: "0".to_string(),
            });
        }
        if self.min_num_iter > self.max_num_iter {
            return Err(ConfigError::InvalidValue {
                name: "min_num_iter",
                value: format!("{} > max_num_iter {}", self.min_num_iter, self.max_num_iter),
            });
        }
        check_positive("convergence_threshold", self.convergence_threshold)?;
        if !(self.model_clamp_factor >= 1.0) {
            return Err(ConfigError::InvalidValue {
                name: "model_clamp_factor",
                value: self.model_clamp_factor.to_string(),
            });
        }
        if self.clamp_frequency != 0.0 && !(self.clamp_frequency >= 1.0) {
            return Err(ConfigError::InvalidValue {
                name: "clamp_frequency",
                value: self.clamp_frequency.to_string(),
            });
        }
        if !(self.regularize_sigma >= 0.0) {
            return Err(ConfigError::InvalidValue {
                name: "regularize_sigma",
                value: self.regularize_sigma.to_string(),
            });
        }
        check_positive("min_gain", self.min_gain)?;
        check_positive("max_gain", self.max_gain)?;
        if self.min_gain > self.max_gain {
            return Err(ConfigError::InvalidValue {
                name: "min_gain",
                value: format!("{} > max_gain {}", self.min_gain, self.max_gain),
            });
        }
        check_positive("lambda_eff", self.lambda_eff)?;
        check_positive("filter_width", self.filter_width())?;
        check_positive("pixel_scale", self.pixel_scale)?;
        Ok(())
    }

    pub fn filter_width(&self) -> f64 {
        self.filter_width.unwrap_or(0.2 * self.lambda_eff)
    }
}

/// Load any configuration struct from a JSON file.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        assert!(AssembleCoaddConfig::default().validate().is_ok());
        assert!(SafeClipConfig::default().validate().is_ok());
        assert!(CompareWarpConfig::default().validate().is_ok());
        assert!(DcrConfig::default().validate().is_ok());
    }

    #[test]
    fn test_safe_clip_requires_mean() {
        let mut config = SafeClipConfig::default();
        config.assemble.statistic = Statistic::Median;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StatisticMismatch { .. })
        ));
    }

    #[test]
    fn test_interpolation_with_variance_statistic_is_rejected() {
        let config = AssembleCoaddConfig {
            statistic: Statistic::Variance,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InterpolationUnsupported("VARIANCE".to_string()))
        );
        let config = AssembleCoaddConfig {
            do_interp: false,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_subregion_is_rejected() {
        let config = AssembleCoaddConfig {
            subregion_size: ImageSize::from_width_height(0, 100),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptySubregion(_))
        ));
    }

    #[test]
    fn test_compare_warp_moves_edge_to_removed_planes() {
        let config = CompareWarpConfig::default();
        assert!(!config.assemble.bad_mask_planes.contains(&"EDGE".to_string()));
        assert!(config.assemble.remove_mask_planes.contains(&"EDGE".to_string()));
    }

    #[test]
    fn test_stats_control_registers_planes() {
        let registry = MaskPlaneRegistry::new();
        let config = AssembleCoaddConfig::default().with_bad_plane("CLIPPED");
        let ctrl = config.stats_control(&registry).unwrap();
        let clipped = registry.plane_bit("CLIPPED").unwrap();
        assert_ne!(ctrl.and_mask & clipped, 0);
        assert_eq!(
            ctrl.mask_propagation_thresholds,
            vec![(registry.plane_bit("SAT").unwrap(), 0.1)]
        );
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"statistic": "meanclip", "subregion_size": {{"width": 64, "height": 32}}}}"#
        )
        .unwrap();
        let config: AssembleCoaddConfig = load_config(file.path()).unwrap();
        assert_eq!(config.statistic, Statistic::MeanClip);
        assert_eq!(config.subregion_size, ImageSize::from_width_height(64, 32));
        assert_eq!(config.clip_iter, 2);
    }

    #[test]
    fn test_unknown_statistic_in_json() {
        let err = serde_json::from_str::<AssembleCoaddConfig>(r#"{"statistic": "ORMASK"}"#);
        assert!(err.is_err());
    }
}
