//! Input epochs: warped images of one patch and their observing conditions.
//!
//! Epochs are reached through the [`EpochSource`] trait so the assembler only
//! ever asks for windows of a warp. [`InMemoryEpochs`] keeps every warp in
//! memory, which is what the tests and the synthetic driver use.

use log::{info, warn};
use ndarray::Zip;
use serde::{Deserialize, Serialize};
use shared::algo::clipped_mean;
use shared::image_proc::{MaskPlaneRegistry, MaskedImage, AABB};
use std::fmt;

use crate::config::AssembleCoaddConfig;
use crate::error::CoaddError;

/// Identifier of one epoch (a visit warped onto the patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpochId(pub u64);

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which warp of an epoch to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarpType {
    /// Warp at the native PSF of the visit
    Direct,
    /// Warp convolved to a common PSF
    PsfMatched,
}

impl WarpType {
    pub fn name(&self) -> &'static str {
        match self {
            WarpType::Direct => "direct",
            WarpType::PsfMatched => "psf-matched",
        }
    }
}

impl fmt::Display for WarpType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Site weather at the time of a visit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub temperature_c: f64,
    pub pressure_hpa: f64,
    /// Relative humidity in percent
    pub humidity_pct: f64,
}

impl Default for Weather {
    fn default() -> Self {
        Self {
            temperature_c: 10.0,
            pressure_hpa: 744.0,
            humidity_pct: 40.0,
        }
    }
}

/// Pointing and conditions of a visit, as needed to model refraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisitInfo {
    /// Boresight elevation above the horizon in degrees
    pub elevation_deg: f64,
    /// Boresight parallactic angle in degrees
    pub parallactic_angle_deg: f64,
    /// Rotation of the instrument relative to the sky in degrees
    pub rotator_angle_deg: f64,
    pub weather: Weather,
}

impl VisitInfo {
    /// A visit at the zenith, where refraction vanishes.
    pub fn zenith() -> Self {
        Self {
            elevation_deg: 90.0,
            parallactic_angle_deg: 0.0,
            rotator_angle_deg: 0.0,
            weather: Weather::default(),
        }
    }

    pub fn zenith_distance_deg(&self) -> f64 {
        90.0 - self.elevation_deg
    }

    /// Plane-parallel airmass, `sec(z)`.
    pub fn airmass(&self) -> f64 {
        1.0 / self.zenith_distance_deg().to_radians().cos()
    }

    /// Angle of the refraction vector on the pixel grid in radians.
    pub fn rotation_rad(&self) -> f64 {
        (self.parallactic_angle_deg + self.rotator_angle_deg).to_radians()
    }
}

/// One epoch held in memory.
#[derive(Debug, Clone)]
pub struct Epoch {
    pub id: EpochId,
    pub direct: MaskedImage,
    pub psf_matched: Option<MaskedImage>,
    /// Photometric scale applied on read: image × s, variance × s²
    pub scale: f64,
    pub visit_info: Option<VisitInfo>,
}

impl Epoch {
    pub fn new(id: EpochId, direct: MaskedImage) -> Self {
        Self {
            id,
            direct,
            psf_matched: None,
            scale: 1.0,
            visit_info: None,
        }
    }

    pub fn with_psf_matched(mut self, warp: MaskedImage) -> Self {
        self.psf_matched = Some(warp);
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_visit_info(mut self, visit_info: VisitInfo) -> Self {
        self.visit_info = Some(visit_info);
        self
    }

    fn warp(&self, warp: WarpType) -> Option<&MaskedImage> {
        match warp {
            WarpType::Direct => Some(&self.direct),
            WarpType::PsfMatched => self.psf_matched.as_ref(),
        }
    }
}

/// Read access to the epochs of one patch.
///
/// Indices run over `0..len()`. Reads return photometrically scaled copies,
/// so callers are free to edit masks in place.
pub trait EpochSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn epoch_id(&self, index: usize) -> Result<EpochId, CoaddError>;

    fn has_warp(&self, index: usize, warp: WarpType) -> bool;

    /// Region covered by the given warp.
    fn bbox(&self, index: usize, warp: WarpType) -> Result<AABB, CoaddError>;

    /// Scaled copy of `bbox` from the given warp.
    fn read(&self, index: usize, bbox: &AABB, warp: WarpType) -> Result<MaskedImage, CoaddError>;

    fn visit_info(&self, index: usize) -> Option<VisitInfo>;

    fn filter_name(&self) -> &str;
}

/// Epochs of one filter held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryEpochs {
    filter: String,
    epochs: Vec<Epoch>,
}

impl InMemoryEpochs {
    pub fn new(filter: impl Into<String>, epochs: Vec<Epoch>) -> Self {
        Self {
            filter: filter.into(),
            epochs,
        }
    }

    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    fn epoch(&self, index: usize) -> Result<&Epoch, CoaddError> {
        self.epochs.get(index).ok_or(CoaddError::EpochIndex(index))
    }

    fn warp(&self, index: usize, warp: WarpType) -> Result<&MaskedImage, CoaddError> {
        let epoch = self.epoch(index)?;
        epoch
            .warp(warp)
            .ok_or(CoaddError::MissingWarp(epoch.id, warp.name()))
    }
}

impl EpochSource for InMemoryEpochs {
    fn len(&self) -> usize {
        self.epochs.len()
    }

    fn epoch_id(&self, index: usize) -> Result<EpochId, CoaddError> {
        Ok(self.epoch(index)?.id)
    }

    fn has_warp(&self, index: usize, warp: WarpType) -> bool {
        self.epochs
            .get(index)
            .is_some_and(|e| e.warp(warp).is_some())
    }

    fn bbox(&self, index: usize, warp: WarpType) -> Result<AABB, CoaddError> {
        Ok(self.warp(index, warp)?.bbox)
    }

    fn read(&self, index: usize, bbox: &AABB, warp: WarpType) -> Result<MaskedImage, CoaddError> {
        let mut image = self.warp(index, warp)?.subimage(bbox)?;
        let scale = self.epoch(index)?.scale;
        if scale != 1.0 {
            image.scale(scale);
        }
        Ok(image)
    }

    fn visit_info(&self, index: usize) -> Option<VisitInfo> {
        self.epochs.get(index).and_then(|e| e.visit_info)
    }

    fn filter_name(&self) -> &str {
        &self.filter
    }
}

/// Epochs that survived input preparation, with their coadd weights.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInputs {
    /// Source indices of the surviving epochs
    pub indices: Vec<usize>,
    pub ids: Vec<EpochId>,
    pub weights: Vec<f64>,
}

impl PreparedInputs {
    /// Every epoch of `source` with unit weight.
    pub fn uniform(source: &dyn EpochSource) -> Result<Self, CoaddError> {
        let indices: Vec<usize> = (0..source.len()).collect();
        let ids = indices
            .iter()
            .map(|&i| source.epoch_id(i))
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Err(CoaddError::NoInputs);
        }
        Ok(Self {
            weights: vec![1.0; ids.len()],
            indices,
            ids,
        })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

fn epoch_weight(
    source: &dyn EpochSource,
    index: usize,
    config: &AssembleCoaddConfig,
    bad_mask: u32,
    warp: WarpType,
) -> Result<f64, CoaddError> {
    let bbox = source.bbox(index, warp)?;
    let image = source.read(index, &bbox, warp)?;
    let good: Vec<f64> = Zip::from(&image.image)
        .and(&image.variance)
        .and(&image.mask)
        .fold(Vec::new(), |mut acc, &value, &var, &mask| {
            if mask & bad_mask == 0 && value.is_finite() && var.is_finite() {
                acc.push(var);
            }
            acc
        });
    let stats = clipped_mean(&good, config.sigma_clip, config.clip_iter)?;
    Ok(1.0 / stats.mean)
}

/// Compute inverse mean-variance weights for every readable epoch.
///
/// Epochs that cannot be read or produce a non-finite weight are dropped with
/// a warning; only an empty result is an error.
pub fn prepare_inputs(
    source: &dyn EpochSource,
    config: &AssembleCoaddConfig,
    registry: &MaskPlaneRegistry,
    warp: WarpType,
) -> Result<PreparedInputs, CoaddError> {
    let bad_mask = config.bad_mask(registry)?;
    let mut inputs = PreparedInputs {
        indices: Vec::new(),
        ids: Vec::new(),
        weights: Vec::new(),
    };

    for index in 0..source.len() {
        let id = match source.epoch_id(index) {
            Ok(id) => id,
            Err(e) => {
                warn!("Skipping epoch at index {index}: {e}");
                continue;
            }
        };
        match epoch_weight(source, index, config, bad_mask, warp) {
            Ok(weight) if weight.is_finite() && weight > 0.0 => {
                info!("Weight of {warp} warp {id} = {weight:.3}");
                inputs.indices.push(index);
                inputs.ids.push(id);
                inputs.weights.push(weight);
            }
            Ok(weight) => warn!("Non-finite weight {weight} for {warp} warp {id}; skipping it"),
            Err(e) => warn!("Error preparing {warp} warp {id}; skipping it: {e}"),
        }
    }

    if inputs.is_empty() {
        return Err(CoaddError::NoInputs);
    }
    info!("Found {} usable {warp} warps", inputs.len());
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use shared::test_util::flat_image;

    fn bbox() -> AABB {
        AABB::from_origin_size(10, 20, 8, 6)
    }

    #[test]
    fn test_read_applies_scale() {
        let epoch = Epoch::new(EpochId(1), flat_image(bbox(), 4.0, 2.0)).with_scale(3.0);
        let source = InMemoryEpochs::new("g", vec![epoch]);
        let window = AABB::from_origin_size(12, 21, 2, 2);
        let image = source.read(0, &window, WarpType::Direct).unwrap();
        assert_eq!(image.bbox, window);
        assert_relative_eq!(image.image[[0, 0]], 12.0);
        assert_relative_eq!(image.variance[[1, 1]], 18.0);
    }

    #[test]
    fn test_missing_psf_matched_warp() {
        let source = InMemoryEpochs::new("g", vec![Epoch::new(EpochId(7), flat_image(bbox(), 0.0, 1.0))]);
        assert!(!source.has_warp(0, WarpType::PsfMatched));
        assert_eq!(
            source.read(0, &bbox(), WarpType::PsfMatched),
            Err(CoaddError::MissingWarp(EpochId(7), "psf-matched"))
        );
        assert_eq!(source.epoch_id(3), Err(CoaddError::EpochIndex(3)));
    }

    #[test]
    fn test_prepare_inputs_weights_and_drops() {
        let registry = MaskPlaneRegistry::new();
        let no_data = registry.plane_bit("NO_DATA").unwrap();
        let epochs = vec![
            Epoch::new(EpochId(1), flat_image(bbox(), 1.0, 4.0)),
            Epoch::new(EpochId(2), MaskedImage::filled(bbox(), 1.0, 4.0, no_data)),
            Epoch::new(EpochId(3), flat_image(bbox(), 1.0, 0.5)),
        ];
        let source = InMemoryEpochs::new("r", epochs);
        let inputs = prepare_inputs(
            &source,
            &AssembleCoaddConfig::default(),
            &registry,
            WarpType::Direct,
        )
        .unwrap();
        assert_eq!(inputs.ids, vec![EpochId(1), EpochId(3)]);
        assert_eq!(inputs.indices, vec![0, 2]);
        assert_relative_eq!(inputs.weights[0], 0.25);
        assert_relative_eq!(inputs.weights[1], 2.0);
    }

    #[test]
    fn test_prepare_inputs_nothing_usable() {
        let registry = MaskPlaneRegistry::new();
        let source = InMemoryEpochs::new("r", vec![Epoch::new(EpochId(1), flat_image(bbox(), 1.0, 0.0))]);
        assert_eq!(
            prepare_inputs(
                &source,
                &AssembleCoaddConfig::default(),
                &registry,
                WarpType::Direct
            ),
            Err(CoaddError::NoInputs)
        );
    }

    #[test]
    fn test_airmass() {
        let mut visit = VisitInfo::zenith();
        assert_relative_eq!(visit.airmass(), 1.0);
        visit.elevation_deg = 30.0;
        assert_relative_eq!(visit.airmass(), 2.0, epsilon = 1e-12);
    }
}
