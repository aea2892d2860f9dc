//! Compare-Warp artifact rejection.
//!
//! Each PSF-matched warp is differenced against a sigma-clipped static-sky
//! template. Regions detected in a difference are counted per epoch; a region
//! that shows up in only a few of the epochs covering it is a transient
//! artifact and is masked as CLIPPED in that epoch before the final coadd.

use log::{debug, info, warn};
use ndarray::{Array2, Zip};
use rayon::prelude::*;
use shared::image_proc::detection::{Detector, Footprint, ThresholdDetector};
use shared::image_proc::mask::planes;
use shared::image_proc::noise::estimate_variance_scale;
use shared::image_proc::{MaskPlaneRegistry, MaskedImage, SpanSet, AABB};

use crate::assemble::{assemble_coadd, AltMaskOverlay, CoaddResult};
use crate::config::CompareWarpConfig;
use crate::epoch::{prepare_inputs, EpochId, EpochSource, PreparedInputs, WarpType};
use crate::error::{CoaddError, ConfigError};

/// The static-sky template built from PSF-matched warps.
#[derive(Debug, Clone, PartialEq)]
pub struct CompareWarpSupplementary {
    pub template: CoaddResult,
}

/// Artifact regions and the overlays derived from them, indexed like the
/// prepared inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactResult {
    pub artifacts: Vec<Vec<SpanSet>>,
    pub overlays: Vec<AltMaskOverlay>,
    /// Number of epochs with a candidate at each pixel
    pub epoch_count: Array2<u16>,
    /// Number of epochs with usable data at each pixel
    pub n_image: Array2<u16>,
}

/// Mask bits used while differencing warps.
#[derive(Debug, Clone, Copy)]
struct DiffMasks {
    bad: u32,
    prefilter: u32,
    edge: u32,
}

/// What one PSF-matched difference contributes.
struct WarpDiff {
    candidates: Vec<SpanSet>,
    no_data: Vec<SpanSet>,
    edge: Vec<SpanSet>,
    good: Option<Array2<bool>>,
}

impl WarpDiff {
    /// An epoch without a usable PSF-matched warp: masked everywhere.
    fn missing(bbox: &AABB) -> Self {
        Self {
            candidates: Vec::new(),
            no_data: vec![SpanSet::from_bbox(bbox)],
            edge: Vec::new(),
            good: None,
        }
    }
}

/// Keep candidates mostly free of the prefilter planes.
pub fn prefilter_artifacts(
    candidates: Vec<SpanSet>,
    image: &MaskedImage,
    bad_mask: u32,
    ratio: f64,
) -> Vec<SpanSet> {
    candidates
        .into_iter()
        .filter(|spans| {
            let area = spans.area();
            let good = spans.count_mask(&image.bbox, image.mask.view(), |m| m & bad_mask == 0);
            area > 0 && good as f64 / area as f64 > ratio
        })
        .collect()
}

/// Keep the candidates that appear in few enough of the epochs covering them.
///
/// The allowed number of epochs is `floor(min(low·N̄, max + high·N̄))` with N̄
/// the mean n-image under the candidate. With `template_footprints`, a
/// candidate contained in any of them is kept unmasked.
pub fn filter_artifacts(
    candidates: &[SpanSet],
    epoch_count: &Array2<u16>,
    n_image: &Array2<u16>,
    bbox: &AABB,
    template_footprints: Option<&[Footprint]>,
    config: &CompareWarpConfig,
) -> Vec<SpanSet> {
    candidates
        .iter()
        .filter(|spans| {
            let indices: Vec<(usize, usize)> = spans.local_indices(bbox).collect();
            if indices.is_empty() {
                return false;
            }
            let mean_n = indices.iter().map(|&idx| n_image[idx] as f64).sum::<f64>()
                / indices.len() as f64;
            let high = config.max_num_epochs as f64 + config.max_fraction_epochs_high * mean_n;
            let low = config.max_fraction_epochs_low * mean_n;
            let effective_max = low.min(high).floor() as u16;
            let below = indices
                .iter()
                .filter(|&&idx| epoch_count[idx] > 0 && epoch_count[idx] <= effective_max)
                .count();
            below as f64 / indices.len() as f64 > config.spatial_threshold
        })
        .filter(|spans| {
            !template_footprints
                .is_some_and(|fps| fps.iter().any(|fp| fp.spans.contains(spans)))
        })
        .cloned()
        .collect()
}

/// OR SENSOR_EDGE|INEXACT_PSF into the coadd under every EDGE overlay region.
pub fn apply_alt_edge_mask(
    image: &mut MaskedImage,
    overlays: &[AltMaskOverlay],
    registry: &MaskPlaneRegistry,
) -> Result<(), CoaddError> {
    let bits = registry.add_planes(&[planes::SENSOR_EDGE, planes::INEXACT_PSF])?;
    for regions in overlays.iter().filter_map(|o| o.get(planes::EDGE)) {
        for region in regions {
            region.set_mask(image, bits);
        }
    }
    Ok(())
}

pub struct CompareWarpAssembler {
    config: CompareWarpConfig,
    detector: Box<dyn Detector>,
    template_detector: Box<dyn Detector>,
}

impl CompareWarpAssembler {
    pub fn new(config: CompareWarpConfig) -> Result<Self, ConfigError> {
        let detector = ThresholdDetector::new(config.detect.clone())?;
        let template_detector = ThresholdDetector::new(config.detect_template.clone())?;
        Self::with_detectors(config, Box::new(detector), Box::new(template_detector))
    }

    pub fn with_detectors(
        config: CompareWarpConfig,
        detector: Box<dyn Detector>,
        template_detector: Box<dyn Detector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            detector,
            template_detector,
        })
    }

    pub fn config(&self) -> &CompareWarpConfig {
        &self.config
    }

    /// Assemble the static-sky template from every PSF-matched warp.
    pub fn make_supplementary_data(
        &self,
        source: &dyn EpochSource,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
    ) -> Result<CompareWarpSupplementary, CoaddError> {
        let inputs = match prepare_inputs(source, &self.config.template, registry, WarpType::PsfMatched)
        {
            Ok(inputs) => inputs,
            Err(CoaddError::NoInputs) => {
                return Err(CoaddError::MissingTemplate(
                    "no epoch has a usable PSF-matched warp".to_string(),
                ))
            }
            Err(e) => return Err(e),
        };
        let template = assemble_coadd(
            source,
            &inputs,
            bbox,
            &self.config.template,
            registry,
            None,
            WarpType::PsfMatched,
        )?;
        Ok(CompareWarpSupplementary { template })
    }

    /// Difference one epoch's PSF-matched warp against the template.
    fn warp_diff(
        &self,
        source: &dyn EpochSource,
        index: usize,
        id: EpochId,
        template: &MaskedImage,
        masks: DiffMasks,
    ) -> WarpDiff {
        let bbox = template.bbox;
        if !source.has_warp(index, WarpType::PsfMatched) {
            debug!("Epoch {id} has no PSF-matched warp; masking all of it");
            return WarpDiff::missing(&bbox);
        }
        let warp = match source.read(index, &bbox, WarpType::PsfMatched) {
            Ok(warp) => warp,
            Err(e) => {
                warn!("Cannot read PSF-matched warp of epoch {id}; masking all of it: {e}");
                return WarpDiff::missing(&bbox);
            }
        };

        let mut diff = warp;
        diff.image -= &template.image;
        diff.variance += &template.variance;
        if self.config.do_scale_warp_variance {
            match estimate_variance_scale(&diff, masks.bad) {
                Ok(factor) => {
                    debug!("Scaling variance of epoch {id} difference by {factor:.3}");
                    diff.variance.mapv_inplace(|v| v * factor);
                }
                Err(e) => warn!("Cannot rescale variance of epoch {id} difference: {e}"),
            }
        }

        let mut candidates: Vec<SpanSet> = match self.detector.detect(&diff, false) {
            Ok(footprints) => footprints.merged().into_iter().map(|fp| fp.spans).collect(),
            Err(e) => {
                warn!("Detection failed on epoch {id} difference: {e}");
                Vec::new()
            }
        };
        if self.config.do_prefilter_artifacts {
            candidates = prefilter_artifacts(
                candidates,
                &diff,
                masks.prefilter,
                self.config.prefilter_artifacts_ratio,
            );
        }

        let good = Zip::from(&diff.image)
            .and(&diff.mask)
            .map_collect(|&v, &m| v.is_finite() && m & masks.bad == 0);
        let no_data = SpanSet::from_predicate(&bbox, diff.image.view(), |v: &f64| !v.is_finite());
        let edge = SpanSet::from_mask(&bbox, diff.mask.view(), masks.edge);
        WarpDiff {
            candidates,
            no_data: no_data.split(),
            edge: edge.split(),
            good: Some(good),
        }
    }

    /// Detect transient artifacts in every epoch.
    pub fn find_artifacts(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        template: &MaskedImage,
        registry: &MaskPlaneRegistry,
    ) -> Result<ArtifactResult, CoaddError> {
        let bbox = template.bbox;
        let masks = DiffMasks {
            bad: self.config.assemble.bad_mask(registry)?,
            prefilter: registry.add_planes(&self.config.prefilter_artifacts_mask_planes)?,
            edge: registry.plane_bit(planes::EDGE)?,
        };

        let diffs: Vec<WarpDiff> = inputs
            .indices
            .par_iter()
            .zip(inputs.ids.par_iter())
            .map(|(&index, &id)| self.warp_diff(source, index, id, template, masks))
            .collect();

        let mut epoch_count = Array2::<u16>::zeros(bbox.shape());
        let mut n_image = Array2::<u16>::zeros(bbox.shape());
        for diff in &diffs {
            if let Some(good) = &diff.good {
                Zip::from(&mut n_image).and(good).for_each(|n, &g| {
                    if g {
                        *n += 1;
                    }
                });
            }
            let covered = diff
                .candidates
                .iter()
                .fold(SpanSet::new(), |acc, spans| acc.union(spans));
            for idx in covered.local_indices(&bbox) {
                epoch_count[idx] += 1;
            }
        }

        let template_footprints = if self.config.do_preserve_contained_by_source {
            let template_image = MaskedImage {
                mask: Array2::zeros(bbox.shape()),
                ..template.clone()
            };
            match self.template_detector.detect(&template_image, true) {
                Ok(footprints) => Some(footprints.positive),
                Err(e) => {
                    warn!("Detection on the template failed; no artifacts are preserved: {e}");
                    None
                }
            }
        } else {
            None
        };

        let mut artifacts = Vec::with_capacity(diffs.len());
        let mut overlays = Vec::with_capacity(diffs.len());
        for (diff, id) in diffs.into_iter().zip(&inputs.ids) {
            let found = filter_artifacts(
                &diff.candidates,
                &epoch_count,
                &n_image,
                &bbox,
                template_footprints.as_deref(),
                &self.config,
            );
            if !found.is_empty() {
                debug!("Masking {} artifacts in epoch {id}", found.len());
            }
            let mut overlay = AltMaskOverlay::new();
            for (plane, regions) in [
                (planes::CLIPPED, found.clone()),
                (planes::NO_DATA, diff.no_data),
                (planes::EDGE, diff.edge),
            ] {
                if !regions.is_empty() {
                    overlay.insert(plane.to_string(), regions);
                }
            }
            artifacts.push(found);
            overlays.push(overlay);
        }

        info!(
            "Found {} artifacts in {} epochs",
            artifacts.iter().map(Vec::len).sum::<usize>(),
            artifacts.len()
        );
        Ok(ArtifactResult {
            artifacts,
            overlays,
            epoch_count,
            n_image,
        })
    }

    /// Assemble the final coadd with the artifacts of every epoch rejected.
    pub fn assemble(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
        supplementary: &CompareWarpSupplementary,
    ) -> Result<CoaddResult, CoaddError> {
        let artifacts = self.find_artifacts(source, inputs, &supplementary.template.image, registry)?;
        let config = self.config.assemble.with_bad_plane(planes::CLIPPED);
        let mut result = assemble_coadd(
            source,
            inputs,
            bbox,
            &config,
            registry,
            Some(&artifacts.overlays),
            WarpType::Direct,
        )?;
        apply_alt_edge_mask(&mut result.image, &artifacts.overlays, registry)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::image_proc::detection::Polarity;
    use shared::image_proc::Span;

    fn square(r0: usize, c0: usize, size: usize) -> SpanSet {
        SpanSet::from_bbox(&AABB::from_origin_size(r0, c0, size, size))
    }

    #[test]
    fn test_filter_artifacts_epoch_fraction() {
        let bbox = AABB::from_origin_size(0, 0, 10, 10);
        let config = CompareWarpConfig::default();
        let n_image = Array2::from_elem(bbox.shape(), 10u16);
        let mut epoch_count = Array2::<u16>::zeros(bbox.shape());
        let rare = square(1, 1, 2);
        let common = square(6, 6, 2);
        for idx in rare.local_indices(&bbox) {
            epoch_count[idx] = 1;
        }
        for idx in common.local_indices(&bbox) {
            epoch_count[idx] = 5;
        }
        let kept = filter_artifacts(
            &[rare.clone(), common],
            &epoch_count,
            &n_image,
            &bbox,
            None,
            &config,
        );
        assert_eq!(kept, vec![rare]);
    }

    #[test]
    fn test_filter_artifacts_effective_epochs_scale_with_depth() {
        // 100 epochs allow floor(min(40, 2 + 3)) = 5.
        let bbox = AABB::from_origin_size(0, 0, 4, 4);
        let config = CompareWarpConfig::default();
        let n_image = Array2::from_elem(bbox.shape(), 100u16);
        let candidate = square(0, 0, 2);
        for (count, expect) in [(5u16, true), (6, false)] {
            let epoch_count = Array2::from_elem(bbox.shape(), count);
            let kept = filter_artifacts(
                &[candidate.clone()],
                &epoch_count,
                &n_image,
                &bbox,
                None,
                &config,
            );
            assert_eq!(!kept.is_empty(), expect, "count {count}");
        }
    }

    #[test]
    fn test_filter_artifacts_preserves_template_sources() {
        let bbox = AABB::from_origin_size(0, 0, 10, 10);
        let config = CompareWarpConfig::default();
        let n_image = Array2::from_elem(bbox.shape(), 10u16);
        let epoch_count = Array2::from_elem(bbox.shape(), 1u16);
        let inside = square(2, 2, 2);
        let template = vec![Footprint::new(square(1, 1, 5), 50.0, Polarity::Positive)];
        let kept = filter_artifacts(
            &[inside.clone(), square(8, 8, 2)],
            &epoch_count,
            &n_image,
            &bbox,
            Some(template.as_slice()),
            &config,
        );
        assert_eq!(kept, vec![square(8, 8, 2)]);
    }

    #[test]
    fn test_prefilter_artifacts() {
        let bbox = AABB::from_origin_size(0, 0, 4, 4);
        let mut image = MaskedImage::filled(bbox, 0.0, 1.0, 0);
        image.mask.row_mut(0).fill(1);
        let all_bad = SpanSet::from_spans(vec![Span::new(0, 0, 3)]);
        let mostly_good = square(0, 0, 2);
        let kept = prefilter_artifacts(vec![all_bad, mostly_good.clone()], &image, 1, 0.05);
        assert_eq!(kept, vec![mostly_good]);
    }

    #[test]
    fn test_apply_alt_edge_mask() {
        let registry = MaskPlaneRegistry::new();
        let bbox = AABB::from_origin_size(0, 0, 3, 3);
        let mut image = MaskedImage::filled(bbox, 0.0, 1.0, 0);
        let mut overlay = AltMaskOverlay::new();
        overlay.insert(planes::EDGE.to_string(), vec![square(0, 0, 1)]);
        apply_alt_edge_mask(&mut image, &[overlay], &registry).unwrap();
        let expected = registry
            .plane_bitmask(&[planes::SENSOR_EDGE, planes::INEXACT_PSF])
            .unwrap();
        assert_eq!(image.mask[[0, 0]], expected);
        assert_eq!(image.mask[[1, 1]], 0);
    }
}
