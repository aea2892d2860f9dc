//! Safe-Clip artifact rejection.
//!
//! A mean coadd and a sigma-clipped mean coadd differ only where some epoch
//! carried an outlier. Regions detected in their difference are attributed to
//! the epochs whose own detection planes cover most of the region; when only
//! one or two epochs explain it, those epochs are clipped there. Detections
//! shared by many epochs are real sources and left alone.

use log::{debug, info, warn};
use ndarray::Array2;
use shared::image_proc::detection::{Detector, Footprint, ThresholdDetector};
use shared::image_proc::mask::planes;
use shared::image_proc::{MaskPlaneRegistry, MaskedImage, SpanSet, AABB};

use crate::assemble::{assemble_coadd, AltMaskOverlay, CoaddResult};
use crate::config::{AssembleCoaddConfig, SafeClipConfig};
use crate::epoch::{EpochSource, PreparedInputs, WarpType};
use crate::error::{CoaddError, ConfigError};
use crate::stack::Statistic;

/// Regions clipped per input epoch, indexed like [`PreparedInputs`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClipResult {
    pub clip_regions: Vec<Vec<SpanSet>>,
    /// Candidate regions found in the difference coadd
    pub candidates: Vec<Footprint>,
    /// Indices into `candidates` that were clipped in some epoch
    pub clipped_candidates: Vec<usize>,
}

impl ClipResult {
    pub fn overlays(&self) -> Vec<AltMaskOverlay> {
        self.clip_regions
            .iter()
            .map(|regions| {
                let mut overlay = AltMaskOverlay::new();
                if !regions.is_empty() {
                    overlay.insert(planes::CLIPPED.to_string(), regions.clone());
                }
                overlay
            })
            .collect()
    }
}

/// Epochs to clip for one candidate given `(epoch, overlap fraction)` pairs.
///
/// A lone overlapping epoch is clipped above the single threshold; otherwise a
/// unique epoch above the general threshold is clipped. Two epochs above the
/// double threshold are both clipped, overriding the former, when more than
/// three epochs overlap and every other overlap stays at or below the
/// maximum double overlap.
pub fn classify_overlaps(overlaps: &[(usize, f64)], config: &SafeClipConfig) -> Vec<usize> {
    if overlaps.len() == 1 {
        let (epoch, overlap) = overlaps[0];
        return if overlap > config.min_clip_foot_overlap_single {
            vec![epoch]
        } else {
            Vec::new()
        };
    }

    let mut clip = Vec::new();
    let above: Vec<usize> = overlaps
        .iter()
        .filter(|(_, o)| *o > config.min_clip_foot_overlap)
        .map(|(e, _)| *e)
        .collect();
    if above.len() == 1 {
        clip = above;
    }

    let (double, rest): (Vec<&(usize, f64)>, Vec<&(usize, f64)>) = overlaps
        .iter()
        .partition(|(_, o)| *o > config.min_clip_foot_overlap_double);
    if double.len() == 2 && overlaps.len() > 3 {
        let max_rest = rest.iter().map(|(_, o)| *o).fold(f64::MIN, f64::max);
        if max_rest <= config.max_clip_foot_overlap_double {
            clip = double.iter().map(|(e, _)| *e).collect();
        }
    }
    clip
}

pub struct SafeClipAssembler {
    config: SafeClipConfig,
    detector: Box<dyn Detector>,
}

impl SafeClipAssembler {
    pub fn new(config: SafeClipConfig) -> Result<Self, ConfigError> {
        let detector = ThresholdDetector::new(config.clip_detection.clone())?;
        Self::with_detector(config, Box::new(detector))
    }

    pub fn with_detector(
        config: SafeClipConfig,
        detector: Box<dyn Detector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, detector })
    }

    pub fn config(&self) -> &SafeClipConfig {
        &self.config
    }

    /// Mean coadd minus sigma-clipped mean coadd.
    pub fn build_difference_coadd(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
    ) -> Result<MaskedImage, CoaddError> {
        let base = AssembleCoaddConfig {
            do_interp: false,
            do_n_image: false,
            ..self.config.assemble.clone()
        };
        let mean_config = base.with_statistic(Statistic::Mean, base.sigma_clip, base.clip_iter);
        let clip_config =
            base.with_statistic(Statistic::MeanClip, self.config.sigma_clip, self.config.clip_iter);
        let mean = assemble_coadd(source, inputs, bbox, &mean_config, registry, None, WarpType::Direct)?;
        let clipped = assemble_coadd(source, inputs, bbox, &clip_config, registry, None, WarpType::Direct)?;
        Ok(mean.image.difference(&clipped.image)?)
    }

    /// Find the regions to clip in each epoch.
    pub fn find_clip(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
    ) -> Result<ClipResult, CoaddError> {
        let difference = self.build_difference_coadd(source, inputs, bbox, registry)?;
        let candidates = self.detector.detect(&difference, true)?.merged();
        info!("Found {} clip candidates in the difference coadd", candidates.len());

        let bad_mask = self.config.assemble.bad_mask(registry)?;
        let detected = registry.plane_bitmask(&[planes::DETECTED, planes::DETECTED_NEGATIVE])?;
        let masks: Vec<Option<Array2<u32>>> = inputs
            .indices
            .iter()
            .zip(&inputs.ids)
            .map(|(&index, id)| match source.read(index, bbox, WarpType::Direct) {
                Ok(image) => Some(image.mask),
                Err(e) => {
                    warn!("Cannot read the mask of epoch {id}; it will not be clipped: {e}");
                    None
                }
            })
            .collect();

        let mut clip_regions: Vec<Vec<SpanSet>> = vec![Vec::new(); inputs.len()];
        let mut clipped_candidates = Vec::new();
        for (i, candidate) in candidates.iter().enumerate() {
            let n_pixel = candidate.area();
            let mut overlaps = Vec::new();
            for (k, mask) in masks.iter().enumerate() {
                let Some(mask) = mask else { continue };
                let ignore = candidate
                    .spans
                    .count_mask(bbox, mask.view(), |m| m & bad_mask != 0);
                let overlap_det = candidate.spans.count_mask(bbox, mask.view(), |m| {
                    m & bad_mask == 0 && m & detected != 0
                });
                let total = n_pixel - ignore;
                if ignore > overlap_det || total as f64 <= 0.5 * n_pixel as f64 || overlap_det == 0 {
                    continue;
                }
                overlaps.push((k, overlap_det as f64 / total as f64));
            }

            let clip = classify_overlaps(&overlaps, &self.config);
            if !clip.is_empty() {
                debug!(
                    "Clipping candidate at {} in epochs {:?}",
                    candidate.bbox(),
                    clip.iter().map(|&k| inputs.ids[k]).collect::<Vec<_>>()
                );
                clipped_candidates.push(i);
            }
            for k in clip {
                clip_regions[k].push(candidate.spans.clone());
            }
        }

        self.append_big_footprints(&mut clip_regions, &masks, bbox, bad_mask, detected);
        Ok(ClipResult {
            clip_regions,
            candidates,
            clipped_candidates,
        })
    }

    /// Extend each epoch's clip list with its large detections that are mostly
    /// clipped already.
    fn append_big_footprints(
        &self,
        clip_regions: &mut [Vec<SpanSet>],
        masks: &[Option<Array2<u32>>],
        bbox: &AABB,
        bad_mask: u32,
        detected: u32,
    ) {
        let min_big = self.config.min_big_overlap;
        for (regions, mask) in clip_regions.iter_mut().zip(masks) {
            let Some(mask) = mask else { continue };
            if regions.is_empty() {
                continue;
            }
            let clipped = regions.iter().fold(SpanSet::new(), |acc, r| acc.union(r));
            let big: Vec<SpanSet> = SpanSet::from_mask(bbox, mask.view(), detected)
                .split()
                .into_iter()
                .filter(|fp| fp.area() >= min_big)
                .filter(|fp| {
                    fp.intersection(&clipped)
                        .count_mask(bbox, mask.view(), |m| m & bad_mask == 0)
                        > min_big
                })
                .collect();
            if !big.is_empty() {
                debug!("Adding {} big footprints to the clip list", big.len());
            }
            regions.extend(big);
        }
    }

    /// Assemble the final coadd with the clipped regions rejected.
    pub fn assemble(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
    ) -> Result<CoaddResult, CoaddError> {
        let clip = self.find_clip(source, inputs, bbox, registry)?;
        info!(
            "Clipped {} of {} candidates",
            clip.clipped_candidates.len(),
            clip.candidates.len()
        );
        let overlays = clip.overlays();
        let config = self.config.assemble.with_bad_plane(planes::CLIPPED);
        assemble_coadd(
            source,
            inputs,
            bbox,
            &config,
            registry,
            Some(&overlays),
            WarpType::Direct,
        )
    }
}
