//! Iterative forward modelling of the sub-band sky.
//!
//! Every visit is predicted as the sum of the sub-band models shifted by that
//! visit's refraction. Residuals against the observed warps are shifted back
//! per sub-band, stacked, and added to that sub-band's model. Updates are
//! clamped per pixel, regularized across sub-bands and blended with a gain set
//! by the change in the convergence metric.

use log::{debug, info, warn};
use ndarray::{s, Array2, ArrayView2, Zip};
use shared::algo::stats::{weighted_mean, weighted_variance};
use shared::algo::StatsError;
use shared::image_proc::mask::planes;
use shared::image_proc::shift::{shift_image, shift_mask};
use shared::image_proc::{MaskPlaneRegistry, MaskedImage, AABB};
use std::fmt;

use super::model::{background_scatter, clamp_model, regularize_frequency, DcrModel};
use super::refraction::{dcr_shifts, subband_edges, DcrShift};
use crate::assemble::{
    apply_alt_mask_planes, set_coadd_edge_bits, sub_bbox_iter, AltMaskOverlay, CoaddBits,
    CoaddMetadata, CoaddResult,
};
use crate::compare_warp::CompareWarpAssembler;
use crate::config::{AssembleCoaddConfig, DcrConfig};
use crate::epoch::{EpochId, EpochSource, PreparedInputs, WarpType};
use crate::error::{CoaddError, ConfigError};
use crate::stack::{statistics_stack, Statistic, StatsControl};

/// The starting template and the artifact overlays for every input.
#[derive(Debug, Clone, PartialEq)]
pub struct DcrSupplementary {
    pub template: CoaddResult,
    /// Indexed like the prepared inputs
    pub overlays: Option<Vec<AltMaskOverlay>>,
}

/// Why the iterations of a tile stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The relative improvement fell below the threshold
    Converged,
    /// The model reproduces every visit exactly
    ZeroMetric,
    /// An update made the metric worse and was reverted
    Diverged,
    MaxIterations,
    /// An iteration could not be computed
    Failed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            StopReason::Converged => "converged",
            StopReason::ZeroMetric => "exact fit",
            StopReason::Diverged => "diverged",
            StopReason::MaxIterations => "iteration limit",
            StopReason::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Convergence record of one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceState {
    pub bbox: AABB,
    /// Metric before the first iteration and after every accepted one
    pub history: Vec<f64>,
    /// Number of accepted iterations
    pub iterations: usize,
    pub reason: StopReason,
}

impl ConvergenceState {
    pub fn converged(&self) -> bool {
        matches!(self.reason, StopReason::Converged | StopReason::ZeroMetric)
    }

    pub fn final_metric(&self) -> Option<f64> {
        self.history.last().copied()
    }
}

/// One coadd per sub-band, bluest first.
#[derive(Debug, Clone, PartialEq)]
pub struct DcrCoadds {
    pub subbands: Vec<CoaddResult>,
    /// `(start, end)` wavelength of each sub-band in nm
    pub wavelengths: Vec<(f64, f64)>,
    pub convergence: Vec<ConvergenceState>,
}

impl DcrCoadds {
    pub fn len(&self) -> usize {
        self.subbands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subbands.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CoaddResult> {
        self.subbands.iter()
    }

    /// Sum of the sub-band coadds: the model of the full filter.
    pub fn combined(&self) -> Option<MaskedImage> {
        let images = self.subbands.iter().map(|s| s.image.clone()).collect();
        DcrModel::from_subbands(images).sum()
    }
}

impl<'a> IntoIterator for &'a DcrCoadds {
    type Item = &'a CoaddResult;
    type IntoIter = std::slice::Iter<'a, CoaddResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.subbands.iter()
    }
}

/// One visit as seen by the solver of a tile.
struct TileEpoch {
    id: EpochId,
    image: MaskedImage,
    shifts: Vec<DcrShift>,
    /// Coadd weight of the epoch
    weight: f64,
    airmass: f64,
}

/// Pixel window `(r0, r1, c0, c1)` of `inner` inside `outer`.
fn local_window(outer: &AABB, inner: &AABB) -> (usize, usize, usize, usize) {
    let r0 = inner.min_row - outer.min_row;
    let c0 = inner.min_col - outer.min_col;
    (r0, r0 + inner.height(), c0, c0 + inner.width())
}

fn window<A>(array: &Array2<A>, (r0, r1, c0, c1): (usize, usize, usize, usize)) -> ArrayView2<'_, A> {
    array.slice(s![r0..r1, c0..c1])
}

/// Population standard deviation of the usable residual pixels.
fn residual_scatter(residual: &Array2<f64>, mask: &Array2<u32>, bad_mask: u32) -> Result<f64, StatsError> {
    let good: Vec<f64> = Zip::from(residual)
        .and(mask)
        .fold(Vec::new(), |mut acc, &r, &m| {
            if r.is_finite() && m & bad_mask == 0 {
                acc.push(r);
            }
            acc
        });
    let ones = vec![1.0; good.len()];
    let mean = weighted_mean(&good, &ones)?;
    Ok(weighted_variance(&good, &ones, mean)?.sqrt())
}

/// Solver state shared by every tile of one assembly.
struct TileSolver<'a> {
    config: &'a DcrConfig,
    ctrl: StatsControl,
    mask_map: Vec<(u32, u32)>,
    bad_mask: u32,
    convergence_mask: u32,
    bits: CoaddBits,
}

impl TileSolver<'_> {
    /// Weighted mean over visits of `Σ|observed - predicted| / Σ|observed|`
    /// inside `tile`.
    ///
    /// When a visit has unmasked pixels in the convergence planes, only those
    /// pixels count for it.
    fn metric(&self, model: &DcrModel, epochs: &[TileEpoch], tile: &AABB) -> Result<f64, CoaddError> {
        let mut total = 0.0;
        let mut total_weight = 0.0;
        for epoch in epochs {
            let bounds = local_window(&epoch.image.bbox, tile);
            let predicted = model.build_matched_template(&epoch.shifts);
            let image = window(&epoch.image.image, bounds);
            let mask = window(&epoch.image.mask, bounds);
            let predicted = window(&predicted, bounds);

            let bad_mask = self.bad_mask;
            let convergence_mask = self.convergence_mask;
            let restrict = convergence_mask != 0
                && mask
                    .iter()
                    .any(|&m| m & convergence_mask != 0 && m & bad_mask == 0);
            let (diff, reference) = Zip::from(&image).and(&predicted).and(&mask).fold(
                (0.0, 0.0),
                |(diff, reference), &v, &p, &m| {
                    let usable = v.is_finite()
                        && m & bad_mask == 0
                        && (!restrict || m & convergence_mask != 0);
                    if usable {
                        (diff + (v - p).abs(), reference + v.abs())
                    } else {
                        (diff, reference)
                    }
                },
            );
            if reference > 0.0 {
                total += epoch.weight * diff / reference;
                total_weight += epoch.weight;
            }
        }
        if total_weight > 0.0 {
            Ok(total / total_weight)
        } else {
            Err(StatsError::NoData.into())
        }
    }

    /// One forward-model update, before gain blending.
    fn iterate(&self, model: &DcrModel, epochs: &[TileEpoch]) -> Result<DcrModel, CoaddError> {
        let bbox = model.bbox().ok_or(CoaddError::NoInputs)?;
        let no_data = self.bits.no_data;

        let residuals: Vec<(&TileEpoch, Array2<f64>, Option<f64>)> = epochs
            .iter()
            .map(|epoch| {
                let residual = &epoch.image.image - &model.build_matched_template(&epoch.shifts);
                let scatter = residual_scatter(&residual, &epoch.image.mask, self.bad_mask).ok();
                (epoch, residual, scatter)
            })
            .collect();
        // Uniform residuals carry no scatter; weigh them equally.
        let uniform = residuals.iter().all(|(_, _, scatter)| *scatter == Some(0.0));

        let mut kept = Vec::with_capacity(residuals.len());
        let mut weights = Vec::with_capacity(residuals.len());
        for (epoch, residual, scatter) in residuals {
            let mut weight = match scatter {
                Some(_) if uniform => 1.0,
                Some(scatter) => 1.0 / scatter,
                None => f64::NAN,
            };
            if self.config.use_airmass_weight {
                weight /= epoch.airmass;
            }
            if !(weight.is_finite() && weight > 0.0) {
                debug!("Leaving epoch {} out of this iteration: weight {weight}", epoch.id);
                continue;
            }
            kept.push((epoch, residual));
            weights.push(weight);
        }
        if kept.is_empty() {
            return Err(CoaddError::NoInputs);
        }

        // Every sub-band takes the full residual; the gain blend damps the
        // joint overshoot.
        let mut updated = Vec::with_capacity(model.len());
        for (k, old) in model.subbands().iter().enumerate() {
            let shifted: Vec<MaskedImage> = kept
                .iter()
                .map(|(epoch, residual)| {
                    let back = epoch.shifts[k].inverse();
                    MaskedImage {
                        bbox,
                        image: shift_image(residual.view(), back.dx, back.dy),
                        variance: shift_image(epoch.image.variance.view(), back.dx, back.dy),
                        mask: shift_mask(epoch.image.mask.view(), back.dx, back.dy, no_data),
                    }
                })
                .collect();
            let correction = statistics_stack(
                &shifted,
                Statistic::Mean,
                &self.ctrl,
                &weights,
                self.bits.clipped,
                &self.mask_map,
            )?;
            let mut new = old.clone();
            Zip::from(&mut new.image)
                .and(&correction.image)
                .for_each(|v, &c| *v += c);
            updated.push(new);
        }

        let mut new_model = DcrModel::from_subbands(updated);
        for (new, old) in new_model.subbands_mut().iter_mut().zip(model.subbands()) {
            let floor = self.config.regularize_sigma * background_scatter(&old.image);
            clamp_model(new, old, self.config.model_clamp_factor, floor, no_data);
        }
        if self.config.clamp_frequency > 0.0 {
            let n = model.len() as f64;
            let floor = model
                .sum()
                .map_or(0.0, |total| background_scatter(&total.image) / n);
            regularize_frequency(
                &mut new_model,
                self.config.clamp_frequency,
                self.config.regularize_sigma * floor,
            );
        }
        Ok(new_model)
    }

    /// Iterate the model of one tile until convergence.
    fn solve(&self, model: &mut DcrModel, epochs: &[TileEpoch], tile: &AABB) -> ConvergenceState {
        let mut state = ConvergenceState {
            bbox: *tile,
            history: Vec::new(),
            iterations: 0,
            reason: StopReason::MaxIterations,
        };
        let mut metric = match self.metric(model, epochs, tile) {
            Ok(metric) => metric,
            Err(e) => {
                warn!("Cannot evaluate the model of tile {tile}: {e}");
                state.reason = StopReason::Failed;
                return state;
            }
        };
        state.history.push(metric);
        if metric == 0.0 {
            state.reason = StopReason::ZeroMetric;
            return state;
        }

        for iteration in 1..=self.config.max_num_iter {
            let step = self.iterate(model, epochs).and_then(|mut new| {
                let mut new_metric = self.metric(&new, epochs, tile)?;
                if self.config.use_gain {
                    let gain = if new_metric > 0.0 {
                        (metric / new_metric).clamp(self.config.min_gain, self.config.max_gain)
                    } else {
                        self.config.max_gain
                    };
                    let mut blended = model.clone();
                    blended.blend(&new, gain);
                    new = blended;
                    new_metric = self.metric(&new, epochs, tile)?;
                }
                Ok((new, new_metric))
            });
            let (new, new_metric) = match step {
                Ok(step) => step,
                Err(e) => {
                    warn!("Iteration {iteration} failed on tile {tile}: {e}");
                    state.reason = StopReason::Failed;
                    return state;
                }
            };
            debug!("Tile {tile} iteration {iteration}: metric {metric:.6} -> {new_metric:.6}");

            if new_metric > metric {
                info!("Reverting iteration {iteration} on tile {tile}: metric rose to {new_metric:.6}");
                state.reason = StopReason::Diverged;
                return state;
            }
            let improvement = if new_metric > 0.0 {
                (metric - new_metric) / new_metric
            } else {
                f64::INFINITY
            };
            *model = new;
            metric = new_metric;
            state.history.push(metric);
            state.iterations = iteration;

            if metric == 0.0 {
                state.reason = StopReason::ZeroMetric;
                return state;
            }
            if improvement < self.config.convergence_threshold
                && iteration >= self.config.min_num_iter
            {
                state.reason = StopReason::Converged;
                return state;
            }
        }
        warn!(
            "Tile {tile} did not converge in {} iterations; final metric {metric:.6}",
            self.config.max_num_iter
        );
        state
    }
}

/// DCR assembly: Compare-Warp artifact rejection feeding a sub-band forward
/// model.
pub struct DcrAssembler {
    config: DcrConfig,
    compare_warp: CompareWarpAssembler,
}

impl DcrAssembler {
    pub fn new(config: DcrConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let compare_warp = CompareWarpAssembler::new(config.compare_warp.clone())?;
        Ok(Self {
            config,
            compare_warp,
        })
    }

    /// Use an existing Compare-Warp assembler for the template and artifacts.
    pub fn with_compare_warp(
        config: DcrConfig,
        compare_warp: CompareWarpAssembler,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            compare_warp,
        })
    }

    pub fn config(&self) -> &DcrConfig {
        &self.config
    }

    /// `(start, end)` wavelengths of the sub-bands.
    pub fn wavelengths(&self) -> Vec<(f64, f64)> {
        subband_edges(
            self.config.lambda_eff,
            self.config.filter_width(),
            self.config.dcr_num_subbands,
        )
    }

    /// Build the static-sky template and find the artifacts of every epoch.
    pub fn make_supplementary_data(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
    ) -> Result<DcrSupplementary, CoaddError> {
        let template = self
            .compare_warp
            .make_supplementary_data(source, bbox, registry)?
            .template;
        let artifacts = self
            .compare_warp
            .find_artifacts(source, inputs, &template.image, registry)?;
        Ok(DcrSupplementary {
            template,
            overlays: Some(artifacts.overlays),
        })
    }

    /// Epochs usable for modelling, with their overlays and visit conditions.
    fn usable_inputs(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        supplementary: &DcrSupplementary,
    ) -> (PreparedInputs, Vec<AltMaskOverlay>, Vec<(Vec<DcrShift>, f64)>) {
        let subbands = self.wavelengths();
        let mut usable = PreparedInputs {
            indices: Vec::new(),
            ids: Vec::new(),
            weights: Vec::new(),
        };
        let mut overlays = Vec::new();
        let mut conditions = Vec::new();
        for (k, (&index, &id)) in inputs.indices.iter().zip(&inputs.ids).enumerate() {
            let Some(visit) = source.visit_info(index) else {
                warn!("{}; leaving it out of the model", CoaddError::MissingVisitInfo(id));
                continue;
            };
            let shifts = dcr_shifts(
                &visit,
                &subbands,
                self.config.lambda_eff,
                self.config.pixel_scale,
            );
            debug!("Epoch {id} airmass {:.3} shifts {shifts:?}", visit.airmass());
            usable.indices.push(index);
            usable.ids.push(id);
            usable.weights.push(inputs.weights[k]);
            overlays.push(
                supplementary
                    .overlays
                    .as_ref()
                    .and_then(|o| o.get(k).cloned())
                    .unwrap_or_default(),
            );
            conditions.push((shifts, visit.airmass()));
        }
        (usable, overlays, conditions)
    }

    /// Solve for the sub-band models of `bbox`.
    pub fn assemble(
        &self,
        source: &dyn EpochSource,
        inputs: &PreparedInputs,
        bbox: &AABB,
        registry: &MaskPlaneRegistry,
        supplementary: &DcrSupplementary,
    ) -> Result<DcrCoadds, CoaddError> {
        let assemble_config: AssembleCoaddConfig =
            self.config.compare_warp.assemble.with_bad_plane(planes::CLIPPED);
        assemble_config.validate()?;
        let tiles = sub_bbox_iter(bbox, assemble_config.subregion_size)?;
        let bits = CoaddBits::register(registry)?;
        let ctrl = assemble_config.stats_control(registry)?;
        let remove_mask = assemble_config.remove_mask(registry)?;
        let solver = TileSolver {
            config: &self.config,
            mask_map: bits.mask_map(ctrl.and_mask),
            bad_mask: ctrl.and_mask,
            convergence_mask: registry.add_planes(&self.config.convergence_mask_planes)?,
            ctrl,
            bits,
        };

        let (usable, overlays, conditions) = self.usable_inputs(source, inputs, supplementary);
        if usable.is_empty() {
            return Err(CoaddError::NoInputs);
        }
        let template = supplementary
            .template
            .image
            .subimage(bbox)
            .map_err(|e| CoaddError::MissingTemplate(e.to_string()))?;
        let mut model = DcrModel::from_template(&template, self.config.dcr_num_subbands);

        let mut convergence = Vec::new();
        for tile in tiles {
            let grown = tile.grown_within(self.config.buffer_size, bbox);
            let mut epochs = Vec::with_capacity(usable.len());
            for (k, (&index, &id)) in usable.indices.iter().zip(&usable.ids).enumerate() {
                let mut image = match source.read(index, &grown, WarpType::Direct) {
                    Ok(image) => image,
                    Err(e) => {
                        warn!("Leaving epoch {id} out of tile {tile}: {e}");
                        continue;
                    }
                };
                apply_alt_mask_planes(
                    &mut image,
                    &overlays[k],
                    registry,
                    solver.bad_mask,
                    assemble_config.use_psf_matched_polygons,
                )?;
                image.clear_mask(remove_mask);
                let (shifts, airmass) = conditions[k].clone();
                epochs.push(TileEpoch {
                    id,
                    image,
                    shifts,
                    weight: usable.weights[k],
                    airmass,
                });
            }
            if epochs.is_empty() {
                warn!("No epoch covers tile {tile}; keeping the template");
                continue;
            }

            let mut tile_model = model.subimage(&grown)?;
            let state = solver.solve(&mut tile_model, &epochs, &tile);
            info!(
                "Tile {tile}: {} after {} iterations, metric {:.6}",
                state.reason,
                state.iterations,
                state.final_metric().unwrap_or(f64::NAN)
            );
            model.assign_region(&tile_model, &tile)?;
            convergence.push(state);
        }

        let metadata = CoaddMetadata::new(source, &usable);
        let subbands = model
            .into_subbands()
            .into_iter()
            .map(|mut image| {
                set_coadd_edge_bits(&mut image, bits.no_data);
                CoaddResult {
                    image,
                    n_image: None,
                    metadata: metadata.clone(),
                }
            })
            .collect();
        Ok(DcrCoadds {
            subbands,
            wavelengths: self.wavelengths(),
            convergence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_local_window() {
        let outer = AABB::from_origin_size(10, 20, 30, 40);
        let inner = AABB::from_origin_size(15, 22, 5, 6);
        assert_eq!(local_window(&outer, &inner), (5, 10, 2, 8));
    }

    #[test]
    fn test_residual_scatter_skips_masked() {
        let residual = ndarray::array![[1.0, -1.0, 100.0], [1.0, -1.0, f64::NAN]];
        let mask = ndarray::array![[0, 0, 4], [0, 0, 0]];
        assert_relative_eq!(residual_scatter(&residual, &mask, 4).unwrap(), 1.0);
    }

    #[test]
    fn test_stop_reason_convergence() {
        let state = ConvergenceState {
            bbox: AABB::from_origin_size(0, 0, 1, 1),
            history: vec![0.1, 0.0],
            iterations: 1,
            reason: StopReason::ZeroMetric,
        };
        assert!(state.converged());
        assert_eq!(state.final_metric(), Some(0.0));
        let failed = ConvergenceState {
            reason: StopReason::Diverged,
            ..state
        };
        assert!(!failed.converged());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DcrConfig {
            dcr_num_subbands: 0,
            ..DcrConfig::default()
        };
        assert!(DcrAssembler::new(config).is_err());
    }
}
