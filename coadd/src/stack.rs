//! Per-pixel weighted statistics across a stack of co-registered images.
//!
//! Every output pixel is reduced independently from the matching pixel of each
//! input, so output rows are evaluated in parallel with rayon and the result
//! does not depend on the thread count.
//!
//! # Pixel exclusion
//!
//! An input pixel is excluded when its mask intersects the and-mask or when its
//! value or variance is not finite. Mask-excluded pixels are still accounted
//! for: their weight is tallied per propagated plane, and the mask map turns
//! their bits into substitute output bits (for example any bad plane into
//! `REJECTED`).

use ndarray::{Axis, Zip};
use serde::{Deserialize, Serialize};
use shared::algo::stats::{median, weighted_mean, weighted_variance};
use shared::image_proc::{MaskedImage, AABB};
use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, StackError};

/// Statistic used to combine the pixels of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Statistic {
    Mean,
    Median,
    /// Iterative sigma-clipped weighted mean
    MeanClip,
    Variance,
    VarianceClip,
}

impl Statistic {
    pub fn name(&self) -> &'static str {
        match self {
            Statistic::Mean => "MEAN",
            Statistic::Median => "MEDIAN",
            Statistic::MeanClip => "MEANCLIP",
            Statistic::Variance => "VARIANCE",
            Statistic::VarianceClip => "VARIANCECLIP",
        }
    }

    /// True when the statistic estimates a scatter rather than a level.
    pub fn is_variance(&self) -> bool {
        matches!(self, Statistic::Variance | Statistic::VarianceClip)
    }

    pub fn is_clipped(&self) -> bool {
        matches!(self, Statistic::MeanClip | Statistic::VarianceClip)
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Statistic {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MEAN" => Ok(Statistic::Mean),
            "MEDIAN" => Ok(Statistic::Median),
            "MEANCLIP" => Ok(Statistic::MeanClip),
            "VARIANCE" => Ok(Statistic::Variance),
            "VARIANCECLIP" => Ok(Statistic::VarianceClip),
            "NOTHING" | "ERROR" | "ORMASK" => Err(ConfigError::UnsupportedStatistic(s.to_string())),
            _ => Err(ConfigError::UnknownStatistic(s.to_string())),
        }
    }
}

impl TryFrom<String> for Statistic {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Statistic> for String {
    fn from(statistic: Statistic) -> Self {
        statistic.name().to_string()
    }
}

/// Controls for [`statistics_stack`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatsControl {
    /// Pixels with any of these bits set are excluded
    pub and_mask: u32,
    pub sigma_clip: f64,
    pub clip_iter: usize,
    /// `(bit, threshold)`: the bit reaches the output when the weight of
    /// inputs excluded while carrying it exceeds `threshold` of the total
    pub mask_propagation_thresholds: Vec<(u32, f64)>,
    pub weighted: bool,
    /// Variance of the result from input variances rather than sample scatter
    pub calc_error_from_input_variance: bool,
    /// Set on pixels with no usable input
    pub no_data_bit: u32,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    variance: f64,
    weight: f64,
    mask: u32,
}

/// Reduction of one pixel stack.
struct PixelReducer<'a> {
    statistic: Statistic,
    ctrl: &'a StatsControl,
    clipped_bit: u32,
}

impl PixelReducer<'_> {
    /// Indices of the samples surviving sigma clipping.
    ///
    /// The first pass centres on the median with the unclipped weighted
    /// deviation as scale; later passes use the clipped weighted mean and
    /// deviation. A zero scale clips nothing and a pass that would reject every
    /// sample is not applied.
    fn clip(&self, values: &[f64], weights: &[f64]) -> Option<Vec<usize>> {
        let mut kept: Vec<usize> = (0..values.len()).collect();
        let mut center = median(values).ok()?;
        let mean = weighted_mean(values, weights).ok()?;
        let mut scale = weighted_variance(values, weights, mean).ok()?.sqrt();

        for _ in 0..self.ctrl.clip_iter {
            if !(scale > 0.0) {
                break;
            }
            let limit = self.ctrl.sigma_clip * scale;
            let next: Vec<usize> = kept
                .iter()
                .copied()
                .filter(|&i| (values[i] - center).abs() <= limit)
                .collect();
            if next.is_empty() || next.len() == kept.len() {
                break;
            }
            kept = next;
            let (v, w) = subset(values, weights, &kept);
            center = weighted_mean(&v, &w).ok()?;
            scale = weighted_variance(&v, &w, center).ok()?.sqrt();
        }
        Some(kept)
    }

    /// `(value, variance, mask)` of a non-empty stack, or `None` when the
    /// statistic is undefined for it.
    fn reduce(&self, samples: &[Sample]) -> Option<(f64, f64, u32)> {
        let mut mask = samples.iter().fold(0, |m, s| m | s.mask);
        if samples.is_empty() {
            return None;
        }
        if samples.len() == 1 && !self.statistic.is_variance() {
            return Some((samples[0].value, samples[0].variance, mask));
        }

        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        let weights: Vec<f64> = samples.iter().map(|s| s.weight).collect();
        let kept = if self.statistic.is_clipped() {
            let kept = self.clip(&values, &weights)?;
            if kept.len() < samples.len() {
                mask |= self.clipped_bit;
            }
            kept
        } else {
            (0..samples.len()).collect()
        };
        let (values, weights) = subset(&values, &weights, &kept);
        let variances: Vec<f64> = kept.iter().map(|&i| samples[i].variance).collect();
        let n = values.len();

        let (value, variance) = match self.statistic {
            Statistic::Mean | Statistic::MeanClip => {
                let mean = weighted_mean(&values, &weights).ok()?;
                (mean, self.error_of_mean(&values, &weights, &variances, mean)?)
            }
            Statistic::Median => {
                let value = median(&values).ok()?;
                let mean = weighted_mean(&values, &weights).ok()?;
                (value, self.error_of_mean(&values, &weights, &variances, mean)?)
            }
            Statistic::Variance | Statistic::VarianceClip => {
                if n < 2 {
                    return Some((f64::NAN, f64::NAN, mask | self.ctrl.no_data_bit));
                }
                let mean = weighted_mean(&values, &weights).ok()?;
                let nf = n as f64;
                let var = weighted_variance(&values, &weights, mean).ok()? * nf / (nf - 1.0);
                (var, 2.0 * var * var / (nf - 1.0))
            }
        };
        Some((value, variance, mask))
    }

    fn error_of_mean(
        &self,
        values: &[f64],
        weights: &[f64],
        variances: &[f64],
        mean: f64,
    ) -> Option<f64> {
        if values.len() == 1 {
            return Some(variances[0]);
        }
        if self.ctrl.calc_error_from_input_variance {
            let sum_w: f64 = weights.iter().sum();
            let sum_w2v: f64 = weights
                .iter()
                .zip(variances)
                .map(|(w, v)| w * w * v)
                .sum();
            Some(sum_w2v / (sum_w * sum_w))
        } else {
            let var = weighted_variance(values, weights, mean).ok()?;
            Some(var / (values.len() - 1) as f64)
        }
    }
}

fn subset(values: &[f64], weights: &[f64], kept: &[usize]) -> (Vec<f64>, Vec<f64>) {
    kept.iter().map(|&i| (values[i], weights[i])).unzip()
}

fn check_inputs(images: &[MaskedImage], weights: &[f64]) -> Result<AABB, StackError> {
    let first = images.first().ok_or(StackError::NoImages)?;
    if images.len() != weights.len() {
        return Err(StackError::WeightCount {
            images: images.len(),
            weights: weights.len(),
        });
    }
    for (index, image) in images.iter().enumerate() {
        if image.bbox != first.bbox {
            return Err(StackError::BBoxMismatch {
                index,
                expected: first.bbox,
                got: image.bbox,
            });
        }
    }
    Ok(first.bbox)
}

/// Combine co-registered images pixel by pixel.
///
/// `clipped_bit` is set on pixels where clipping removed an input, and
/// `mask_map` lists `(input bits, output bits)` substitutions applied for every
/// mask-excluded input. Pixels with no usable input get value 0, variance +∞
/// and the no-data bit.
pub fn statistics_stack(
    images: &[MaskedImage],
    statistic: Statistic,
    ctrl: &StatsControl,
    weights: &[f64],
    clipped_bit: u32,
    mask_map: &[(u32, u32)],
) -> Result<MaskedImage, StackError> {
    let bbox = check_inputs(images, weights)?;
    let weights: Vec<f64> = if ctrl.weighted {
        weights.to_vec()
    } else {
        vec![1.0; images.len()]
    };
    let total_weight: f64 = weights.iter().sum();
    let reducer = PixelReducer {
        statistic,
        ctrl,
        clipped_bit,
    };
    let thresholds = &ctrl.mask_propagation_thresholds;

    let mut out = MaskedImage::new(bbox);
    Zip::indexed(out.image.axis_iter_mut(Axis(0)))
        .and(out.variance.axis_iter_mut(Axis(0)))
        .and(out.mask.axis_iter_mut(Axis(0)))
        .par_for_each(|row, mut image_row, mut variance_row, mut mask_row| {
            let mut samples = Vec::with_capacity(images.len());
            let mut rejected = vec![0.0; thresholds.len()];
            for col in 0..image_row.len() {
                samples.clear();
                rejected.iter_mut().for_each(|w| *w = 0.0);
                let mut extra = 0u32;

                for (input, &weight) in images.iter().zip(&weights) {
                    let sample = Sample {
                        value: input.image[[row, col]],
                        variance: input.variance[[row, col]],
                        weight,
                        mask: input.mask[[row, col]],
                    };
                    if sample.mask & ctrl.and_mask != 0 {
                        for (tally, &(bit, _)) in rejected.iter_mut().zip(thresholds) {
                            if sample.mask & bit != 0 {
                                *tally += weight;
                            }
                        }
                        for &(from, to) in mask_map {
                            if sample.mask & from != 0 {
                                extra |= to;
                            }
                        }
                        continue;
                    }
                    if sample.value.is_finite() && sample.variance.is_finite() {
                        samples.push(sample);
                    }
                }

                for (tally, &(bit, threshold)) in rejected.iter().zip(thresholds) {
                    if total_weight > 0.0 && tally / total_weight > threshold {
                        extra |= bit;
                    }
                }

                let (value, variance, mask) = reducer
                    .reduce(&samples)
                    .unwrap_or((0.0, f64::INFINITY, ctrl.no_data_bit));
                image_row[col] = value;
                variance_row[col] = variance;
                mask_row[col] = mask | extra;
            }
        });
    Ok(out)
}
