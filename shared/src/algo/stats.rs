//! Robust and weighted statistics over 1D samples.
//!
//! Everything here rejects empty input with [`StatsError::NoData`]. Functions
//! that sort require finite input and report the first offending index
//! otherwise, so a NaN never silently shifts a median.

use num_traits::Float;
use std::cmp::Ordering;
use thiserror::Error;

/// Scale from interquartile range to Gaussian standard deviation.
pub const IQR_TO_SIGMA: f64 = 0.741_301_109_252_801;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("Non-finite value encountered at index {0}")]
    NonFinite(usize),
    #[error("No data to compute statistics")]
    NoData,
    #[error("Values and weights have different lengths ({0} vs {1})")]
    MismatchedLengths(usize, usize),
}

fn check_finite<T: Float>(values: &[T]) -> Result<(), StatsError> {
    if values.is_empty() {
        return Err(StatsError::NoData);
    }
    match values.iter().position(|v| !v.is_finite()) {
        Some(idx) => Err(StatsError::NonFinite(idx)),
        None => Ok(()),
    }
}

fn sorted_copy<T: Float>(values: &[T]) -> Result<Vec<T>, StatsError> {
    check_finite(values)?;
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    Ok(sorted)
}

/// Linearly interpolated quantile `q` in `[0, 1]` of already sorted values.
pub fn quantile_sorted<T: Float>(sorted: &[T], q: f64) -> Result<T, StatsError> {
    if sorted.is_empty() {
        return Err(StatsError::NoData);
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = T::from(pos - lo as f64).unwrap_or_else(T::zero);
    Ok(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Median of finite values (mean of the two central values for even counts).
pub fn median<T: Float>(values: &[T]) -> Result<T, StatsError> {
    let sorted = sorted_copy(values)?;
    quantile_sorted(&sorted, 0.5)
}

/// Gaussian-equivalent standard deviation from the interquartile range.
pub fn robust_sigma(values: &[f64]) -> Result<f64, StatsError> {
    let sorted = sorted_copy(values)?;
    let q1 = quantile_sorted(&sorted, 0.25)?;
    let q3 = quantile_sorted(&sorted, 0.75)?;
    Ok(IQR_TO_SIGMA * (q3 - q1))
}

/// Weighted mean, accumulated relative to the first value.
///
/// Accumulating offsets from a reference makes the mean of identical values
/// exactly that value regardless of the weights.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> Result<f64, StatsError> {
    if values.len() != weights.len() {
        return Err(StatsError::MismatchedLengths(values.len(), weights.len()));
    }
    let reference = *values.first().ok_or(StatsError::NoData)?;
    let (sum_w, sum_wd) = values
        .iter()
        .zip(weights)
        .fold((0.0, 0.0), |(sw, swd), (&v, &w)| (sw + w, swd + w * (v - reference)));
    if sum_w <= 0.0 {
        return Err(StatsError::NoData);
    }
    Ok(reference + sum_wd / sum_w)
}

/// Weighted population variance about `mean`.
pub fn weighted_variance(values: &[f64], weights: &[f64], mean: f64) -> Result<f64, StatsError> {
    if values.len() != weights.len() {
        return Err(StatsError::MismatchedLengths(values.len(), weights.len()));
    }
    let (sum_w, sum_wd2) = values
        .iter()
        .zip(weights)
        .fold((0.0, 0.0), |(sw, swd2), (&v, &w)| {
            (sw + w, swd2 + w * (v - mean) * (v - mean))
        });
    if sum_w <= 0.0 {
        return Err(StatsError::NoData);
    }
    Ok(sum_wd2 / sum_w)
}

/// Result of an iterative sigma-clipped mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    pub mean: f64,
    pub std_dev: f64,
    /// Number of values surviving the final clip
    pub n_used: usize,
}

/// Sigma-clipped mean of unweighted finite values.
///
/// The first pass clips about the median using the unclipped standard
/// deviation; later passes use the clipped mean and deviation. A pass that
/// would reject every value is not applied.
pub fn clipped_mean(
    values: &[f64],
    sigma: f64,
    iterations: usize,
) -> Result<ClippedStats, StatsError> {
    check_finite(values)?;
    let ones = vec![1.0; values.len()];

    let mut center = median(values)?;
    let mean = weighted_mean(values, &ones)?;
    let mut std_dev = weighted_variance(values, &ones, mean)?.sqrt();
    let mut active: Vec<f64> = values.to_vec();

    for _ in 0..iterations {
        if std_dev <= 0.0 {
            break;
        }
        let limit = sigma * std_dev;
        let kept: Vec<f64> = active
            .iter()
            .copied()
            .filter(|v| (v - center).abs() <= limit)
            .collect();
        if kept.is_empty() || kept.len() == active.len() {
            break;
        }
        active = kept;
        let ones = &ones[..active.len()];
        center = weighted_mean(&active, ones)?;
        std_dev = weighted_variance(&active, ones, center)?.sqrt();
    }

    let ones = &ones[..active.len()];
    let mean = weighted_mean(&active, ones)?;
    let std_dev = weighted_variance(&active, ones, mean)?.sqrt();
    Ok(ClippedStats {
        mean,
        std_dev,
        n_used: active.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]).unwrap(), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]).unwrap(), 2.5);
        assert_eq!(median(&[7.0f32]).unwrap(), 7.0);
    }

    #[test]
    fn test_median_rejects_nan_and_empty() {
        assert_eq!(median(&[1.0, f64::NAN]), Err(StatsError::NonFinite(1)));
        assert_eq!(median::<f64>(&[]), Err(StatsError::NoData));
    }

    #[test]
    fn test_robust_sigma_of_uniform_grid() {
        let values: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        assert_relative_eq!(robust_sigma(&values).unwrap(), IQR_TO_SIGMA * 50.0);
    }

    #[test]
    fn test_weighted_mean_identical_values_exact() {
        let values = [0.1 + 0.2; 7];
        let weights = [0.3, 1.7, 2.9, 0.01, 5.0, 1.0, 0.5];
        assert_eq!(weighted_mean(&values, &weights).unwrap(), 0.1 + 0.2);
    }

    #[test]
    fn test_weighted_variance() {
        let values = [1.0, 3.0];
        let weights = [1.0, 3.0];
        let mean = weighted_mean(&values, &weights).unwrap();
        assert_relative_eq!(mean, 2.5);
        assert_relative_eq!(
            weighted_variance(&values, &weights, mean).unwrap(),
            (1.0 * 2.25 + 3.0 * 0.25) / 4.0
        );
    }

    #[test]
    fn test_clipped_mean_rejects_outlier() {
        let mut values = vec![10.0; 20];
        values[3] = 11.0;
        values[7] = 9.0;
        values[12] = 1000.0;
        let stats = clipped_mean(&values, 3.0, 1).unwrap();
        assert_eq!(stats.n_used, 19);
        assert_relative_eq!(stats.mean, 10.0);

        // Further passes tighten around the clipped core
        let stats = clipped_mean(&values, 3.0, 3).unwrap();
        assert_eq!(stats.n_used, 17);
        assert_eq!(stats.mean, 10.0);
    }

    #[test]
    fn test_clipped_mean_constant_input() {
        let stats = clipped_mean(&[4.0; 5], 3.0, 2).unwrap();
        assert_eq!(stats.mean, 4.0);
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.n_used, 5);
    }
}
