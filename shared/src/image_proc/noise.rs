//! Noise utilities for coadd inputs.
//!
//! Provides the two noise-related primitives the coadd pipeline needs:
//! - Seeded Gaussian noise generation for synthetic epochs and tests
//! - Empirical variance-plane rescaling, used to correct difference images
//!   whose propagated variance under- or over-states the actual pixel scatter
//!
//! # Variance Rescaling
//!
//! For a correctly calibrated image, `value / sqrt(variance)` of background
//! pixels has unit scatter. The robust (IQR-based) scatter of that ratio over
//! unmasked pixels, squared, is the factor the variance plane is off by.

use ndarray::{Array2, Zip};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, NormalError};
use thiserror::Error;

use super::masked_image::MaskedImage;
use crate::algo::stats::robust_sigma;

/// Minimum number of usable pixels for an empirical variance estimate.
pub const MIN_VARIANCE_SCALE_PIXELS: usize = 16;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VarianceScaleError {
    #[error("Only {0} usable pixels for variance estimation")]
    TooFewPixels(usize),
    #[error("Degenerate variance scale factor {0}")]
    Degenerate(f64),
}

/// Generate a 2D array of normally distributed values for testing purposes.
///
/// # Arguments
/// * `size` - Tuple of (height, width) for the output array dimensions
/// * `mean` - Mean value of the normal distribution
/// * `std_dev` - Standard deviation of the normal distribution
/// * `seed` - Random seed for deterministic output
///
/// # Returns
/// A 2D array with values sampled from Normal(mean, std_dev)
///
/// # Example
/// ```
/// use shared::image_proc::noise::simple_normal_array;
///
/// let noise = simple_normal_array((10, 10), 100.0, 10.0, 42).unwrap();
/// assert_eq!(noise.dim(), (10, 10));
/// ```
pub fn simple_normal_array(
    size: (usize, usize),
    mean: f64,
    std_dev: f64,
    seed: u64,
) -> Result<Array2<f64>, NormalError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal_dist = Normal::new(mean, std_dev)?;
    Ok(Array2::from_shape_fn(size, |_| normal_dist.sample(&mut rng)))
}

/// Add zero-mean Gaussian noise drawn from each pixel's own variance.
pub fn add_gaussian_noise(image: &mut MaskedImage, seed: u64) -> Result<(), NormalError> {
    let unit = simple_normal_array(image.shape(), 0.0, 1.0, seed)?;
    Zip::from(&mut image.image)
        .and(&image.variance)
        .and(&unit)
        .for_each(|value, &var, &n| {
            if var.is_finite() && var > 0.0 {
                *value += n * var.sqrt();
            }
        });
    Ok(())
}

/// Estimate the factor by which the variance plane should be multiplied so
/// that it matches the observed pixel scatter.
///
/// Only finite, positive-variance pixels with none of `bad_mask` set are used.
pub fn estimate_variance_scale(
    image: &MaskedImage,
    bad_mask: u32,
) -> Result<f64, VarianceScaleError> {
    let normalized: Vec<f64> = Zip::from(&image.image)
        .and(&image.variance)
        .and(&image.mask)
        .fold(Vec::new(), |mut acc, &v, &var, &m| {
            if m & bad_mask == 0 && v.is_finite() && var.is_finite() && var > 0.0 {
                acc.push(v / var.sqrt());
            }
            acc
        });

    if normalized.len() < MIN_VARIANCE_SCALE_PIXELS {
        return Err(VarianceScaleError::TooFewPixels(normalized.len()));
    }

    let sigma =
        robust_sigma(&normalized).map_err(|_| VarianceScaleError::TooFewPixels(0))?;
    let factor = sigma * sigma;
    if !factor.is_finite() || factor <= 0.0 {
        return Err(VarianceScaleError::Degenerate(factor));
    }
    Ok(factor)
}
