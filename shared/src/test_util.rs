//! Synthetic image helpers for tests and demos.
//!
//! Builds deterministic sky images: flat backgrounds, Gaussian point sources
//! and seeded noise, positioned in patch coordinates.

use ndarray::Array2;
use rand_distr::NormalError;

use crate::image_proc::aabb::AABB;
use crate::image_proc::masked_image::MaskedImage;
use crate::image_proc::noise::add_gaussian_noise;

/// Flux image of a circular Gaussian source.
///
/// `row`/`col` are patch coordinates of the centre; `flux` is the total flux
/// the profile would integrate to on an unbounded grid.
pub fn gaussian_source(bbox: &AABB, row: f64, col: f64, flux: f64, sigma: f64) -> Array2<f64> {
    let norm = flux / (2.0 * std::f64::consts::PI * sigma * sigma);
    Array2::from_shape_fn(bbox.shape(), |(r, c)| {
        let dy = (bbox.min_row + r) as f64 - row;
        let dx = (bbox.min_col + c) as f64 - col;
        norm * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
    })
}

/// Image with a constant background and variance and a clear mask.
pub fn flat_image(bbox: AABB, background: f64, variance: f64) -> MaskedImage {
    MaskedImage::filled(bbox, background, variance, 0)
}

/// Flat image plus seeded Gaussian noise drawn from `variance`.
pub fn noisy_image(
    bbox: AABB,
    background: f64,
    variance: f64,
    seed: u64,
) -> Result<MaskedImage, NormalError> {
    let mut image = flat_image(bbox, background, variance);
    add_gaussian_noise(&mut image, seed)?;
    Ok(image)
}
