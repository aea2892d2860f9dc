//! Linear interpolation over masked pixels.
//!
//! Coadd pixels that end up with no contributing data are filled row by row
//! from their nearest good neighbours so downstream measurement sees a
//! smooth image. Values beyond the last good pixel of a row are held
//! constant.

use ndarray::{Array2, ArrayViewMut2, Axis};
use thiserror::Error;

/// Errors that can occur during interpolation operations.
#[derive(Error, Debug)]
pub enum InterpError {
    #[error("Value {0} is out of bounds for interpolation range [{1}, {2}]")]
    OutOfBounds(f64, f64, f64),
    #[error("Input vectors must have at least 2 points")]
    InsufficientData,
    #[error("Input vectors must have the same length")]
    MismatchedLengths,
    #[error("X values must be sorted in ascending order")]
    UnsortedData,
}

/// Performs linear interpolation on 1D data using binary search.
///
/// # Arguments
///
/// * `x` - The x-coordinate at which to interpolate
/// * `xs` - Array of x-coordinates (must be sorted in ascending order)
/// * `ys` - Array of corresponding y-values (must match length of xs)
///
/// # Returns
///
/// * `Ok(f64)` - The interpolated y-value at position x
/// * `Err(InterpError)` - Detailed error if interpolation fails
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> Result<f64, InterpError> {
    if xs.len() != ys.len() {
        return Err(InterpError::MismatchedLengths);
    }

    if xs.len() < 2 {
        return Err(InterpError::InsufficientData);
    }

    if xs.windows(2).any(|w| w[1] <= w[0]) {
        return Err(InterpError::UnsortedData);
    }

    let min_x = xs[0];
    let max_x = xs[xs.len() - 1];

    if !(min_x..=max_x).contains(&x) {
        return Err(InterpError::OutOfBounds(x, min_x, max_x));
    }

    let idx = match xs.binary_search_by(|v| v.total_cmp(&x)) {
        Ok(exact_idx) => return Ok(ys[exact_idx]),
        Err(insert_idx) => insert_idx,
    };

    let (x1, x2) = (xs[idx - 1], xs[idx]);
    let (y1, y2) = (ys[idx - 1], ys[idx]);
    let t = (x - x1) / (x2 - x1);
    Ok(y1 + t * (y2 - y1))
}

/// Fill the `bad` pixels of each plane row by row from the good pixels of the
/// same row.
///
/// Rows with no good pixel are left untouched. Returns the number of pixels
/// that were filled.
pub fn interpolate_rows(planes: &mut [ArrayViewMut2<f64>], bad: &Array2<bool>) -> usize {
    let mut filled = 0;
    for (r, bad_row) in bad.axis_iter(Axis(0)).enumerate() {
        let good_cols: Vec<usize> = bad_row
            .iter()
            .enumerate()
            .filter(|(_, &b)| !b)
            .map(|(c, _)| c)
            .collect();
        if good_cols.is_empty() || good_cols.len() == bad_row.len() {
            continue;
        }
        let (first, last) = (good_cols[0], good_cols[good_cols.len() - 1]);
        let xs: Vec<f64> = good_cols.iter().map(|&c| c as f64).collect();

        for plane in planes.iter_mut() {
            let ys: Vec<f64> = good_cols.iter().map(|&c| plane[[r, c]]).collect();
            for (c, _) in bad_row.iter().enumerate().filter(|(_, &b)| b) {
                plane[[r, c]] = if c < first {
                    ys[0]
                } else if c > last {
                    ys[ys.len() - 1]
                } else {
                    // A bad pixel between two good ones always has a bracket.
                    interp(c as f64, &xs, &ys).unwrap_or(f64::NAN)
                };
            }
        }
        filled += bad_row.iter().filter(|&&b| b).count();
    }
    filled
}
