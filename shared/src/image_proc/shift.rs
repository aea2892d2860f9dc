//! Sub-pixel image shifts by bilinear interpolation.
//!
//! A shift by `(dx, dy)` moves content right by `dx` columns and down by `dy`
//! rows: `out[r, c] = in[r - dy, c - dx]`, sampled bilinearly. Samples that
//! fall outside the input contribute zero. Shifting by `(-dx, -dy)` undoes a
//! shift up to interpolation smoothing.

use ndarray::{Array2, ArrayView2, Zip};

/// Bilinear taps `(index, weight)` for a sample at `(y, x)`. The index is
/// `None` when the tap falls outside a `rows x cols` input.
fn taps(y: f64, x: f64, rows: usize, cols: usize) -> [(Option<(usize, usize)>, f64); 4] {
    let y0 = y.floor();
    let x0 = x.floor();
    let fy = y - y0;
    let fx = x - x0;
    let index = |ty: f64, tx: f64| {
        (ty >= 0.0 && tx >= 0.0 && (ty as usize) < rows && (tx as usize) < cols)
            .then(|| (ty as usize, tx as usize))
    };
    [
        (index(y0, x0), (1.0 - fy) * (1.0 - fx)),
        (index(y0, x0 + 1.0), (1.0 - fy) * fx),
        (index(y0 + 1.0, x0), fy * (1.0 - fx)),
        (index(y0 + 1.0, x0 + 1.0), fy * fx),
    ]
}

/// Shift an image by `(dx, dy)` pixels with zero fill.
pub fn shift_image(src: ArrayView2<f64>, dx: f64, dy: f64) -> Array2<f64> {
    let (rows, cols) = src.dim();
    let mut out = Array2::zeros((rows, cols));
    Zip::indexed(&mut out).par_for_each(|(r, c), value| {
        let mut sum = 0.0;
        for (idx, w) in taps(r as f64 - dy, c as f64 - dx, rows, cols) {
            if let (Some(idx), true) = (idx, w != 0.0) {
                sum += w * src[idx];
            }
        }
        *value = sum;
    });
    out
}

/// Shift a mask by `(dx, dy)` pixels.
///
/// Each output pixel is the OR of every input pixel contributing to its
/// bilinear sample; samples reaching outside the input OR in `fill`.
pub fn shift_mask(src: ArrayView2<u32>, dx: f64, dy: f64, fill: u32) -> Array2<u32> {
    let (rows, cols) = src.dim();
    let mut out = Array2::zeros((rows, cols));
    Zip::indexed(&mut out).par_for_each(|(r, c), bits| {
        let mut acc = 0u32;
        for (idx, w) in taps(r as f64 - dy, c as f64 - dx, rows, cols) {
            if w != 0.0 {
                acc |= idx.map_or(fill, |idx| src[idx]);
            }
        }
        *bits = acc;
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_integer_shift_is_exact() {
        let src = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        let shifted = shift_image(src.view(), 1.0, 0.0);
        assert_eq!(shifted, array![[0.0, 1.0, 2.0], [0.0, 4.0, 5.0], [0.0, 7.0, 8.0]]);

        let down = shift_image(src.view(), 0.0, 1.0);
        assert_eq!(down.row(0).to_vec(), vec![0.0, 0.0, 0.0]);
        assert_eq!(down.row(1).to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_zero_shift_is_identity_even_with_nan_neighbours() {
        let src = array![[1.0, f64::NAN], [3.0, 4.0]];
        let shifted = shift_image(src.view(), 0.0, 0.0);
        assert_eq!(shifted[[0, 0]], 1.0);
        assert_eq!(shifted[[1, 1]], 4.0);
    }

    #[test]
    fn test_half_pixel_shift_conserves_interior_flux() {
        let mut src = Array2::zeros((9, 9));
        src[[4, 4]] = 8.0;
        let shifted = shift_image(src.view(), 0.5, -0.5);
        assert_relative_eq!(shifted.sum(), 8.0, epsilon = 1e-12);
        assert_relative_eq!(shifted[[4, 4]], 2.0);
        assert_relative_eq!(shifted[[3, 5]], 2.0);
    }

    #[test]
    fn test_shift_mask_fills_edges() {
        let src = array![[1u32, 2], [4, 8]];
        let shifted = shift_mask(src.view(), 0.5, 0.0, 16);
        assert_eq!(shifted[[0, 0]], 16 | 1);
        assert_eq!(shifted[[0, 1]], 1 | 2);
        assert_eq!(shifted[[1, 1]], 4 | 8);
    }
}
