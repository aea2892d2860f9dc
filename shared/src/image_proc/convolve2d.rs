//! 2D convolution for detection smoothing
//!
//! Detection on a difference image optionally smooths with a normalized
//! Gaussian before thresholding. The variance plane of a smoothed image is
//! propagated with the squared kernel, see [`gaussian_kernel`] and
//! [`convolve2d`].

use ndarray::{Array2, ArrayView2, Zip};

/// 2D convolution of an image with a kernel, zero-padded to the input size
///
/// The kernel is applied without flipping, which is a convolution for the
/// symmetric kernels used here. Output rows are computed in parallel.
///
/// # Arguments
/// * `image` - Input image as a 2D array
/// * `kernel` - Convolution kernel, centred on `(rows / 2, cols / 2)`
///
/// # Returns
/// * Result of the convolution, same shape as `image`
pub fn convolve2d(image: &ArrayView2<f64>, kernel: &ArrayView2<f64>) -> Array2<f64> {
    let (img_rows, img_cols) = image.dim();
    let (ker_rows, ker_cols) = kernel.dim();
    let (offset_rows, offset_cols) = (ker_rows / 2, ker_cols / 2);

    let mut output = Array2::zeros((img_rows, img_cols));
    Zip::indexed(&mut output).par_for_each(|(i, j), out| {
        let mut sum = 0.0;
        for ki in 0..ker_rows {
            let row = (i + ki) as isize - offset_rows as isize;
            if row < 0 || row >= img_rows as isize {
                continue;
            }
            for kj in 0..ker_cols {
                let col = (j + kj) as isize - offset_cols as isize;
                if col < 0 || col >= img_cols as isize {
                    continue;
                }
                sum += image[[row as usize, col as usize]] * kernel[[ki, kj]];
            }
        }
        *out = sum;
    });

    output
}

/// Create a Gaussian kernel with specified size and sigma
///
/// # Arguments
/// * `size` - Size of the kernel (must be odd)
/// * `sigma` - Standard deviation of the Gaussian
///
/// # Returns
/// * Gaussian kernel normalized to unit sum
pub fn gaussian_kernel(size: usize, sigma: f64) -> Array2<f64> {
    assert!(size % 2 == 1, "Kernel size must be odd");

    let center = (size / 2) as f64;
    let mut kernel = Array2::from_shape_fn((size, size), |(i, j)| {
        let y = i as f64 - center;
        let x = j as f64 - center;
        (-(x * x + y * y) / (2.0 * sigma * sigma)).exp()
    });

    let sum = kernel.sum();
    if sum > 0.0 {
        kernel.mapv_inplace(|x| x / sum);
    }

    kernel
}

/// Odd kernel size covering ±4σ.
pub fn kernel_size_for_sigma(sigma: f64) -> usize {
    2 * (4.0 * sigma).ceil().max(1.0) as usize + 1
}
