//! Image processing primitives for coadd assembly
//!
//! This module provides the pixel-level building blocks shared by the stacker
//! and the rejection strategies: bounding boxes, mask planes, image triples,
//! span sets, convolution, sub-pixel shifting, interpolation and detection.

pub mod aabb;
pub mod convolve2d;
pub mod detection;
pub mod interp;
pub mod mask;
pub mod masked_image;
pub mod noise;
pub mod shift;
pub mod span_set;

// Re-export key functionality for easier access
pub use aabb::AABB;
pub use convolve2d::{convolve2d, gaussian_kernel};
pub use mask::{MaskError, MaskPlaneRegistry};
pub use masked_image::{MaskedImage, MaskedImageError};
pub use span_set::{Span, SpanSet};
