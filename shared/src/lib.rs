//! Shared image-processing primitives for coadd assembly.
//!
//! Everything here is independent of how epochs are combined: bounding boxes,
//! the mask-plane registry, image triples, run-length pixel regions, the
//! detection primitive and the robust statistics the stacker builds on.

pub mod algo;
pub mod image_proc;
pub mod image_size;
pub mod test_util;

pub use image_size::ImageSize;
