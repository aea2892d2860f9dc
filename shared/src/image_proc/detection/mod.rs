//! Source detection on image triples.
//!
//! The coadd strategies only depend on the [`Detector`] trait: given an image
//! triple and a smoothing flag it returns connected positive and negative
//! pixel regions. [`ThresholdDetector`] is the reference implementation,
//! thresholding the (optionally Gaussian-smoothed) image and growing the
//! resulting footprints.

pub mod config;
pub mod footprint;
pub mod threshold;

pub use config::{DetectionConfig, Polarity, ThresholdType};
pub use footprint::{Footprint, FootprintSet};
pub use threshold::ThresholdDetector;

use thiserror::Error;

use super::masked_image::MaskedImage;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("Cannot run detection on an empty image")]
    EmptyImage,
    #[error("Invalid detection configuration: {0}")]
    InvalidConfig(String),
    #[error("Could not estimate image noise for thresholding")]
    NoiseEstimate,
}

/// Detection primitive used by the rejection strategies.
pub trait Detector: Send + Sync {
    /// Detect connected regions of significant positive and negative flux.
    fn detect(&self, image: &MaskedImage, smooth: bool) -> Result<FootprintSet, DetectionError>;
}
