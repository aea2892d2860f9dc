//! Error types for coadd assembly.
//!
//! Only [`ConfigError`], an empty output region, a missing template or a batch
//! with no usable epochs abort an assembly. Everything else is absorbed at the
//! epoch, tile or iteration that produced it and logged.

use shared::algo::StatsError;
use shared::image_proc::detection::DetectionError;
use shared::image_proc::{MaskError, MaskedImageError, AABB};
use thiserror::Error;

use crate::epoch::EpochId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown statistic: {0}")]
    UnknownStatistic(String),
    #[error("Statistic {0} is not supported for coaddition")]
    UnsupportedStatistic(String),
    #[error("{strategy} requires statistic {required}, got {got}")]
    StatisticMismatch {
        strategy: &'static str,
        required: String,
        got: String,
    },
    #[error("Interpolation is not supported with statistic {0}")]
    InterpolationUnsupported(String),
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("Subregion size must be non-empty, got {0}")]
    EmptySubregion(String),
    #[error(transparent)]
    Mask(#[from] MaskError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error("Could not read configuration: {0}")]
    Io(String),
    #[error("Could not parse configuration: {0}")]
    Parse(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StackError {
    #[error("No images to stack")]
    NoImages,
    #[error("{images} images but {weights} weights")]
    WeightCount { images: usize, weights: usize },
    #[error("Image {index} covers {got}, expected {expected}")]
    BBoxMismatch {
        index: usize,
        expected: AABB,
        got: AABB,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoaddError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error(transparent)]
    Image(#[from] MaskedImageError),
    #[error(transparent)]
    Mask(#[from] MaskError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error("Cannot assemble an empty region {0}")]
    EmptyRegion(AABB),
    #[error("No usable input epochs")]
    NoInputs,
    #[error("Epoch {0} has no {1} warp")]
    MissingWarp(EpochId, &'static str),
    #[error("Epoch {0} has no visit information")]
    MissingVisitInfo(EpochId),
    #[error("No static-sky template could be built: {0}")]
    MissingTemplate(String),
    #[error("Epoch index {0} out of range")]
    EpochIndex(usize),
    #[error("Non-finite weight {1} for epoch {0}")]
    NonFiniteWeight(EpochId, f64),
}
