//! Numerical algorithms shared by the stacker and the rejection strategies.

pub mod stats;

pub use stats::{clipped_mean, median, robust_sigma, ClippedStats, StatsError};
