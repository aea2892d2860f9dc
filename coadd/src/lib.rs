//! Tiled coadd assembly for astronomical image stacks
//!
//! Combines many co-registered epochs of one sky patch into a composite image,
//! rejecting per-epoch artifacts along the way:
//!
//! - [`stack`]: per-pixel weighted statistics across epochs
//! - [`assemble`]: tile-by-tile coadd assembly and post-processing
//! - [`safe_clip`]: Safe-Clip rejection of outliers seen in one or two epochs
//! - [`compare_warp`]: Compare-Warp rejection of transients against a template
//! - [`dcr`]: forward modeling of differential chromatic refraction sub-bands
//! - [`strategy`]: the common strategy interface and configuration dispatch
//! - [`scene`]: synthetic patches for demos and end-to-end tests

pub mod assemble;
pub mod compare_warp;
pub mod config;
pub mod dcr;
pub mod epoch;
pub mod error;
pub mod safe_clip;
pub mod scene;
pub mod shared_args;
pub mod stack;
pub mod strategy;

pub use assemble::{assemble_coadd, sub_bbox_iter, AltMaskOverlay, CoaddMetadata, CoaddResult};
pub use config::{AssembleCoaddConfig, CompareWarpConfig, DcrConfig, SafeClipConfig};
pub use epoch::{prepare_inputs, Epoch, EpochId, EpochSource, InMemoryEpochs, PreparedInputs};
pub use error::{CoaddError, ConfigError, StackError};
pub use stack::{statistics_stack, Statistic, StatsControl};
pub use strategy::{AssemblyMethod, CoaddOutput, CoaddStrategy};
