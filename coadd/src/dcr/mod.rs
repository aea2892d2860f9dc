//! Differential chromatic refraction (DCR) coadds.
//!
//! The atmosphere shifts blue light further towards the zenith than red, so
//! the same source lands at slightly different positions in visits taken at
//! different airmasses. This module splits the filter into sub-bands, models
//! the sky in each one, and solves for models that reproduce every visit once
//! shifted by its refraction.

pub mod model;
pub mod refraction;
pub mod solver;

pub use model::{background_scatter, clamp_model, regularize_frequency, DcrModel};
pub use refraction::{
    dcr_shifts, differential_refraction_arcsec, refraction_arcsec, refractivity, subband_edges,
    DcrShift,
};
pub use solver::{ConvergenceState, DcrAssembler, DcrCoadds, DcrSupplementary, StopReason};
