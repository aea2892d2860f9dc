//! Named mask-plane registry.
//!
//! Every mask pixel is a `u32` bitfield. Each bit is a named plane ("BAD",
//! "SAT", "CLIPPED", ...). Planes are added at runtime by name and keep their
//! bit for the lifetime of the registry. Adding a name twice returns the bit
//! it already has, so independent components can register the planes they
//! need without coordinating.
//!
//! The registry is shared through an `Arc<MaskPlaneRegistry>` handle rather
//! than a global.

use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Standard plane names registered by [`MaskPlaneRegistry::new`], in bit order.
pub mod planes {
    pub const BAD: &str = "BAD";
    pub const SAT: &str = "SAT";
    pub const INTRP: &str = "INTRP";
    pub const CR: &str = "CR";
    pub const EDGE: &str = "EDGE";
    pub const DETECTED: &str = "DETECTED";
    pub const DETECTED_NEGATIVE: &str = "DETECTED_NEGATIVE";
    pub const SUSPECT: &str = "SUSPECT";
    pub const NO_DATA: &str = "NO_DATA";

    // Planes registered by the coadd assembler.
    pub const REJECTED: &str = "REJECTED";
    pub const CLIPPED: &str = "CLIPPED";
    pub const SENSOR_EDGE: &str = "SENSOR_EDGE";
    pub const INEXACT_PSF: &str = "INEXACT_PSF";

    pub const DEFAULT: [&str; 9] = [
        BAD,
        SAT,
        INTRP,
        CR,
        EDGE,
        DETECTED,
        DETECTED_NEGATIVE,
        SUSPECT,
        NO_DATA,
    ];
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaskError {
    #[error("Unknown mask plane: {0}")]
    UnknownPlane(String),
    #[error("Cannot add mask plane {0}: all {1} bits are in use")]
    TooManyPlanes(String, usize),
}

/// Append-only table mapping plane names to bit indices.
#[derive(Debug)]
pub struct MaskPlaneRegistry {
    planes: RwLock<Vec<String>>,
}

impl MaskPlaneRegistry {
    /// Number of planes a `u32` mask can hold.
    pub const MAX_PLANES: usize = 32;

    /// Create a registry pre-populated with the standard planes.
    pub fn new() -> Self {
        Self {
            planes: RwLock::new(planes::DEFAULT.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Create a standard registry behind a shareable handle.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<String>> {
        // A panic while holding the lock cannot leave the table half-written:
        // every mutation is a single push.
        self.planes.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a plane, or return the bit index of an existing plane of that name.
    pub fn add_plane(&self, name: &str) -> Result<u32, MaskError> {
        if let Some(index) = self.read().iter().position(|p| p == name) {
            return Ok(index as u32);
        }

        let mut table = self.planes.write().unwrap_or_else(|e| e.into_inner());
        // Another writer may have added it between the two locks.
        if let Some(index) = table.iter().position(|p| p == name) {
            return Ok(index as u32);
        }
        if table.len() >= Self::MAX_PLANES {
            return Err(MaskError::TooManyPlanes(name.to_string(), Self::MAX_PLANES));
        }
        table.push(name.to_string());
        log::debug!("Registered mask plane {} as bit {}", name, table.len() - 1);
        Ok((table.len() - 1) as u32)
    }

    /// Bit index of an existing plane.
    pub fn plane_index(&self, name: &str) -> Result<u32, MaskError> {
        self.read()
            .iter()
            .position(|p| p == name)
            .map(|i| i as u32)
            .ok_or_else(|| MaskError::UnknownPlane(name.to_string()))
    }

    /// Single-bit mask value of an existing plane.
    pub fn plane_bit(&self, name: &str) -> Result<u32, MaskError> {
        self.plane_index(name).map(|i| 1u32 << i)
    }

    /// OR of the bits of every named plane. Fails on the first unknown name.
    pub fn plane_bitmask<S: AsRef<str>>(&self, names: &[S]) -> Result<u32, MaskError> {
        names
            .iter()
            .try_fold(0u32, |acc, name| Ok(acc | self.plane_bit(name.as_ref())?))
    }

    /// Add every named plane (idempotently) and return the OR of their bits.
    pub fn add_planes<S: AsRef<str>>(&self, names: &[S]) -> Result<u32, MaskError> {
        names
            .iter()
            .try_fold(0u32, |acc, name| Ok(acc | (1u32 << self.add_plane(name.as_ref())?)))
    }

    /// Names of the planes set in `mask`, in bit order.
    pub fn plane_names(&self, mask: u32) -> Vec<String> {
        self.read()
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1u32 << i) != 0)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Number of registered planes.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for MaskPlaneRegistry {
    fn default() -> Self {
        Self::new()
    }
}
