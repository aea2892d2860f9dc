//! Image dimensions and size utilities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Image dimensions structure
///
/// Used for tile (sub-region) sizes in the coadd assembler. Parses from and
/// prints as `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Image width in pixels
    pub width: usize,
    /// Image height in pixels
    pub height: usize,
}

impl ImageSize {
    /// Create a new ImageSize
    pub fn from_width_height(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Get total number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// True when either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Expected WIDTHxHEIGHT, got '{s}'"))?;
        let width = w
            .trim()
            .parse()
            .map_err(|e| format!("Invalid width '{w}': {e}"))?;
        let height = h
            .trim()
            .parse()
            .map_err(|e| format!("Invalid height '{h}': {e}"))?;
        Ok(Self { width, height })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let size: ImageSize = "2000x1500".parse().unwrap();
        assert_eq!(size, ImageSize::from_width_height(2000, 1500));
        assert_eq!(size.to_string(), "2000x1500");
        assert_eq!(size.pixel_count(), 3_000_000);
    }

    #[test]
    fn test_parse_errors() {
        assert!("2000".parse::<ImageSize>().is_err());
        assert!("ax5".parse::<ImageSize>().is_err());
    }

    #[test]
    fn test_is_empty() {
        assert!(ImageSize::from_width_height(0, 10).is_empty());
        assert!(!ImageSize::from_width_height(1, 1).is_empty());
    }
}
