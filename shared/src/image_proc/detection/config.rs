//! Detection thresholds and footprint post-processing settings.

use serde::{Deserialize, Serialize};

use super::DetectionError;

/// How [`DetectionConfig::threshold`] is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    /// Absolute pixel value
    Value,
    /// Multiple of the robust standard deviation of the whole image
    Stdev,
    /// Multiple of each pixel's own `sqrt(variance)`
    PixelStdev,
}

/// Which signs of deviation to detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
    Both,
}

impl Polarity {
    pub fn includes_positive(&self) -> bool {
        matches!(self, Polarity::Positive | Polarity::Both)
    }

    pub fn includes_negative(&self) -> bool {
        matches!(self, Polarity::Negative | Polarity::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub threshold: f64,
    pub threshold_type: ThresholdType,
    pub polarity: Polarity,
    /// Footprints with fewer pixels (before growing) are discarded
    pub min_pixels: usize,
    /// Isotropic growth applied to every surviving footprint
    pub n_grow: usize,
    /// Gaussian sigma in pixels used when smoothing is requested
    pub smoothing_sigma: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 5.0,
            threshold_type: ThresholdType::PixelStdev,
            polarity: Polarity::Positive,
            min_pixels: 1,
            n_grow: 0,
            smoothing_sigma: 1.0,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), DetectionError> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(DetectionError::InvalidConfig(format!(
                "threshold must be positive, got {}",
                self.threshold
            )));
        }
        if !self.smoothing_sigma.is_finite() || self.smoothing_sigma <= 0.0 {
            return Err(DetectionError::InvalidConfig(format!(
                "smoothing_sigma must be positive, got {}",
                self.smoothing_sigma
            )));
        }
        if self.min_pixels == 0 {
            return Err(DetectionError::InvalidConfig(
                "min_pixels must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DetectionConfig =
            serde_json::from_str(r#"{"threshold": 2.0, "polarity": "both"}"#).unwrap();
        assert_eq!(config.threshold, 2.0);
        assert_eq!(config.polarity, Polarity::Both);
        assert_eq!(config.threshold_type, ThresholdType::PixelStdev);
    }

    #[test]
    fn test_validate() {
        assert!(DetectionConfig::default().validate().is_ok());
        let bad = DetectionConfig {
            threshold: -1.0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(DetectionError::InvalidConfig(_))));
    }
}
