//! Threshold-and-grow detection.
//!
//! Pixels whose (optionally smoothed) value exceeds the configured threshold
//! are grouped into 8-connected footprints. Footprints smaller than
//! `min_pixels` are dropped, the rest are grown by `n_grow` pixels, and grown
//! footprints that touch are merged.
//!
//! Non-finite pixels never detect and are treated as zero when smoothing, so
//! a NO_DATA hole does not spread NaN into its neighbours.

use ndarray::{Array2, Zip};

use super::config::{DetectionConfig, Polarity, ThresholdType};
use super::footprint::{Footprint, FootprintSet};
use super::{DetectionError, Detector};
use crate::algo::stats::robust_sigma;
use crate::image_proc::aabb::AABB;
use crate::image_proc::convolve2d::{convolve2d, gaussian_kernel, kernel_size_for_sigma};
use crate::image_proc::masked_image::MaskedImage;
use crate::image_proc::span_set::SpanSet;

#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    config: DetectionConfig,
}

impl ThresholdDetector {
    pub fn new(config: DetectionConfig) -> Result<Self, DetectionError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Smoothed signal and its propagated variance.
    fn smooth(&self, image: &Array2<f64>, variance: &Array2<f64>) -> (Array2<f64>, Array2<f64>) {
        let sigma = self.config.smoothing_sigma;
        let kernel = gaussian_kernel(kernel_size_for_sigma(sigma), sigma);
        let kernel_sq = kernel.mapv(|k| k * k);
        (
            convolve2d(&image.view(), &kernel.view()),
            convolve2d(&variance.view(), &kernel_sq.view()),
        )
    }

    /// Per-pixel detection limit on the absolute signal.
    fn limits(
        &self,
        signal: &Array2<f64>,
        variance: &Array2<f64>,
        valid: &Array2<bool>,
    ) -> Result<Array2<f64>, DetectionError> {
        let threshold = self.config.threshold;
        match self.config.threshold_type {
            ThresholdType::Value => Ok(Array2::from_elem(signal.dim(), threshold)),
            ThresholdType::Stdev => {
                let values: Vec<f64> = Zip::from(signal).and(valid).fold(
                    Vec::new(),
                    |mut acc, &s, &ok| {
                        if ok {
                            acc.push(s);
                        }
                        acc
                    },
                );
                let sigma = robust_sigma(&values).map_err(|_| DetectionError::NoiseEstimate)?;
                Ok(Array2::from_elem(signal.dim(), threshold * sigma))
            }
            ThresholdType::PixelStdev => Ok(variance.mapv(|v| {
                if v > 0.0 {
                    threshold * v.sqrt()
                } else {
                    f64::INFINITY
                }
            })),
        }
    }

    fn footprints(
        &self,
        bbox: &AABB,
        detected: &Array2<bool>,
        image: &Array2<f64>,
        polarity: Polarity,
    ) -> Vec<Footprint> {
        let candidates = SpanSet::from_predicate(bbox, detected.view(), |&d| d);
        let grown = candidates
            .split()
            .into_iter()
            .filter(|component| component.area() >= self.config.min_pixels)
            .fold(SpanSet::new(), |acc, component| {
                acc.union(&component.dilated(self.config.n_grow).clipped_to(bbox))
            });

        grown
            .split()
            .into_iter()
            .map(|spans| {
                let peak = spans
                    .local_indices(bbox)
                    .map(|idx| image[idx].abs())
                    .fold(0.0, f64::max);
                Footprint::new(spans, peak, polarity)
            })
            .collect()
    }
}

impl Detector for ThresholdDetector {
    fn detect(&self, image: &MaskedImage, smooth: bool) -> Result<FootprintSet, DetectionError> {
        if !image.bbox.is_valid() || image.image.is_empty() {
            return Err(DetectionError::EmptyImage);
        }

        let valid = Zip::from(&image.image)
            .and(&image.variance)
            .map_collect(|v, var| v.is_finite() && var.is_finite());
        let clean_image = Zip::from(&image.image)
            .and(&valid)
            .map_collect(|&v, &ok| if ok { v } else { 0.0 });
        let clean_variance = Zip::from(&image.variance)
            .and(&valid)
            .map_collect(|&v, &ok| if ok { v.max(0.0) } else { 0.0 });

        let (signal, variance) = if smooth {
            self.smooth(&clean_image, &clean_variance)
        } else {
            (clean_image.clone(), clean_variance)
        };
        let limits = self.limits(&signal, &variance, &valid)?;

        let mut result = FootprintSet::new();
        if self.config.polarity.includes_positive() {
            let above = Zip::from(&signal)
                .and(&limits)
                .and(&valid)
                .map_collect(|&s, &l, &ok| ok && s > l);
            result.positive = self.footprints(&image.bbox, &above, &clean_image, Polarity::Positive);
        }
        if self.config.polarity.includes_negative() {
            let below = Zip::from(&signal)
                .and(&limits)
                .and(&valid)
                .map_collect(|&s, &l, &ok| ok && -s > l);
            result.negative =
                self.footprints(&image.bbox, &below, &clean_image, Polarity::Negative);
        }

        log::debug!(
            "Detected {} positive and {} negative footprints in {}",
            result.positive.len(),
            result.negative.len(),
            image.bbox
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: f64, polarity: Polarity) -> DetectionConfig {
        DetectionConfig {
            threshold,
            threshold_type: ThresholdType::PixelStdev,
            polarity,
            min_pixels: 1,
            n_grow: 0,
            smoothing_sigma: 1.0,
        }
    }

    #[test]
    fn test_detects_both_polarities() {
        let bbox = AABB::from_origin_size(100, 200, 20, 20);
        let mut image = MaskedImage::filled(bbox, 0.0, 1.0, 0);
        image.image[[5, 5]] = 50.0;
        image.image[[5, 6]] = 40.0;
        image.image[[15, 12]] = -30.0;

        let detector = ThresholdDetector::new(config(5.0, Polarity::Both)).unwrap();
        let found = detector.detect(&image, false).unwrap();

        assert_eq!(found.positive.len(), 1);
        assert_eq!(found.positive[0].area(), 2);
        assert_eq!(found.positive[0].peak, 50.0);
        assert!(found.positive[0].spans.contains_point(105, 205));
        assert_eq!(found.negative.len(), 1);
        assert!(found.negative[0].spans.contains_point(115, 212));
    }

    #[test]
    fn test_min_pixels_and_growth() {
        let bbox = AABB::from_origin_size(0, 0, 20, 20);
        let mut image = MaskedImage::filled(bbox, 0.0, 1.0, 0);
        image.image[[2, 2]] = 50.0;
        for c in 10..13 {
            image.image[[10, c]] = 50.0;
        }

        let mut cfg = config(5.0, Polarity::Positive);
        cfg.min_pixels = 2;
        cfg.n_grow = 1;
        let found = ThresholdDetector::new(cfg).unwrap().detect(&image, false).unwrap();

        assert_eq!(found.positive.len(), 1);
        // A 1x3 run grown by one pixel: 3 + 5 + 3
        assert_eq!(found.positive[0].area(), 11);
    }

    #[test]
    fn test_nan_pixels_never_detect() {
        let bbox = AABB::from_origin_size(0, 0, 10, 10);
        let mut image = MaskedImage::filled(bbox, 0.0, 1.0, 0);
        image.image[[3, 3]] = f64::NAN;
        image.image[[6, 6]] = 100.0;

        let found = ThresholdDetector::new(config(5.0, Polarity::Both))
            .unwrap()
            .detect(&image, true)
            .unwrap();
        assert_eq!(found.positive.len(), 1);
        assert!(found.negative.is_empty());
        assert!(!found.positive[0].spans.contains_point(3, 3));
    }

    #[test]
    fn test_zero_variance_never_detects_in_pixel_stdev_mode() {
        let bbox = AABB::from_origin_size(0, 0, 5, 5);
        let mut image = MaskedImage::filled(bbox, 0.0, 0.0, 0);
        image.image[[2, 2]] = 100.0;
        let found = ThresholdDetector::new(config(5.0, Polarity::Both))
            .unwrap()
            .detect(&image, false)
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_value_threshold() {
        let bbox = AABB::from_origin_size(0, 0, 5, 5);
        let mut image = MaskedImage::filled(bbox, 0.0, 0.0, 0);
        image.image[[1, 1]] = 3.0;
        image.image[[3, 3]] = 1.0;
        let mut cfg = config(2.0, Polarity::Positive);
        cfg.threshold_type = ThresholdType::Value;
        let found = ThresholdDetector::new(cfg).unwrap().detect(&image, false).unwrap();
        assert_eq!(found.positive.len(), 1);
        assert_eq!(found.positive[0].bbox(), AABB::from_coords(1, 1, 1, 1));
    }

    #[test]
    fn test_empty_image() {
        let detector = ThresholdDetector::new(DetectionConfig::default()).unwrap();
        let empty = MaskedImage::new(AABB::new());
        assert_eq!(detector.detect(&empty, false), Err(DetectionError::EmptyImage));
    }
}
