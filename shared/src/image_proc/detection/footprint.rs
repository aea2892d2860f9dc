//! Detected regions.

use super::config::Polarity;
use crate::image_proc::aabb::AABB;
use crate::image_proc::masked_image::MaskedImage;
use crate::image_proc::span_set::SpanSet;

/// A connected set of detected pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    pub spans: SpanSet,
    /// Largest absolute pixel value inside the footprint
    pub peak: f64,
    pub polarity: Polarity,
}

impl Footprint {
    pub fn new(spans: SpanSet, peak: f64, polarity: Polarity) -> Self {
        Self {
            spans,
            peak,
            polarity,
        }
    }

    pub fn area(&self) -> usize {
        self.spans.area()
    }

    pub fn bbox(&self) -> AABB {
        self.spans.bbox()
    }
}

/// Footprints of one detection pass, split by sign.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FootprintSet {
    pub positive: Vec<Footprint>,
    pub negative: Vec<Footprint>,
}

impl FootprintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positive.len() + self.negative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty()
    }

    /// Combine both polarities into connected, non-overlapping footprints.
    ///
    /// Positive and negative footprints that touch become one footprint with
    /// [`Polarity::Both`].
    pub fn merged(&self) -> Vec<Footprint> {
        let all: Vec<&Footprint> = self.positive.iter().chain(self.negative.iter()).collect();
        let union = all
            .iter()
            .fold(SpanSet::new(), |acc, fp| acc.union(&fp.spans));

        union
            .split()
            .into_iter()
            .map(|component| {
                let members: Vec<&&Footprint> = all
                    .iter()
                    .filter(|fp| fp.spans.overlaps(&component))
                    .collect();
                let has_pos = members.iter().any(|fp| fp.polarity.includes_positive());
                let has_neg = members.iter().any(|fp| fp.polarity.includes_negative());
                let polarity = match (has_pos, has_neg) {
                    (true, true) => Polarity::Both,
                    (false, true) => Polarity::Negative,
                    _ => Polarity::Positive,
                };
                let peak = members.iter().map(|fp| fp.peak).fold(0.0, f64::max);
                Footprint::new(component, peak, polarity)
            })
            .collect()
    }

    /// OR `positive_bits` / `negative_bits` into the mask under each footprint.
    pub fn set_mask(&self, image: &mut MaskedImage, positive_bits: u32, negative_bits: u32) {
        for fp in &self.positive {
            fp.spans.set_mask(image, positive_bits);
        }
        for fp in &self.negative {
            fp.spans.set_mask(image, negative_bits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_proc::span_set::Span;

    fn fp(spans: Vec<Span>, peak: f64, polarity: Polarity) -> Footprint {
        Footprint::new(SpanSet::from_spans(spans), peak, polarity)
    }

    #[test]
    fn test_merge_touching_polarities() {
        let set = FootprintSet {
            positive: vec![
                fp(vec![Span::new(0, 0, 2)], 5.0, Polarity::Positive),
                fp(vec![Span::new(10, 0, 0)], 3.0, Polarity::Positive),
            ],
            negative: vec![fp(vec![Span::new(1, 3, 4)], 9.0, Polarity::Negative)],
        };

        let merged = set.merged();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].area(), 5);
        assert_eq!(merged[0].polarity, Polarity::Both);
        assert_eq!(merged[0].peak, 9.0);
        assert_eq!(merged[1].polarity, Polarity::Positive);
    }

    #[test]
    fn test_set_mask() {
        let mut image = MaskedImage::new(AABB::from_origin_size(0, 0, 2, 5));
        let set = FootprintSet {
            positive: vec![fp(vec![Span::new(0, 0, 1)], 1.0, Polarity::Positive)],
            negative: vec![fp(vec![Span::new(1, 3, 4)], 1.0, Polarity::Negative)],
        };
        set.set_mask(&mut image, 1, 2);
        assert_eq!(image.mask.row(0).to_vec(), vec![1, 1, 0, 0, 0]);
        assert_eq!(image.mask.row(1).to_vec(), vec![0, 0, 0, 2, 2]);
    }
}
