//! Per-sub-band sky models and the constraints applied between iterations.

use ndarray::{Array2, Zip};
use shared::algo::robust_sigma;
use shared::image_proc::shift::shift_image;
use shared::image_proc::{MaskedImage, MaskedImageError, AABB};

use super::refraction::DcrShift;

/// One model image per sub-band, all on the same bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct DcrModel {
    subbands: Vec<MaskedImage>,
}

impl DcrModel {
    /// Split a template evenly across `n` sub-bands.
    ///
    /// Each sub-band gets `template / n` with variance `template variance / n`.
    pub fn from_template(template: &MaskedImage, n: usize) -> Self {
        let mut subband = template.clone();
        subband.image.mapv_inplace(|v| v / n as f64);
        subband.variance.mapv_inplace(|v| v / n as f64);
        Self {
            subbands: vec![subband; n],
        }
    }

    pub fn from_subbands(subbands: Vec<MaskedImage>) -> Self {
        Self { subbands }
    }

    pub fn len(&self) -> usize {
        self.subbands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subbands.is_empty()
    }

    pub fn subbands(&self) -> &[MaskedImage] {
        &self.subbands
    }

    pub fn subbands_mut(&mut self) -> &mut [MaskedImage] {
        &mut self.subbands
    }

    pub fn into_subbands(self) -> Vec<MaskedImage> {
        self.subbands
    }

    pub fn bbox(&self) -> Option<AABB> {
        self.subbands.first().map(|s| s.bbox)
    }

    pub fn subimage(&self, region: &AABB) -> Result<Self, MaskedImageError> {
        let subbands = self
            .subbands
            .iter()
            .map(|s| s.subimage(region))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { subbands })
    }

    /// Overwrite `region` of every sub-band with the same region of `other`.
    pub fn assign_region(&mut self, other: &Self, region: &AABB) -> Result<(), MaskedImageError> {
        for (mine, theirs) in self.subbands.iter_mut().zip(&other.subbands) {
            mine.assign_region(theirs, region)?;
        }
        Ok(())
    }

    /// Sum of the sub-band models: images and variances add, masks OR.
    pub fn sum(&self) -> Option<MaskedImage> {
        let (first, rest) = self.subbands.split_first()?;
        let mut total = first.clone();
        for subband in rest {
            total.image += &subband.image;
            total.variance += &subband.variance;
            Zip::from(&mut total.mask)
                .and(&subband.mask)
                .for_each(|m, &b| *m |= b);
        }
        Some(total)
    }

    /// Predicted image of a visit: every sub-band shifted by its refraction and
    /// summed.
    pub fn build_matched_template(&self, shifts: &[DcrShift]) -> Array2<f64> {
        let shape = self.subbands.first().map_or((0, 0), |s| s.shape());
        let mut template = Array2::zeros(shape);
        for (subband, shift) in self.subbands.iter().zip(shifts) {
            template += &shift_image(subband.image.view(), shift.dx, shift.dy);
        }
        template
    }

    /// Blend towards `new` with gain `g`: `(self + g * new) / (1 + g)`.
    pub fn blend(&mut self, new: &Self, gain: f64) {
        let norm = 1.0 / (1.0 + gain);
        for (old, new) in self.subbands.iter_mut().zip(&new.subbands) {
            Zip::from(&mut old.image)
                .and(&new.image)
                .for_each(|o, &n| *o = (*o + gain * n) * norm);
            old.variance.assign(&new.variance);
            Zip::from(&mut old.mask)
                .and(&new.mask)
                .for_each(|m, &b| *m |= b);
        }
    }
}

/// Robust scatter of the finite pixels of an image; zero when there are none.
pub fn background_scatter(image: &Array2<f64>) -> f64 {
    let values: Vec<f64> = image.iter().copied().filter(|v| v.is_finite()).collect();
    robust_sigma(&values).unwrap_or(0.0)
}

/// Limit how far a model update may move each pixel.
///
/// The new value is held to `[old / factor - floor, |old| * factor + floor]`.
/// Non-finite new values become zero and gain `no_data`.
pub fn clamp_model(new: &mut MaskedImage, old: &MaskedImage, factor: f64, floor: f64, no_data: u32) {
    Zip::from(&mut new.image)
        .and(&mut new.mask)
        .and(&old.image)
        .for_each(|v, m, &o| {
            if !v.is_finite() {
                *v = 0.0;
                *m |= no_data;
                return;
            }
            let lo = o / factor - floor;
            let hi = o.abs() * factor + floor;
            // NaN bounds are ignored by max/min.
            *v = v.max(lo).min(hi);
        });
}

/// Keep each sub-band within a factor `clamp` of the mean model.
///
/// Per pixel the bounds are `min(m̄c, m̄/c) - floor` and `max(m̄c, m̄/c) + floor`.
/// Flux removed by clamping is shared equally across sub-bands, so the sum
/// over sub-bands is unchanged.
pub fn regularize_frequency(model: &mut DcrModel, clamp: f64, floor: f64) {
    let n = model.len();
    if n < 2 || clamp <= 0.0 {
        return;
    }
    let (rows, cols) = model.subbands[0].shape();
    let mut values = vec![0.0; n];
    for r in 0..rows {
        for c in 0..cols {
            for (v, subband) in values.iter_mut().zip(&model.subbands) {
                *v = subband.image[[r, c]];
            }
            if values.iter().any(|v| !v.is_finite()) {
                continue;
            }
            let mean = values.iter().sum::<f64>() / n as f64;
            let lo = (mean * clamp).min(mean / clamp) - floor;
            let hi = (mean * clamp).max(mean / clamp) + floor;
            let mut excess = 0.0;
            for v in values.iter_mut() {
                let clamped = v.max(lo).min(hi);
                excess += *v - clamped;
                *v = clamped;
            }
            let share = excess / n as f64;
            for (v, subband) in values.iter().zip(model.subbands.iter_mut()) {
                subband.image[[r, c]] = v + share;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn bbox() -> AABB {
        AABB::from_origin_size(0, 0, 2, 3)
    }

    fn model_from(images: &[Array2<f64>]) -> DcrModel {
        DcrModel::from_subbands(
            images
                .iter()
                .map(|image| {
                    MaskedImage::from_parts(
                        bbox(),
                        image.clone(),
                        Array2::ones((2, 3)),
                        Array2::zeros((2, 3)),
                    )
                    .unwrap()
                })
                .collect(),
        )
    }

    #[test]
    fn test_from_template_splits_flux() {
        let template = MaskedImage::filled(bbox(), 9.0, 3.0, 0);
        let model = DcrModel::from_template(&template, 3);
        assert_eq!(model.len(), 3);
        for subband in model.subbands() {
            assert_relative_eq!(subband.image[[1, 2]], 3.0);
            assert_relative_eq!(subband.variance[[0, 0]], 1.0);
        }
        let total = model.sum().unwrap();
        assert_relative_eq!(total.image[[0, 1]], 9.0);
    }

    #[test]
    fn test_matched_template_without_shifts_is_sum() {
        let model = model_from(&[
            array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
            array![[1.0, 1.0, 1.0], [1.0, 1.0, 1.0]],
        ]);
        let shifts = [DcrShift { dx: 0.0, dy: 0.0 }; 2];
        let template = model.build_matched_template(&shifts);
        assert_eq!(template, array![[2.0, 3.0, 4.0], [5.0, 6.0, 7.0]]);
    }

    #[test]
    fn test_matched_template_applies_shift() {
        let model = model_from(&[array![[0.0, 4.0, 0.0], [0.0, 0.0, 0.0]]]);
        let template = model.build_matched_template(&[DcrShift { dx: 1.0, dy: 0.0 }]);
        assert_relative_eq!(template[[0, 2]], 4.0);
        assert_relative_eq!(template[[0, 1]], 0.0);
    }

    #[test]
    fn test_clamp_limits_change() {
        let old = MaskedImage::filled(bbox(), 10.0, 1.0, 0);
        let mut new = MaskedImage::filled(bbox(), 10.0, 1.0, 0);
        new.image[[0, 0]] = 100.0;
        new.image[[0, 1]] = 1.0;
        new.image[[1, 0]] = f64::NAN;
        clamp_model(&mut new, &old, 2.0, 0.5, 0x100);
        assert_relative_eq!(new.image[[0, 0]], 20.5);
        assert_relative_eq!(new.image[[0, 1]], 4.5);
        assert_relative_eq!(new.image[[0, 2]], 10.0);
        assert_eq!(new.image[[1, 0]], 0.0);
        assert_eq!(new.mask[[1, 0]], 0x100);
    }

    #[test]
    fn test_regularize_conserves_flux() {
        let mut model = model_from(&[
            array![[30.0, 1.0, 5.0], [0.0, -4.0, 2.0]],
            array![[1.0, 1.0, 5.0], [9.0, 2.0, 2.0]],
            array![[2.0, 1.0, 5.0], [0.0, 8.0, 2.0]],
        ]);
        let before = model.sum().unwrap().image;
        regularize_frequency(&mut model, 2.0, 0.0);
        let after = model.sum().unwrap().image;
        for (b, a) in before.iter().zip(after.iter()) {
            assert_relative_eq!(*b, *a, epsilon = 1e-12);
        }
        // The bright outlier was pulled towards the mean.
        assert!(model.subbands()[0].image[[0, 0]] < 30.0);
        // Identical sub-bands are untouched.
        assert_eq!(model.subbands()[1].image[[0, 2]], 5.0);
    }

    #[test]
    fn test_blend() {
        let mut old = model_from(&[array![[1.0, 1.0, 1.0], [1.0, 1.0, 1.0]]]);
        let new = model_from(&[array![[4.0, 4.0, 4.0], [4.0, 4.0, 4.0]]]);
        old.blend(&new, 2.0);
        assert_relative_eq!(old.subbands()[0].image[[1, 1]], 3.0);
    }
}
