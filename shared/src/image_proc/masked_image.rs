//! Image triples: value, variance and mask planes on a common pixel grid.

use ndarray::{s, Array2, Zip};
use thiserror::Error;

use super::aabb::AABB;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MaskedImageError {
    #[error("Plane shape {got:?} does not match bounding box shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("Region {region} is not contained in image bounds {bounds}")]
    OutOfBounds { region: AABB, bounds: AABB },
    #[error("Images cover different regions: {0} and {1}")]
    BBoxMismatch(AABB, AABB),
}

/// A rectangular image with co-registered value, variance and mask planes.
///
/// Arrays are `(rows, cols)` and index pixels relative to `bbox`, which places
/// the image in patch coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedImage {
    pub bbox: AABB,
    pub image: Array2<f64>,
    pub variance: Array2<f64>,
    pub mask: Array2<u32>,
}

impl MaskedImage {
    /// Zero-valued image with zero variance and a clear mask.
    pub fn new(bbox: AABB) -> Self {
        Self::filled(bbox, 0.0, 0.0, 0)
    }

    /// Image with every pixel set to the given value, variance and mask.
    pub fn filled(bbox: AABB, value: f64, variance: f64, mask: u32) -> Self {
        let shape = bbox.shape();
        Self {
            bbox,
            image: Array2::from_elem(shape, value),
            variance: Array2::from_elem(shape, variance),
            mask: Array2::from_elem(shape, mask),
        }
    }

    /// Assemble an image from existing planes, checking their shapes.
    pub fn from_parts(
        bbox: AABB,
        image: Array2<f64>,
        variance: Array2<f64>,
        mask: Array2<u32>,
    ) -> Result<Self, MaskedImageError> {
        let expected = bbox.shape();
        for got in [image.dim(), variance.dim(), mask.dim()] {
            if got != expected {
                return Err(MaskedImageError::ShapeMismatch { expected, got });
            }
        }
        Ok(Self {
            bbox,
            image,
            variance,
            mask,
        })
    }

    /// Array shape `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        self.image.dim()
    }

    fn window(&self, region: &AABB) -> Result<(usize, usize, usize, usize), MaskedImageError> {
        if !self.bbox.contains(region) {
            return Err(MaskedImageError::OutOfBounds {
                region: *region,
                bounds: self.bbox,
            });
        }
        let r0 = region.min_row - self.bbox.min_row;
        let c0 = region.min_col - self.bbox.min_col;
        Ok((r0, r0 + region.height(), c0, c0 + region.width()))
    }

    /// Copy of the pixels inside `region`, which must lie within this image.
    pub fn subimage(&self, region: &AABB) -> Result<Self, MaskedImageError> {
        let (r0, r1, c0, c1) = self.window(region)?;
        Ok(Self {
            bbox: *region,
            image: self.image.slice(s![r0..r1, c0..c1]).to_owned(),
            variance: self.variance.slice(s![r0..r1, c0..c1]).to_owned(),
            mask: self.mask.slice(s![r0..r1, c0..c1]).to_owned(),
        })
    }

    /// Overwrite the pixels of `other.bbox` in this image with `other`.
    pub fn assign(&mut self, other: &Self) -> Result<(), MaskedImageError> {
        self.assign_region(other, &other.bbox)
    }

    /// Overwrite `region` of this image with the same region of `other`.
    pub fn assign_region(&mut self, other: &Self, region: &AABB) -> Result<(), MaskedImageError> {
        let (r0, r1, c0, c1) = self.window(region)?;
        let (or0, or1, oc0, oc1) = other.window(region)?;
        self.image
            .slice_mut(s![r0..r1, c0..c1])
            .assign(&other.image.slice(s![or0..or1, oc0..oc1]));
        self.variance
            .slice_mut(s![r0..r1, c0..c1])
            .assign(&other.variance.slice(s![or0..or1, oc0..oc1]));
        self.mask
            .slice_mut(s![r0..r1, c0..c1])
            .assign(&other.mask.slice(s![or0..or1, oc0..oc1]));
        Ok(())
    }

    /// Fill `region` with a constant value, variance and mask.
    pub fn fill_region(
        &mut self,
        region: &AABB,
        value: f64,
        variance: f64,
        mask: u32,
    ) -> Result<(), MaskedImageError> {
        let (r0, r1, c0, c1) = self.window(region)?;
        self.image.slice_mut(s![r0..r1, c0..c1]).fill(value);
        self.variance.slice_mut(s![r0..r1, c0..c1]).fill(variance);
        self.mask.slice_mut(s![r0..r1, c0..c1]).fill(mask);
        Ok(())
    }

    /// Multiply the image by `factor` and the variance by `factor²`.
    pub fn scale(&mut self, factor: f64) {
        self.image.mapv_inplace(|v| v * factor);
        let factor2 = factor * factor;
        self.variance.mapv_inplace(|v| v * factor2);
    }

    /// `self - other` on a common bounding box: variances add, masks OR.
    pub fn difference(&self, other: &Self) -> Result<Self, MaskedImageError> {
        if self.bbox != other.bbox {
            return Err(MaskedImageError::BBoxMismatch(self.bbox, other.bbox));
        }
        Ok(Self {
            bbox: self.bbox,
            image: &self.image - &other.image,
            variance: &self.variance + &other.variance,
            mask: Zip::from(&self.mask)
                .and(&other.mask)
                .map_collect(|&a, &b| a | b),
        })
    }

    /// Set `bits` on every pixel.
    pub fn or_mask(&mut self, bits: u32) {
        self.mask.mapv_inplace(|m| m | bits);
    }

    /// Clear `bits` on every pixel.
    pub fn clear_mask(&mut self, bits: u32) {
        self.mask.mapv_inplace(|m| m & !bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_checks_shape() {
        let bbox = AABB::from_origin_size(0, 0, 2, 3);
        let err = MaskedImage::from_parts(
            bbox,
            Array2::zeros((2, 3)),
            Array2::zeros((3, 2)),
            Array2::zeros((2, 3)),
        )
        .unwrap_err();
        assert_eq!(
            err,
            MaskedImageError::ShapeMismatch {
                expected: (2, 3),
                got: (3, 2)
            }
        );
    }

    #[test]
    fn test_subimage_and_assign_round_trip_region() {
        let bbox = AABB::from_origin_size(10, 20, 4, 5);
        let mut image = MaskedImage::new(bbox);
        image.image[[1, 2]] = 7.0;

        let region = AABB::from_coords(11, 21, 12, 23);
        let mut sub = image.subimage(&region).unwrap();
        assert_eq!(sub.shape(), (2, 3));
        assert_eq!(sub.image[[0, 1]], 7.0);

        sub.image.fill(3.0);
        image.assign(&sub).unwrap();
        assert_eq!(image.image[[1, 2]], 3.0);
        assert_eq!(image.image[[0, 0]], 0.0);
    }

    #[test]
    fn test_subimage_out_of_bounds() {
        let image = MaskedImage::new(AABB::from_origin_size(0, 0, 4, 4));
        assert!(image.subimage(&AABB::from_coords(2, 2, 4, 3)).is_err());
    }

    #[test]
    fn test_difference_propagates_variance_and_mask() {
        let bbox = AABB::from_origin_size(0, 0, 2, 2);
        let a = MaskedImage::filled(bbox, 5.0, 1.0, 0b01);
        let b = MaskedImage::filled(bbox, 2.0, 0.5, 0b10);
        let diff = a.difference(&b).unwrap();
        assert!(diff.image.iter().all(|&v| v == 3.0));
        assert!(diff.variance.iter().all(|&v| v == 1.5));
        assert!(diff.mask.iter().all(|&m| m == 0b11));
    }

    #[test]
    fn test_scale() {
        let mut image = MaskedImage::filled(AABB::from_origin_size(0, 0, 1, 1), 2.0, 3.0, 0);
        image.scale(2.0);
        assert_eq!(image.image[[0, 0]], 4.0);
        assert_eq!(image.variance[[0, 0]], 12.0);
    }
}
