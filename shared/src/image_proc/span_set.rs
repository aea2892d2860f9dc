//! Run-length pixel regions.
//!
//! A [`SpanSet`] describes an arbitrary set of pixels as horizontal runs in
//! patch coordinates. It is the currency of every detection and masking step:
//! footprints, alternate mask overlays, NO_DATA and EDGE regions are all span
//! sets that get intersected, clipped to a tile and stamped into mask planes.
//!
//! Spans are kept normalized: sorted by `(row, col0)`, non-overlapping, and
//! with horizontally adjacent runs on the same row merged.

use itertools::Itertools;
use ndarray::ArrayView2;

use super::aabb::AABB;
use super::masked_image::MaskedImage;

/// One horizontal run of pixels, `col0..=col1` on `row`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    pub row: usize,
    pub col0: usize,
    pub col1: usize,
}

impl Span {
    pub fn new(row: usize, col0: usize, col1: usize) -> Self {
        Self { row, col0, col1 }
    }

    pub fn width(&self) -> usize {
        self.col1 - self.col0 + 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanSet {
    spans: Vec<Span>,
}

impl SpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a span set from arbitrary (possibly overlapping) spans.
    pub fn from_spans(spans: impl IntoIterator<Item = Span>) -> Self {
        let mut spans: Vec<Span> = spans.into_iter().filter(|s| s.col0 <= s.col1).collect();
        spans.sort_unstable();
        let spans = spans
            .into_iter()
            .coalesce(|a, b| {
                if a.row == b.row && b.col0 <= a.col1.saturating_add(1) {
                    Ok(Span::new(a.row, a.col0, a.col1.max(b.col1)))
                } else {
                    Err((a, b))
                }
            })
            .collect();
        Self { spans }
    }

    /// Every pixel of a bounding box.
    pub fn from_bbox(bbox: &AABB) -> Self {
        if !bbox.is_valid() {
            return Self::new();
        }
        Self {
            spans: (bbox.min_row..=bbox.max_row)
                .map(|row| Span::new(row, bbox.min_col, bbox.max_col))
                .collect(),
        }
    }

    /// Pixels of `plane` (positioned at `bbox`) for which `predicate` holds.
    pub fn from_predicate<T>(
        bbox: &AABB,
        plane: ArrayView2<T>,
        predicate: impl Fn(&T) -> bool,
    ) -> Self {
        let mut spans = Vec::new();
        for (r, row) in plane.outer_iter().enumerate() {
            let mut run_start: Option<usize> = None;
            for (c, value) in row.iter().enumerate() {
                match (predicate(value), run_start) {
                    (true, None) => run_start = Some(c),
                    (false, Some(start)) => {
                        spans.push(Span::new(
                            bbox.min_row + r,
                            bbox.min_col + start,
                            bbox.min_col + c - 1,
                        ));
                        run_start = None;
                    }
                    _ => {}
                }
            }
            if let Some(start) = run_start {
                spans.push(Span::new(
                    bbox.min_row + r,
                    bbox.min_col + start,
                    bbox.min_col + row.len() - 1,
                ));
            }
        }
        Self { spans }
    }

    /// Pixels of a mask plane with any of `bits` set.
    pub fn from_mask(bbox: &AABB, mask: ArrayView2<u32>, bits: u32) -> Self {
        Self::from_predicate(bbox, mask, |&m| m & bits != 0)
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Number of pixels.
    pub fn area(&self) -> usize {
        self.spans.iter().map(Span::width).sum()
    }

    /// Smallest box containing every pixel (empty box for an empty set).
    pub fn bbox(&self) -> AABB {
        self.spans.iter().fold(AABB::new(), |mut bbox, s| {
            bbox.expand_to_include(s.row, s.col0);
            bbox.expand_to_include(s.row, s.col1);
            bbox
        })
    }

    pub fn contains_point(&self, row: usize, col: usize) -> bool {
        let idx = self
            .spans
            .partition_point(|s| (s.row, s.col0) <= (row, col));
        idx > 0 && {
            let s = self.spans[idx - 1];
            s.row == row && col <= s.col1
        }
    }

    /// Pixels present in both sets.
    pub fn intersection(&self, other: &Self) -> Self {
        let (a, b) = (&self.spans, &other.spans);
        let (mut i, mut j) = (0, 0);
        let mut spans = Vec::new();
        while i < a.len() && j < b.len() {
            let (sa, sb) = (a[i], b[j]);
            if sa.row < sb.row {
                i += 1;
                continue;
            }
            if sb.row < sa.row {
                j += 1;
                continue;
            }
            let lo = sa.col0.max(sb.col0);
            let hi = sa.col1.min(sb.col1);
            if lo <= hi {
                spans.push(Span::new(sa.row, lo, hi));
            }
            if sa.col1 < sb.col1 {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self { spans }
    }

    /// Pixels present in either set.
    pub fn union(&self, other: &Self) -> Self {
        Self::from_spans(self.spans.iter().chain(other.spans.iter()).copied())
    }

    /// True if every pixel of `other` is in this set.
    pub fn contains(&self, other: &Self) -> bool {
        !other.is_empty() && self.intersection(other).area() == other.area()
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Restrict to the pixels inside `bbox`.
    pub fn clipped_to(&self, bbox: &AABB) -> Self {
        if !bbox.is_valid() {
            return Self::new();
        }
        let spans = self
            .spans
            .iter()
            .filter(|s| s.row >= bbox.min_row && s.row <= bbox.max_row)
            .filter_map(|s| {
                let lo = s.col0.max(bbox.min_col);
                let hi = s.col1.min(bbox.max_col);
                (lo <= hi).then(|| Span::new(s.row, lo, hi))
            })
            .collect();
        Self { spans }
    }

    /// Grow isotropically by `radius` pixels (circular structuring element).
    ///
    /// Growth stops at row/column zero; callers clip to their own bounds.
    pub fn dilated(&self, radius: usize) -> Self {
        if radius == 0 {
            return self.clone();
        }
        let r = radius as i64;
        let offsets: Vec<(i64, usize)> = (-r..=r)
            .map(|dy| (dy, ((r * r - dy * dy) as f64).sqrt().floor() as usize))
            .collect();
        Self::from_spans(self.spans.iter().flat_map(|s| {
            offsets.iter().filter_map(move |&(dy, half_width)| {
                let row = s.row as i64 + dy;
                (row >= 0).then(|| {
                    Span::new(
                        row as usize,
                        s.col0.saturating_sub(half_width),
                        s.col1.saturating_add(half_width),
                    )
                })
            })
        }))
    }

    /// Split into 8-connected components, ordered by their first span.
    pub fn split(&self) -> Vec<SpanSet> {
        let n = self.spans.len();
        let mut parent: Vec<usize> = (0..n).collect();

        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        // Index range of the spans on the previous row
        let mut prev = 0..0;
        let mut start = 0;
        while start < n {
            let row = self.spans[start].row;
            let end = start + self.spans[start..].partition_point(|s| s.row == row);
            let prev_is_adjacent = prev.start < prev.end && self.spans[prev.start].row + 1 == row;
            if prev_is_adjacent {
                for i in start..end {
                    let si = self.spans[i];
                    for j in prev.clone() {
                        let sj = self.spans[j];
                        if sj.col0 <= si.col1.saturating_add(1) && sj.col1.saturating_add(1) >= si.col0
                        {
                            let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                            if ri != rj {
                                parent[ri.max(rj)] = ri.min(rj);
                            }
                        }
                    }
                }
            }
            prev = start..end;
            start = end;
        }

        let mut components: Vec<(usize, Vec<Span>)> = Vec::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            match components.iter_mut().find(|(r, _)| *r == root) {
                Some((_, spans)) => spans.push(self.spans[i]),
                None => components.push((root, vec![self.spans[i]])),
            }
        }
        components
            .into_iter()
            .map(|(_, spans)| Self::from_spans(spans))
            .collect()
    }

    /// Patch coordinates `(row, col)` of every pixel.
    pub fn indices(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.spans
            .iter()
            .flat_map(|s| (s.col0..=s.col1).map(move |c| (s.row, c)))
    }

    /// Array indices, relative to `bbox`, of the pixels inside `bbox`.
    pub fn local_indices<'a>(
        &'a self,
        bbox: &'a AABB,
    ) -> impl Iterator<Item = (usize, usize)> + 'a {
        self.spans
            .iter()
            .filter(move |s| bbox.is_valid() && s.row >= bbox.min_row && s.row <= bbox.max_row)
            .flat_map(move |s| {
                let lo = s.col0.max(bbox.min_col);
                let hi = s.col1.min(bbox.max_col);
                (lo..=hi).map(move |c| (s.row - bbox.min_row, c - bbox.min_col))
            })
    }

    /// OR `bits` into the mask of every pixel that falls inside `image`.
    pub fn set_mask(&self, image: &mut MaskedImage, bits: u32) {
        let bbox = image.bbox;
        for idx in self.local_indices(&bbox) {
            image.mask[idx] |= bits;
        }
    }

    /// Clear `bits` from the mask of every pixel that falls inside `image`.
    pub fn clear_mask(&self, image: &mut MaskedImage, bits: u32) {
        let bbox = image.bbox;
        for idx in self.local_indices(&bbox) {
            image.mask[idx] &= !bits;
        }
    }

    /// Set the value plane to a constant on every pixel inside `image`.
    pub fn set_image(&self, image: &mut MaskedImage, value: f64) {
        let bbox = image.bbox;
        for idx in self.local_indices(&bbox) {
            image.image[idx] = value;
        }
    }

    /// Number of pixels inside `bbox` whose mask value satisfies `predicate`.
    pub fn count_mask(
        &self,
        bbox: &AABB,
        mask: ArrayView2<u32>,
        predicate: impl Fn(u32) -> bool,
    ) -> usize {
        self.local_indices(bbox)
            .filter(|&idx| predicate(mask[idx]))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_from_spans_normalizes() {
        let set = SpanSet::from_spans(vec![
            Span::new(1, 5, 6),
            Span::new(0, 0, 2),
            Span::new(1, 2, 4),
            Span::new(0, 1, 3),
        ]);
        assert_eq!(set.spans(), &[Span::new(0, 0, 3), Span::new(1, 2, 6)]);
        assert_eq!(set.area(), 9);
        assert_eq!(set.bbox(), AABB::from_coords(0, 0, 1, 6));
    }

    #[test]
    fn test_from_mask() {
        let mask = array![[0u32, 1, 1, 0], [2, 0, 1, 1]];
        let bbox = AABB::from_origin_size(10, 20, 2, 4);
        let set = SpanSet::from_mask(&bbox, mask.view(), 1);
        assert_eq!(
            set.spans(),
            &[Span::new(10, 21, 22), Span::new(11, 22, 23)]
        );
        assert!(set.contains_point(11, 23));
        assert!(!set.contains_point(11, 20));
    }

    #[test]
    fn test_intersection_union_contains() {
        let a = SpanSet::from_bbox(&AABB::from_coords(0, 0, 3, 3));
        let b = SpanSet::from_bbox(&AABB::from_coords(2, 2, 5, 5));
        let both = a.intersection(&b);
        assert_eq!(both.area(), 4);
        assert_eq!(a.union(&b).area(), 16 + 16 - 4);
        assert!(a.contains(&both));
        assert!(!a.contains(&b));
        assert!(a.overlaps(&b));
    }

    #[test]
    fn test_clipped_to() {
        let set = SpanSet::from_bbox(&AABB::from_coords(0, 0, 9, 9));
        let clipped = set.clipped_to(&AABB::from_coords(8, 5, 20, 20));
        assert_eq!(clipped.bbox(), AABB::from_coords(8, 5, 9, 9));
        assert_eq!(clipped.area(), 10);
    }

    #[test]
    fn test_dilated_single_pixel() {
        let set = SpanSet::from_spans(vec![Span::new(5, 5, 5)]);
        let grown = set.dilated(2);
        // Disk of radius 2: 1 + 3 + 5 + 3 + 1
        assert_eq!(grown.area(), 13);
        assert!(grown.contains_point(3, 5));
        assert!(!grown.contains_point(3, 6));
        assert!(grown.contains_point(4, 6));
    }

    #[test]
    fn test_split_eight_connected() {
        let mut mask = Array2::<u32>::zeros((5, 6));
        mask[[0, 0]] = 1;
        mask[[1, 1]] = 1; // diagonal neighbour of (0, 0)
        mask[[0, 4]] = 1;
        mask[[1, 4]] = 1;
        mask[[4, 2]] = 1;
        let set = SpanSet::from_mask(&AABB::from_origin_size(0, 0, 5, 6), mask.view(), 1);
        let parts = set.split();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].area(), 2);
        assert_eq!(parts[1].area(), 2);
        assert_eq!(parts[2].spans(), &[Span::new(4, 2, 2)]);
    }

    #[test]
    fn test_set_and_clear_mask_inside_image_only() {
        let mut image = MaskedImage::new(AABB::from_origin_size(2, 2, 3, 3));
        let set = SpanSet::from_bbox(&AABB::from_coords(0, 0, 2, 3));
        set.set_mask(&mut image, 0b100);
        assert_eq!(image.mask.iter().filter(|&&m| m == 0b100).count(), 2);
        assert_eq!(set.count_mask(&image.bbox, image.mask.view(), |m| m != 0), 2);
        set.clear_mask(&mut image, 0b100);
        assert!(image.mask.iter().all(|&m| m == 0));
    }
}
