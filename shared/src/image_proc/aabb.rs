//! Axis-Aligned Bounding Box in patch pixel coordinates.
//!
//! Every image triple, tile and region in the coadd pipeline is positioned by
//! an [`AABB`] expressed in the coordinates of the full output patch, so a
//! tile cut from one epoch lines up with the same tile of every other epoch
//! and of the output coadd.
//!
//! # Coordinate System
//! - **Rows (y-axis)**: Increase downward from the patch origin
//! - **Columns (x-axis)**: Increase rightward from the patch origin
//! - **Bounds**: Both min and max coordinates are inclusive
//!
//! An AABB whose minimum exceeds its maximum on either axis is *empty*; it
//! covers no pixels and [`AABB::is_valid`] returns `false`.
//!
//! # Examples
//!
//! ```rust
//! use shared::image_proc::aabb::AABB;
//!
//! let patch = AABB::from_origin_size(0, 0, 100, 120);
//! let tile = AABB::from_coords(90, 100, 109, 139);
//!
//! let clipped = tile.intersection(&patch).unwrap();
//! assert_eq!(clipped.height(), 10);
//! assert_eq!(clipped.width(), 20);
//! ```

use std::fmt;

/// Axis-Aligned Bounding Box for 2D image regions.
///
/// Represents a rectangular region in patch coordinates (row, column) using
/// inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AABB {
    /// Minimum row (y) coordinate (inclusive)
    pub min_row: usize,
    /// Minimum column (x) coordinate (inclusive)
    pub min_col: usize,
    /// Maximum row (y) coordinate (inclusive)
    pub max_row: usize,
    /// Maximum column (x) coordinate (inclusive)
    pub max_col: usize,
}

impl AABB {
    /// Create a new empty AABB with invalid bounds.
    ///
    /// The resulting AABB has min coordinates set to `usize::MAX` and max
    /// coordinates set to 0, making it invalid until points are added via
    /// `expand_to_include()`.
    ///
    /// # Examples
    /// ```rust
    /// use shared::image_proc::aabb::AABB;
    ///
    /// let mut bbox = AABB::new();
    /// assert!(!bbox.is_valid());
    ///
    /// bbox.expand_to_include(50, 100);
    /// bbox.expand_to_include(55, 105);
    /// assert!(bbox.is_valid());
    /// assert_eq!(bbox.width(), 6);
    /// ```
    pub fn new() -> Self {
        Self {
            min_row: usize::MAX,
            min_col: usize::MAX,
            max_row: 0,
            max_col: 0,
        }
    }

    /// Create an AABB from explicit coordinate bounds.
    ///
    /// # Arguments
    /// * `min_row` - Top edge (minimum y-coordinate, inclusive)
    /// * `min_col` - Left edge (minimum x-coordinate, inclusive)
    /// * `max_row` - Bottom edge (maximum y-coordinate, inclusive)
    /// * `max_col` - Right edge (maximum x-coordinate, inclusive)
    pub fn from_coords(min_row: usize, min_col: usize, max_row: usize, max_col: usize) -> Self {
        Self {
            min_row,
            min_col,
            max_row,
            max_col,
        }
    }

    /// Create an AABB from its top-left corner and its extent.
    ///
    /// A zero height or width yields an empty box.
    ///
    /// # Arguments
    /// * `min_row` - Top edge (inclusive)
    /// * `min_col` - Left edge (inclusive)
    /// * `height` - Number of rows
    /// * `width` - Number of columns
    pub fn from_origin_size(min_row: usize, min_col: usize, height: usize, width: usize) -> Self {
        if height == 0 || width == 0 {
            return Self::new();
        }
        Self {
            min_row,
            min_col,
            max_row: min_row + height - 1,
            max_col: min_col + width - 1,
        }
    }

    /// Check if this AABB overlaps with another AABB.
    ///
    /// Returns true if the bounding boxes share any pixels. Empty boxes never
    /// overlap anything.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.min_row <= other.max_row
            && self.max_row >= other.min_row
            && self.min_col <= other.max_col
            && self.max_col >= other.min_col
    }

    /// Intersection of two boxes, `None` when they share no pixel.
    ///
    /// # Examples
    /// ```rust
    /// use shared::image_proc::aabb::AABB;
    ///
    /// let a = AABB::from_coords(0, 0, 9, 9);
    /// let b = AABB::from_coords(5, 5, 14, 14);
    /// assert_eq!(a.intersection(&b), Some(AABB::from_coords(5, 5, 9, 9)));
    /// assert_eq!(a.intersection(&AABB::from_coords(20, 20, 21, 21)), None);
    /// ```
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Self {
            min_row: self.min_row.max(other.min_row),
            min_col: self.min_col.max(other.min_col),
            max_row: self.max_row.min(other.max_row),
            max_col: self.max_col.min(other.max_col),
        })
    }

    /// Merge this AABB with another to create a bounding box containing both.
    ///
    /// Merging with an empty box returns the other box unchanged.
    pub fn merge(&self, other: &Self) -> Self {
        if !self.is_valid() {
            return *other;
        }
        if !other.is_valid() {
            return *self;
        }
        Self {
            min_row: self.min_row.min(other.min_row),
            min_col: self.min_col.min(other.min_col),
            max_row: self.max_row.max(other.max_row),
            max_col: self.max_col.max(other.max_col),
        }
    }

    /// Expand this AABB to include the specified point.
    pub fn expand_to_include(&mut self, row: usize, col: usize) {
        self.min_row = self.min_row.min(row);
        self.min_col = self.min_col.min(col);
        self.max_row = self.max_row.max(row);
        self.max_col = self.max_col.max(col);
    }

    /// Width of the bounding box in pixels (0 for empty boxes).
    pub fn width(&self) -> usize {
        if self.is_valid() {
            self.max_col - self.min_col + 1
        } else {
            0
        }
    }

    /// Height of the bounding box in pixels (0 for empty boxes).
    pub fn height(&self) -> usize {
        if self.is_valid() {
            self.max_row - self.min_row + 1
        } else {
            0
        }
    }

    /// Total number of pixels covered.
    pub fn area(&self) -> usize {
        self.width() * self.height()
    }

    /// Array shape `(rows, cols)` of an image covering this box.
    pub fn shape(&self) -> (usize, usize) {
        (self.height(), self.width())
    }

    /// Check if this AABB has valid (non-empty) bounds.
    pub fn is_valid(&self) -> bool {
        self.min_row <= self.max_row && self.min_col <= self.max_col
    }

    /// Grow the box by `padding` pixels on every side, saturating at zero.
    pub fn with_padding(&self, padding: usize) -> Self {
        if !self.is_valid() {
            return *self;
        }
        Self {
            min_row: self.min_row.saturating_sub(padding),
            min_col: self.min_col.saturating_sub(padding),
            max_row: self.max_row.saturating_add(padding),
            max_col: self.max_col.saturating_add(padding),
        }
    }

    /// Grow by `padding` and clip the result to `bounds`.
    ///
    /// Returns an empty box when the padded box falls outside `bounds`.
    pub fn grown_within(&self, padding: usize, bounds: &Self) -> Self {
        self.with_padding(padding)
            .intersection(bounds)
            .unwrap_or_default()
    }

    /// Check if a point is contained within this AABB.
    pub fn contains_point(&self, row: usize, col: usize) -> bool {
        row >= self.min_row && row <= self.max_row && col >= self.min_col && col <= self.max_col
    }

    /// Check if this AABB completely contains another AABB.
    pub fn contains(&self, other: &Self) -> bool {
        other.is_valid()
            && self.min_row <= other.min_row
            && self.min_col <= other.min_col
            && self.max_row >= other.max_row
            && self.max_col >= other.max_col
    }

    /// Offset of a patch coordinate relative to this box's origin, as
    /// `(row, col)` array indices. `None` when the point lies outside.
    pub fn local_index(&self, row: usize, col: usize) -> Option<(usize, usize)> {
        if self.contains_point(row, col) {
            Some((row - self.min_row, col - self.min_col))
        } else {
            None
        }
    }
}

impl Default for AABB {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AABB {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_valid() {
            write!(
                f,
                "[{}..={}, {}..={}]",
                self.min_row, self.max_row, self.min_col, self.max_col
            )
        } else {
            write!(f, "[empty]")
        }
    }
}
