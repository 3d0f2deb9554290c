// src/amr/rect.rs

use std::fmt;

/// Integer box in D-dimensional cell index space, using inclusive corners:
/// [lower[0], upper[0]] × ... × [lower[D-1], upper[D-1]]
///
/// A box is empty as soon as `upper[d] < lower[d]` in any direction.
/// All operations are pure and return new boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexBox<const D: usize> {
    pub lower: [i32; D],
    pub upper: [i32; D],
}

impl<const D: usize> IndexBox<D> {
    #[inline]
    pub fn new(lower: [i32; D], upper: [i32; D]) -> Self {
        Self { lower, upper }
    }

    /// Canonical empty box.
    #[inline]
    pub fn empty() -> Self {
        Self {
            lower: [0; D],
            upper: [-1; D],
        }
    }

    /// Box of `shape` cells starting at `lower`.
    #[inline]
    pub fn from_shape(lower: [i32; D], shape: [i32; D]) -> Self {
        Self {
            lower,
            upper: std::array::from_fn(|d| lower[d] + shape[d] - 1),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        (0..D).any(|d| self.upper[d] < self.lower[d])
    }

    /// Number of cells along direction `d` (0 for inverted extents).
    #[inline]
    pub fn extent(&self, d: usize) -> i32 {
        (self.upper[d] - self.lower[d] + 1).max(0)
    }

    #[inline]
    pub fn shape(&self) -> [i32; D] {
        std::array::from_fn(|d| self.extent(d))
    }

    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (0..D).map(|d| self.extent(d) as u64).product()
    }

    #[inline]
    pub fn contains(&self, cell: [i32; D]) -> bool {
        (0..D).all(|d| cell[d] >= self.lower[d] && cell[d] <= self.upper[d])
    }

    /// True if `other` lies entirely inside `self`. Empty boxes are contained everywhere.
    pub fn contains_box(&self, other: &IndexBox<D>) -> bool {
        other.is_empty()
            || (0..D).all(|d| other.lower[d] >= self.lower[d] && other.upper[d] <= self.upper[d])
    }

    /// Intersection of two boxes.
    pub fn intersect(&self, other: &IndexBox<D>) -> Option<IndexBox<D>> {
        let b = IndexBox {
            lower: std::array::from_fn(|d| self.lower[d].max(other.lower[d])),
            upper: std::array::from_fn(|d| self.upper[d].min(other.upper[d])),
        };
        if b.is_empty() { None } else { Some(b) }
    }

    #[inline]
    pub fn intersects(&self, other: &IndexBox<D>) -> bool {
        self.intersect(other).is_some()
    }

    /// Expand (dilate) by `width[d]` cells on both sides of every direction.
    /// Negative widths shrink.
    pub fn grow(&self, width: [i32; D]) -> IndexBox<D> {
        IndexBox {
            lower: std::array::from_fn(|d| self.lower[d] - width[d]),
            upper: std::array::from_fn(|d| self.upper[d] + width[d]),
        }
    }

    /// Smallest box containing both (empty operands are ignored).
    pub fn bounding_union(&self, other: &IndexBox<D>) -> IndexBox<D> {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        IndexBox {
            lower: std::array::from_fn(|d| self.lower[d].min(other.lower[d])),
            upper: std::array::from_fn(|d| self.upper[d].max(other.upper[d])),
        }
    }

    /// Coarsen by `ratio`, rounding towards negative infinity so that the result
    /// covers every coarse cell touched by `self`.
    pub fn coarsen(&self, ratio: [i32; D]) -> IndexBox<D> {
        IndexBox {
            lower: std::array::from_fn(|d| self.lower[d].div_euclid(ratio[d])),
            upper: std::array::from_fn(|d| self.upper[d].div_euclid(ratio[d])),
        }
    }

    /// Refine by `ratio`: every cell becomes ratio[0] × ... × ratio[D-1] cells.
    pub fn refine(&self, ratio: [i32; D]) -> IndexBox<D> {
        IndexBox {
            lower: std::array::from_fn(|d| self.lower[d] * ratio[d]),
            upper: std::array::from_fn(|d| (self.upper[d] + 1) * ratio[d] - 1),
        }
    }

    /// Flat offset of `cell` in an array laid out over this box, first axis fastest.
    #[inline]
    pub fn offset(&self, cell: [i32; D]) -> usize {
        debug_assert!(self.contains(cell));
        let mut off = 0usize;
        let mut stride = 1usize;
        for d in 0..D {
            off += (cell[d] - self.lower[d]) as usize * stride;
            stride *= self.extent(d) as usize;
        }
        off
    }

    /// Iterate over every cell, first axis fastest.
    pub fn cells(&self) -> Cells<D> {
        Cells {
            bx: *self,
            next: if self.is_empty() { None } else { Some(self.lower) },
        }
    }

    /// Ratio of shortest to longest extent, in (0, 1]. Empty boxes report 0.
    pub fn aspect_ratio(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let shape = self.shape();
        let lo = shape.iter().copied().min().unwrap_or(0);
        let hi = shape.iter().copied().max().unwrap_or(0);
        if hi == 0 { 0.0 } else { lo as f64 / hi as f64 }
    }
}

/// Odometer iterator over the cells of an [`IndexBox`].
#[derive(Debug, Clone)]
pub struct Cells<const D: usize> {
    bx: IndexBox<D>,
    next: Option<[i32; D]>,
}

impl<const D: usize> Iterator for Cells<D> {
    type Item = [i32; D];

    fn next(&mut self) -> Option<[i32; D]> {
        let cur = self.next?;
        let mut nxt = cur;
        let mut d = 0;
        loop {
            if d == D {
                self.next = None;
                break;
            }
            if nxt[d] < self.bx.upper[d] {
                nxt[d] += 1;
                self.next = Some(nxt);
                break;
            }
            nxt[d] = self.bx.lower[d];
            d += 1;
        }
        Some(cur)
    }
}

impl<const D: usize> fmt::Display for IndexBox<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let corner = |c: &[i32; D]| {
            c.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        write!(f, "[({}),({})]", corner(&self.lower), corner(&self.upper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_and_extent() {
        let b = IndexBox::new([4, 4], [11, 11]);
        assert_eq!(b.extent(0), 8);
        assert_eq!(b.volume(), 64);
        assert!(!b.is_empty());
        assert!(IndexBox::<2>::empty().is_empty());
        assert_eq!(IndexBox::<2>::empty().volume(), 0);
    }

    #[test]
    fn intersect_and_union() {
        let a = IndexBox::new([0, 0], [5, 5]);
        let b = IndexBox::new([3, 4], [9, 9]);
        assert_eq!(a.intersect(&b), Some(IndexBox::new([3, 4], [5, 5])));
        assert_eq!(a.bounding_union(&b), IndexBox::new([0, 0], [9, 9]));

        let c = IndexBox::new([6, 0], [7, 2]);
        assert_eq!(a.intersect(&c), None);
    }

    #[test]
    fn coarsen_handles_negative_indices() {
        let b = IndexBox::new([-3, 0], [3, 7]);
        assert_eq!(b.coarsen([2, 4]), IndexBox::new([-2, 0], [1, 1]));
        assert_eq!(
            IndexBox::new([1, 0], [2, 0]).refine([2, 3]),
            IndexBox::new([2, 0], [5, 2])
        );
    }

    #[test]
    fn cells_iterates_first_axis_fastest_and_matches_offset() {
        let b = IndexBox::new([1, -1], [3, 0]);
        let cells: Vec<_> = b.cells().collect();
        assert_eq!(cells.len(), 6);
        assert_eq!(cells[0], [1, -1]);
        assert_eq!(cells[1], [2, -1]);
        assert_eq!(cells[3], [1, 0]);
        for (k, c) in cells.iter().enumerate() {
            assert_eq!(b.offset(*c), k);
        }
        assert_eq!(IndexBox::<3>::empty().cells().count(), 0);
    }

    #[test]
    fn display_matches_corner_notation() {
        assert_eq!(IndexBox::new([4, 4], [11, 11]).to_string(), "[(4,4),(11,11)]");
    }
}
