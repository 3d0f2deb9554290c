// src/amr/tags.rs
//
// The tag level: one rank's patches of integer tag data, plus the local
// queries the clustering nodes need (histograms, overlaps, nearby patches).

use rayon::prelude::*;

use crate::amr::box_level::BoxId;
use crate::amr::histogram::Histogram;
use crate::amr::rect::IndexBox;
use crate::error::{ClusterError, CommError, Result};

/// A patch of the tag level: a cell box with one or more integer arrays laid out
/// over it (first axis fastest).
#[derive(Debug, Clone)]
pub struct TagPatch<const D: usize> {
    pub id: BoxId,
    pub cell_box: IndexBox<D>,
    pub data: Vec<Vec<i32>>,
}

impl<const D: usize> TagPatch<D> {
    /// Patch with a single tag array.
    pub fn new(id: BoxId, cell_box: IndexBox<D>, tags: Vec<i32>) -> Result<Self> {
        let patch = Self {
            id,
            cell_box,
            data: vec![tags],
        };
        patch.check_array(0)?;
        Ok(patch)
    }

    /// Array `index` must hold one entry per cell of the patch.
    fn check_array(&self, index: usize) -> Result<()> {
        let len = self.data[index].len();
        if len as u64 != self.cell_box.volume() {
            return Err(ClusterError::TagDataLength {
                index,
                patch: self.cell_box.to_string(),
                len,
                expected: self.cell_box.volume(),
            });
        }
        Ok(())
    }

    /// Tag of `cell` in array `index`, if both exist.
    #[inline]
    pub fn tag_at(&self, index: usize, cell: [i32; D]) -> Option<i32> {
        if !self.cell_box.contains(cell) {
            return None;
        }
        self.data
            .get(index)?
            .get(self.cell_box.offset(cell))
            .copied()
    }

    /// Histogram of cells equal to `tag_val` inside `region`.
    pub fn histogram(&self, index: usize, tag_val: i32, region: &IndexBox<D>) -> Histogram<D> {
        let mut h = Histogram::new(*region);
        if let Some(overlap) = self.cell_box.intersect(region) {
            let tags = &self.data[index];
            for cell in overlap.cells() {
                if tags[self.cell_box.offset(cell)] == tag_val {
                    h.add_cell(cell);
                }
            }
        }
        h
    }
}

/// The patches of the tag level owned by one rank.
#[derive(Debug, Clone)]
pub struct TagLevel<const D: usize> {
    rank: usize,
    n_ranks: usize,
    patches: Vec<TagPatch<D>>,
}

impl<const D: usize> TagLevel<D> {
    pub fn new(rank: usize, n_ranks: usize, patches: Vec<TagPatch<D>>) -> Self {
        Self {
            rank,
            n_ranks,
            patches,
        }
    }

    /// Decompose a global tag array over `domain` into `tile`-shaped patches and
    /// keep the ones assigned (round-robin) to `rank`.
    pub fn from_global(
        domain: IndexBox<D>,
        tags: &[i32],
        tile: [i32; D],
        rank: usize,
        n_ranks: usize,
    ) -> Result<Self> {
        if tags.len() as u64 != domain.volume() {
            return Err(ClusterError::TagDataLength {
                index: 0,
                patch: domain.to_string(),
                len: tags.len(),
                expected: domain.volume(),
            });
        }
        if tile.iter().any(|&t| t < 1) {
            return Err(ClusterError::InvalidTile(tile.to_vec()));
        }
        if rank >= n_ranks {
            return Err(CommError::InvalidRank {
                rank,
                size: n_ranks,
            }
            .into());
        }

        let n_tiles: [i32; D] =
            std::array::from_fn(|d| (domain.extent(d) + tile[d] - 1) / tile[d]);
        let tile_space = IndexBox::from_shape([0; D], n_tiles);

        let mut patches = Vec::new();
        let mut local = 0usize;
        for (k, t) in tile_space.cells().enumerate() {
            if k % n_ranks != rank {
                continue;
            }
            let lower: [i32; D] = std::array::from_fn(|d| domain.lower[d] + t[d] * tile[d]);
            let upper: [i32; D] =
                std::array::from_fn(|d| (lower[d] + tile[d] - 1).min(domain.upper[d]));
            let cell_box = IndexBox::new(lower, upper);
            let data = cell_box.cells().map(|c| tags[domain.offset(c)]).collect();
            patches.push(TagPatch::new(BoxId::new(rank, local), cell_box, data)?);
            local += 1;
        }
        Ok(Self::new(rank, n_ranks, patches))
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    #[inline]
    pub fn patches(&self) -> &[TagPatch<D>] {
        &self.patches
    }

    /// Check that every patch carries tag array `index` and that each of its
    /// arrays covers the patch.
    pub fn check_data_index(&self, index: usize) -> Result<()> {
        for p in &self.patches {
            if p.data.len() <= index {
                return Err(ClusterError::UnknownTagData {
                    index,
                    patch: p.cell_box.to_string(),
                    available: p.data.len(),
                });
            }
            (0..p.data.len()).try_for_each(|i| p.check_array(i))?;
        }
        Ok(())
    }

    /// Local partial histogram of `region`, reduced over the patches in parallel.
    pub fn histogram(
        &self,
        index: usize,
        tag_val: i32,
        region: &IndexBox<D>,
    ) -> Result<Histogram<D>> {
        self.patches
            .par_iter()
            .filter(|p| p.cell_box.intersects(region))
            .map(|p| Ok::<_, ClusterError>(p.histogram(index, tag_val, region)))
            .try_reduce(
                || Histogram::new(*region),
                |mut a, b| {
                    a.merge(&b)?;
                    Ok(a)
                },
            )
    }

    /// Number of local patch cells inside `region`.
    pub fn overlap_cells(&self, region: &IndexBox<D>) -> u64 {
        self.patches
            .iter()
            .filter_map(|p| p.cell_box.intersect(region))
            .map(|b| b.volume())
            .sum()
    }

    /// Local patches within `width` of `region`.
    pub fn patches_near<'a>(
        &'a self,
        region: &'a IndexBox<D>,
        width: [i32; D],
    ) -> impl Iterator<Item = &'a TagPatch<D>> + 'a {
        self.patches
            .iter()
            .filter(move |p| p.cell_box.grow(width).intersects(region))
    }

    /// Count of tagged cells over all local patches.
    pub fn count_tags(&self, index: usize, tag_val: i32) -> u64 {
        self.patches
            .iter()
            .map(|p| p.data[index].iter().filter(|&&t| t == tag_val).count() as u64)
            .sum()
    }
}
