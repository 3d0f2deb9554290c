// src/amr/box_level.rs
//
// Output containers: a distributed box level and the connectors between levels.

use std::collections::BTreeMap;

use crate::amr::rect::IndexBox;

/// Global identity of a box: owning rank plus a per-owner local index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxId {
    pub owner: usize,
    pub local: usize,
}

impl BoxId {
    #[inline]
    pub fn new(owner: usize, local: usize) -> Self {
        Self { owner, local }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelBox<const D: usize> {
    pub id: BoxId,
    pub cell_box: IndexBox<D>,
}

/// The part of a distributed box level owned by one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxLevel<const D: usize> {
    pub rank: usize,
    pub n_ranks: usize,
    boxes: Vec<LevelBox<D>>,
    finalized: bool,
}

impl<const D: usize> BoxLevel<D> {
    pub fn new(rank: usize, n_ranks: usize) -> Self {
        Self {
            rank,
            n_ranks,
            boxes: Vec::new(),
            finalized: false,
        }
    }

    /// Append a box owned by this rank. Ignored once the level is finalized.
    pub fn push(&mut self, b: LevelBox<D>) {
        debug_assert_eq!(b.id.owner, self.rank, "box level only stores local boxes");
        if !self.finalized {
            self.boxes.push(b);
        }
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[inline]
    pub fn boxes(&self) -> &[LevelBox<D>] {
        &self.boxes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn get(&self, id: BoxId) -> Option<&LevelBox<D>> {
        self.boxes.iter().find(|b| b.id == id)
    }

    /// Total number of cells covered by the local boxes.
    pub fn local_cells(&self) -> u64 {
        self.boxes.iter().map(|b| b.cell_box.volume()).sum()
    }
}

/// Relationships from boxes of one level to overlapping boxes of another,
/// computed with a ghost `width`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector<const D: usize> {
    pub width: [i32; D],
    edges: BTreeMap<BoxId, Vec<BoxId>>,
}

impl<const D: usize> Connector<D> {
    pub fn new(width: [i32; D]) -> Self {
        Self {
            width,
            edges: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, base: BoxId, head: BoxId) {
        self.edges.entry(base).or_default().push(head);
    }

    /// Sort and deduplicate every neighbour list.
    pub fn finalize(&mut self) {
        for heads in self.edges.values_mut() {
            heads.sort_unstable();
            heads.dedup();
        }
    }

    pub fn neighbors(&self, base: BoxId) -> &[BoxId] {
        self.edges.get(&base).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (BoxId, &[BoxId])> {
        self.edges.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn n_edges(&self) -> usize {
        self.edges.values().map(|v| v.len()).sum()
    }
}
