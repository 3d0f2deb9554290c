// src/amr/histogram.rs
//
// Histogram / splitting engine for Berger-Rigoutsos clustering.
//
// Given the (group-reduced) tag histogram of a candidate box, decide whether the
// box is a good leaf or where to cut it:
// 1) shrink to the tagged planes, grow back to min_box inside the region;
// 2) accept if efficient enough and not larger than max_box_size;
// 3) otherwise rank zero cuts, inflection cuts and center cuts over the
//    candidate directions;
// 4) apply the combine check to efficiency-driven splits.
//
// `decide` is a pure function of the histogram and the parameters.

use std::cmp::Reverse;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::amr::rect::IndexBox;
use crate::error::{ClusterError, Result};

/// What to do when the minimum box size cannot be honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MinBoxPolicy {
    Ignore,
    #[default]
    Warn,
    Error,
}

impl FromStr for MinBoxPolicy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "IGNORE" => Ok(Self::Ignore),
            "WARN" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            _ => Err(ClusterError::InvalidMode {
                what: "check_min_box_size",
                value: s.to_string(),
            }),
        }
    }
}

/// Tie-break among several admissible zero cuts in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZeroCutTieBreak {
    #[default]
    MostCentered,
    FirstFound,
}

impl FromStr for ZeroCutTieBreak {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MOST_CENTERED" => Ok(Self::MostCentered),
            "FIRST_FOUND" => Ok(Self::FirstFound),
            _ => Err(ClusterError::InvalidMode {
                what: "zero_cut_tie_break",
                value: s.to_string(),
            }),
        }
    }
}

/// How the children/parent volume ratio is compared against `combine_tol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CombineComparison {
    /// Not worth splitting when `ratio >= combine_tol`.
    #[default]
    AtLeast,
    /// Not worth splitting when `ratio > combine_tol`.
    Greater,
}

impl FromStr for CombineComparison {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AT_LEAST" => Ok(Self::AtLeast),
            "GREATER" => Ok(Self::Greater),
            _ => Err(ClusterError::InvalidMode {
                what: "combine_comparison",
                value: s.to_string(),
            }),
        }
    }
}

/// What a split that fails the combine check turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CombineFallback {
    /// Accept the parent box.
    #[default]
    Accept,
    /// Try the remaining ranked cuts first; accept the parent if none passes.
    AlternateDirection,
}

impl FromStr for CombineFallback {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Self::Accept),
            "ALTERNATE_DIRECTION" => Ok(Self::AlternateDirection),
            _ => Err(ClusterError::InvalidMode {
                what: "combine_fallback",
                value: s.to_string(),
            }),
        }
    }
}

/// Parameters of the splitting engine for one clustering invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitParams<const D: usize> {
    pub min_box: [i32; D],
    pub max_box_size: [i32; D],
    pub efficiency_tol: f64,
    pub combine_tol: f64,
    pub max_inflection_cut_from_center: f64,
    pub inflection_cut_threshold_ar: f64,
    pub check_min_box_size: MinBoxPolicy,
    pub zero_cut_tie_break: ZeroCutTieBreak,
    pub combine_comparison: CombineComparison,
    pub combine_fallback: CombineFallback,
}

impl<const D: usize> Default for SplitParams<D> {
    fn default() -> Self {
        Self {
            min_box: [1; D],
            max_box_size: [i32::MAX; D],
            efficiency_tol: 0.8,
            combine_tol: 0.8,
            max_inflection_cut_from_center: 1.0,
            inflection_cut_threshold_ar: 0.0,
            check_min_box_size: MinBoxPolicy::Warn,
            zero_cut_tie_break: ZeroCutTieBreak::MostCentered,
            combine_comparison: CombineComparison::AtLeast,
            combine_fallback: CombineFallback::Accept,
        }
    }
}

/// Directional tag histograms over a region.
///
/// Besides the per-plane counts, each plane keeps the bounding box of its tagged
/// cells, so the tag bounding box of either side of any cut is exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram<const D: usize> {
    region: IndexBox<D>,
    counts: [Vec<u64>; D],
    plane_bounds: [Vec<IndexBox<D>>; D],
}

impl<const D: usize> Histogram<D> {
    pub fn new(region: IndexBox<D>) -> Self {
        Self {
            region,
            counts: std::array::from_fn(|d| vec![0; region.extent(d) as usize]),
            plane_bounds: std::array::from_fn(|d| {
                vec![IndexBox::empty(); region.extent(d) as usize]
            }),
        }
    }

    #[inline]
    pub fn region(&self) -> &IndexBox<D> {
        &self.region
    }

    /// Count one tagged cell. Cells outside the region are ignored.
    pub fn add_cell(&mut self, cell: [i32; D]) {
        if !self.region.contains(cell) {
            return;
        }
        let unit = IndexBox::new(cell, cell);
        for d in 0..D {
            let k = (cell[d] - self.region.lower[d]) as usize;
            self.counts[d][k] += 1;
            self.plane_bounds[d][k] = self.plane_bounds[d][k].bounding_union(&unit);
        }
    }

    /// Add another partial histogram over the same region.
    pub fn merge(&mut self, other: &Histogram<D>) -> Result<()> {
        if other.region != self.region {
            return Err(ClusterError::Protocol(format!(
                "histogram over {} merged into histogram over {}",
                other.region, self.region
            )));
        }
        for d in 0..D {
            for (a, b) in self.counts[d].iter_mut().zip(&other.counts[d]) {
                *a += *b;
            }
            for (a, b) in self.plane_bounds[d].iter_mut().zip(&other.plane_bounds[d]) {
                *a = a.bounding_union(b);
            }
        }
        Ok(())
    }

    #[inline]
    pub fn counts(&self, d: usize) -> &[u64] {
        &self.counts[d]
    }

    pub fn total(&self) -> u64 {
        match self.counts.first() {
            Some(c) => c.iter().sum(),
            None => 0,
        }
    }

    /// Bounding box of every tagged cell, if any.
    pub fn tag_bounding_box(&self) -> Option<IndexBox<D>> {
        let planes = self.plane_bounds.first()?;
        let b = planes
            .iter()
            .fold(IndexBox::empty(), |acc, p| acc.bounding_union(p));
        if b.is_empty() { None } else { Some(b) }
    }

    /// Bounding box of the tags in planes `lo..=hi` (absolute indices) along `d`.
    fn tag_bounds_between(&self, d: usize, lo: i32, hi: i32) -> IndexBox<D> {
        let k0 = (lo - self.region.lower[d]).max(0) as usize;
        let k1 = (hi - self.region.lower[d]) as usize;
        self.plane_bounds[d][k0..=k1.min(self.plane_bounds[d].len() - 1)]
            .iter()
            .fold(IndexBox::empty(), |acc, p| acc.bounding_union(p))
    }

    /// Counts along `d` restricted to `bx`, which must lie inside the region.
    fn counts_over(&self, d: usize, bx: &IndexBox<D>) -> &[u64] {
        let k0 = (bx.lower[d] - self.region.lower[d]) as usize;
        let k1 = (bx.upper[d] - self.region.lower[d]) as usize;
        &self.counts[d][k0..=k1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CutKind {
    Zero,
    Inflection,
    Center,
}

/// A cut perpendicular to `dim`; the right child starts at `position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cut {
    pub dim: usize,
    pub position: i32,
    pub kind: CutKind,
}

impl Cut {
    pub fn split<const D: usize>(&self, bx: &IndexBox<D>) -> (IndexBox<D>, IndexBox<D>) {
        let mut left = *bx;
        let mut right = *bx;
        left.upper[self.dim] = self.position - 1;
        right.lower[self.dim] = self.position;
        (left, right)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<const D: usize> {
    /// No tagged cell in the region.
    Empty,
    Accept(IndexBox<D>),
    Split {
        cut: Cut,
        left: IndexBox<D>,
        right: IndexBox<D>,
    },
}

/// Outcome of [`decide`] plus the diagnostics the node reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict<const D: usize> {
    pub decision: Decision<D>,
    pub efficiency: f64,
    pub min_box_violation: Option<&'static str>,
    pub combine_rejected: bool,
}

impl<const D: usize> Verdict<D> {
    fn new(decision: Decision<D>, efficiency: f64) -> Self {
        Self {
            decision,
            efficiency,
            min_box_violation: None,
            combine_rejected: false,
        }
    }
}

fn check_min_box<const D: usize>(
    p: &SplitParams<D>,
    bx: &IndexBox<D>,
    reason: &'static str,
) -> Result<&'static str> {
    match p.check_min_box_size {
        MinBoxPolicy::Error => Err(ClusterError::MinBoxViolation {
            cell_box: bx.to_string(),
            min_box: p.min_box.to_vec(),
            reason,
        }),
        MinBoxPolicy::Ignore | MinBoxPolicy::Warn => Ok(reason),
    }
}

/// Grow `tags` up to `min_box` in every direction, staying inside `region`.
pub fn grow_to_min_box<const D: usize>(
    tags: &IndexBox<D>,
    region: &IndexBox<D>,
    min_box: [i32; D],
) -> IndexBox<D> {
    let mut out = *tags;
    for d in 0..D {
        let ext = out.extent(d);
        if ext >= min_box[d] {
            continue;
        }
        let need = min_box[d] - ext;
        let mut lo = out.lower[d] - need / 2;
        let mut hi = out.upper[d] + (need - need / 2);
        if lo < region.lower[d] {
            hi += region.lower[d] - lo;
            lo = region.lower[d];
        }
        if hi > region.upper[d] {
            lo -= hi - region.upper[d];
            hi = region.upper[d];
        }
        out.lower[d] = lo.max(region.lower[d]);
        out.upper[d] = hi;
    }
    out
}

fn candidate_directions<const D: usize>(
    bx: &IndexBox<D>,
    oversized: &[usize],
    p: &SplitParams<D>,
) -> Vec<usize> {
    let mut dirs: Vec<usize> = if !oversized.is_empty() {
        oversized.to_vec()
    } else if bx.aspect_ratio() < p.inflection_cut_threshold_ar {
        let longest = (0..D).map(|d| bx.extent(d)).max().unwrap_or(0);
        (0..D).filter(|&d| bx.extent(d) == longest).collect()
    } else {
        (0..D).collect()
    };
    dirs.sort_by_key(|&d| (Reverse(bx.extent(d)), d));
    dirs
}

#[derive(Debug, Clone, Copy)]
struct RankedCut {
    cut: Cut,
    strength: u64,
    order: usize,
}

/// Best admissible cut along one direction: zero, then inflection, then center.
///
/// `h` holds the counts over `bx` along `dim`; k is the width of the left child.
fn best_cut_along<const D: usize>(
    h: &[u64],
    bx: &IndexBox<D>,
    dim: usize,
    p: &SplitParams<D>,
) -> Option<(Cut, u64)> {
    let n = h.len() as i64;
    let min = p.min_box[dim].max(1) as i64;
    let k_lo = min.max(1);
    let k_hi = (n - min).min(n - 1);
    if k_lo > k_hi {
        return None;
    }
    let at = |k: i64, kind| Cut {
        dim,
        position: bx.lower[dim] + k as i32,
        kind,
    };
    let off_center = |k: i64| (2 * k - n).abs();

    let mut prefix = Vec::with_capacity(h.len() + 1);
    prefix.push(0u64);
    for &c in h {
        prefix.push(prefix[prefix.len() - 1] + c);
    }
    let total = prefix[h.len()];

    // Zero cut: next to an empty plane, tags on both sides.
    let mut zero: Option<i64> = None;
    for k in k_lo..=k_hi {
        let ku = k as usize;
        if h[ku] != 0 && h[ku - 1] != 0 {
            continue;
        }
        if prefix[ku] == 0 || prefix[ku] == total {
            continue;
        }
        zero = match (zero, p.zero_cut_tie_break) {
            (None, _) => Some(k),
            (Some(z), ZeroCutTieBreak::MostCentered) if off_center(k) < off_center(z) => Some(k),
            (z, _) => z,
        };
    }
    if let Some(k) = zero {
        return Some((at(k, CutKind::Zero), 0));
    }

    // Inflection cut: strict sign change of the second difference.
    if n >= 4 {
        let lap = |k: usize| h[k - 1] as i64 - 2 * h[k] as i64 + h[k + 1] as i64;
        let reach = p.max_inflection_cut_from_center * n as f64;
        let mut best: Option<(i64, u64)> = None;
        for k in k_lo.max(2)..=k_hi.min(n - 2) {
            let ku = k as usize;
            let (a, b) = (lap(ku - 1), lap(ku));
            if !((a < 0 && b > 0) || (a > 0 && b < 0)) {
                continue;
            }
            if off_center(k) as f64 > reach {
                continue;
            }
            let strength = (b - a).unsigned_abs();
            best = match best {
                None => Some((k, strength)),
                Some((bk, bs)) => {
                    if strength > bs || (strength == bs && off_center(k) < off_center(bk)) {
                        Some((k, strength))
                    } else {
                        Some((bk, bs))
                    }
                }
            };
        }
        if let Some((k, s)) = best {
            return Some((at(k, CutKind::Inflection), s));
        }
    }

    Some((at((n / 2).clamp(k_lo, k_hi), CutKind::Center), 0))
}

fn rank_cuts<const D: usize>(
    hist: &Histogram<D>,
    bx: &IndexBox<D>,
    dirs: &[usize],
    p: &SplitParams<D>,
) -> Vec<RankedCut> {
    let mut ranked: Vec<RankedCut> = dirs
        .iter()
        .enumerate()
        .filter_map(|(order, &d)| {
            best_cut_along(hist.counts_over(d, bx), bx, d, p).map(|(cut, strength)| RankedCut {
                cut,
                strength,
                order,
            })
        })
        .collect();
    ranked.sort_by_key(|r| (r.cut.kind, Reverse(r.strength), r.order));
    ranked
}

/// Volume the two children would have after their own shrink-and-grow step,
/// relative to the parent.
fn children_volume_ratio<const D: usize>(
    hist: &Histogram<D>,
    bx: &IndexBox<D>,
    cut: &Cut,
    p: &SplitParams<D>,
) -> f64 {
    let (left, right) = cut.split(bx);
    let child_volume = |child: &IndexBox<D>| {
        let tags = hist.tag_bounds_between(cut.dim, child.lower[cut.dim], child.upper[cut.dim]);
        match tags.intersect(child) {
            Some(t) => grow_to_min_box(&t, child, p.min_box).volume(),
            None => 0,
        }
    };
    (child_volume(&left) + child_volume(&right)) as f64 / bx.volume() as f64
}

fn worth_splitting<const D: usize>(
    hist: &Histogram<D>,
    bx: &IndexBox<D>,
    cut: &Cut,
    p: &SplitParams<D>,
) -> bool {
    let ratio = children_volume_ratio(hist, bx, cut, p);
    match p.combine_comparison {
        CombineComparison::AtLeast => ratio < p.combine_tol,
        CombineComparison::Greater => ratio <= p.combine_tol,
    }
}

/// Decide ACCEPT or SPLIT for the box whose reduced histogram is `hist`.
///
/// `is_root` enables the min-box check on the tag bounding box itself.
/// Returns `Err` only when `check_min_box_size` is ERROR and the minimum box size
/// cannot be honoured.
pub fn decide<const D: usize>(
    hist: &Histogram<D>,
    p: &SplitParams<D>,
    is_root: bool,
) -> Result<Verdict<D>> {
    let Some(tag_box) = hist.tag_bounding_box() else {
        return Ok(Verdict::new(Decision::Empty, 0.0));
    };

    let violation = if is_root && (0..D).any(|d| tag_box.extent(d) < p.min_box[d]) {
        Some(check_min_box(
            p,
            &tag_box,
            "tag bounding box of a root box is smaller than min_box",
        )?)
    } else {
        None
    };

    let candidate = grow_to_min_box(&tag_box, hist.region(), p.min_box);
    let efficiency = hist.total() as f64 / candidate.volume() as f64;
    let oversized: Vec<usize> = (0..D)
        .filter(|&d| candidate.extent(d) > p.max_box_size[d])
        .collect();

    let accept = |combine_rejected, violation| Verdict {
        decision: Decision::Accept(candidate),
        efficiency,
        min_box_violation: violation,
        combine_rejected,
    };

    if efficiency >= p.efficiency_tol && oversized.is_empty() {
        return Ok(accept(false, violation));
    }

    let dirs = candidate_directions(&candidate, &oversized, p);
    let ranked = rank_cuts(hist, &candidate, &dirs, p);
    if ranked.is_empty() {
        let reason = check_min_box(
            p,
            &candidate,
            "no cut leaves min_box cells on both sides",
        )?;
        return Ok(accept(false, Some(reason)));
    }

    let split = |cut: Cut| {
        let (left, right) = cut.split(&candidate);
        Verdict {
            decision: Decision::Split { cut, left, right },
            efficiency,
            min_box_violation: violation,
            combine_rejected: false,
        }
    };

    if !oversized.is_empty() {
        return Ok(split(ranked[0].cut));
    }

    let tries = match p.combine_fallback {
        CombineFallback::Accept => 1,
        CombineFallback::AlternateDirection => ranked.len(),
    };
    for r in ranked.iter().take(tries) {
        if worth_splitting(hist, &candidate, &r.cut, p) {
            return Ok(split(r.cut));
        }
    }
    Ok(accept(true, violation))
}
