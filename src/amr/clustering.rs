// src/amr/clustering.rs
//
// Asynchronous Berger-Rigoutsos clustering: public entry point.
//
// Given a distributed tag level, find a set of disjoint boxes that together
// cover every tagged cell, with each box efficient enough (tagged / volume) and
// within the size limits. The candidate tree is explored by `BoxNode`s which
// run concurrently across ranks; see `node.rs` for the per-candidate protocol
// and `stage.rs` for the per-rank driver.
//
// Outputs on every rank:
// - the part of the new box level owned by this rank,
// - optionally the tag->new and new->tag connectors,
// - per-invocation statistics.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, info_span};

use crate::amr::box_level::{BoxLevel, Connector, LevelBox};
use crate::amr::collector::RelationshipMode;
use crate::amr::histogram::SplitParams;
use crate::amr::node::{BoxNode, HistogramReduction};
use crate::amr::owner::OwnerMode;
use crate::amr::rect::IndexBox;
use crate::amr::stage::{AdvanceMode, ClusterMessage, Host, Stage};
use crate::amr::tags::TagLevel;
use crate::comm::{ChannelComm, Comm};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};

/// In-process communicator carrying the clustering protocol.
pub type ClusterComm<const D: usize> = ChannelComm<ClusterMessage<D>>;

/// Counters and timers of the clustering run(s) on one rank.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClusterStats {
    pub invocations: usize,
    /// Node instances this rank took part in.
    pub nodes_created: usize,
    pub nodes_owned: usize,
    pub max_generation: u32,
    pub max_active_nodes: usize,
    pub boxes_accepted: usize,
    pub zero_cuts: usize,
    pub inflection_cuts: usize,
    pub center_cuts: usize,
    pub combine_rejections: usize,
    pub min_box_violations: usize,
    pub messages_sent: usize,
    pub messages_received: usize,
    pub relationship_messages: usize,
    pub time_deciding: Duration,
    pub time_total: Duration,
}

impl ClusterStats {
    pub fn accumulate(&mut self, other: &ClusterStats) {
        self.invocations += other.invocations;
        self.nodes_created += other.nodes_created;
        self.nodes_owned += other.nodes_owned;
        self.max_generation = self.max_generation.max(other.max_generation);
        self.max_active_nodes = self.max_active_nodes.max(other.max_active_nodes);
        self.boxes_accepted += other.boxes_accepted;
        self.zero_cuts += other.zero_cuts;
        self.inflection_cuts += other.inflection_cuts;
        self.center_cuts += other.center_cuts;
        self.combine_rejections += other.combine_rejections;
        self.min_box_violations += other.min_box_violations;
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.relationship_messages += other.relationship_messages;
        self.time_deciding += other.time_deciding;
        self.time_total += other.time_total;
    }
}

/// Resolved parameters of one invocation, shared by every node on a rank.
#[derive(Clone, Debug)]
pub(crate) struct Settings<const D: usize> {
    pub split: SplitParams<D>,
    pub advance_mode: AdvanceMode,
    pub owner_mode: OwnerMode,
    pub histogram_reduction: HistogramReduction,
    pub single_owner_rank: usize,
    pub tag_upper_bound: u32,
    pub sort_output_nodes: bool,
    pub relationship_mode: RelationshipMode,
    pub relationship_width: [i32; D],
    pub tag_data_index: usize,
    pub tag_val: i32,
}

/// Result of [`BergerRigoutsos::find_boxes_containing_tags`] on one rank.
#[derive(Debug)]
pub struct ClusterOutput<const D: usize> {
    /// Boxes owned by this rank.
    pub new_box_level: BoxLevel<D>,
    /// Every new box, in global order; identical on all ranks.
    pub global_boxes: Vec<LevelBox<D>>,
    /// Edges from this rank's tag patches to the new boxes near them.
    pub tag_to_new: Option<Connector<D>>,
    /// Edges from this rank's new boxes to the tag patches near them.
    pub new_to_tag: Option<Connector<D>>,
    pub stats: ClusterStats,
}

#[derive(Debug)]
pub struct BergerRigoutsos<const D: usize, C> {
    config: ClusterConfig,
    max_box_size: [i32; D],
    relationship_mode: RelationshipMode,
    relationship_width: [i32; D],
    private_comm: Option<C>,
    epoch: u64,
    deferred: Vec<(usize, ClusterMessage<D>)>,
    stats: ClusterStats,
}

impl<const D: usize, C: Comm<ClusterMessage<D>>> BergerRigoutsos<D, C> {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let max_box_size = config.max_box_size::<D>()?;
        Ok(Self {
            config,
            max_box_size,
            relationship_mode: RelationshipMode::None,
            relationship_width: [0; D],
            private_comm: None,
            epoch: 0,
            deferred: Vec::new(),
            stats: ClusterStats::default(),
        })
    }

    #[inline]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Run every later invocation on `comm` instead of the caller's
    /// communicator. `comm` must be congruent with the tag levels passed in.
    pub fn use_private_comm(&mut self, comm: C) {
        self.private_comm = Some(comm);
    }

    /// Choose which connectors to build and the width that defines "near".
    pub fn set_compute_relationships(
        &mut self,
        mode: RelationshipMode,
        width: [i32; D],
    ) -> Result<()> {
        if width.iter().any(|&w| w < 0) {
            return Err(ClusterError::InvalidMode {
                what: "relationship width",
                value: format!("{width:?}"),
            });
        }
        self.relationship_mode = mode;
        self.relationship_width = width;
        Ok(())
    }

    /// Statistics accumulated over every invocation of this instance.
    #[inline]
    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    /// Cluster the cells of `tag_level` whose tag array `tag_data_index` equals
    /// `tag_val`, inside the disjoint `bound_boxes`.
    ///
    /// Collective: every rank of the communicator must call this with the same
    /// bound boxes and parameters. On error every rank returns `Err`.
    #[allow(clippy::too_many_arguments)]
    pub fn find_boxes_containing_tags(
        &mut self,
        comm: &C,
        tag_level: &TagLevel<D>,
        tag_data_index: usize,
        tag_val: i32,
        bound_boxes: &[IndexBox<D>],
        min_box: [i32; D],
        efficiency_tol: f64,
        combine_tol: f64,
        max_gcw: [i32; D],
    ) -> Result<ClusterOutput<D>> {
        let comm = self.private_comm.as_ref().unwrap_or(comm);

        let t0 = Instant::now();
        self.epoch += 1;
        let epoch = self.epoch;
        let span = info_span!("berger_rigoutsos", rank = comm.rank(), epoch);
        let _guard = span.enter();

        let settings = Settings {
            split: SplitParams {
                min_box,
                max_box_size: self.max_box_size,
                efficiency_tol,
                combine_tol,
                max_inflection_cut_from_center: self.config.max_inflection_cut_from_center,
                inflection_cut_threshold_ar: self.config.inflection_cut_threshold_ar,
                check_min_box_size: self.config.check_min_box_size,
                zero_cut_tie_break: self.config.zero_cut_tie_break,
                combine_comparison: self.config.combine_comparison,
                combine_fallback: self.config.combine_fallback,
            },
            advance_mode: self.config.algo_advance_mode,
            owner_mode: self.config.owner_mode,
            histogram_reduction: self.config.histogram_reduction,
            single_owner_rank: self.config.single_owner_rank,
            tag_upper_bound: self.config.tag_upper_bound,
            sort_output_nodes: self.config.sort_output_nodes,
            relationship_mode: self.relationship_mode,
            relationship_width: self.relationship_width,
            tag_data_index,
            tag_val,
        };

        let mut host = Host::new(comm, &settings, tag_level, epoch);
        let early = std::mem::take(&mut self.deferred);
        let mut stage = Stage::new(settings.advance_mode);

        let run = check_preconditions(&settings, comm, tag_level, bound_boxes, max_gcw)
            .and_then(|_| {
                let roots = bound_boxes
                    .iter()
                    .enumerate()
                    .map(|(i, b)| BoxNode::root(i, *b, comm.size(), settings.single_owner_rank))
                    .collect();
                stage.run(&mut host, roots, early)
            })
            .and_then(|_| stage.finalize(&mut host));

        if let Err(e) = &run {
            if !matches!(e, ClusterError::Aborted { .. }) {
                host.broadcast_abort(&e.to_string());
            }
        }
        self.deferred = std::mem::take(&mut host.deferred);
        run?;

        let Host {
            collector,
            mut stats,
            ..
        } = host;
        let collected = collector.finish(
            settings.sort_output_nodes,
            settings.relationship_mode,
            settings.relationship_width,
        )?;

        stats.invocations = 1;
        stats.time_total = t0.elapsed();
        self.stats.accumulate(&stats);

        let local_cells = collected.level.local_cells();
        info!(
            boxes = collected.global.len(),
            local_boxes = collected.level.len(),
            local_cells,
            nodes = stats.nodes_created,
            max_generation = stats.max_generation,
            elapsed_ms = stats.time_total.as_millis() as u64,
            "clustering complete"
        );
        debug!(?stats, "clustering statistics");

        Ok(ClusterOutput {
            new_box_level: collected.level,
            global_boxes: collected.global,
            tag_to_new: collected.tag_to_new,
            new_to_tag: collected.new_to_tag,
            stats,
        })
    }
}

fn check_preconditions<const D: usize, C: Comm<ClusterMessage<D>>>(
    settings: &Settings<D>,
    comm: &C,
    tag_level: &TagLevel<D>,
    bound_boxes: &[IndexBox<D>],
    max_gcw: [i32; D],
) -> Result<()> {
    if comm.size() != tag_level.n_ranks() || comm.rank() != tag_level.rank() {
        return Err(ClusterError::IncongruentComm {
            comm_rank: comm.rank(),
            comm_size: comm.size(),
            level_rank: tag_level.rank(),
            level_size: tag_level.n_ranks(),
        });
    }
    let p = &settings.split;
    for (name, value) in [("efficiency_tol", p.efficiency_tol), ("combine_tol", p.combine_tol)] {
        if !(0.0..=1.0).contains(&value) {
            return Err(ClusterError::InvalidTolerance { name, value });
        }
    }
    if p.min_box.iter().any(|&m| m < 1) {
        return Err(ClusterError::InvalidMinBox(p.min_box.to_vec()));
    }
    if settings.single_owner_rank >= comm.size() {
        return Err(ClusterError::InvalidMode {
            what: "DEV_single_owner_rank",
            value: settings.single_owner_rank.to_string(),
        });
    }
    if settings.relationship_mode != RelationshipMode::None
        && (0..D).any(|d| settings.relationship_width[d] > max_gcw[d])
    {
        return Err(ClusterError::RelationshipWidthExceedsGhost {
            width: settings.relationship_width.to_vec(),
            max_gcw: max_gcw.to_vec(),
        });
    }

    if bound_boxes.is_empty() {
        return Err(ClusterError::EmptyBoundBoxes);
    }
    if bound_boxes.len() as u64 > u64::from(u32::MAX) {
        return Err(ClusterError::InvalidBoundBox(format!(
            "{} bound boxes",
            bound_boxes.len()
        )));
    }
    for (i, a) in bound_boxes.iter().enumerate() {
        if a.is_empty() {
            return Err(ClusterError::InvalidBoundBox(a.to_string()));
        }
        if let Some(b) = bound_boxes[i + 1..].iter().find(|b| a.intersects(b)) {
            return Err(ClusterError::OverlappingBoundBoxes {
                a: a.to_string(),
                b: b.to_string(),
            });
        }
    }

    tag_level.check_data_index(settings.tag_data_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_on_ranks;

    fn block_level(rank: usize, n: usize) -> TagLevel<2> {
        let domain = IndexBox::new([0, 0], [15, 15]);
        let tags: Vec<i32> = domain
            .cells()
            .map(|c| i32::from((4..12).contains(&c[0]) && (4..12).contains(&c[1])))
            .collect();
        TagLevel::from_global(domain, &tags, [8, 8], rank, n).unwrap()
    }

    #[test]
    fn dense_block_is_one_box() {
        let comms = ClusterComm::<2>::world(1, Duration::from_secs(5));
        let out = run_on_ranks(comms, |comm| {
            let mut br = BergerRigoutsos::<2, _>::new(ClusterConfig::default()).unwrap();
            br.find_boxes_containing_tags(
                &comm,
                &block_level(0, 1),
                0,
                1,
                &[IndexBox::new([0, 0], [15, 15])],
                [1, 1],
                0.8,
                0.8,
                [0, 0],
            )
            .unwrap()
        });
        let out = &out[0];
        assert_eq!(out.new_box_level.len(), 1);
        assert_eq!(
            out.new_box_level.boxes()[0].cell_box,
            IndexBox::new([4, 4], [11, 11])
        );
        assert_eq!(out.stats.boxes_accepted, 1);
        assert!(out.tag_to_new.is_none());
    }

    #[test]
    fn invalid_arguments_fail_fast() {
        let comms = ClusterComm::<2>::world(1, Duration::from_millis(200));
        let comm = &comms[0];
        let level = block_level(0, 1);
        let bound = IndexBox::new([0, 0], [15, 15]);
        let mut br = BergerRigoutsos::<2, ClusterComm<2>>::new(ClusterConfig::default()).unwrap();

        let r = br.find_boxes_containing_tags(comm, &level, 0, 1, &[], [1, 1], 0.8, 0.8, [0, 0]);
        assert!(matches!(r, Err(ClusterError::EmptyBoundBoxes)));

        let r =
            br.find_boxes_containing_tags(comm, &level, 0, 1, &[bound], [1, 1], 1.5, 0.8, [0, 0]);
        assert!(matches!(
            r,
            Err(ClusterError::InvalidTolerance {
                name: "efficiency_tol",
                ..
            })
        ));

        let r =
            br.find_boxes_containing_tags(comm, &level, 0, 1, &[bound], [0, 1], 0.8, 0.8, [0, 0]);
        assert!(matches!(r, Err(ClusterError::InvalidMinBox(_))));

        let r = br.find_boxes_containing_tags(
            comm,
            &level,
            0,
            1,
            &[bound, IndexBox::new([15, 15], [20, 20])],
            [1, 1],
            0.8,
            0.8,
            [0, 0],
        );
        assert!(matches!(r, Err(ClusterError::OverlappingBoundBoxes { .. })));

        let r =
            br.find_boxes_containing_tags(comm, &level, 3, 1, &[bound], [1, 1], 0.8, 0.8, [0, 0]);
        assert!(matches!(r, Err(ClusterError::UnknownTagData { index: 3, .. })));

        br.set_compute_relationships(RelationshipMode::TagToNew, [2, 2])
            .unwrap();
        let r =
            br.find_boxes_containing_tags(comm, &level, 0, 1, &[bound], [1, 1], 0.8, 0.8, [1, 1]);
        assert!(matches!(
            r,
            Err(ClusterError::RelationshipWidthExceedsGhost { .. })
        ));

        let other = block_level(0, 2);
        let r =
            br.find_boxes_containing_tags(comm, &other, 0, 1, &[bound], [1, 1], 0.8, 0.8, [2, 2]);
        assert!(matches!(r, Err(ClusterError::IncongruentComm { .. })));
    }

    #[test]
    fn bad_config_is_rejected_at_construction() {
        let mut cfg = ClusterConfig::default();
        cfg.max_box_size = Some(vec![8]);
        assert!(matches!(
            BergerRigoutsos::<2, ClusterComm<2>>::new(cfg),
            Err(ClusterError::DimensionMismatch { .. })
        ));
        let mut cfg = ClusterConfig::default();
        cfg.max_box_size = Some(vec![8, 0]);
        assert!(matches!(
            BergerRigoutsos::<2, ClusterComm<2>>::new(cfg),
            Err(ClusterError::InvalidMaxBoxSize(_))
        ));
    }

    #[test]
    fn stats_accumulate_over_invocations() {
        let comms = ClusterComm::<2>::world(2, Duration::from_secs(5));
        let stats = run_on_ranks(comms, |comm| {
            let mut br = BergerRigoutsos::<2, _>::new(ClusterConfig::default()).unwrap();
            let level = block_level(comm.rank(), 2);
            for _ in 0..3 {
                br.find_boxes_containing_tags(
                    &comm,
                    &level,
                    0,
                    1,
                    &[IndexBox::new([0, 0], [15, 15])],
                    [1, 1],
                    0.8,
                    0.8,
                    [0, 0],
                )
                .unwrap();
            }
            br.stats().clone()
        });
        assert_eq!(stats[0].invocations, 3);
        assert_eq!(stats[0].boxes_accepted + stats[1].boxes_accepted, 3);
    }
}
