// src/amr/node.rs
//
// Per-candidate state machine of the Berger-Rigoutsos algorithm.
//
// A node exists on every rank of its group. Each call to `advance` moves it as
// far as the messages already in its inbox allow; it returns `Pending` at the
// suspension points (histogram reduction, decision broadcast, child-group
// formation) and the stage driver resumes it when new mail arrives.
//
// The node only talks to the outside world through `NodeHost`.

use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::amr::clustering::{ClusterStats, Settings};
use crate::amr::histogram::{CutKind, Decision, Histogram, MinBoxPolicy, decide};
use crate::amr::owner::{GroupCriteria, form_child_group};
use crate::amr::rect::IndexBox;
use crate::error::{ClusterError, Result};

/// Globally unique node identity.
///
/// Roots use a reserved origin and the index of their bound box; every other
/// node gets `(origin, seq)` from the tag pool of the rank that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub origin: u32,
    pub seq: u32,
}

impl NodeId {
    pub const ROOT_ORIGIN: u32 = u32::MAX;

    pub fn root(index: usize) -> Self {
        Self {
            origin: Self::ROOT_ORIGIN,
            seq: index as u32,
        }
    }
}

/// How partial histograms are combined across a node's group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistogramReduction {
    /// Members send to the owner; the owner decides and broadcasts.
    #[default]
    GatherToOwner,
    /// Members exchange partial histograms and all decide locally.
    AllReduce,
}

impl FromStr for HistogramReduction {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GATHER_TO_OWNER" => Ok(Self::GatherToOwner),
            "ALL_REDUCE" => Ok(Self::AllReduce),
            _ => Err(ClusterError::InvalidMode {
                what: "histogram_reduction",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    Constructed,
    HistogramPending,
    HistogramReducing,
    Deciding,
    BroadcastingDecision,
    Accepted,
    Split,
    FormingChildGroups,
    RelationshipSharing,
    Completed,
}

/// A child created by a split, as broadcast by the parent's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChildSpec<const D: usize> {
    pub id: NodeId,
    pub bound: IndexBox<D>,
    pub group: Vec<usize>,
    pub owner: usize,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeMessage<const D: usize> {
    Histogram(Histogram<D>),
    Decision(Decision<D>),
    Criteria(GroupCriteria),
    ChildGroups(Vec<ChildSpec<D>>),
}

/// What the driver should do with a node after advancing it.
#[derive(Debug)]
pub(crate) enum Advance<const D: usize> {
    Pending,
    Completed,
    Spawned(Vec<BoxNode<D>>),
}

/// Capabilities a node needs from the process it runs on.
pub(crate) trait NodeHost<const D: usize> {
    fn rank(&self) -> usize;

    fn settings(&self) -> &Settings<D>;

    fn send(&mut self, to: usize, node: NodeId, msg: NodeMessage<D>) -> Result<()>;

    fn local_histogram(&self, region: &IndexBox<D>) -> Result<Histogram<D>>;

    /// This rank's grouping report for the two children of a split.
    fn criteria(&self, children: [&IndexBox<D>; 2]) -> GroupCriteria;

    fn allocate_node_id(&mut self) -> Result<NodeId>;

    /// Record an accepted box: registration on the owner, relationships everywhere.
    fn accept_box(&mut self, node: NodeId, owner: usize, cell_box: IndexBox<D>) -> Result<()>;

    fn stats(&mut self) -> &mut ClusterStats;
}

#[derive(Debug)]
pub(crate) struct BoxNode<const D: usize> {
    id: NodeId,
    generation: u32,
    bound: IndexBox<D>,
    group: Vec<usize>,
    owner: usize,
    state: NodeState,
    inbox: Vec<(usize, NodeMessage<D>)>,
    histogram: Option<Histogram<D>>,
    decision: Option<Decision<D>>,
    criteria: Vec<GroupCriteria>,
    /// Remote contributions still expected in the current reduction.
    expected: usize,
}

impl<const D: usize> BoxNode<D> {
    pub(crate) fn new(
        id: NodeId,
        generation: u32,
        bound: IndexBox<D>,
        group: Vec<usize>,
        owner: usize,
    ) -> Self {
        Self {
            id,
            generation,
            bound,
            group,
            owner,
            state: NodeState::Constructed,
            inbox: Vec::new(),
            histogram: None,
            decision: None,
            criteria: Vec::new(),
            expected: 0,
        }
    }

    /// Root node for bound box `index`; every rank takes part.
    pub(crate) fn root(index: usize, bound: IndexBox<D>, n_ranks: usize, owner: usize) -> Self {
        Self::new(NodeId::root(index), 0, bound, (0..n_ranks).collect(), owner)
    }

    #[inline]
    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub(crate) fn owner(&self) -> usize {
        self.owner
    }

    #[inline]
    pub(crate) fn state(&self) -> NodeState {
        self.state
    }

    /// Order in which synchronous mode processes nodes; children sort after parents.
    #[inline]
    pub(crate) fn key(&self) -> (u32, NodeId) {
        (self.generation, self.id)
    }

    pub(crate) fn deliver(&mut self, from: usize, msg: NodeMessage<D>) {
        self.inbox.push((from, msg));
    }

    fn take_mail(&mut self, pick: impl Fn(&NodeMessage<D>) -> bool) -> Vec<(usize, NodeMessage<D>)> {
        let (taken, rest) = std::mem::take(&mut self.inbox)
            .into_iter()
            .partition(|(_, m)| pick(m));
        self.inbox = rest;
        taken
    }

    fn others<'a>(&'a self, me: usize) -> impl Iterator<Item = usize> + 'a {
        self.group.iter().copied().filter(move |&r| r != me)
    }

    fn protocol(&self, what: &str) -> ClusterError {
        ClusterError::Protocol(format!("node {:?} in state {:?}: {what}", self.id, self.state))
    }

    fn enter(&mut self, decision: Decision<D>) {
        self.state = match decision {
            Decision::Empty => NodeState::Completed,
            Decision::Accept(_) => NodeState::Accepted,
            Decision::Split { .. } => NodeState::Split,
        };
        self.decision = Some(decision);
    }

    fn spawn(&self, children: &[ChildSpec<D>], me: usize) -> Vec<BoxNode<D>> {
        children
            .iter()
            .filter(|c| c.group.contains(&me))
            .map(|c| BoxNode::new(c.id, self.generation + 1, c.bound, c.group.clone(), c.owner))
            .collect()
    }

    /// Run the state machine until it completes or has to wait for messages.
    pub(crate) fn advance<H: NodeHost<D>>(&mut self, host: &mut H) -> Result<Advance<D>> {
        let me = host.rank();
        let reduction = host.settings().histogram_reduction;
        // Whether this rank sums the histogram and runs the engine itself.
        let reduces = me == self.owner || reduction == HistogramReduction::AllReduce;

        loop {
            match self.state {
                NodeState::Constructed => {
                    if !self.group.contains(&me) || !self.group.contains(&self.owner) {
                        return Err(self.protocol("rank or owner outside the group"));
                    }
                    self.state = NodeState::HistogramPending;
                }

                NodeState::HistogramPending => {
                    let local = host.local_histogram(&self.bound)?;
                    match reduction {
                        HistogramReduction::GatherToOwner if me != self.owner => {
                            host.send(self.owner, self.id, NodeMessage::Histogram(local))?;
                        }
                        HistogramReduction::GatherToOwner => {
                            self.histogram = Some(local);
                        }
                        HistogramReduction::AllReduce => {
                            let others: Vec<usize> = self.others(me).collect();
                            for r in others {
                                host.send(r, self.id, NodeMessage::Histogram(local.clone()))?;
                            }
                            self.histogram = Some(local);
                        }
                    }
                    self.expected = if reduces { self.group.len() - 1 } else { 0 };
                    self.state = NodeState::HistogramReducing;
                }

                NodeState::HistogramReducing => {
                    if !reduces {
                        self.state = NodeState::BroadcastingDecision;
                        continue;
                    }
                    let mail = self.take_mail(|m| matches!(m, NodeMessage::Histogram(_)));
                    let acc = self
                        .histogram
                        .as_mut()
                        .ok_or_else(|| ClusterError::Protocol("missing local histogram".into()))?;
                    for (_, m) in &mail {
                        if let NodeMessage::Histogram(h) = m {
                            acc.merge(h)?;
                        }
                    }
                    if mail.len() > self.expected {
                        return Err(self.protocol("more histograms than group members"));
                    }
                    self.expected -= mail.len();
                    if self.expected > 0 {
                        return Ok(Advance::Pending);
                    }
                    self.state = NodeState::Deciding;
                }

                NodeState::Deciding => {
                    let hist = self
                        .histogram
                        .take()
                        .ok_or_else(|| self.protocol("no reduced histogram"))?;
                    let params = host.settings().split;
                    let t0 = Instant::now();
                    let verdict = decide(&hist, &params, self.generation == 0)?;
                    let stats = host.stats();
                    stats.time_deciding += t0.elapsed();

                    // Diagnostics are reported once, by the owner.
                    if me == self.owner {
                        if let Some(reason) = verdict.min_box_violation {
                            stats.min_box_violations += 1;
                            if params.check_min_box_size == MinBoxPolicy::Warn {
                                warn!(node = ?self.id, region = %self.bound, reason, "minimum box size violation");
                            }
                        }
                        if verdict.combine_rejected {
                            stats.combine_rejections += 1;
                        }
                        match verdict.decision {
                            Decision::Split { cut, .. } => match cut.kind {
                                CutKind::Zero => stats.zero_cuts += 1,
                                CutKind::Inflection => stats.inflection_cuts += 1,
                                CutKind::Center => stats.center_cuts += 1,
                            },
                            Decision::Accept(b) => {
                                debug!(node = ?self.id, generation = self.generation, cell_box = %b, efficiency = verdict.efficiency, "accepted");
                            }
                            Decision::Empty => {}
                        }
                    }

                    if reduction == HistogramReduction::GatherToOwner {
                        let others: Vec<usize> = self.others(me).collect();
                        for r in others {
                            host.send(r, self.id, NodeMessage::Decision(verdict.decision))?;
                        }
                    }
                    self.enter(verdict.decision);
                }

                NodeState::BroadcastingDecision => {
                    let mut mail = self.take_mail(|m| matches!(m, NodeMessage::Decision(_)));
                    match mail.pop() {
                        Some((_, NodeMessage::Decision(d))) if mail.is_empty() => self.enter(d),
                        Some(_) => return Err(self.protocol("duplicate decision")),
                        None => return Ok(Advance::Pending),
                    }
                }

                NodeState::Accepted => {
                    let Some(Decision::Accept(cell_box)) = self.decision else {
                        return Err(self.protocol("accepted without a box"));
                    };
                    host.accept_box(self.id, self.owner, cell_box)?;
                    self.state = NodeState::RelationshipSharing;
                }

                NodeState::RelationshipSharing => {
                    // Relationship sends are fire-and-forget; termination accounts for them.
                    self.state = NodeState::Completed;
                }

                NodeState::Split => {
                    let Some(Decision::Split { left, right, .. }) = self.decision else {
                        return Err(self.protocol("split without children"));
                    };
                    let crit = host.criteria([&left, &right]);
                    if me == self.owner {
                        self.criteria.push(crit);
                        self.expected = self.group.len() - 1;
                    } else {
                        host.send(self.owner, self.id, NodeMessage::Criteria(crit))?;
                    }
                    self.state = NodeState::FormingChildGroups;
                }

                NodeState::FormingChildGroups => {
                    if me != self.owner {
                        let mut mail = self.take_mail(|m| matches!(m, NodeMessage::ChildGroups(_)));
                        let children = match mail.pop() {
                            Some((_, NodeMessage::ChildGroups(c))) if mail.is_empty() => c,
                            Some(_) => return Err(self.protocol("duplicate child groups")),
                            None => return Ok(Advance::Pending),
                        };
                        self.state = NodeState::Completed;
                        return Ok(Advance::Spawned(self.spawn(&children, me)));
                    }

                    let mail = self.take_mail(|m| matches!(m, NodeMessage::Criteria(_)));
                    if mail.len() > self.expected {
                        return Err(self.protocol("more criteria than group members"));
                    }
                    self.expected -= mail.len();
                    self.criteria.extend(mail.into_iter().filter_map(|(_, m)| match m {
                        NodeMessage::Criteria(c) => Some(c),
                        _ => None,
                    }));
                    if self.expected > 0 {
                        return Ok(Advance::Pending);
                    }

                    let Some(Decision::Split { left, right, .. }) = self.decision else {
                        return Err(self.protocol("split without children"));
                    };
                    let (owner_mode, single_owner_rank) = {
                        let s = host.settings();
                        (s.owner_mode, s.single_owner_rank)
                    };
                    let mut children = Vec::with_capacity(2);
                    for (k, bound) in [left, right].into_iter().enumerate() {
                        let Some(cg) = form_child_group(
                            &self.criteria,
                            k,
                            self.owner,
                            owner_mode,
                            single_owner_rank,
                        ) else {
                            continue;
                        };
                        children.push(ChildSpec {
                            id: host.allocate_node_id()?,
                            bound,
                            group: cg.group,
                            owner: cg.owner,
                        });
                    }

                    let others: Vec<usize> = self.others(me).collect();
                    for r in others {
                        host.send(r, self.id, NodeMessage::ChildGroups(children.clone()))?;
                    }
                    self.state = NodeState::Completed;
                    return Ok(Advance::Spawned(self.spawn(&children, me)));
                }

                NodeState::Completed => return Ok(Advance::Completed),
            }
        }
    }
}
