// src/amr/stage.rs
//
// The driver that runs every node this rank takes part in.
//
// Messages are routed to nodes by `NodeId`; mail for a node this rank has not
// created yet is stashed until the node is launched. Relationship, finalize and
// abort traffic is handled here directly. Three advance modes decide how
// message handling and node advancement interleave.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::amr::box_level::BoxId;
use crate::amr::clustering::{ClusterStats, Settings};
use crate::amr::collector::{AcceptedList, Collector, RelationshipMode};
use crate::amr::histogram::Histogram;
use crate::amr::node::{Advance, BoxNode, NodeHost, NodeId, NodeMessage};
use crate::amr::owner::GroupCriteria;
use crate::amr::rect::IndexBox;
use crate::amr::tags::TagLevel;
use crate::comm::Comm;
use crate::error::{ClusterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdvanceMode {
    /// Handle one message, then advance one node.
    AdvanceAny,
    /// Handle every arrived message, then advance every ready node.
    #[default]
    AdvanceSome,
    /// Run one node at a time to completion, in (generation, id) order.
    Synchronous,
}

impl FromStr for AdvanceMode {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ADVANCE_ANY" => Ok(Self::AdvanceAny),
            "ADVANCE_SOME" => Ok(Self::AdvanceSome),
            "SYNCHRONOUS" => Ok(Self::Synchronous),
            _ => Err(ClusterError::InvalidMode {
                what: "algo_advance_mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Wire message of the clustering protocol.
///
/// Opaque outside the crate; a transport only moves it between ranks.
#[derive(Debug)]
pub struct ClusterMessage<const D: usize> {
    /// Invocation counter; keeps back-to-back runs on one communicator apart.
    epoch: u64,
    payload: Payload<D>,
}

#[derive(Debug)]
pub(crate) enum Payload<const D: usize> {
    Node {
        node: NodeId,
        msg: NodeMessage<D>,
    },
    Relationships {
        new_node: NodeId,
        tag_boxes: Vec<BoxId>,
    },
    Finalize {
        accepted: AcceptedList<D>,
        relationship_messages: usize,
    },
    Abort {
        reason: String,
    },
}

/// Everything a node may touch while it runs on this rank.
pub(crate) struct Host<'a, const D: usize, C> {
    comm: &'a C,
    settings: &'a Settings<D>,
    tags: &'a TagLevel<D>,
    epoch: u64,
    pub(crate) collector: Collector<D>,
    pub(crate) stats: ClusterStats,
    /// Messages that belong to a later invocation.
    pub(crate) deferred: Vec<(usize, ClusterMessage<D>)>,
    next_seq: u32,
    owned: usize,
    active: usize,
}

impl<'a, const D: usize, C: Comm<ClusterMessage<D>>> Host<'a, D, C> {
    pub(crate) fn new(
        comm: &'a C,
        settings: &'a Settings<D>,
        tags: &'a TagLevel<D>,
        epoch: u64,
    ) -> Self {
        Self {
            comm,
            settings,
            tags,
            epoch,
            collector: Collector::new(comm.rank(), comm.size()),
            stats: ClusterStats::default(),
            deferred: Vec::new(),
            next_seq: 0,
            owned: 0,
            active: 0,
        }
    }

    fn post(&mut self, to: usize, payload: Payload<D>) -> Result<()> {
        self.comm.send(
            to,
            ClusterMessage {
                epoch: self.epoch,
                payload,
            },
        )?;
        self.stats.messages_sent += 1;
        Ok(())
    }

    /// Tell every other rank to stop. Best effort: peers may already be gone.
    pub(crate) fn broadcast_abort(&mut self, reason: &str) {
        let me = self.comm.rank();
        for r in (0..self.comm.size()).filter(|&r| r != me) {
            let _ = self.post(
                r,
                Payload::Abort {
                    reason: reason.to_string(),
                },
            );
        }
    }

    fn node_started(&mut self, node: &BoxNode<D>) {
        self.active += 1;
        self.stats.nodes_created += 1;
        if node.owner() == self.comm.rank() {
            self.owned += 1;
            self.stats.nodes_owned += 1;
        }
        self.stats.max_active_nodes = self.stats.max_active_nodes.max(self.active);
        self.stats.max_generation = self.stats.max_generation.max(node.generation());
    }

    fn node_retired(&mut self, node: &BoxNode<D>) {
        self.active -= 1;
        if node.owner() == self.comm.rank() {
            self.owned -= 1;
        }
    }
}

impl<const D: usize, C: Comm<ClusterMessage<D>>> NodeHost<D> for Host<'_, D, C> {
    #[inline]
    fn rank(&self) -> usize {
        self.comm.rank()
    }

    #[inline]
    fn settings(&self) -> &Settings<D> {
        self.settings
    }

    fn send(&mut self, to: usize, node: NodeId, msg: NodeMessage<D>) -> Result<()> {
        self.post(to, Payload::Node { node, msg })
    }

    fn local_histogram(&self, region: &IndexBox<D>) -> Result<Histogram<D>> {
        self.tags
            .histogram(self.settings.tag_data_index, self.settings.tag_val, region)
    }

    fn criteria(&self, children: [&IndexBox<D>; 2]) -> GroupCriteria {
        let near = |b: &IndexBox<D>| {
            self.settings.relationship_mode != RelationshipMode::None
                && self
                    .tags
                    .patches_near(b, self.settings.relationship_width)
                    .next()
                    .is_some()
        };
        GroupCriteria {
            rank: self.comm.rank(),
            overlap: [
                self.tags.overlap_cells(children[0]),
                self.tags.overlap_cells(children[1]),
            ],
            near: [near(children[0]), near(children[1])],
            owned: self.owned,
            active: self.active,
        }
    }

    fn allocate_node_id(&mut self) -> Result<NodeId> {
        let rank = self.comm.rank();
        if self.next_seq >= self.settings.tag_upper_bound {
            return Err(ClusterError::TagPoolExhausted {
                rank,
                upper_bound: self.settings.tag_upper_bound,
            });
        }
        let id = NodeId {
            origin: rank as u32,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        Ok(id)
    }

    fn accept_box(&mut self, node: NodeId, owner: usize, cell_box: IndexBox<D>) -> Result<()> {
        let me = self.comm.rank();
        if owner == me {
            self.collector.register(node, cell_box);
            self.stats.boxes_accepted += 1;
        }

        let mode = self.settings.relationship_mode;
        if mode == RelationshipMode::None {
            return Ok(());
        }
        let near: Vec<BoxId> = self
            .tags
            .patches_near(&cell_box, self.settings.relationship_width)
            .map(|p| p.id)
            .collect();
        for &tag in &near {
            self.collector.add_tag_to_new(tag, node);
        }
        if mode == RelationshipMode::Bidirectional && !near.is_empty() {
            if owner == me {
                for &tag in &near {
                    self.collector.add_new_to_tag(node, tag);
                }
            } else {
                self.post(
                    owner,
                    Payload::Relationships {
                        new_node: node,
                        tag_boxes: near,
                    },
                )?;
                self.collector.note_relationships_sent(owner);
                self.stats.relationship_messages += 1;
            }
        }
        Ok(())
    }

    #[inline]
    fn stats(&mut self) -> &mut ClusterStats {
        &mut self.stats
    }
}

/// All nodes this rank takes part in, plus the mail routing between them.
pub(crate) struct Stage<const D: usize> {
    mode: AdvanceMode,
    nodes: HashMap<NodeId, BoxNode<D>>,
    /// Active nodes by (generation, id).
    order: BTreeSet<(u32, NodeId)>,
    ready: VecDeque<NodeId>,
    queued: HashSet<NodeId>,
    stash: HashMap<NodeId, Vec<(usize, NodeMessage<D>)>>,
}

impl<const D: usize> Stage<D> {
    pub(crate) fn new(mode: AdvanceMode) -> Self {
        Self {
            mode,
            nodes: HashMap::new(),
            order: BTreeSet::new(),
            ready: VecDeque::new(),
            queued: HashSet::new(),
            stash: HashMap::new(),
        }
    }

    fn enqueue(&mut self, id: NodeId) {
        if self.mode != AdvanceMode::Synchronous && self.queued.insert(id) {
            self.ready.push_back(id);
        }
    }

    fn launch<C: Comm<ClusterMessage<D>>>(&mut self, mut node: BoxNode<D>, host: &mut Host<'_, D, C>) {
        let id = node.id();
        if let Some(mail) = self.stash.remove(&id) {
            for (from, msg) in mail {
                node.deliver(from, msg);
            }
        }
        host.node_started(&node);
        self.order.insert(node.key());
        self.nodes.insert(id, node);
        self.enqueue(id);
    }

    fn step<C: Comm<ClusterMessage<D>>>(&mut self, id: NodeId, host: &mut Host<'_, D, C>) -> Result<()> {
        self.queued.remove(&id);
        let Some(mut node) = self.nodes.remove(&id) else {
            return Ok(());
        };
        match node.advance(host)? {
            Advance::Pending => {
                self.nodes.insert(id, node);
            }
            Advance::Completed => self.retire(&node, host),
            Advance::Spawned(children) => {
                self.retire(&node, host);
                for child in children {
                    self.launch(child, host);
                }
            }
        }
        Ok(())
    }

    fn retire<C: Comm<ClusterMessage<D>>>(&mut self, node: &BoxNode<D>, host: &mut Host<'_, D, C>) {
        trace!(node = ?node.id(), state = ?node.state(), "retired");
        self.order.remove(&node.key());
        host.node_retired(node);
    }

    /// Route one incoming message. Returns the node it was addressed to, if any.
    fn deliver<C: Comm<ClusterMessage<D>>>(
        &mut self,
        from: usize,
        msg: ClusterMessage<D>,
        host: &mut Host<'_, D, C>,
    ) -> Result<Option<NodeId>> {
        if msg.epoch > host.epoch {
            host.deferred.push((from, msg));
            return Ok(None);
        }
        if msg.epoch < host.epoch {
            warn!(from, epoch = msg.epoch, "dropping message from an earlier invocation");
            return Ok(None);
        }
        host.stats.messages_received += 1;

        match msg.payload {
            Payload::Node { node, msg } => {
                match self.nodes.get_mut(&node) {
                    Some(n) => {
                        n.deliver(from, msg);
                        self.enqueue(node);
                    }
                    None => self.stash.entry(node).or_default().push((from, msg)),
                }
                Ok(Some(node))
            }
            Payload::Relationships { new_node, tag_boxes } => {
                host.collector.receive_relationships(new_node, tag_boxes);
                Ok(None)
            }
            Payload::Finalize {
                accepted,
                relationship_messages,
            } => {
                host.collector
                    .receive_finalize(from, accepted, relationship_messages)?;
                Ok(None)
            }
            Payload::Abort { reason } => Err(ClusterError::Aborted { rank: from, reason }),
        }
    }

    fn recv_and_deliver<C: Comm<ClusterMessage<D>>>(
        &mut self,
        host: &mut Host<'_, D, C>,
    ) -> Result<Option<NodeId>> {
        let (from, msg) = host.comm.recv()?;
        self.deliver(from, msg, host)
    }

    /// Run `roots` and everything they spawn until no local node is active.
    pub(crate) fn run<C: Comm<ClusterMessage<D>>>(
        &mut self,
        host: &mut Host<'_, D, C>,
        roots: Vec<BoxNode<D>>,
        early: Vec<(usize, ClusterMessage<D>)>,
    ) -> Result<()> {
        for root in roots {
            self.launch(root, host);
        }
        for (from, msg) in early {
            self.deliver(from, msg, host)?;
        }
        match self.mode {
            AdvanceMode::Synchronous => self.run_synchronous(host),
            AdvanceMode::AdvanceAny => self.run_interleaved(host, false),
            AdvanceMode::AdvanceSome => self.run_interleaved(host, true),
        }
    }

    fn run_interleaved<C: Comm<ClusterMessage<D>>>(
        &mut self,
        host: &mut Host<'_, D, C>,
        batch: bool,
    ) -> Result<()> {
        while !self.nodes.is_empty() {
            if batch {
                while let Some((from, msg)) = host.comm.try_recv()? {
                    self.deliver(from, msg, host)?;
                }
            } else if let Some((from, msg)) = host.comm.try_recv()? {
                self.deliver(from, msg, host)?;
            }

            if self.ready.is_empty() {
                // Every local node waits on a peer.
                self.recv_and_deliver(host)?;
                continue;
            }

            if batch {
                let ids: Vec<NodeId> = self.ready.drain(..).collect();
                for id in ids {
                    self.step(id, host)?;
                }
            } else if let Some(id) = self.ready.pop_front() {
                self.step(id, host)?;
            }
        }
        Ok(())
    }

    fn run_synchronous<C: Comm<ClusterMessage<D>>>(&mut self, host: &mut Host<'_, D, C>) -> Result<()> {
        while let Some(&(_, id)) = self.order.first() {
            self.step(id, host)?;
            while self.nodes.contains_key(&id) {
                if self.recv_and_deliver(host)? == Some(id) {
                    self.step(id, host)?;
                }
            }
        }
        Ok(())
    }

    /// Final collective: exchange accepted lists and relationship counts, then
    /// wait until every peer and every announced relationship message is in.
    pub(crate) fn finalize<C: Comm<ClusterMessage<D>>>(&mut self, host: &mut Host<'_, D, C>) -> Result<()> {
        let me = host.comm.rank();
        for r in (0..host.comm.size()).filter(|&r| r != me) {
            let (accepted, relationship_messages) = host.collector.finalize_payload(r);
            host.post(
                r,
                Payload::Finalize {
                    accepted,
                    relationship_messages,
                },
            )?;
        }
        while !host.collector.is_complete() {
            self.recv_and_deliver(host)?;
        }
        if let Some(node) = self.stash.keys().next() {
            return Err(ClusterError::Protocol(format!(
                "messages for node {node:?} were never consumed"
            )));
        }
        Ok(())
    }
}
