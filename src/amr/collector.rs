// src/amr/collector.rs
//
// Accepted-box registration, relationship bookkeeping and the final collective.
//
// During the run boxes and edges are keyed by `NodeId`. Once every rank has
// finished, the Finalize exchange gives each rank every owner's accepted list,
// from which the global box order and the `BoxId`s are derived.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::amr::box_level::{BoxId, BoxLevel, Connector, LevelBox};
use crate::amr::node::NodeId;
use crate::amr::rect::IndexBox;
use crate::error::{ClusterError, Result};

/// Which connectors to build between the tag level and the new level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipMode {
    #[default]
    None,
    TagToNew,
    Bidirectional,
}

impl FromStr for RelationshipMode {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::None),
            "TAG_TO_NEW" => Ok(Self::TagToNew),
            "BIDIRECTIONAL" => Ok(Self::Bidirectional),
            _ => Err(ClusterError::InvalidMode {
                what: "relationship_mode",
                value: s.to_string(),
            }),
        }
    }
}

/// One rank's accepted boxes, in registration order.
pub(crate) type AcceptedList<const D: usize> = Vec<(NodeId, IndexBox<D>)>;

/// Result of the final collective on one rank.
#[derive(Debug)]
pub(crate) struct Collected<const D: usize> {
    pub level: BoxLevel<D>,
    pub global: Vec<LevelBox<D>>,
    pub tag_to_new: Option<Connector<D>>,
    pub new_to_tag: Option<Connector<D>>,
}

#[derive(Debug, Clone)]
pub(crate) struct Collector<const D: usize> {
    rank: usize,
    n_ranks: usize,
    accepted: AcceptedList<D>,
    tag_to_new: Vec<(BoxId, NodeId)>,
    new_to_tag: Vec<(NodeId, BoxId)>,
    sent: Vec<usize>,
    received: usize,
    remote: Vec<Option<(AcceptedList<D>, usize)>>,
}

impl<const D: usize> Collector<D> {
    pub(crate) fn new(rank: usize, n_ranks: usize) -> Self {
        Self {
            rank,
            n_ranks,
            accepted: Vec::new(),
            tag_to_new: Vec::new(),
            new_to_tag: Vec::new(),
            sent: vec![0; n_ranks],
            received: 0,
            remote: vec![None; n_ranks],
        }
    }

    pub(crate) fn register(&mut self, node: NodeId, cell_box: IndexBox<D>) {
        self.accepted.push((node, cell_box));
    }

    pub(crate) fn add_tag_to_new(&mut self, tag: BoxId, node: NodeId) {
        self.tag_to_new.push((tag, node));
    }

    pub(crate) fn add_new_to_tag(&mut self, node: NodeId, tag: BoxId) {
        self.new_to_tag.push((node, tag));
    }

    pub(crate) fn note_relationships_sent(&mut self, to: usize) {
        self.sent[to] += 1;
    }

    /// Edges another rank found between its tag patches and a box owned here.
    pub(crate) fn receive_relationships(&mut self, node: NodeId, tags: Vec<BoxId>) {
        self.new_to_tag.extend(tags.into_iter().map(|t| (node, t)));
        self.received += 1;
    }

    /// Accepted list and relationship-message count this rank sends to `to`.
    pub(crate) fn finalize_payload(&self, to: usize) -> (AcceptedList<D>, usize) {
        (self.accepted.clone(), self.sent[to])
    }

    pub(crate) fn receive_finalize(
        &mut self,
        from: usize,
        accepted: AcceptedList<D>,
        relationship_messages: usize,
    ) -> Result<()> {
        let slot = self
            .remote
            .get_mut(from)
            .ok_or_else(|| ClusterError::Protocol(format!("finalize from unknown rank {from}")))?;
        if slot.is_some() {
            return Err(ClusterError::Protocol(format!(
                "duplicate finalize from rank {from}"
            )));
        }
        *slot = Some((accepted, relationship_messages));
        Ok(())
    }

    /// Every peer has reported and every relationship message announced to this
    /// rank has arrived.
    pub(crate) fn is_complete(&self) -> bool {
        let mut announced = 0;
        for (r, slot) in self.remote.iter().enumerate() {
            if r == self.rank {
                continue;
            }
            match slot {
                Some((_, n)) => announced += n,
                None => return false,
            }
        }
        self.received >= announced
    }

    /// Build the global box order, assign `BoxId`s and resolve the edges.
    pub(crate) fn finish(
        mut self,
        sort: bool,
        mode: RelationshipMode,
        width: [i32; D],
    ) -> Result<Collected<D>> {
        let mut per_owner: Vec<AcceptedList<D>> = Vec::with_capacity(self.n_ranks);
        for r in 0..self.n_ranks {
            let list = if r == self.rank {
                std::mem::take(&mut self.accepted)
            } else {
                match self.remote[r].take() {
                    Some((list, _)) => list,
                    None => {
                        return Err(ClusterError::Protocol(format!(
                            "finalize from rank {r} never arrived"
                        )));
                    }
                }
            };
            per_owner.push(list);
        }

        let mut ids: HashMap<NodeId, BoxId> = HashMap::new();
        let mut global = Vec::new();
        let mut level = BoxLevel::new(self.rank, self.n_ranks);
        for (owner, mut list) in per_owner.into_iter().enumerate() {
            if sort {
                list.sort_by_key(|&(_, b)| b);
            }
            for (local, (node, cell_box)) in list.into_iter().enumerate() {
                let id = BoxId::new(owner, local);
                if ids.insert(node, id).is_some() {
                    return Err(ClusterError::Protocol(format!(
                        "node {node:?} accepted twice"
                    )));
                }
                let b = LevelBox { id, cell_box };
                if owner == self.rank {
                    level.push(b);
                }
                global.push(b);
            }
        }
        level.finalize();

        let resolve = |node: NodeId| {
            ids.get(&node).copied().ok_or_else(|| {
                ClusterError::Protocol(format!("relationship to unknown node {node:?}"))
            })
        };

        let tag_to_new = match mode {
            RelationshipMode::None => None,
            RelationshipMode::TagToNew | RelationshipMode::Bidirectional => {
                let mut c = Connector::new(width);
                for &(tag, node) in &self.tag_to_new {
                    c.insert(tag, resolve(node)?);
                }
                c.finalize();
                Some(c)
            }
        };
        let new_to_tag = match mode {
            RelationshipMode::Bidirectional => {
                let mut c = Connector::new(width);
                for &(node, tag) in &self.new_to_tag {
                    c.insert(resolve(node)?, tag);
                }
                c.finalize();
                Some(c)
            }
            _ => None,
        };

        Ok(Collected {
            level,
            global,
            tag_to_new,
            new_to_tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seq: u32) -> NodeId {
        NodeId { origin: 0, seq }
    }

    #[test]
    fn waits_for_every_peer_and_announced_message() {
        let mut c = Collector::<1>::new(1, 3);
        assert!(!c.is_complete());
        c.receive_finalize(0, vec![], 1).unwrap();
        c.receive_finalize(2, vec![], 0).unwrap();
        assert!(!c.is_complete());
        c.receive_relationships(node(0), vec![BoxId::new(0, 0)]);
        assert!(c.is_complete());
        assert!(c.receive_finalize(2, vec![], 0).is_err());
    }

    #[test]
    fn ids_follow_owner_rank_then_registration_order() {
        let a = IndexBox::new([10], [12]);
        let b = IndexBox::new([0], [3]);
        let mut c = Collector::<1>::new(1, 2);
        c.register(node(5), a);
        c.register(node(6), b);
        c.add_tag_to_new(BoxId::new(1, 0), node(6));
        c.add_new_to_tag(node(5), BoxId::new(0, 2));
        c.receive_finalize(0, vec![(node(1), IndexBox::new([20], [21]))], 0)
            .unwrap();

        let out = c
            .clone()
            .finish(false, RelationshipMode::Bidirectional, [1])
            .unwrap();
        let globals: Vec<_> = out.global.iter().map(|b| (b.id, b.cell_box)).collect();
        assert_eq!(
            globals,
            vec![
                (BoxId::new(0, 0), IndexBox::new([20], [21])),
                (BoxId::new(1, 0), a),
                (BoxId::new(1, 1), b),
            ]
        );
        assert_eq!(out.level.len(), 2);
        assert!(out.level.is_finalized());
        let t2n = out.tag_to_new.unwrap();
        assert_eq!(t2n.neighbors(BoxId::new(1, 0)), &[BoxId::new(1, 1)]);
        let n2t = out.new_to_tag.unwrap();
        assert_eq!(n2t.neighbors(BoxId::new(1, 0)), &[BoxId::new(0, 2)]);

        let sorted = c.finish(true, RelationshipMode::TagToNew, [1]).unwrap();
        assert_eq!(sorted.level.boxes()[0].cell_box, b);
        assert_eq!(sorted.level.boxes()[1].cell_box, a);
        assert!(sorted.new_to_tag.is_none());
    }
}
