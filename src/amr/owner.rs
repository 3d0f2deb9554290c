// src/amr/owner.rs
//
// Ownership policies and child-group formation.
//
// When a node splits, every member of its group reports how it relates to each
// child (`GroupCriteria`). The parent's owner turns those reports into the
// child groups and picks one owner per child.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnerMode {
    /// A fixed rank owns every node.
    SingleOwner,
    /// The member with the largest data overlap owns the node.
    #[default]
    MostOverlap,
    /// The member owning the fewest active nodes owns the node.
    FewestOwned,
    /// The member participating in the fewest active nodes owns the node.
    LeastActive,
}

impl FromStr for OwnerMode {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SINGLE_OWNER" => Ok(Self::SingleOwner),
            "MOST_OVERLAP" => Ok(Self::MostOverlap),
            "FEWEST_OWNED" => Ok(Self::FewestOwned),
            "LEAST_ACTIVE" => Ok(Self::LeastActive),
            _ => Err(ClusterError::InvalidMode {
                what: "owner_mode",
                value: s.to_string(),
            }),
        }
    }
}

/// One member's report about the two children of a split node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCriteria {
    pub rank: usize,
    /// Local patch cells inside each child.
    pub overlap: [u64; 2],
    /// Whether any local patch lies within the relationship width of each child.
    pub near: [bool; 2],
    /// Active nodes this rank owns.
    pub owned: usize,
    /// Active nodes this rank participates in.
    pub active: usize,
}

/// Group and owner chosen for one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildGroup {
    pub group: Vec<usize>,
    pub owner: usize,
}

/// Form the group of child `child` (0 = left, 1 = right) and pick its owner.
///
/// Returns `None` when no member relates to the child at all.
pub fn form_child_group(
    criteria: &[GroupCriteria],
    child: usize,
    parent_owner: usize,
    mode: OwnerMode,
    single_owner_rank: usize,
) -> Option<ChildGroup> {
    let members: Vec<&GroupCriteria> = criteria
        .iter()
        .filter(|c| c.overlap[child] > 0 || c.near[child])
        .collect();
    if members.is_empty() {
        return None;
    }

    let mut group: Vec<usize> = members.iter().map(|c| c.rank).collect();

    let owner = match mode {
        OwnerMode::SingleOwner => {
            if !group.contains(&single_owner_rank) {
                group.push(single_owner_rank);
            }
            single_owner_rank
        }
        OwnerMode::MostOverlap => {
            // Largest overlap; ties keep the parent's owner, then the lowest rank.
            members
                .iter()
                .max_by_key(|c| {
                    (
                        c.overlap[child],
                        c.rank == parent_owner,
                        std::cmp::Reverse(c.rank),
                    )
                })
                .map(|c| c.rank)?
        }
        OwnerMode::FewestOwned => {
            members
                .iter()
                .min_by_key(|c| (c.owned, std::cmp::Reverse(c.overlap[child]), c.rank))
                .map(|c| c.rank)?
        }
        OwnerMode::LeastActive => {
            members
                .iter()
                .min_by_key(|c| (c.active, std::cmp::Reverse(c.overlap[child]), c.rank))
                .map(|c| c.rank)?
        }
    };

    group.sort_unstable();
    group.dedup();
    Some(ChildGroup { group, owner })
}
