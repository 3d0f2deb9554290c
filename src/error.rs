// src/error.rs
//
// Error taxonomy for the clustering core and the messaging substrate.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Failures of the point-to-point messaging substrate. All of them are fatal
/// for a clustering run.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {rank} is outside a communicator of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("rank {to} is no longer receiving messages")]
    Disconnected { to: usize },

    #[error("rank {rank} waited {waited:?} without receiving a message")]
    Timeout { rank: usize, waited: Duration },
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("bound_boxes must not be empty")]
    EmptyBoundBoxes,

    #[error("bound box {0} is empty")]
    InvalidBoundBox(String),

    #[error("bound boxes {a} and {b} overlap")]
    OverlappingBoundBoxes { a: String, b: String },

    #[error("{name} = {value} must lie in [0, 1]")]
    InvalidTolerance { name: &'static str, value: f64 },

    #[error("min_box must be at least 1 in every direction, got {0:?}")]
    InvalidMinBox(Vec<i32>),

    #[error("max_box_size must be at least 1 in every direction, got {0:?}")]
    InvalidMaxBoxSize(Vec<i32>),

    #[error("{what} has {got} entries, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("tag data index {index} is not present on patch {patch} ({available} arrays)")]
    UnknownTagData {
        index: usize,
        patch: String,
        available: usize,
    },

    #[error("tag array {index} on patch {patch} has {len} entries, expected {expected}")]
    TagDataLength {
        index: usize,
        patch: String,
        len: usize,
        expected: u64,
    },

    #[error("tile must be at least 1 in every direction, got {0:?}")]
    InvalidTile(Vec<i32>),

    #[error("relationship ghost width {width:?} exceeds max_gcw {max_gcw:?}")]
    RelationshipWidthExceedsGhost { width: Vec<i32>, max_gcw: Vec<i32> },

    #[error("invalid {what} '{value}'")]
    InvalidMode { what: &'static str, value: String },

    #[error("config: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("minimum box size violation at {cell_box} (min_box {min_box:?}): {reason}")]
    MinBoxViolation {
        cell_box: String,
        min_box: Vec<i32>,
        reason: &'static str,
    },

    #[error(
        "communicator (rank {comm_rank} of {comm_size}) is not congruent with the tag level (rank {level_rank} of {level_size})"
    )]
    IncongruentComm {
        comm_rank: usize,
        comm_size: usize,
        level_rank: usize,
        level_size: usize,
    },

    #[error("message tag pool exhausted on rank {rank} (upper bound {upper_bound})")]
    TagPoolExhausted { rank: usize, upper_bound: u32 },

    #[error("rank {rank} aborted clustering: {reason}")]
    Aborted { rank: usize, reason: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Comm(#[from] CommError),
}
