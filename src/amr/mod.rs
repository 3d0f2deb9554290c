pub mod box_level;
pub mod histogram;
pub mod rect;
pub mod tags;

pub mod clustering;
pub mod collector;
pub mod indicator;
pub mod node;
pub mod owner;
pub mod stage;

pub use box_level::{BoxId, BoxLevel, Connector, LevelBox};
pub use rect::IndexBox;
pub use tags::{TagLevel, TagPatch};

pub use clustering::{BergerRigoutsos, ClusterComm, ClusterOutput, ClusterStats};
pub use collector::RelationshipMode;
pub use histogram::{
    CombineComparison, CombineFallback, CutKind, MinBoxPolicy, ZeroCutTieBreak,
};
pub use indicator::{IndicatorStats, ScalarField2D, indicator_grad2_forward, tag_cells_from_indicator};
pub use node::{HistogramReduction, NodeId};
pub use owner::OwnerMode;
pub use stage::{AdvanceMode, ClusterMessage};
