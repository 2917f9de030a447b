//! Dataset input for replaying recorded streams through the node.

pub mod replay;

pub use replay::ReplayDataset;
