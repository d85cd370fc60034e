//! Node paths and the broker's own tree

pub mod path;
pub mod tree;

pub use path::ParsedPath;
pub use tree::{MemoryNode, MemoryTree, NodeHandle, NodeTree};
