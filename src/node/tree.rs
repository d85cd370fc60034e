//! Broker-local node tree
//!
//! The broker only needs two capabilities from its own tree: resolve a path
//! to a node and list that node. Storage and permissions live behind the
//! [`NodeTree`] trait; [`MemoryTree`] is the in-process implementation used
//! by default and in tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use super::path::ParsedPath;
use crate::protocol::constants::{IS_ATTRIBUTE, NODE_PROFILE};

/// A resolved node
pub trait NodeHandle: Send + Sync {
    /// Snapshot of the node's attributes and children as list entries
    fn list(&self) -> Vec<Value>;

    /// Whether the node may be listed at all
    fn accessible(&self) -> bool;
}

/// Lookup capability over the broker's own tree
pub trait NodeTree: Send + Sync {
    fn resolve(&self, path: &ParsedPath) -> Option<Arc<dyn NodeHandle>>;
}

/// In-memory node
pub struct MemoryNode {
    profile: RwLock<String>,
    attributes: RwLock<BTreeMap<String, Value>>,
    children: RwLock<BTreeMap<String, Arc<MemoryNode>>>,
    accessible: AtomicBool,
}

impl MemoryNode {
    fn new() -> Self {
        Self {
            profile: RwLock::new(NODE_PROFILE.to_string()),
            attributes: RwLock::new(BTreeMap::new()),
            children: RwLock::new(BTreeMap::new()),
            accessible: AtomicBool::new(true),
        }
    }

    fn child_or_insert(&self, name: &str) -> Arc<MemoryNode> {
        let mut children = self.children.write();
        Arc::clone(
            children
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryNode::new())),
        )
    }

    fn child(&self, name: &str) -> Option<Arc<MemoryNode>> {
        self.children.read().get(name).cloned()
    }

    pub fn set_profile(&self, profile: impl Into<String>) {
        *self.profile.write() = profile.into();
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: Value) {
        self.attributes.write().insert(name.into(), value);
    }

    pub fn set_accessible(&self, accessible: bool) {
        self.accessible.store(accessible, Ordering::Relaxed);
    }
}

impl NodeHandle for MemoryNode {
    fn list(&self) -> Vec<Value> {
        let mut entries = vec![json!([IS_ATTRIBUTE, self.profile.read().as_str()])];

        for (name, value) in self.attributes.read().iter() {
            entries.push(json!([name, value]));
        }
        for (name, child) in self.children.read().iter() {
            entries.push(json!([name, { IS_ATTRIBUTE: child.profile.read().as_str() }]));
        }

        entries
    }

    fn accessible(&self) -> bool {
        self.accessible.load(Ordering::Relaxed)
    }
}

/// Tree of [`MemoryNode`]s rooted at `/`
pub struct MemoryTree {
    root: Arc<MemoryNode>,
    downstream: String,
}

impl MemoryTree {
    /// Create a tree whose remote paths are mounted under `downstream`
    pub fn new(downstream: impl Into<String>) -> Self {
        Self {
            root: Arc::new(MemoryNode::new()),
            downstream: downstream.into(),
        }
    }

    /// Get or create the node at `path`, creating intermediate nodes
    pub fn insert(&self, path: &str) -> Arc<MemoryNode> {
        let parsed = ParsedPath::parse(&self.downstream, path);
        parsed
            .split()
            .iter()
            .fold(Arc::clone(&self.root), |node, segment| {
                node.child_or_insert(segment)
            })
    }

    fn find(&self, path: &ParsedPath) -> Option<Arc<MemoryNode>> {
        let mut node = Arc::clone(&self.root);
        for segment in path.split() {
            node = node.child(segment)?;
        }
        Some(node)
    }
}

impl NodeTree for MemoryTree {
    fn resolve(&self, path: &ParsedPath) -> Option<Arc<dyn NodeHandle>> {
        self.find(path).map(|node| node as Arc<dyn NodeHandle>)
    }
}
