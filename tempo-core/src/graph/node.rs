//! Graph Nodes
//!
//! Bookkeeping the runtime keeps per tag, addressed by [`TagId`]. Values live
//! in the tag handles; the arena only holds what the scheduler needs.

use crate::reactive::TagId;

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A cell. The leaves of the graph, updated directly.
    Cell,

    /// A formula. Internal nodes, derived from the cells they read.
    Formula,
}

/// A node in the dependency graph.
#[derive(Debug)]
pub struct Node {
    kind: NodeKind,

    /// Optional diagnostic label.
    label: Option<String>,

    /// Revision at which the node last changed. Only cells move this.
    changed_at: u64,

    /// Flush epoch in which the node's opcodes last ran as a shared tag.
    flushed_in: u64,
}

impl Node {
    pub fn new(kind: NodeKind, label: Option<String>) -> Self {
        Self {
            kind,
            label,
            changed_at: 0,
            flushed_in: 0,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn changed_at(&self) -> u64 {
        self.changed_at
    }

    pub fn touch(&mut self, revision: u64) {
        self.changed_at = revision;
    }

    /// Mark the node as executed in `epoch`.
    ///
    /// Returns `false` if it was already marked, i.e. it already ran in this
    /// flush and must be skipped.
    pub fn mark_flushed(&mut self, epoch: u64) -> bool {
        if self.flushed_in == epoch {
            return false;
        }
        self.flushed_in = epoch;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_is_unchanged() {
        let node = Node::new(NodeKind::Cell, Some("count".into()));
        assert_eq!(node.kind(), NodeKind::Cell);
        assert_eq!(node.label(), Some("count"));
        assert_eq!(node.changed_at(), 0);
    }

    #[test]
    fn flush_marker_dedups_within_epoch() {
        let mut node = Node::new(NodeKind::Formula, None);
        assert!(node.mark_flushed(1));
        assert!(!node.mark_flushed(1));
        assert!(node.mark_flushed(2));
    }
}
