//! Graph Indexes
//!
//! The graph is an arena of [`Node`]s plus two identity-keyed maps:
//!
//! - the **reverse-dependency index**, mapping a cell id to the formulas that
//!   read it during their last evaluation;
//! - the **opcode index**, mapping a tag id to the ordered list of opcodes
//!   registered against it.
//!
//! Both maps are only ever touched through [`Graph`], and [`Graph::remove_tag`]
//! is the single path that clears everything keyed by an id. Using ids instead
//! of references means the cyclic cell/formula relationship never needs
//! shared ownership.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexSet;
use serde::Serialize;

use super::node::Node;
use super::pool::Pool;
use crate::config::PoolConfig;
use crate::reactive::{Opcode, TagId};

/// Tears down the owning tag once its last opcode is gone.
pub(crate) type Release = Rc<dyn Fn()>;

struct OpcodeList {
    ops: Vec<Rc<Opcode>>,
    release: Release,
}

/// Outcome of removing one opcode from a tag's list.
pub(crate) enum Removal {
    /// The opcode was not registered (already removed).
    Missing,
    /// Other opcodes remain registered.
    Remaining,
    /// The list became empty and was released; the caller must run `Release`
    /// once no graph borrow is held.
    Emptied(Release),
}

/// Counters describing the graph, for diagnostics and leak checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    /// Live cells and formulas.
    pub nodes: usize,
    /// Tags with at least one registered opcode.
    pub opcode_lists: usize,
    /// Cells with at least one dependent formula.
    pub reverse_entries: usize,
    /// Cells awaiting the next flush.
    pub pending: usize,
    /// Opcode list buffers held for reuse.
    pub pooled_lists: usize,
    /// Tracking frames held for reuse.
    pub pooled_frames: usize,
}

pub(crate) struct Graph {
    nodes: HashMap<TagId, Node>,
    reverse: HashMap<TagId, IndexSet<TagId>>,
    opcodes: HashMap<TagId, OpcodeList>,
    lists: Pool<Vec<Rc<Opcode>>>,
}

impl Graph {
    pub fn new(pool: PoolConfig) -> Self {
        Self {
            nodes: HashMap::new(),
            reverse: HashMap::new(),
            opcodes: HashMap::new(),
            lists: Pool::new(pool),
        }
    }

    pub fn insert_node(&mut self, id: TagId, node: Node) {
        self.nodes.insert(id, node);
    }

    pub fn node(&self, id: TagId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: TagId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Record that cell `id` changed at `revision`.
    pub fn touch(&mut self, id: TagId, revision: u64) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.touch(revision);
                true
            }
            None => false,
        }
    }

    /// Whether any of `cells` changed after `revision`.
    ///
    /// Cells that no longer exist count as unchanged.
    pub fn changed_since(&self, cells: &[TagId], revision: u64) -> bool {
        cells.iter().any(|id| {
            self.nodes
                .get(id)
                .is_some_and(|node| node.changed_at() > revision)
        })
    }

    /// Register `formula` as a dependent of each of `cells`.
    pub fn bind_all(&mut self, cells: &[TagId], formula: TagId) {
        for cell in cells {
            if self.nodes.contains_key(cell) {
                self.reverse.entry(*cell).or_default().insert(formula);
            }
        }
    }

    /// Remove `formula` from the dependents of each of `cells`.
    pub fn unbind_all(&mut self, cells: &[TagId], formula: TagId) {
        for cell in cells {
            if let Some(dependents) = self.reverse.get_mut(cell) {
                dependents.shift_remove(&formula);
                if dependents.is_empty() {
                    self.reverse.remove(cell);
                }
            }
        }
    }

    /// Move the dependents of `cell` into `out`, clearing the entry.
    pub fn drain_dependents(&mut self, cell: TagId, out: &mut Vec<TagId>) {
        if let Some(dependents) = self.reverse.remove(&cell) {
            out.extend(dependents);
        }
    }

    pub fn dependents(&self, cell: TagId) -> Vec<TagId> {
        self.reverse
            .get(&cell)
            .map(|dependents| dependents.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Append an opcode to `id`'s list, creating the list if absent.
    ///
    /// `release` is only invoked when a new list is created.
    pub fn push_opcode(&mut self, id: TagId, op: Rc<Opcode>, release: impl FnOnce() -> Release) {
        if let Some(list) = self.opcodes.get_mut(&id) {
            list.ops.push(op);
            return;
        }

        let mut ops = self.lists.acquire();
        ops.push(op);
        self.opcodes.insert(
            id,
            OpcodeList {
                ops,
                release: release(),
            },
        );
    }

    /// Append a snapshot of `id`'s opcode list to `out`.
    pub fn copy_opcodes(&self, id: TagId, out: &mut Vec<Rc<Opcode>>) {
        if let Some(list) = self.opcodes.get(&id) {
            out.extend(list.ops.iter().cloned());
        }
    }

    pub fn opcode_count(&self, id: TagId) -> usize {
        self.opcodes.get(&id).map_or(0, |list| list.ops.len())
    }

    /// Remove one opcode from `id`'s list.
    pub fn remove_opcode(&mut self, id: TagId, op: &Rc<Opcode>) -> Removal {
        let Some(list) = self.opcodes.get_mut(&id) else {
            return Removal::Missing;
        };
        let Some(position) = list.ops.iter().position(|entry| Rc::ptr_eq(entry, op)) else {
            return Removal::Missing;
        };
        list.ops.remove(position).deactivate();
        if !list.ops.is_empty() {
            return Removal::Remaining;
        }

        match self.opcodes.remove(&id) {
            Some(list) => {
                self.lists.release(list.ops);
                Removal::Emptied(list.release)
            }
            None => Removal::Remaining,
        }
    }

    /// Remove every piece of bookkeeping keyed by `id`.
    ///
    /// Dropping the opcode list here does not run its release hook: this is
    /// the destroy path the hook itself leads to.
    pub fn remove_tag(&mut self, id: TagId) -> bool {
        let existed = self.nodes.remove(&id).is_some();
        self.reverse.remove(&id);
        if let Some(list) = self.opcodes.remove(&id) {
            list.ops.iter().for_each(|op| op.deactivate());
            self.lists.release(list.ops);
        }
        existed
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            nodes: self.nodes.len(),
            opcode_lists: self.opcodes.len(),
            reverse_entries: self.reverse.len(),
            pooled_lists: self.lists.available(),
            ..GraphStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;

    fn graph_with(ids: &[u64]) -> Graph {
        let mut graph = Graph::new(PoolConfig::default());
        for id in ids {
            graph.insert_node(TagId::from(*id), Node::new(NodeKind::Cell, None));
        }
        graph
    }

    #[test]
    fn bind_and_drain_dependents() {
        let mut graph = graph_with(&[1, 2]);
        let cells = [TagId::from(1), TagId::from(2)];

        graph.bind_all(&cells, TagId::from(10));
        graph.bind_all(&cells[..1], TagId::from(11));
        graph.bind_all(&cells[..1], TagId::from(10));

        assert_eq!(graph.dependents(cells[0]), vec![TagId::from(10), TagId::from(11)]);

        let mut out = Vec::new();
        graph.drain_dependents(cells[0], &mut out);
        assert_eq!(out, vec![TagId::from(10), TagId::from(11)]);
        assert!(graph.dependents(cells[0]).is_empty());
        assert_eq!(graph.stats().reverse_entries, 1);
    }

    #[test]
    fn unbind_removes_empty_entries() {
        let mut graph = graph_with(&[1]);
        let cells = [TagId::from(1)];
        graph.bind_all(&cells, TagId::from(5));
        graph.unbind_all(&cells, TagId::from(5));
        assert_eq!(graph.stats().reverse_entries, 0);
    }

    #[test]
    fn bind_ignores_unknown_cells() {
        let mut graph = graph_with(&[]);
        graph.bind_all(&[TagId::from(3)], TagId::from(4));
        assert_eq!(graph.stats().reverse_entries, 0);
    }

    #[test]
    fn changed_since_compares_revisions() {
        let mut graph = graph_with(&[1, 2]);
        graph.touch(TagId::from(2), 7);

        assert!(graph.changed_since(&[TagId::from(1), TagId::from(2)], 6));
        assert!(!graph.changed_since(&[TagId::from(1), TagId::from(2)], 7));
        assert!(!graph.changed_since(&[TagId::from(99)], 0));
    }

    #[test]
    fn remove_tag_clears_all_indexes() {
        let mut graph = graph_with(&[1]);
        let id = TagId::from(1);
        graph.bind_all(&[id], TagId::from(2));
        graph.push_opcode(id, Rc::new(Opcode::noop()), || -> Release { Rc::new(|| {}) });

        assert!(graph.remove_tag(id));
        assert!(!graph.remove_tag(id));

        let stats = graph.stats();
        assert_eq!(stats.nodes, 0);
        assert_eq!(stats.opcode_lists, 0);
        assert_eq!(stats.reverse_entries, 0);
        assert_eq!(stats.pooled_lists, 1);
    }

    #[test]
    fn removed_opcodes_are_deactivated() {
        let mut graph = graph_with(&[1]);
        let id = TagId::from(1);
        let first = Rc::new(Opcode::noop());
        let second = Rc::new(Opcode::noop());
        graph.push_opcode(id, first.clone(), || -> Release { Rc::new(|| {}) });
        graph.push_opcode(id, second.clone(), || -> Release { Rc::new(|| {}) });

        let mut snapshot = Vec::new();
        graph.copy_opcodes(id, &mut snapshot);
        assert_eq!(snapshot.len(), 2);

        assert!(matches!(graph.remove_opcode(id, &first), Removal::Remaining));
        assert!(!first.is_active());
        assert!(second.is_active());

        graph.remove_tag(id);
        assert!(snapshot.iter().all(|op| !op.is_active()));
    }

    #[test]
    fn removing_last_opcode_returns_release_hook() {
        let mut graph = graph_with(&[1]);
        let id = TagId::from(1);
        let first = Rc::new(Opcode::noop());
        let second = Rc::new(Opcode::noop());
        graph.push_opcode(id, first.clone(), || -> Release { Rc::new(|| {}) });
        graph.push_opcode(id, second.clone(), || -> Release { unreachable!("list already exists") });

        assert!(matches!(graph.remove_opcode(id, &first), Removal::Remaining));
        assert!(matches!(graph.remove_opcode(id, &first), Removal::Missing));
        assert!(matches!(graph.remove_opcode(id, &second), Removal::Emptied(_)));
        assert_eq!(graph.opcode_count(id), 0);
    }
}
