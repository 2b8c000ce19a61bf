//! Dependency Graph
//!
//! This module holds the bookkeeping behind the reactive primitives and the
//! scheduler that walks it.
//!
//! # Overview
//!
//! - Nodes live in an arena keyed by [`TagId`](crate::reactive::TagId).
//!   Cells and formulas only hold their id, never references to each other.
//! - The reverse-dependency index maps a cell to the formulas that read it.
//! - The opcode index maps a tag to its registered opcodes.
//!
//! A flush starts from the pending cells, follows the reverse index one step
//! to the formulas they feed, and runs the opcodes of both in a fixed order.
//!
//! # Design Decisions
//!
//! 1. Formulas flatten the cells of formulas they read, so one step through
//!    the reverse index reaches every affected formula. No topological sort
//!    is needed.
//!
//! 2. Ids are assigned in creation order, which gives derived tags a
//!    deterministic execution order for free.
//!
//! 3. Storage that churns (opcode lists, tracking frames) is recycled through
//!    bounded pools.

mod index;
mod node;
mod pool;
mod scheduler;

pub use index::GraphStats;
pub use node::{Node, NodeKind};
pub use pool::{Pool, Recycle};
pub use scheduler::FlushStrategy;

pub(crate) use index::{Graph, Release, Removal};
