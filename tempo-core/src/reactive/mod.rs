//! Reactive Primitives
//!
//! This module implements the core reactive system: cells, formulas, and the
//! opcodes bound to them. These primitives form the foundation of Tempo's
//! fine-grained reactivity.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a container for mutable state. Reading a cell inside a tracking
//! frame records it as a dependency. Updating a cell puts it in the pending
//! batch and schedules a flush.
//!
//! ## Formulas
//!
//! A Formula is a derived value that caches its result. It re-evaluates only
//! when one of the cells it read has changed since the cached value was
//! produced.
//!
//! ## Opcodes
//!
//! An Opcode is a side-effecting callback bound to one cell or formula. It
//! runs once when registered and again in every flush that reaches its tag.
//!
//! # Implementation Notes
//!
//! There is no thread-local state. Everything the primitives share lives in
//! a [`Runtime`], so independent graphs never observe each other.

mod cell;
mod context;
mod formula;
mod opcode;
mod runtime;
mod tag;

pub use cell::{Cell, WeakCell};
pub use context::TrackingFrame;
pub use formula::{Formula, FormulaState, WeakFormula};
pub use opcode::{evaluate_opcode, register_opcode, Completion, IntoCompletion, Opcode, Registration};
pub use runtime::{ManualControl, NoSchedulingWindow, Runtime};
pub use tag::{Tag, TagId, WeakTag};

pub(crate) use runtime::{FlushStorage, WeakRuntime};
