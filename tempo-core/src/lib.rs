//! Tempo Core
//!
//! This crate provides the reactive runtime behind Tempo's incremental UI
//! updates. It implements:
//!
//! - Reactive primitives (cells, formulas, opcodes)
//! - Automatic dependency tracking with isolated tracking frames
//! - A batched revalidation scheduler with synchronous and deferred flushes
//! - Pluggable hosts that decide when a scheduled flush runs
//!
//! The crate is designed to be used both as a native Rust library and as a
//! Python extension module via PyO3 (`python` feature).
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Cells, formulas, the opcode VM, and the runtime that owns them
//! - `graph`: Node arena, reverse-dependency and opcode indexes, scheduler
//! - `host`: Flush hosts (microtask queue, tokio)
//! - `config`: Runtime configuration
//! - `text`: Text rendering fallback for opcode values
//!
//! # Example
//!
//! ```rust,ignore
//! use tempo_core::reactive::{register_opcode, Cell, Formula, Runtime};
//!
//! let runtime = Runtime::new();
//!
//! // Create a cell
//! let count = Cell::new(&runtime, 1);
//!
//! // Create a derived value
//! let doubled = Formula::new(&runtime, {
//!     let count = count.clone();
//!     move || count.read() * 2
//! });
//!
//! // Bind a side effect; it runs immediately and prints "doubled: 2"
//! let registration = register_opcode(&doubled, |value| println!("doubled: {value}"));
//!
//! // Update the cell and drain the scheduled flush
//! count.update(5);
//! runtime.microtasks().unwrap().run_sync();
//! // Prints: "doubled: 10"
//!
//! registration.unregister();
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod host;
pub mod reactive;
pub mod text;

#[cfg(feature = "python")]
mod python;

pub use config::{PoolConfig, RuntimeConfig};
pub use error::{GraphError, Result};
pub use graph::{FlushStrategy, GraphStats};
pub use host::{Host, MicrotaskQueue, ScheduledFlush, TokioHost};
pub use reactive::{
    evaluate_opcode, register_opcode, Cell, Completion, Formula, FormulaState, Registration,
    Runtime, Tag, TagId, WeakTag,
};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module definition.
///
/// This function is called by Python when importing the module.
/// It registers all Python-exposed types.
#[cfg(feature = "python")]
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::PyRuntime>()?;
    m.add_class::<python::PyCell>()?;
    m.add_class::<python::PyFormula>()?;
    m.add_class::<python::PyRegistration>()?;

    // Add version info
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;

    Ok(())
}
