//! Cell Implementation
//!
//! A cell is the atomic mutable value of the graph. Cells are the leaves:
//! formulas read them, and updating one is the only way new work enters the
//! scheduler.
//!
//! # How Cells Work
//!
//! 1. Reading a cell while a tracking frame is active records the cell's id
//!    in that frame.
//!
//! 2. Updating a cell replaces the value unconditionally (there is no
//!    equality check), adds the cell to the pending batch, and requests a
//!    flush. Repeated updates before the flush coalesce into one entry.
//!
//! 3. Destroying a cell removes every piece of graph bookkeeping keyed by its
//!    id. Destroy is idempotent.
//!
//! # Updating After Destroy
//!
//! Updating a destroyed cell is tolerated: the value is stored so that
//! surviving handles read it, but the cell never re-enters the pending batch.
//! [`Cell::try_update`] reports the situation as [`GraphError::Destroyed`].

use std::cell::{Cell as Flag, Ref, RefCell};
use std::fmt::{self, Debug};
use std::rc::Rc;

use super::{Runtime, Tag, TagId, WeakRuntime, WeakTag};
use crate::error::{GraphError, Result};
use crate::graph::NodeKind;

/// A reactive cell holding a value of type `T`.
///
/// Cloning a `Cell` creates another handle to the same cell.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::new();
/// let count = Cell::new(&runtime, 0);
///
/// count.update(5);
/// assert_eq!(count.read(), 5);
/// ```
pub struct Cell<T> {
    runtime: Runtime,
    inner: Rc<CellInner<T>>,
}

struct CellInner<T> {
    id: TagId,
    value: RefCell<T>,
    destroyed: Flag<bool>,
}

impl<T: 'static> Cell<T> {
    /// Create a new cell with the given initial value.
    pub fn new(runtime: &Runtime, value: T) -> Self {
        Self::create(runtime, value, None)
    }

    /// Create a new cell carrying a diagnostic label.
    pub fn labeled(runtime: &Runtime, value: T, label: impl Into<String>) -> Self {
        Self::create(runtime, value, Some(label.into()))
    }

    fn create(runtime: &Runtime, value: T, label: Option<String>) -> Self {
        let id = runtime.register_node(NodeKind::Cell, label);
        Self {
            runtime: runtime.clone(),
            inner: Rc::new(CellInner {
                id,
                value: RefCell::new(value),
                destroyed: Flag::new(false),
            }),
        }
    }

    /// Get the cell's unique id.
    pub fn id(&self) -> TagId {
        self.inner.id
    }

    pub fn label(&self) -> Option<String> {
        self.runtime.label(self.inner.id)
    }

    /// Borrow the value, recording a dependency if tracking is active.
    ///
    /// # Panics
    ///
    /// The value stays borrowed while `f` runs, so updating this cell from
    /// inside `f` panics. Use [`read`](Cell::read) to work on a copy instead.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.runtime.tracking().track(self.inner.id);
        f(&self.inner.value.borrow())
    }

    /// Borrow the value without recording a dependency.
    pub fn borrow_untracked(&self) -> Ref<'_, T> {
        self.inner.value.borrow()
    }

    /// Replace the value and schedule a flush.
    ///
    /// On a destroyed cell the value is stored but nothing is scheduled.
    pub fn update(&self, value: T) {
        if let Err(err) = self.try_update(value) {
            if self.runtime.config().warn_on_destroyed_update {
                tracing::warn!(error = %err, "update on destroyed cell ignored by scheduler");
            }
        }
    }

    /// Like [`update`](Cell::update), but reports a destroyed cell.
    pub fn try_update(&self, value: T) -> Result<()> {
        *self.inner.value.borrow_mut() = value;
        self.changed()
    }

    /// Modify the value in place and schedule a flush.
    pub fn update_with(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.inner.value.borrow_mut());
        if let Err(err) = self.changed() {
            if self.runtime.config().warn_on_destroyed_update {
                tracing::warn!(error = %err, "update on destroyed cell ignored by scheduler");
            }
        }
    }

    fn changed(&self) -> Result<()> {
        let id = self.inner.id;
        if self.inner.destroyed.get() || !self.runtime.mark_changed(id) {
            return Err(GraphError::Destroyed { id });
        }
        Ok(())
    }

    /// Remove the cell from the graph. Calls after the first are no-ops.
    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        self.runtime.destroy_tag(self.inner.id);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }
}

impl<T: Clone + 'static> Cell<T> {
    /// Get the current value, recording a dependency if tracking is active.
    pub fn read(&self) -> T {
        self.runtime.tracking().track(self.inner.id);
        self.inner.value.borrow().clone()
    }

    /// Get the current value without recording a dependency.
    pub fn read_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }
}

impl<T: Clone + 'static> Tag for Cell<T> {
    type Value = T;
    type Weak = WeakCell<T>;

    fn id(&self) -> TagId {
        self.inner.id
    }

    fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn read(&self) -> T {
        Cell::read(self)
    }

    fn downgrade(&self) -> WeakCell<T> {
        WeakCell {
            runtime: self.runtime.downgrade(),
            inner: Rc::clone(&self.inner),
        }
    }

    fn destroy(&self) {
        Cell::destroy(self)
    }
}

/// A [`Cell`] handle that keeps the value but not the runtime alive.
pub struct WeakCell<T> {
    runtime: WeakRuntime,
    inner: Rc<CellInner<T>>,
}

impl<T: Clone + 'static> WeakTag for WeakCell<T> {
    type Strong = Cell<T>;

    fn upgrade(&self) -> Option<Cell<T>> {
        let runtime = self.runtime.upgrade()?;
        Some(Cell {
            runtime,
            inner: Rc::clone(&self.inner),
        })
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Debug> Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.borrow())
            .field("destroyed", &self.inner.destroyed.get())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::TrackingFrame;

    #[test]
    fn cell_read_and_update() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 0);
        assert_eq!(cell.read(), 0);

        cell.update(42);
        assert_eq!(cell.read(), 42);
    }

    #[test]
    fn update_with_modifies_in_place() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, vec![1, 2]);
        cell.update_with(|items| items.push(3));
        assert_eq!(cell.read(), vec![1, 2, 3]);
        assert_eq!(runtime.pending_count(), 1);
    }

    #[test]
    fn read_records_dependency_in_active_frame() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);

        let (_, frame) = runtime.with_isolated_frame(Some(TrackingFrame::new()), || cell.read());
        assert!(frame.unwrap().contains(cell.id()));

        let (_, frame) =
            runtime.with_isolated_frame(Some(TrackingFrame::new()), || cell.read_untracked());
        assert!(frame.unwrap().is_empty());
    }

    #[test]
    fn updates_coalesce_into_one_pending_entry() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 0);

        for value in 1..=5 {
            cell.update(value);
        }

        assert_eq!(runtime.pending_count(), 1);
        assert_eq!(runtime.microtasks().unwrap().len(), 1);
    }

    #[test]
    fn update_with_equal_value_still_schedules() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 7);
        cell.update(7);
        assert_eq!(runtime.pending_count(), 1);
    }

    #[test]
    fn destroy_is_idempotent() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 0);
        cell.update(1);

        cell.destroy();
        cell.destroy();

        assert!(cell.is_destroyed());
        assert_eq!(runtime.stats().nodes, 0);
        assert_eq!(runtime.pending_count(), 0);
    }

    #[test]
    fn update_after_destroy_is_tolerated() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 0);
        cell.destroy();

        cell.update(3);
        assert_eq!(cell.read_untracked(), 3);
        assert_eq!(runtime.pending_count(), 0);

        let err = cell.try_update(4).unwrap_err();
        assert!(matches!(err, GraphError::Destroyed { id } if id == cell.id()));
    }

    #[test]
    #[should_panic(expected = "already borrowed")]
    fn update_inside_with_panics() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);
        cell.with(|value| cell.update(*value + 1));
    }

    #[test]
    fn weak_handle_does_not_keep_runtime() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 5);
        let weak = cell.downgrade();
        assert_eq!(weak.upgrade().map(|cell| cell.read()), Some(5));

        drop(cell);
        drop(runtime);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn clone_shares_state() {
        let runtime = Runtime::new();
        let first = Cell::new(&runtime, 0);
        let second = first.clone();

        first.update(42);
        assert_eq!(second.read(), 42);
        assert_eq!(first.id(), second.id());
    }
}
