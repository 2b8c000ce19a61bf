//! Tracking Frame and Transaction State
//!
//! The tracking frame is the "current dependency collector": while a formula
//! evaluates, every cell it reads inserts its id into the active frame. At
//! most one frame is active at a time.
//!
//! # Isolation
//!
//! Every nested evaluation installs a brand-new frame and puts the previous
//! one back when it finishes. Restoration happens in a drop guard, so it
//! also runs when the computation panics. This is what keeps an inner
//! formula's reads out of the outer formula's dependency set.
//!
//! # Transactions
//!
//! The transaction flag is separate from frame isolation. It marks "inside a
//! revalidation pass" and is reentrant: nested entries never switch it off
//! early, each guard restores exactly the value it found.

use std::cell::{Cell as Flag, RefCell};

use indexmap::IndexSet;

use super::TagId;
use crate::config::PoolConfig;
use crate::graph::{Pool, Recycle};

/// A set of cell ids collected during one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingFrame {
    cells: IndexSet<TagId>,
}

impl TrackingFrame {
    /// Create an empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cell id. Returns `false` if it was already present.
    pub fn insert(&mut self, id: TagId) -> bool {
        self.cells.insert(id)
    }

    pub fn contains(&self, id: TagId) -> bool {
        self.cells.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Iterate ids in the order they were first read.
    pub fn iter(&self) -> impl Iterator<Item = TagId> + '_ {
        self.cells.iter().copied()
    }
}

impl Recycle for TrackingFrame {
    fn recycle(&mut self) {
        self.cells.clear();
    }
}

/// Per-runtime tracking state: the active frame and the transaction flag.
#[derive(Debug)]
pub(crate) struct TrackingState {
    frame: RefCell<Option<TrackingFrame>>,
    in_transaction: Flag<bool>,
    spare: RefCell<Pool<TrackingFrame>>,
}

impl TrackingState {
    pub fn new(pool: PoolConfig) -> Self {
        Self {
            frame: RefCell::new(None),
            in_transaction: Flag::new(false),
            spare: RefCell::new(Pool::new(pool)),
        }
    }

    /// Snapshot of the active frame.
    pub fn current_frame(&self) -> Option<TrackingFrame> {
        self.frame.borrow().clone()
    }

    /// Replace the active frame, returning the previous one.
    pub fn set_current_frame(&self, frame: Option<TrackingFrame>) -> Option<TrackingFrame> {
        self.frame.replace(frame)
    }

    pub fn is_tracking(&self) -> bool {
        self.frame.borrow().is_some()
    }

    /// Record a read in the active frame, if any.
    pub fn track(&self, id: TagId) {
        if let Some(frame) = self.frame.borrow_mut().as_mut() {
            frame.insert(id);
        }
    }

    /// Record several reads in the active frame, if any.
    pub fn track_all(&self, ids: impl IntoIterator<Item = TagId>) {
        if let Some(frame) = self.frame.borrow_mut().as_mut() {
            for id in ids {
                frame.insert(id);
            }
        }
    }

    /// Install `frame` as the active collector until the guard is finished
    /// or dropped.
    pub fn isolate(&self, frame: Option<TrackingFrame>) -> Isolation<'_> {
        let saved = self.frame.replace(frame);
        Isolation {
            state: self,
            saved: Some(saved),
        }
    }

    /// Run `f` with `frame` installed, returning its result and whatever the
    /// frame collected. The previous frame is restored on every exit path.
    pub fn with_isolated_frame<R>(
        &self,
        frame: Option<TrackingFrame>,
        f: impl FnOnce() -> R,
    ) -> (R, Option<TrackingFrame>) {
        let isolation = self.isolate(frame);
        let result = f();
        (result, isolation.finish())
    }

    /// An empty frame, reusing pooled storage.
    pub fn fresh_frame(&self) -> TrackingFrame {
        self.spare.borrow_mut().acquire()
    }

    pub fn recycle_frame(&self, frame: TrackingFrame) {
        self.spare.borrow_mut().release(frame);
    }

    pub fn pooled_frames(&self) -> usize {
        self.spare.borrow().available()
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction.get()
    }

    pub fn set_in_transaction(&self, value: bool) {
        self.in_transaction.set(value);
    }

    /// Enter a transaction. The guard restores the prior flag on drop.
    pub fn enter_transaction(&self) -> TransactionGuard<'_> {
        let prior = self.in_transaction.replace(true);
        TransactionGuard { state: self, prior }
    }
}

/// Restores the previously active frame when dropped.
///
/// This ensures frames are properly nested even if the computation panics.
pub(crate) struct Isolation<'a> {
    state: &'a TrackingState,
    saved: Option<Option<TrackingFrame>>,
}

impl Isolation<'_> {
    /// Restore the previous frame and hand back the isolated one.
    pub fn finish(mut self) -> Option<TrackingFrame> {
        let saved = self.saved.take().flatten();
        self.state.frame.replace(saved)
    }
}

impl Drop for Isolation<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.state.frame.replace(saved);
        }
    }
}

/// Restores the prior transaction flag when dropped.
pub(crate) struct TransactionGuard<'a> {
    state: &'a TrackingState,
    prior: bool,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.state.in_transaction.set(self.prior);
    }
}
