//! Reactive Runtime
//!
//! The runtime is the scheduling context that connects cells, formulas, and
//! opcodes. It owns everything that would otherwise be process-wide state:
//!
//! - the id counter and revision clock,
//! - the tracking frame and transaction flag,
//! - the graph arena with its reverse-dependency and opcode indexes,
//! - the pending batch and the flush/manual-control flags,
//! - the host that decides when a scheduled flush actually runs.
//!
//! # How It Works
//!
//! 1. `Cell::update` bumps the revision clock, adds the cell to the pending
//!    batch, and requests a flush.
//!
//! 2. The first request in a tick hands a [`ScheduledFlush`] to the host;
//!    later requests coalesce into it.
//!
//! 3. The flush runs the opcodes of every pending cell, then the opcodes of
//!    every formula reachable through the reverse index, each exactly once,
//!    in creation order.
//!
//! # Threading
//!
//! A runtime is single-threaded (`Rc`-based, `!Send`). Independent graphs,
//! e.g. in tests, simply use separate runtimes.

use std::cell::{Cell as Flag, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexSet;

use super::context::{TrackingFrame, TrackingState};
use super::opcode::{Completion, Opcode};
use super::{Cell, Formula, TagId};
use crate::config::RuntimeConfig;
use crate::error::GraphError;
use crate::graph::{Graph, GraphStats, Node, NodeKind};
use crate::host::{Host, MicrotaskQueue, ScheduledFlush};

/// Handle to a reactive runtime. Cloning shares the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    next_id: Flag<u64>,
    revision: Flag<u64>,
    epoch: Flag<u64>,
    tracking: TrackingState,
    graph: RefCell<Graph>,

    /// Cells updated since the last flush, in update order.
    pending: RefCell<IndexSet<TagId>>,
    /// Storage swapped in for `pending` while a flush walks the batch.
    spare_batch: RefCell<IndexSet<TagId>>,
    /// Storage for the per-flush shared tag list.
    spare_shared: RefCell<Vec<TagId>>,
    /// Storage for the snapshot of the opcode list being run.
    spare_ops: RefCell<Vec<Rc<Opcode>>>,

    flush_scheduled: Flag<bool>,
    flushing: Flag<bool>,
    manual_control: Flag<usize>,
    no_scheduling: Flag<usize>,
    deferred_seen: Flag<bool>,
    host: HostSlot,
}

enum HostSlot {
    Queue(MicrotaskQueue),
    Custom(Rc<dyn Host>),
}

impl HostSlot {
    fn host(&self) -> &dyn Host {
        match self {
            Self::Queue(queue) => queue,
            Self::Custom(host) => host.as_ref(),
        }
    }
}

/// Weak handle used by scheduled flushes, so a queued flush does not keep
/// a dropped runtime alive.
#[derive(Clone)]
pub(crate) struct WeakRuntime(Weak<RuntimeInner>);

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|inner| Runtime { inner })
    }
}

impl Runtime {
    /// Create a runtime with the default configuration, flushing through its
    /// own [`MicrotaskQueue`].
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::build(config, HostSlot::Queue(MicrotaskQueue::new()))
    }

    /// Create a runtime whose flushes are scheduled by `host`.
    pub fn with_host(config: RuntimeConfig, host: Rc<dyn Host>) -> Self {
        Self::build(config, HostSlot::Custom(host))
    }

    fn build(config: RuntimeConfig, host: HostSlot) -> Self {
        let pool = config.pool;
        Self {
            inner: Rc::new(RuntimeInner {
                tracking: TrackingState::new(pool),
                graph: RefCell::new(Graph::new(pool)),
                config,
                next_id: Flag::new(1),
                revision: Flag::new(0),
                epoch: Flag::new(0),
                pending: RefCell::new(IndexSet::new()),
                spare_batch: RefCell::new(IndexSet::new()),
                spare_shared: RefCell::new(Vec::new()),
                spare_ops: RefCell::new(Vec::new()),
                flush_scheduled: Flag::new(false),
                flushing: Flag::new(false),
                manual_control: Flag::new(0),
                no_scheduling: Flag::new(0),
                deferred_seen: Flag::new(false),
                host,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The built-in microtask queue, unless a custom host was supplied.
    pub fn microtasks(&self) -> Option<MicrotaskQueue> {
        match &self.inner.host {
            HostSlot::Queue(queue) => Some(queue.clone()),
            HostSlot::Custom(_) => None,
        }
    }

    /// Create a cell owned by this runtime.
    pub fn cell<T: 'static>(&self, value: T) -> Cell<T> {
        Cell::new(self, value)
    }

    /// Create a formula owned by this runtime.
    pub fn formula<T: Clone + 'static>(&self, compute: impl Fn() -> T + 'static) -> Formula<T> {
        Formula::new(self, compute)
    }

    // ------------------------------------------------------------------
    // Tracking frame and transaction state
    // ------------------------------------------------------------------

    /// Snapshot of the active tracking frame.
    pub fn current_frame(&self) -> Option<TrackingFrame> {
        self.inner.tracking.current_frame()
    }

    /// Replace the active tracking frame, returning the previous one.
    pub fn set_current_frame(&self, frame: Option<TrackingFrame>) -> Option<TrackingFrame> {
        self.inner.tracking.set_current_frame(frame)
    }

    /// Run `f` with `frame` as the active collector (`None` disables
    /// tracking), restoring the previous frame on every exit path.
    pub fn with_isolated_frame<R>(
        &self,
        frame: Option<TrackingFrame>,
        f: impl FnOnce() -> R,
    ) -> (R, Option<TrackingFrame>) {
        self.inner.tracking.with_isolated_frame(frame, f)
    }

    pub fn is_in_transaction(&self) -> bool {
        self.inner.tracking.is_in_transaction()
    }

    pub fn set_in_transaction(&self, value: bool) {
        self.inner.tracking.set_in_transaction(value);
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Ask the host to run a flush. Idempotent until the flush starts.
    ///
    /// A no-op while manual control is held. Inside a no-scheduling window
    /// this is a programmer error: it panics in debug builds and is logged
    /// and ignored in release builds.
    pub fn request_flush(&self) {
        let inner = &self.inner;
        if inner.manual_control.get() > 0 {
            tracing::trace!("flush request suppressed by manual control");
            return;
        }
        if inner.no_scheduling.get() > 0 {
            debug_assert!(false, "{}", GraphError::SchedulingForbidden);
            tracing::error!(error = %GraphError::SchedulingForbidden, "ignoring flush request");
            return;
        }
        if inner.flush_scheduled.replace(true) {
            return;
        }

        tracing::trace!("flush scheduled");
        inner.host.host().schedule_flush(ScheduledFlush::new(self.downgrade()));
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.inner.flush_scheduled.get()
    }

    /// Suppress flush scheduling until the returned guard is dropped.
    ///
    /// Used by drivers that want to choose flush timing themselves, and by
    /// teardown passes that must not let a destructor-triggered mutation
    /// schedule a flush. Mutations still enter the pending batch.
    pub fn take_manual_control(&self) -> ManualControl {
        let held = &self.inner.manual_control;
        held.set(held.get() + 1);
        ManualControl {
            runtime: self.clone(),
        }
    }

    pub fn has_manual_control(&self) -> bool {
        self.inner.manual_control.get() > 0
    }

    /// Open a window in which requesting a flush is a programmer error.
    pub fn no_scheduling(&self) -> NoSchedulingWindow {
        let open = &self.inner.no_scheduling;
        open.set(open.get() + 1);
        NoSchedulingWindow {
            runtime: self.clone(),
        }
    }

    /// Number of cells waiting for the next flush.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Whether any opcode has ever signalled deferred completion.
    pub fn has_deferred_opcodes(&self) -> bool {
        self.inner.deferred_seen.get()
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Number of opcodes registered against `tag`.
    pub fn opcode_count(&self, tag: TagId) -> usize {
        self.graph().opcode_count(tag)
    }

    /// Formulas currently registered as dependents of `cell`.
    pub fn dependents(&self, cell: TagId) -> Vec<TagId> {
        self.graph().dependents(cell)
    }

    /// Diagnostic label of a live tag.
    pub fn label(&self, tag: TagId) -> Option<String> {
        self.graph()
            .node(tag)
            .and_then(|node| node.label().map(str::to_owned))
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            pending: self.pending_count(),
            pooled_frames: self.inner.tracking.pooled_frames(),
            ..self.graph().stats()
        }
    }

    // ------------------------------------------------------------------
    // Crate internals
    // ------------------------------------------------------------------

    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Rc::downgrade(&self.inner))
    }

    pub(crate) fn tracking(&self) -> &TrackingState {
        &self.inner.tracking
    }

    pub(crate) fn graph(&self) -> Ref<'_, Graph> {
        self.inner.graph.borrow()
    }

    pub(crate) fn graph_mut(&self) -> RefMut<'_, Graph> {
        self.inner.graph.borrow_mut()
    }

    /// Current value of the revision clock.
    pub(crate) fn revision(&self) -> u64 {
        self.inner.revision.get()
    }

    /// Allocate an id and its arena node.
    pub(crate) fn register_node(&self, kind: NodeKind, label: Option<String>) -> TagId {
        let raw = self.inner.next_id.get();
        self.inner.next_id.set(raw + 1);
        let id = TagId::from(raw);
        self.graph_mut().insert_node(id, Node::new(kind, label));
        tracing::trace!(%id, ?kind, "node created");
        id
    }

    /// Record a direct mutation of `cell` and schedule a flush.
    ///
    /// Returns `false` if the cell no longer exists.
    pub(crate) fn mark_changed(&self, cell: TagId) -> bool {
        let revision = self.inner.revision.get() + 1;
        if !self.graph_mut().touch(cell, revision) {
            return false;
        }
        self.inner.revision.set(revision);
        self.inner.pending.borrow_mut().insert(cell);
        self.request_flush();
        true
    }

    /// Remove everything keyed by `tag`.
    pub(crate) fn destroy_tag(&self, tag: TagId) {
        self.inner.pending.borrow_mut().shift_remove(&tag);
        if self.graph_mut().remove_tag(tag) {
            tracing::trace!(%tag, "node destroyed");
        }
    }

    pub(crate) fn note_deferred(&self) {
        self.inner.deferred_seen.set(true);
    }

    /// Hand a completion that nobody awaits to the host.
    pub(crate) fn detach(&self, completion: Completion) {
        match completion {
            Completion::Ready => {}
            #[cfg(feature = "deferred")]
            Completion::Pending(work) => self.inner.host.host().spawn_deferred(work),
        }
    }

    /// Begin a flush: advance the epoch and take the pending batch.
    ///
    /// Returns `None` while another flush is running. The running flush
    /// picks up whatever is pending when it finishes.
    pub(crate) fn take_batch(&self) -> Option<FlushStorage> {
        let inner = &self.inner;
        inner.flush_scheduled.set(false);
        if inner.flushing.replace(true) {
            return None;
        }

        let epoch = inner.epoch.get() + 1;
        inner.epoch.set(epoch);
        let spare = inner.spare_batch.take();
        Some(FlushStorage {
            epoch,
            batch: inner.pending.replace(spare),
            shared: inner.spare_shared.take(),
            ops: inner.spare_ops.take(),
        })
    }

    /// Return flush storage for reuse and end the flush.
    pub(crate) fn return_batch(&self, mut storage: FlushStorage) {
        let inner = &self.inner;
        storage.batch.clear();
        storage.shared.clear();
        storage.ops.clear();
        inner.spare_batch.replace(storage.batch);
        inner.spare_shared.replace(storage.shared);
        inner.spare_ops.replace(storage.ops);
        inner.flushing.set(false);

        let leftover = !inner.pending.borrow().is_empty();
        if leftover
            && !inner.flush_scheduled.get()
            && inner.no_scheduling.get() == 0
            && !std::thread::panicking()
        {
            self.request_flush();
        }
    }

    /// Whether a flush is currently walking its batch.
    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.get()
    }
}

/// Storage a flush borrows from the runtime while it runs.
pub(crate) struct FlushStorage {
    pub epoch: u64,
    pub batch: IndexSet<TagId>,
    pub shared: Vec<TagId>,
    pub ops: Vec<Rc<Opcode>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("stats", &self.stats())
            .field("flush_scheduled", &self.is_flush_scheduled())
            .field("in_transaction", &self.is_in_transaction())
            .finish()
    }
}

/// Guard returned by [`Runtime::take_manual_control`]. Dropping releases it.
#[must_use = "manual control is released as soon as the guard is dropped"]
pub struct ManualControl {
    runtime: Runtime,
}

impl ManualControl {
    /// Release manual control.
    pub fn release(self) {}
}

impl Drop for ManualControl {
    fn drop(&mut self) {
        let held = &self.runtime.inner.manual_control;
        held.set(held.get().saturating_sub(1));
    }
}

impl fmt::Debug for ManualControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualControl").finish_non_exhaustive()
    }
}

/// Guard returned by [`Runtime::no_scheduling`]. Dropping closes the window.
#[must_use = "the window closes as soon as the guard is dropped"]
pub struct NoSchedulingWindow {
    runtime: Runtime,
}

impl Drop for NoSchedulingWindow {
    fn drop(&mut self) {
        let open = &self.runtime.inner.no_scheduling;
        open.set(open.get().saturating_sub(1));
    }
}

impl fmt::Debug for NoSchedulingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoSchedulingWindow").finish_non_exhaustive()
    }
}
