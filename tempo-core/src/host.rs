//! Flush Hosts
//!
//! A runtime never runs a flush on its own. When the first mutation of a
//! tick requests one, the runtime hands a [`ScheduledFlush`] to its host,
//! and the host runs it in whatever "soon, but not now" phase the
//! environment offers.
//!
//! Two hosts ship with the crate:
//!
//! - [`MicrotaskQueue`], the default. Nothing runs until the owner drains
//!   the queue, which makes flush timing explicit in tests and drivers.
//! - [`TokioHost`], which spawns each flush on the current
//!   [`LocalSet`](tokio::task::LocalSet).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

#[cfg(feature = "deferred")]
use futures_util::future::LocalBoxFuture;

use crate::reactive::WeakRuntime;

/// Environment hook that decides when scheduled work runs.
pub trait Host {
    /// Arrange for `flush` to run after the current task.
    fn schedule_flush(&self, flush: ScheduledFlush);

    /// Drive deferred work that no flush is awaiting, such as a pending
    /// completion returned at registration time.
    #[cfg(feature = "deferred")]
    fn spawn_deferred(&self, work: LocalBoxFuture<'static, ()>);
}

/// A flush handed to a [`Host`].
///
/// Holds the runtime weakly: running it after the runtime was dropped does
/// nothing.
pub struct ScheduledFlush {
    runtime: WeakRuntime,
}

impl ScheduledFlush {
    pub(crate) fn new(runtime: WeakRuntime) -> Self {
        Self { runtime }
    }

    /// Run the flush with the synchronous strategy.
    ///
    /// Returns `false` if the runtime no longer exists.
    pub fn run_sync(self) -> bool {
        match self.runtime.upgrade() {
            Some(runtime) => {
                runtime.flush_sync();
                true
            }
            None => false,
        }
    }

    /// Run the flush, letting the runtime pick its strategy.
    #[cfg(feature = "deferred")]
    pub async fn run(self) -> bool {
        match self.runtime.upgrade() {
            Some(runtime) => {
                runtime.flush().await;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ScheduledFlush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledFlush")
            .field("live", &self.runtime.upgrade().is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Microtask queue
// ----------------------------------------------------------------------------

/// FIFO host drained explicitly by its owner.
///
/// Cloning shares the same queue.
#[derive(Clone, Default)]
pub struct MicrotaskQueue {
    state: Rc<RefCell<QueueState>>,
}

#[derive(Default)]
struct QueueState {
    flushes: VecDeque<ScheduledFlush>,
    #[cfg(feature = "deferred")]
    deferred: VecDeque<LocalBoxFuture<'static, ()>>,
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks, flushes and deferred work together.
    pub fn len(&self) -> usize {
        let state = self.state.borrow();
        let queued = state.flushes.len();
        #[cfg(feature = "deferred")]
        let queued = queued + state.deferred.len();
        queued
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run queued flushes with the synchronous strategy until none remain,
    /// including flushes scheduled by the ones being run.
    ///
    /// Deferred work stays queued; it needs [`run`](MicrotaskQueue::run).
    pub fn run_sync(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.state.borrow_mut().flushes.pop_front();
            let Some(flush) = next else {
                break;
            };
            flush.run_sync();
            ran += 1;
        }
        ran
    }

    /// Run queued flushes and await deferred work until the queue is empty.
    ///
    /// Flushes are preferred over deferred work, so a mutation made by
    /// deferred work is flushed before the next piece of deferred work runs.
    #[cfg(feature = "deferred")]
    pub async fn run(&self) -> usize {
        let mut ran = 0;
        loop {
            let flush = self.state.borrow_mut().flushes.pop_front();
            if let Some(flush) = flush {
                flush.run().await;
                ran += 1;
                continue;
            }

            let work = self.state.borrow_mut().deferred.pop_front();
            match work {
                Some(work) => {
                    work.await;
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }
}

impl Host for MicrotaskQueue {
    fn schedule_flush(&self, flush: ScheduledFlush) {
        self.state.borrow_mut().flushes.push_back(flush);
    }

    #[cfg(feature = "deferred")]
    fn spawn_deferred(&self, work: LocalBoxFuture<'static, ()>) {
        self.state.borrow_mut().deferred.push_back(work);
    }
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("len", &self.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tokio
// ----------------------------------------------------------------------------

/// Host that spawns flushes as local tokio tasks.
///
/// Must be used from inside a [`LocalSet`](tokio::task::LocalSet);
/// `spawn_local` panics anywhere else.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioHost;

impl Host for TokioHost {
    fn schedule_flush(&self, flush: ScheduledFlush) {
        tracing::trace!("spawning flush task");
        drop(tokio::task::spawn_local(async move {
            #[cfg(feature = "deferred")]
            flush.run().await;
            #[cfg(not(feature = "deferred"))]
            flush.run_sync();
        }));
    }

    #[cfg(feature = "deferred")]
    fn spawn_deferred(&self, work: LocalBoxFuture<'static, ()>) {
        drop(tokio::task::spawn_local(work));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{register_opcode, Runtime};
    use std::cell::Cell as Counter;

    #[test]
    fn queue_runs_scheduled_flush() {
        let runtime = Runtime::new();
        let queue = runtime.microtasks().unwrap();
        let cell = runtime.cell(0);
        let calls = Rc::new(Counter::new(0));

        let counter = calls.clone();
        let _registration = register_opcode(&cell, move |_| counter.set(counter.get() + 1));

        cell.update(1);
        cell.update(2);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.run_sync(), 1);
        assert!(queue.is_empty());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn flush_for_dropped_runtime_is_a_no_op() {
        let queue = {
            let runtime = Runtime::new();
            let queue = runtime.microtasks().unwrap();
            runtime.request_flush();
            queue
        };

        let flush = queue.state.borrow_mut().flushes.pop_front().unwrap();
        assert!(!flush.run_sync());
    }

    #[test]
    fn mutation_during_flush_schedules_another() {
        let runtime = Runtime::new();
        let queue = runtime.microtasks().unwrap();
        let source = runtime.cell(0);
        let echo = runtime.cell(0);
        let echoed = Rc::new(Counter::new(0));

        let _forward = register_opcode(&source, {
            let echo = echo.clone();
            move |value| {
                if value > 0 {
                    echo.update(value);
                }
            }
        });
        let _record = register_opcode(&echo, {
            let echoed = echoed.clone();
            move |value| echoed.set(value)
        });

        source.update(4);
        assert_eq!(queue.run_sync(), 2);
        assert_eq!(echoed.get(), 4);
        assert_eq!(runtime.pending_count(), 0);
    }

    #[cfg(feature = "deferred")]
    #[tokio::test]
    async fn queue_awaits_deferred_work() {
        let runtime = Runtime::new();
        let queue = runtime.microtasks().unwrap();
        let done = Rc::new(Counter::new(false));

        let flag = done.clone();
        runtime.detach(crate::reactive::Completion::deferred(async move {
            tokio::task::yield_now().await;
            flag.set(true);
        }));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.run().await, 1);
        assert!(done.get());
    }
}
