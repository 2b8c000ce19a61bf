//! Revalidation Scheduler
//!
//! A flush walks the pending batch and decides which opcodes run, in which
//! order. The walk is shared by both flush strategies through
//! [`FlushCursor`], which yields one opcode at a time; the strategies only
//! differ in what they do with the opcode's [`Completion`].
//!
//! # Algorithm
//!
//! 1. Enter a transaction and take the pending batch.
//! 2. For each pending cell, in update order: run its opcodes, then drain
//!    its reverse-dependency entry into the shared list.
//! 3. Sort the shared list by ascending tag id (creation order).
//! 4. Run each shared tag's opcodes, skipping tags already run in this
//!    flush (per-flush epoch marker on the node).
//! 5. Release the batch storage and leave the transaction.
//!
//! Shared tags therefore always run after every direct cell, and a formula
//! reachable from several updated cells (a diamond) runs exactly once.
//!
//! # Mutation During a Flush
//!
//! The batch is taken when the flush starts, so cells updated by opcodes
//! during the flush land in a fresh batch and schedule the next flush
//! instead of being dropped.
//!
//! A tag's opcode list is copied when the flush reaches that tag. Opcodes
//! registered against it after that point do not run in this flush (their
//! registration already ran them once). Opcodes unregistered after that
//! point are skipped.
//!
//! Flushes do not nest. Calling [`Runtime::flush_sync`] from inside an
//! opcode returns immediately; the outer flush schedules another flush for
//! anything still pending when it finishes.

use std::rc::Rc;

#[cfg(feature = "deferred")]
use tracing::Instrument;

#[cfg(feature = "deferred")]
use crate::reactive::Completion;
use crate::reactive::{FlushStorage, Opcode, Runtime, TagId};

/// How a flush treats pending completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    /// Run opcodes back to back. Pending completions are handed to the host.
    Sync,

    /// Await each pending completion before the next opcode runs.
    #[cfg(feature = "deferred")]
    Deferred,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Running the opcodes of `batch[cell]`. Once they are exhausted the
    /// cell's dependents are drained and the walk moves on.
    Direct { cell: usize, loaded: bool },
    Shared { tag: usize },
    Done,
}

/// Iterator-like walk over the opcodes a flush must run.
pub(crate) struct FlushCursor {
    runtime: Runtime,
    prior_transaction: bool,
    storage: FlushStorage,
    /// Position in `storage.ops`, the current tag's snapshot.
    op: usize,
    phase: Phase,
    executed: usize,
}

impl FlushCursor {
    /// Start a flush, or return `None` if one is already running.
    pub fn begin(runtime: &Runtime) -> Option<Self> {
        let Some(storage) = runtime.take_batch() else {
            tracing::trace!("flush already running, nested flush skipped");
            return None;
        };

        let tracking = runtime.tracking();
        let prior_transaction = tracking.is_in_transaction();
        tracking.set_in_transaction(true);

        Some(Self {
            runtime: runtime.clone(),
            prior_transaction,
            storage,
            op: 0,
            phase: Phase::Direct {
                cell: 0,
                loaded: false,
            },
            executed: 0,
        })
    }

    pub fn batch_len(&self) -> usize {
        self.storage.batch.len()
    }

    pub fn executed(&self) -> usize {
        self.executed
    }

    /// The next opcode to run, or `None` when the flush is complete.
    pub fn next(&mut self) -> Option<Rc<Opcode>> {
        loop {
            if let Some(opcode) = self.next_in_snapshot() {
                self.executed += 1;
                return Some(opcode);
            }

            match self.phase {
                Phase::Direct { cell, loaded } => {
                    let Some(&id) = self.storage.batch.get_index(cell) else {
                        self.storage.shared.sort_unstable();
                        self.phase = Phase::Shared { tag: 0 };
                        continue;
                    };

                    if loaded {
                        self.runtime
                            .graph_mut()
                            .drain_dependents(id, &mut self.storage.shared);
                        self.phase = Phase::Direct {
                            cell: cell + 1,
                            loaded: false,
                        };
                    } else {
                        self.load(id);
                        self.phase = Phase::Direct { cell, loaded: true };
                    }
                }
                Phase::Shared { tag } => {
                    let Some(&id) = self.storage.shared.get(tag) else {
                        self.phase = Phase::Done;
                        return None;
                    };

                    self.phase = Phase::Shared { tag: tag + 1 };
                    if self.claim(id) {
                        self.load(id);
                    }
                }
                Phase::Done => return None,
            }
        }
    }

    /// Take the next still-registered opcode from the current snapshot.
    fn next_in_snapshot(&mut self) -> Option<Rc<Opcode>> {
        while let Some(opcode) = self.storage.ops.get(self.op) {
            self.op += 1;
            if opcode.is_active() {
                return Some(Rc::clone(opcode));
            }
        }
        None
    }

    fn load(&mut self, id: TagId) {
        self.storage.ops.clear();
        self.op = 0;
        self.runtime
            .graph()
            .copy_opcodes(id, &mut self.storage.ops);
    }

    /// Mark a shared tag as run in this flush. Returns `false` if it already
    /// ran or no longer exists.
    fn claim(&self, id: TagId) -> bool {
        self.runtime
            .graph_mut()
            .node_mut(id)
            .is_some_and(|node| node.mark_flushed(self.storage.epoch))
    }
}

impl Drop for FlushCursor {
    fn drop(&mut self) {
        self.runtime
            .tracking()
            .set_in_transaction(self.prior_transaction);
        let storage = FlushStorage {
            epoch: self.storage.epoch,
            batch: std::mem::take(&mut self.storage.batch),
            shared: std::mem::take(&mut self.storage.shared),
            ops: std::mem::take(&mut self.storage.ops),
        };
        self.runtime.return_batch(storage);
    }
}

impl Runtime {
    /// The strategy the next flush will use.
    ///
    /// Runtimes stay on the synchronous strategy until some opcode has
    /// signalled deferred completion.
    pub fn strategy(&self) -> FlushStrategy {
        #[cfg(feature = "deferred")]
        if self.has_deferred_opcodes() {
            return FlushStrategy::Deferred;
        }
        FlushStrategy::Sync
    }

    /// Flush the pending batch with the synchronous strategy.
    ///
    /// Pending completions returned by opcodes are not awaited; they are
    /// handed to the host. Does nothing when called while a flush is
    /// already running.
    pub fn flush_sync(&self) {
        let span = tracing::debug_span!("flush", strategy = "sync", pending = self.pending_count());
        let _entered = span.enter();

        let Some(mut cursor) = FlushCursor::begin(self) else {
            return;
        };
        while let Some(opcode) = cursor.next() {
            let completion = self.execute(&opcode);
            self.detach(completion);
        }
        tracing::debug!(
            cells = cursor.batch_len(),
            executed = cursor.executed(),
            "flush complete"
        );
    }

    /// Flush the pending batch, selecting the strategy once for this flush.
    #[cfg(feature = "deferred")]
    pub async fn flush(&self) {
        match self.strategy() {
            FlushStrategy::Sync => self.flush_sync(),
            FlushStrategy::Deferred => {
                let span = tracing::debug_span!(
                    "flush",
                    strategy = "deferred",
                    pending = self.pending_count()
                );
                self.flush_deferred().instrument(span).await;
            }
        }
    }

    #[cfg(feature = "deferred")]
    async fn flush_deferred(&self) {
        let Some(mut cursor) = FlushCursor::begin(self) else {
            return;
        };
        while let Some(opcode) = cursor.next() {
            if let Completion::Pending(work) = self.execute(&opcode) {
                work.await;
            }
        }
        tracing::debug!(
            cells = cursor.batch_len(),
            executed = cursor.executed(),
            "flush complete"
        );
    }
}
