//! Opcode VM
//!
//! An opcode is a side-effecting callback bound to exactly one tag. The
//! renderer produces them (update a text node, toggle an attribute); this
//! module only decides *when* they run.
//!
//! # Execution
//!
//! Every opcode runs through the same wrapper:
//!
//! 1. Enter a transaction (reentrant, the prior flag is restored on exit).
//! 2. Suspend dependency tracking, so reads made by the callback never leak
//!    into an enclosing formula's dependency set.
//! 3. Invoke the callback with the tag's current value.
//! 4. If the callback returned a pending [`Completion`], set its sticky
//!    may-defer marker.
//!
//! Steps 1 and 2 are undone by drop guards, so a panicking callback leaves
//! the runtime state exactly as it found it.
//!
//! # Lifetime
//!
//! Opcodes keep their tag's value alive but hold the runtime weakly, so a
//! runtime whose handles are all dropped is freed along with its opcodes.
//! Handles captured by the callback itself are strong and still keep the
//! runtime alive until the opcode is unregistered.
//!
//! When the last opcode registered against a tag is unregistered, the tag's
//! list storage goes back to the pool and the tag is destroyed. Removed
//! opcodes are deactivated, so a flush that already took a snapshot of the
//! list skips them.

use std::cell::{Cell as Flag, RefCell};
use std::fmt;
use std::rc::Rc;

#[cfg(feature = "deferred")]
use futures_util::future::{FutureExt, LocalBoxFuture};

use super::{Runtime, Tag, TagId, WeakTag};
use crate::graph::{Release, Removal};

/// What an opcode callback reports when it returns.
pub enum Completion {
    /// The side effect is complete.
    Ready,

    /// The side effect finishes later. The deferred-aware flush awaits it
    /// before moving on to the next opcode.
    #[cfg(feature = "deferred")]
    Pending(LocalBoxFuture<'static, ()>),
}

impl Completion {
    /// Wrap a future as a pending completion.
    #[cfg(feature = "deferred")]
    pub fn deferred(work: impl std::future::Future<Output = ()> + 'static) -> Self {
        Self::Pending(work.boxed_local())
    }

    pub fn is_pending(&self) -> bool {
        match self {
            Self::Ready => false,
            #[cfg(feature = "deferred")]
            Self::Pending(_) => true,
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("Ready"),
            #[cfg(feature = "deferred")]
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Conversion from callback return values into a [`Completion`].
pub trait IntoCompletion {
    fn into_completion(self) -> Completion;
}

impl IntoCompletion for () {
    fn into_completion(self) -> Completion {
        Completion::Ready
    }
}

impl IntoCompletion for Completion {
    fn into_completion(self) -> Completion {
        self
    }
}

/// A registered callback, bound to one tag.
pub struct Opcode {
    tag: TagId,
    run: Box<dyn Fn() -> Completion>,
    may_defer: Flag<bool>,
    active: Flag<bool>,
}

impl Opcode {
    pub(crate) fn new(tag: TagId, run: impl Fn() -> Completion + 'static) -> Self {
        Self {
            tag,
            run: Box::new(run),
            may_defer: Flag::new(false),
            active: Flag::new(true),
        }
    }

    #[cfg(test)]
    pub(crate) fn noop() -> Self {
        Self::new(TagId::from(0), || Completion::Ready)
    }

    /// The tag this opcode is bound to.
    pub fn tag(&self) -> TagId {
        self.tag
    }

    /// Whether this opcode has ever returned a pending completion.
    pub fn may_defer(&self) -> bool {
        self.may_defer.get()
    }

    /// Whether the opcode is still registered.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub(crate) fn deactivate(&self) {
        self.active.set(false);
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opcode")
            .field("tag", &self.tag)
            .field("may_defer", &self.may_defer())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Runtime {
    /// Run a registered opcode inside the execution wrapper.
    pub(crate) fn execute(&self, opcode: &Opcode) -> Completion {
        let completion = self.evaluate_with(|| (opcode.run)());
        if completion.is_pending() && !opcode.may_defer.replace(true) {
            tracing::debug!(tag = %opcode.tag, "opcode signalled deferred completion");
            self.note_deferred();
        }
        completion
    }

    fn evaluate_with(&self, run: impl FnOnce() -> Completion) -> Completion {
        let tracking = self.tracking();
        let _transaction = tracking.enter_transaction();
        let isolation = tracking.isolate(None);
        let completion = run();
        drop(isolation);
        completion
    }

    fn unregister_opcode(&self, tag: TagId, opcode: &Rc<Opcode>) {
        let removal = self.graph_mut().remove_opcode(tag, opcode);
        if let Removal::Emptied(release) = removal {
            tracing::trace!(%tag, "last opcode removed, releasing tag");
            release();
        }
    }
}

/// Run `callback` once with the tag's current value inside the execution
/// wrapper, without registering it.
pub fn evaluate_opcode<G, F, R>(tag: &G, callback: F) -> Completion
where
    G: Tag,
    F: FnOnce(G::Value) -> R,
    R: IntoCompletion,
{
    let runtime = tag.runtime();
    let completion = runtime.evaluate_with(|| callback(tag.read()).into_completion());
    if completion.is_pending() {
        runtime.note_deferred();
    }
    completion
}

/// Bind `callback` to `tag`.
///
/// The callback runs once immediately, so a new subscriber always observes
/// the current value, and again during every flush that reaches the tag.
pub fn register_opcode<G, F, R>(tag: &G, callback: F) -> Registration
where
    G: Tag + 'static,
    G::Weak: 'static,
    F: Fn(G::Value) -> R + 'static,
    R: IntoCompletion,
{
    let runtime = tag.runtime().clone();
    let id = tag.id();

    let source = tag.downgrade();
    let opcode = Rc::new(Opcode::new(id, move || match source.upgrade() {
        Some(tag) => callback(tag.read()).into_completion(),
        None => Completion::Ready,
    }));

    let completion = runtime.execute(&opcode);
    runtime.detach(completion);

    let owner = tag.downgrade();
    runtime
        .graph_mut()
        .push_opcode(id, opcode.clone(), move || -> Release {
            Rc::new(move || {
                if let Some(tag) = owner.upgrade() {
                    tag.destroy();
                }
            })
        });
    tracing::trace!(tag = %id, "opcode registered");

    Registration {
        runtime,
        tag: id,
        opcode: RefCell::new(Some(opcode)),
    }
}

/// Handle returned by [`register_opcode`].
///
/// Dropping the handle does not unregister; teardown is explicit.
pub struct Registration {
    runtime: Runtime,
    tag: TagId,
    opcode: RefCell<Option<Rc<Opcode>>>,
}

impl Registration {
    /// The tag the opcode is bound to.
    pub fn tag(&self) -> TagId {
        self.tag
    }

    pub fn is_registered(&self) -> bool {
        self.opcode.borrow().is_some()
    }

    /// Remove the opcode. Calls after the first are no-ops.
    ///
    /// If this was the tag's last opcode, the tag is destroyed.
    pub fn unregister(&self) {
        let Some(opcode) = self.opcode.borrow_mut().take() else {
            return;
        };
        self.runtime.unregister_opcode(self.tag, &opcode);
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("tag", &self.tag)
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Cell, Formula};
    use std::cell::Cell as Counter;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn registration_runs_immediately_with_current_value() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 3);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let log = seen.clone();
        let registration = register_opcode(&cell, move |value| log.borrow_mut().push(value));

        assert_eq!(*seen.borrow(), vec![3]);
        assert!(registration.is_registered());
        assert_eq!(runtime.opcode_count(cell.id()), 1);
    }

    #[test]
    fn callback_runs_in_transaction_without_tracking() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 0);

        let observer = runtime.clone();
        let _registration = register_opcode(&cell, move |_| {
            assert!(observer.is_in_transaction());
            assert!(observer.current_frame().is_none());
        });

        assert!(!runtime.is_in_transaction());
    }

    #[test]
    fn opcode_reads_do_not_leak_into_outer_frame() {
        let runtime = Runtime::new();
        let inner = Cell::new(&runtime, 1);
        let outer = Cell::new(&runtime, 2);

        let formula = Formula::new(&runtime, {
            let inner = inner.clone();
            let outer = outer.clone();
            move || {
                evaluate_opcode(&inner, |_| ());
                outer.read()
            }
        });

        assert_eq!(formula.read(), 2);
        assert_eq!(formula.related_cells(), vec![outer.id()]);
    }

    #[test]
    fn state_is_restored_when_callback_panics() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);

        let result = catch_unwind(AssertUnwindSafe(|| {
            evaluate_opcode(&cell, |_| -> () { panic!("render failed") })
        }));

        assert!(result.is_err());
        assert!(!runtime.is_in_transaction());
        assert!(runtime.current_frame().is_none());
    }

    #[test]
    fn nested_evaluation_keeps_outer_transaction() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);

        evaluate_opcode(&cell, |_| {
            evaluate_opcode(&cell, |_| ());
            assert!(runtime.is_in_transaction());
        });
        assert!(!runtime.is_in_transaction());
    }

    #[test]
    fn unregister_is_idempotent_and_destroys_tag() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);
        let calls = Rc::new(Counter::new(0));

        let counter = calls.clone();
        let registration = register_opcode(&cell, move |_| counter.set(counter.get() + 1));

        registration.unregister();
        registration.unregister();
        registration.unregister();

        assert!(!registration.is_registered());
        assert!(cell.is_destroyed());
        assert_eq!(runtime.opcode_count(cell.id()), 0);
        assert_eq!(runtime.stats().nodes, 0);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn tag_survives_while_other_opcodes_remain() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);

        let first = register_opcode(&cell, |_| ());
        let second = register_opcode(&cell, |_| ());

        first.unregister();
        assert!(!cell.is_destroyed());
        assert_eq!(runtime.opcode_count(cell.id()), 1);

        second.unregister();
        assert!(cell.is_destroyed());
    }

    #[cfg(feature = "deferred")]
    #[test]
    fn pending_completion_sets_sticky_marker() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 0);

        let _registration = register_opcode(&cell, |value| {
            if value == 0 {
                Completion::deferred(async {})
            } else {
                Completion::Ready
            }
        });

        assert!(runtime.has_deferred_opcodes());
    }

    #[cfg(feature = "deferred")]
    #[test]
    fn one_off_pending_evaluation_switches_strategy() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 0);
        assert!(!runtime.has_deferred_opcodes());

        let completion = evaluate_opcode(&cell, |_| Completion::deferred(async {}));

        assert!(completion.is_pending());
        assert!(runtime.has_deferred_opcodes());
    }

    #[test]
    fn unregistered_opcode_is_deactivated() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 0);
        let registration = register_opcode(&cell, |_| ());
        let opcode = registration.opcode.borrow().clone().unwrap();

        assert!(opcode.is_active());
        registration.unregister();
        assert!(!opcode.is_active());
    }
}
