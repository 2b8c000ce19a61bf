//! Formula Implementation
//!
//! A formula memoizes a computation over cells. It is lazy: nothing runs at
//! construction, and a read only recomputes when the cached value is stale.
//!
//! # Staleness
//!
//! Every evaluation records the revision clock *before* `compute` runs. The
//! cache is stale when any related cell changed after that revision. Cells
//! updated while `compute` is running therefore invalidate the result they
//! raced with.
//!
//! # Dependencies
//!
//! `compute` runs inside a fresh tracking frame. The cells it collects
//! become the formula's related cells, and the formula registers itself in
//! each cell's reverse-dependency entry. A flush drains those entries, so
//! every read binds the formula again.
//!
//! Reading a formula inside another evaluation forwards the formula's
//! related cells to the outer frame. The formula's own id is never tracked:
//! only cells appear in a dependency set.
//!
//! # Constants
//!
//! The first evaluation that happens inside a transaction decides `is_const`:
//! a formula that read no cells there is constant forever. Constant formulas
//! are never bound in the reverse index, so the scheduler cannot reach them.

use std::cell::{Cell as Flag, RefCell};
use std::fmt::{self, Debug};
use std::rc::Rc;

use smallvec::SmallVec;

use super::{Runtime, Tag, TagId, WeakRuntime, WeakTag};
use crate::graph::NodeKind;

/// Observable lifecycle state of a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulaState {
    /// Never evaluated.
    Unevaluated,
    /// The cached value is current.
    Clean,
    /// A related cell changed since the cached value was produced.
    Stale,
    /// Decided constant; the cached value is final.
    Constant,
    Destroyed,
}

/// A memoized computation with automatically discovered dependencies.
///
/// Cloning a `Formula` creates another handle to the same formula.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::new();
/// let count = Cell::new(&runtime, 2);
/// let doubled = Formula::new(&runtime, {
///     let count = count.clone();
///     move || count.read() * 2
/// });
///
/// assert_eq!(doubled.read(), 4);
/// ```
pub struct Formula<T> {
    runtime: Runtime,
    inner: Rc<FormulaInner<T>>,
}

struct FormulaInner<T> {
    id: TagId,
    compute: Box<dyn Fn() -> T>,
    cache: RefCell<Option<Cached<T>>>,
    related: RefCell<SmallVec<[TagId; 4]>>,
    is_const: Flag<bool>,
    const_decided: Flag<bool>,
    destroyed: Flag<bool>,
}

struct Cached<T> {
    value: T,
    verified_at: u64,
}

impl<T: Clone + 'static> Formula<T> {
    /// Create a formula. `compute` is not run until the first read.
    pub fn new(runtime: &Runtime, compute: impl Fn() -> T + 'static) -> Self {
        Self::create(runtime, Box::new(compute), None)
    }

    /// Create a formula carrying a diagnostic label.
    pub fn labeled(
        runtime: &Runtime,
        compute: impl Fn() -> T + 'static,
        label: impl Into<String>,
    ) -> Self {
        Self::create(runtime, Box::new(compute), Some(label.into()))
    }

    fn create(runtime: &Runtime, compute: Box<dyn Fn() -> T>, label: Option<String>) -> Self {
        let id = runtime.register_node(NodeKind::Formula, label);
        Self {
            runtime: runtime.clone(),
            inner: Rc::new(FormulaInner {
                id,
                compute,
                cache: RefCell::new(None),
                related: RefCell::new(SmallVec::new()),
                is_const: Flag::new(false),
                const_decided: Flag::new(false),
                destroyed: Flag::new(false),
            }),
        }
    }

    pub fn id(&self) -> TagId {
        self.inner.id
    }

    pub fn label(&self) -> Option<String> {
        self.runtime.label(self.inner.id)
    }

    /// Get the value, recomputing only if the cache is missing or stale.
    ///
    /// A destroyed formula computes without tracking and caches nothing.
    pub fn read(&self) -> T {
        let inner = &self.inner;
        if inner.destroyed.get() {
            let (value, _) = self
                .runtime
                .with_isolated_frame(None, || (inner.compute)());
            return value;
        }

        if let Some(value) = self.cached_if_fresh() {
            self.forward_dependencies();
            return value;
        }

        let value = self.evaluate();
        self.forward_dependencies();
        value
    }

    /// The cell ids read during the most recent evaluation.
    pub fn related_cells(&self) -> Vec<TagId> {
        self.inner.related.borrow().to_vec()
    }

    /// Whether the formula was decided constant.
    pub fn is_const(&self) -> bool {
        self.inner.is_const.get()
    }

    pub fn state(&self) -> FormulaState {
        let inner = &self.inner;
        if inner.destroyed.get() {
            return FormulaState::Destroyed;
        }
        if inner.is_const.get() {
            return FormulaState::Constant;
        }
        let cache = inner.cache.borrow();
        let Some(cached) = cache.as_ref() else {
            return FormulaState::Unevaluated;
        };
        if self
            .runtime
            .graph()
            .changed_since(&inner.related.borrow(), cached.verified_at)
        {
            FormulaState::Stale
        } else {
            FormulaState::Clean
        }
    }

    /// Unregister from every reverse-dependency entry and mark dead.
    /// Calls after the first are no-ops.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.replace(true) {
            return;
        }
        self.runtime
            .graph_mut()
            .unbind_all(&inner.related.borrow(), inner.id);
        self.runtime.destroy_tag(inner.id);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    fn cached_if_fresh(&self) -> Option<T> {
        let inner = &self.inner;
        let cache = inner.cache.borrow();
        let cached = cache.as_ref()?;
        if inner.is_const.get() {
            return Some(cached.value.clone());
        }
        let related = inner.related.borrow();
        let mut graph = self.runtime.graph_mut();
        if graph.changed_since(&related, cached.verified_at) {
            return None;
        }
        self.decide_constancy(related.is_empty());
        graph.bind_all(&related, inner.id);
        Some(cached.value.clone())
    }

    fn evaluate(&self) -> T {
        let inner = &self.inner;
        let tracking = self.runtime.tracking();
        let verified_at = self.runtime.revision();

        let frame = tracking.fresh_frame();
        let (value, frame) = tracking.with_isolated_frame(Some(frame), || (inner.compute)());
        let frame = frame.unwrap_or_default();

        self.decide_constancy(frame.is_empty());

        {
            let mut related = inner.related.borrow_mut();
            let mut graph = self.runtime.graph_mut();
            graph.unbind_all(&related, inner.id);
            related.clear();
            related.extend(frame.iter());
            if !inner.is_const.get() {
                graph.bind_all(&related, inner.id);
            }
        }
        tracking.recycle_frame(frame);

        tracing::trace!(id = %inner.id, deps = inner.related.borrow().len(), "formula evaluated");
        *inner.cache.borrow_mut() = Some(Cached {
            value: value.clone(),
            verified_at,
        });
        value
    }

    /// Settle `is_const` on the first read inside a transaction, whether
    /// that read evaluated or hit the cache.
    fn decide_constancy(&self, no_dependencies: bool) {
        let inner = &self.inner;
        if inner.const_decided.get() || !self.runtime.is_in_transaction() {
            return;
        }
        inner.const_decided.set(true);
        if no_dependencies {
            inner.is_const.set(true);
            tracing::trace!(id = %inner.id, "formula decided constant");
        }
    }

    fn forward_dependencies(&self) {
        let tracking = self.runtime.tracking();
        if tracking.is_tracking() {
            tracking.track_all(self.inner.related.borrow().iter().copied());
        }
    }
}

impl<T: Clone + 'static> Tag for Formula<T> {
    type Value = T;
    type Weak = WeakFormula<T>;

    fn id(&self) -> TagId {
        self.inner.id
    }

    fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn read(&self) -> T {
        Formula::read(self)
    }

    fn downgrade(&self) -> WeakFormula<T> {
        WeakFormula {
            runtime: self.runtime.downgrade(),
            inner: Rc::clone(&self.inner),
        }
    }

    fn destroy(&self) {
        Formula::destroy(self)
    }
}

/// A [`Formula`] handle that does not keep the runtime alive.
///
/// Handles captured by `compute` itself still do.
pub struct WeakFormula<T> {
    runtime: WeakRuntime,
    inner: Rc<FormulaInner<T>>,
}

impl<T: Clone + 'static> WeakTag for WeakFormula<T> {
    type Strong = Formula<T>;

    fn upgrade(&self) -> Option<Formula<T>> {
        let runtime = self.runtime.upgrade()?;
        Some(Formula {
            runtime,
            inner: Rc::clone(&self.inner),
        })
    }
}

impl<T> Clone for Formula<T> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Debug> Debug for Formula<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.inner.cache.borrow();
        f.debug_struct("Formula")
            .field("id", &self.inner.id)
            .field("cached", &cache.as_ref().map(|cached| &cached.value))
            .field("related", &*self.inner.related.borrow())
            .field("is_const", &self.inner.is_const.get())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{evaluate_opcode, Cell};
    use std::cell::Cell as Counter;

    fn counted<T: Clone + 'static>(
        runtime: &Runtime,
        compute: impl Fn() -> T + 'static,
    ) -> (Formula<T>, Rc<Counter<usize>>) {
        let calls = Rc::new(Counter::new(0));
        let counter = calls.clone();
        let formula = Formula::new(runtime, move || {
            counter.set(counter.get() + 1);
            compute()
        });
        (formula, calls)
    }

    #[test]
    fn formula_is_lazy_and_cached() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 2);
        let (doubled, calls) = counted(&runtime, {
            let cell = cell.clone();
            move || cell.read() * 2
        });

        assert_eq!(calls.get(), 0);
        assert_eq!(doubled.state(), FormulaState::Unevaluated);

        assert_eq!(doubled.read(), 4);
        assert_eq!(doubled.read(), 4);
        assert_eq!(calls.get(), 1);
        assert_eq!(doubled.state(), FormulaState::Clean);

        cell.update(5);
        assert_eq!(doubled.state(), FormulaState::Stale);
        assert_eq!(doubled.read(), 10);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn evaluation_binds_reverse_index() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);
        let formula = Formula::new(&runtime, {
            let cell = cell.clone();
            move || cell.read() + 1
        });

        formula.read();
        assert_eq!(formula.related_cells(), vec![cell.id()]);
        assert_eq!(runtime.dependents(cell.id()), vec![formula.id()]);
    }

    #[test]
    fn clean_read_rebinds_after_drain() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);
        let (formula, calls) = counted(&runtime, {
            let cell = cell.clone();
            move || cell.read()
        });
        formula.read();

        let mut drained = Vec::new();
        runtime.graph_mut().drain_dependents(cell.id(), &mut drained);
        assert_eq!(drained, vec![formula.id()]);
        assert!(runtime.dependents(cell.id()).is_empty());

        formula.read();
        assert_eq!(calls.get(), 1);
        assert_eq!(runtime.dependents(cell.id()), vec![formula.id()]);
    }

    #[test]
    fn nested_formula_keeps_separate_dependencies() {
        let runtime = Runtime::new();
        let a = Cell::new(&runtime, 1);
        let b = Cell::new(&runtime, 10);
        let inner_slot: Rc<RefCell<Option<Formula<i32>>>> = Rc::new(RefCell::new(None));

        let outer = Formula::new(&runtime, {
            let (runtime, a, b) = (runtime.clone(), a.clone(), b.clone());
            let slot = inner_slot.clone();
            move || {
                let first = a.read();
                let inner = Formula::new(&runtime, {
                    let b = b.clone();
                    move || b.read()
                });
                let second = inner.read();
                slot.replace(Some(inner));
                first + second
            }
        });

        assert_eq!(outer.read(), 11);
        let inner = inner_slot.borrow().clone().unwrap();

        assert_eq!(inner.related_cells(), vec![b.id()]);
        let related = outer.related_cells();
        assert!(related.contains(&a.id()));
        assert!(!related.contains(&inner.id()));
    }

    #[test]
    fn zero_dependencies_in_transaction_is_constant() {
        let runtime = Runtime::new();
        let (constant, calls) = counted(&runtime, || 42);

        evaluate_opcode(&constant, |value| assert_eq!(value, 42));
        assert!(constant.is_const());
        assert_eq!(constant.state(), FormulaState::Constant);

        constant.read();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn constancy_is_not_decided_outside_transaction() {
        let runtime = Runtime::new();
        let flag = Cell::new(&runtime, false);
        let gate = Rc::new(Counter::new(false));

        let formula = Formula::new(&runtime, {
            let (flag, gate) = (flag.clone(), gate.clone());
            move || if gate.get() { flag.read() } else { false }
        });

        formula.read();
        assert!(!formula.is_const());
        assert_eq!(formula.state(), FormulaState::Clean);
    }

    #[test]
    fn cached_formula_is_decided_constant_on_first_transaction() {
        let runtime = Runtime::new();
        let (constant, calls) = counted(&runtime, || 5);

        assert_eq!(constant.read(), 5);
        assert!(!constant.is_const());

        evaluate_opcode(&constant, |value| assert_eq!(value, 5));
        assert!(constant.is_const());
        assert_eq!(constant.state(), FormulaState::Constant);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn cached_formula_with_dependencies_is_not_constant() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);
        let formula = Formula::new(&runtime, {
            let cell = cell.clone();
            move || cell.read()
        });

        formula.read();
        evaluate_opcode(&formula, |_| ());
        assert!(!formula.is_const());

        cell.update(2);
        assert_eq!(formula.state(), FormulaState::Stale);
    }

    #[test]
    fn constancy_is_sticky() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);
        let gate = Rc::new(Counter::new(false));

        let (formula, calls) = counted(&runtime, {
            let (cell, gate) = (cell.clone(), gate.clone());
            move || if gate.get() { cell.read() } else { 0 }
        });
        evaluate_opcode(&formula, |_| ());
        assert!(formula.is_const());

        gate.set(true);
        cell.update(2);
        runtime.flush_sync();
        assert_eq!(formula.read(), 0);
        assert_eq!(calls.get(), 1);
        assert!(formula.related_cells().is_empty());
    }

    #[test]
    fn destroy_unbinds_and_is_idempotent() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 1);
        let formula = Formula::new(&runtime, {
            let cell = cell.clone();
            move || cell.read()
        });
        formula.read();

        formula.destroy();
        formula.destroy();

        assert!(runtime.dependents(cell.id()).is_empty());
        assert_eq!(formula.state(), FormulaState::Destroyed);
        assert_eq!(runtime.stats().nodes, 1);
    }

    #[test]
    fn destroyed_formula_reads_without_binding() {
        let runtime = Runtime::new();
        let cell = Cell::new(&runtime, 3);
        let formula = Formula::new(&runtime, {
            let cell = cell.clone();
            move || cell.read() * 3
        });
        formula.destroy();

        assert_eq!(formula.read(), 9);
        assert!(runtime.dependents(cell.id()).is_empty());
    }
}
