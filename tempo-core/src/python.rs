//! Python Bindings
//!
//! Exposes the runtime to Python through PyO3. Python values are stored as
//! `Rc<PyObject>` so cells and formulas can hand out cheap clones without
//! touching the GIL. All classes are `unsendable`: a runtime belongs to the
//! thread that created it.

use std::rc::Rc;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::config::RuntimeConfig;
use crate::reactive::{register_opcode, Cell, Formula, Registration, Runtime};

type Shared = Rc<PyObject>;
type Computed = Rc<PyResult<PyObject>>;

/// Python wrapper for [`Runtime`].
#[pyclass(name = "Runtime", unsendable)]
pub struct PyRuntime {
    runtime: Runtime,
}

#[pymethods]
impl PyRuntime {
    /// Create a runtime, optionally from a JSON configuration string.
    #[new]
    #[pyo3(signature = (config=None))]
    fn new(config: Option<String>) -> PyResult<Self> {
        let config = match config {
            Some(json) => RuntimeConfig::from_json(&json)
                .map_err(|err| PyValueError::new_err(err.to_string()))?,
            None => RuntimeConfig::default(),
        };
        Ok(Self {
            runtime: Runtime::with_config(config),
        })
    }

    #[pyo3(signature = (value, label=None))]
    fn cell(&self, value: PyObject, label: Option<String>) -> PyCell {
        let value = Rc::new(value);
        let cell = match label {
            Some(label) => Cell::labeled(&self.runtime, value, label),
            None => Cell::new(&self.runtime, value),
        };
        PyCell { cell }
    }

    /// Create a formula from a zero-argument callable.
    #[pyo3(signature = (compute, label=None))]
    fn formula(&self, compute: PyObject, label: Option<String>) -> PyFormula {
        let compute = move || -> Computed {
            Rc::new(Python::with_gil(|py| compute.call0(py)))
        };
        let formula = match label {
            Some(label) => Formula::labeled(&self.runtime, compute, label),
            None => Formula::new(&self.runtime, compute),
        };
        PyFormula { formula }
    }

    /// Run every queued flush. Returns how many ran.
    fn flush(&self) -> usize {
        match self.runtime.microtasks() {
            Some(queue) => queue.run_sync(),
            None => {
                self.runtime.flush_sync();
                1
            }
        }
    }

    #[getter]
    fn pending_count(&self) -> usize {
        self.runtime.pending_count()
    }

    #[getter]
    fn is_flush_scheduled(&self) -> bool {
        self.runtime.is_flush_scheduled()
    }

    /// Graph counters as a JSON string.
    fn stats(&self) -> PyResult<String> {
        serde_json::to_string(&self.runtime.stats())
            .map_err(|err| PyValueError::new_err(err.to_string()))
    }

    fn __repr__(&self) -> String {
        let stats = self.runtime.stats();
        format!(
            "Runtime(nodes={}, pending={}, opcode_lists={})",
            stats.nodes, stats.pending, stats.opcode_lists
        )
    }
}

/// Python wrapper for [`Cell`].
#[pyclass(name = "Cell", unsendable)]
pub struct PyCell {
    cell: Cell<Shared>,
}

#[pymethods]
impl PyCell {
    /// Read the value, recording a dependency inside a formula.
    fn read(&self, py: Python<'_>) -> PyObject {
        self.cell.read().clone_ref(py)
    }

    fn update(&self, value: PyObject) {
        self.cell.update(Rc::new(value));
    }

    /// Bind `callback` to this cell. It runs immediately with the current
    /// value and again on every flush that reaches the cell.
    fn subscribe(&self, callback: PyObject) -> PyRegistration {
        let registration = register_opcode(&self.cell, move |value: Shared| {
            Python::with_gil(|py| invoke(py, &callback, value.clone_ref(py)));
        });
        PyRegistration { registration }
    }

    fn destroy(&self) {
        self.cell.destroy();
    }

    #[getter]
    fn id(&self) -> u64 {
        self.cell.id().raw()
    }

    #[getter]
    fn label(&self) -> Option<String> {
        self.cell.label()
    }

    #[getter]
    fn is_destroyed(&self) -> bool {
        self.cell.is_destroyed()
    }

    fn __repr__(&self, py: Python<'_>) -> String {
        let value = self.cell.read_untracked();
        let repr = value
            .bind(py)
            .repr()
            .map(|r| r.to_string())
            .unwrap_or_else(|_| "?".to_string());
        format!("Cell(id={}, value={})", self.cell.id().raw(), repr)
    }
}

/// Python wrapper for [`Formula`].
#[pyclass(name = "Formula", unsendable)]
pub struct PyFormula {
    formula: Formula<Computed>,
}

#[pymethods]
impl PyFormula {
    /// Read the value. Exceptions raised by the callable are re-raised.
    fn read(&self, py: Python<'_>) -> PyResult<PyObject> {
        unpack(py, &self.formula.read())
    }

    /// Bind `callback` to this formula.
    ///
    /// Evaluations that raised are not passed to the callback.
    fn subscribe(&self, callback: PyObject) -> PyRegistration {
        let registration = register_opcode(&self.formula, move |value: Computed| {
            Python::with_gil(|py| match unpack(py, &value) {
                Ok(value) => invoke(py, &callback, value),
                Err(err) => report(py, err),
            });
        });
        PyRegistration { registration }
    }

    /// Ids of the cells read during the last evaluation.
    fn related_cells(&self) -> Vec<u64> {
        self.formula
            .related_cells()
            .into_iter()
            .map(|id| id.raw())
            .collect()
    }

    fn destroy(&self) {
        self.formula.destroy();
    }

    #[getter]
    fn id(&self) -> u64 {
        self.formula.id().raw()
    }

    #[getter]
    fn label(&self) -> Option<String> {
        self.formula.label()
    }

    #[getter]
    fn is_const(&self) -> bool {
        self.formula.is_const()
    }

    #[getter]
    fn state(&self) -> String {
        format!("{:?}", self.formula.state())
    }

    fn __repr__(&self) -> String {
        format!(
            "Formula(id={}, state={:?})",
            self.formula.id().raw(),
            self.formula.state()
        )
    }
}

/// Python wrapper for [`Registration`].
#[pyclass(name = "Registration", unsendable)]
pub struct PyRegistration {
    registration: Registration,
}

#[pymethods]
impl PyRegistration {
    /// Remove the callback. Safe to call more than once.
    fn unregister(&self) {
        self.registration.unregister();
    }

    #[getter]
    fn is_registered(&self) -> bool {
        self.registration.is_registered()
    }

    fn __repr__(&self) -> String {
        format!(
            "Registration(tag={}, registered={})",
            self.registration.tag().raw(),
            self.registration.is_registered()
        )
    }
}

fn unpack(py: Python<'_>, value: &PyResult<PyObject>) -> PyResult<PyObject> {
    match value {
        Ok(value) => Ok(value.clone_ref(py)),
        Err(err) => Err(err.clone_ref(py)),
    }
}

fn invoke(py: Python<'_>, callback: &PyObject, value: PyObject) {
    if let Err(err) = callback.call1(py, (value,)) {
        report(py, err);
    }
}

/// Opcode callbacks run inside a flush with no Python caller to raise into.
fn report(py: Python<'_>, err: PyErr) {
    tracing::error!(error = %err, "python callback raised");
    err.print(py);
}
