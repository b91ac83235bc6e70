#![allow(unsafe_op_in_unsafe_fn)]

//! Stochastic metapopulation epidemic engine.
//!
//! Every node hosts a continuous-time Markov chain over integer
//! compartment counts, advanced by the Gillespie direct method and
//! interleaved with scheduled demographic events at integer ticks. Nodes
//! are partitioned statically across workers; given a seed, a worker
//! count, and a partition, a run replays bit-identically.

use std::sync::Arc;

use numpy::{
    Element, IxDyn, PyArray1, PyArrayDyn, PyArrayMethods, PyReadonlyArray1, PyReadonlyArray2,
    PyUntypedArrayMethods,
};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyAnyMethods, PyDict};

mod driver;
mod error;
mod events;
mod model;
mod propensity;
mod recorder;
mod rng;
mod sparse;
mod ssa;

pub use driver::{CancelToken, RunOptions, SimOutput, run};
pub use error::{SimError, SimStatus};
pub use events::{EventKind, ScheduledEvent};
pub use model::{Model, PostStep};
pub use propensity::{MassAction, Propensity, RateExpr, VarTable, falling_factorial, from_fn};
pub use recorder::{OutputData, OutputMask};
pub use rng::{WorkerRng, derive_stream_seed};
pub use sparse::SparseMatrix;

impl From<SimError> for PyErr {
    fn from(err: SimError) -> Self {
        PyValueError::new_err(err.to_string())
    }
}

fn dense_matrix<T: Copy + Element>(
    array: PyReadonlyArray2<T>,
    name: &str,
) -> Result<(usize, usize, Vec<T>), SimError> {
    let shape = array.shape();
    let data = array
        .as_slice()
        .map_err(|_| SimError::Shape(format!("{name} must be a contiguous 2-d array")))?;
    Ok((shape[0], shape[1], data.to_vec()))
}

fn dense_vector<T: Copy + Element>(
    array: PyReadonlyArray1<T>,
    name: &str,
) -> Result<Vec<T>, SimError> {
    array
        .as_slice()
        .map(|slice| slice.to_vec())
        .map_err(|_| SimError::Shape(format!("{name} must be a contiguous 1-d array")))
}

fn compress(
    array: Option<PyReadonlyArray2<i32>>,
    nrow: usize,
    name: &str,
) -> Result<SparseMatrix, SimError> {
    match array {
        Some(dense) => {
            let (rows, cols, flat) = dense_matrix(dense, name)?;
            if rows != nrow {
                return Err(SimError::Shape(format!(
                    "{name} has {rows} rows, expected {nrow}"
                )));
            }
            SparseMatrix::from_dense(rows, cols, &flat)
        }
        None => Ok(SparseMatrix::zero(nrow, 0)),
    }
}

fn resolve_names(
    names: Option<Vec<String>>,
    expected: usize,
    what: &str,
) -> Result<Vec<String>, SimError> {
    match names {
        Some(list) if list.len() != expected => Err(SimError::Shape(format!(
            "{} {what} names were given for {expected} entries",
            list.len()
        ))),
        Some(list) => Ok(list),
        None => Ok(Vec::new()),
    }
}

fn required_int(dict: &Bound<'_, PyDict>, field: &str) -> Result<i64, SimError> {
    let value = dict
        .get_item(field)
        .map_err(|_| SimError::InvalidArgument(format!("failed to read event field '{field}'")))?
        .ok_or_else(|| SimError::InvalidArgument(format!("event entry missing '{field}'")))?;
    value
        .extract::<i64>()
        .map_err(|_| SimError::InvalidArgument(format!("event field '{field}' must be an integer")))
}

fn optional_int(dict: &Bound<'_, PyDict>, field: &str, default: i64) -> Result<i64, SimError> {
    match dict
        .get_item(field)
        .map_err(|_| SimError::InvalidArgument(format!("failed to read event field '{field}'")))?
    {
        Some(value) if !value.is_none() => value.extract::<i64>().map_err(|_| {
            SimError::InvalidArgument(format!("event field '{field}' must be an integer"))
        }),
        _ => Ok(default),
    }
}

fn optional_float(dict: &Bound<'_, PyDict>, field: &str, default: f64) -> Result<f64, SimError> {
    match dict
        .get_item(field)
        .map_err(|_| SimError::InvalidArgument(format!("failed to read event field '{field}'")))?
    {
        Some(value) if !value.is_none() => value.extract::<f64>().map_err(|_| {
            SimError::InvalidArgument(format!("event field '{field}' must be a number"))
        }),
        _ => Ok(default),
    }
}

/// Turn a sequence of event mappings into the sorted schedule the engine
/// consumes. `node` and `dest` arrive 1-based, the convention of the
/// source data format, and leave 0-based.
fn parse_events(events: Option<Bound<'_, PyAny>>) -> Result<Vec<ScheduledEvent>, SimError> {
    let Some(obj) = events else {
        return Ok(Vec::new());
    };
    if obj.is_none() {
        return Ok(Vec::new());
    }
    let py = obj.py();
    let entries: Vec<Py<PyAny>> = obj.extract().map_err(|_| {
        SimError::InvalidArgument("events must be a sequence of mappings with named fields".into())
    })?;
    let mut schedule = Vec::with_capacity(entries.len());
    for raw in entries {
        let bound = raw.bind(py);
        let dict = bound.cast::<PyDict>().map_err(|_| {
            SimError::InvalidArgument("each event entry must be a mapping with named fields".into())
        })?;
        // the event code stays raw: an unknown kind fails at its tick
        // with the partial recording, not here
        let code = required_int(dict, "event")?;
        let time = required_int(dict, "time")?;
        let node = required_int(dict, "node")?;
        if node < 1 {
            return Err(SimError::InvalidArgument(format!(
                "event at t={time} has node {node}; nodes are numbered from 1"
            )));
        }
        let dest = optional_int(dict, "dest", 0)?;
        let dest = if code == EventKind::ExternalTransfer.code() {
            if dest < 1 {
                return Err(SimError::InvalidArgument(format!(
                    "transfer at t={time} has destination {dest}; nodes are numbered from 1"
                )));
            }
            (dest - 1) as usize
        } else {
            0
        };
        let n = optional_int(dict, "n", 0)?;
        if n < 0 || n > i64::from(i32::MAX) {
            return Err(SimError::InvalidArgument(format!(
                "event at t={time} has count {n} outside the supported range"
            )));
        }
        let proportion = optional_float(dict, "proportion", 0.0)?;
        let select = required_int(dict, "select")?;
        if select < 0 {
            return Err(SimError::InvalidArgument(format!(
                "event at t={time} has negative select column {select}"
            )));
        }
        let shift = optional_int(dict, "shift", -1)?;
        let shift = if code == EventKind::InternalTransfer.code() {
            if shift < 0 {
                return Err(SimError::InvalidArgument(format!(
                    "internal transfer at t={time} has shift {shift}; a shift column is required"
                )));
            }
            Some(shift as usize)
        } else if shift == -1 {
            None
        } else {
            return Err(SimError::InvalidArgument(format!(
                "event at t={time} has shift {shift}; only internal transfers take a shift"
            )));
        };
        schedule.push(ScheduledEvent {
            event: code,
            time,
            node: (node - 1) as usize,
            dest,
            n: n as i32,
            proportion,
            select: select as usize,
            shift,
        });
    }
    schedule.sort_by(events::schedule_order);
    Ok(schedule)
}

fn parse_mask(
    array: Option<PyReadonlyArray2<i64>>,
    name: &str,
) -> Result<Option<Vec<(usize, usize)>>, SimError> {
    array
        .map(|dense| {
            let (entries, width, flat) = dense_matrix(dense, name)?;
            if width != 2 {
                return Err(SimError::Shape(format!(
                    "{name} must have two columns (row, time index), got {width}"
                )));
            }
            let mut mask = Vec::with_capacity(entries);
            for pair in flat.chunks_exact(2) {
                if pair[0] < 0 || pair[1] < 0 {
                    return Err(SimError::Shape(format!(
                        "{name} entry ({}, {}) is negative",
                        pair[0], pair[1]
                    )));
                }
                mask.push((pair[0] as usize, pair[1] as usize));
            }
            Ok(mask)
        })
        .transpose()
}

fn export_dense<T: Copy + Element>(
    py: Python<'_>,
    values: &[T],
    written: usize,
    rows: usize,
) -> PyResult<Py<PyAny>> {
    let dims = vec![written, rows];
    let array = unsafe { PyArrayDyn::<T>::new(py, IxDyn(&dims), false) };
    unsafe {
        array
            .as_slice_mut()
            .map_err(|_| PyValueError::new_err("failed to export recorded data"))?
            .copy_from_slice(values);
    }
    Ok(array.into_any().unbind())
}

fn export_output<T: Copy + Element>(
    py: Python<'_>,
    data: &OutputData<T>,
    written: usize,
    rows: usize,
) -> PyResult<Py<PyAny>> {
    match data {
        OutputData::Dense(values) => export_dense(py, values, written, rows),
        OutputData::Sparse { rows, cols, values } => {
            let row_arr = PyArray1::from_vec(py, rows.iter().map(|&r| r as i64).collect());
            let col_arr = PyArray1::from_vec(py, cols.iter().map(|&c| c as i64).collect());
            let val_arr = PyArray1::from_vec(py, values.clone());
            Ok((row_arr, col_arr, val_arr)
                .into_pyobject(py)?
                .into_any()
                .unbind())
        }
    }
}

/// NumPy hands over row-major `(width, n_nodes)` buffers; the engine keeps
/// per-node columns contiguous.
fn flat_to_column_major<T: Copy>(flat: &[T], width: usize, n_nodes: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(flat.len());
    for node in 0..n_nodes {
        for row in 0..width {
            out.push(flat[row * n_nodes + node]);
        }
    }
    out
}

/// Run a metapopulation simulation.
///
/// Matrices arrive dense and are compressed internally: `dep_graph` is
/// transitions x transitions 0/1, `stoich` is compartments x transitions,
/// `select_matrix`/`shift_matrix` hold the event selector and remapping
/// classes, `u0`/`v0`/`ldata` have one column per node. `propensities` is
/// one rate expression per transition; variables resolve against the
/// optional name lists, the positional forms `u<k>`/`v<k>`/`ld<k>`/
/// `gd<k>`, and `t`.
///
/// Returns a dict with the recorded `u` and `v` (dense arrays shaped
/// (recorded, rows), or (rows, cols, values) triplets where a mask was
/// given), the number of recorded observation columns, and the run status
/// with any error detail.
#[pyfunction(signature = (
    dep_graph,
    stoich,
    u0,
    tspan,
    propensities,
    select_matrix=None,
    shift_matrix=None,
    events=None,
    v0=None,
    ldata=None,
    gdata=None,
    compartments=None,
    v_names=None,
    ldata_names=None,
    gdata_names=None,
    u_mask=None,
    v_mask=None,
    seed=None,
    n_threads=None,
))]
#[allow(clippy::too_many_arguments)]
pub fn simulate(
    py: Python<'_>,
    dep_graph: PyReadonlyArray2<i32>,
    stoich: PyReadonlyArray2<i32>,
    u0: PyReadonlyArray2<i32>,
    tspan: PyReadonlyArray1<f64>,
    propensities: Vec<String>,
    select_matrix: Option<PyReadonlyArray2<i32>>,
    shift_matrix: Option<PyReadonlyArray2<i32>>,
    events: Option<Py<PyAny>>,
    v0: Option<PyReadonlyArray2<f64>>,
    ldata: Option<PyReadonlyArray2<f64>>,
    gdata: Option<PyReadonlyArray1<f64>>,
    compartments: Option<Vec<String>>,
    v_names: Option<Vec<String>>,
    ldata_names: Option<Vec<String>>,
    gdata_names: Option<Vec<String>>,
    u_mask: Option<PyReadonlyArray2<i64>>,
    v_mask: Option<PyReadonlyArray2<i64>>,
    seed: Option<u64>,
    n_threads: Option<usize>,
) -> PyResult<Py<PyAny>> {
    let (n_compartments, n_nodes, u0_flat) = dense_matrix(u0, "u0")?;
    let (stoich_rows, n_transitions, stoich_flat) = dense_matrix(stoich, "stoichiometry")?;
    let stoich = SparseMatrix::from_dense(stoich_rows, n_transitions, &stoich_flat)?;
    let (dep_rows, dep_cols, dep_flat) = dense_matrix(dep_graph, "dependency graph")?;
    let dep_graph = SparseMatrix::from_dense(dep_rows, dep_cols, &dep_flat)?;
    let select = compress(select_matrix, n_compartments, "select matrix")?;
    let shift = compress(shift_matrix, n_compartments, "shift matrix")?;

    let tspan_vec = dense_vector(tspan, "tspan")?;
    let (n_vdim, v0_vec) = match v0 {
        Some(array) => {
            let (rows, cols, flat) = dense_matrix(array, "v0")?;
            if cols != n_nodes {
                return Err(SimError::Shape(format!(
                    "v0 has {cols} columns, expected one per node ({n_nodes})"
                ))
                .into());
            }
            (rows, flat_to_column_major(&flat, rows, cols))
        }
        None => (0, Vec::new()),
    };
    let (n_ldata, ldata_vec) = match ldata {
        Some(array) => {
            let (rows, cols, flat) = dense_matrix(array, "ldata")?;
            if cols != n_nodes {
                return Err(SimError::Shape(format!(
                    "ldata has {cols} columns, expected one per node ({n_nodes})"
                ))
                .into());
            }
            (rows, flat_to_column_major(&flat, rows, cols))
        }
        None => (0, Vec::new()),
    };
    let gdata_vec = match gdata {
        Some(array) => dense_vector(array, "gdata")?,
        None => Vec::new(),
    };

    let table = Arc::new(VarTable {
        n_compartments,
        n_vdim,
        n_ldata,
        n_gdata: gdata_vec.len(),
        compartments: resolve_names(compartments, n_compartments, "compartment")?,
        vdims: resolve_names(v_names, n_vdim, "continuous-state")?,
        ldata: resolve_names(ldata_names, n_ldata, "local-data")?,
        gdata: resolve_names(gdata_names, gdata_vec.len(), "global-data")?,
    });
    let mut registry: Vec<Arc<dyn Propensity>> = Vec::with_capacity(propensities.len());
    for expr in &propensities {
        registry.push(Arc::new(RateExpr::parse(expr, Arc::clone(&table))?));
    }

    let schedule = parse_events(events.as_ref().map(|obj| obj.bind(py).clone()))?;
    let u_mask = parse_mask(u_mask, "u_mask")?;
    let v_mask = parse_mask(v_mask, "v_mask")?;

    let model = Model {
        n_compartments,
        n_nodes,
        n_vdim,
        n_ldata,
        dep_graph,
        stoich,
        select,
        shift,
        u0: flat_to_column_major(&u0_flat, n_compartments, n_nodes),
        v0: v0_vec,
        ldata: ldata_vec,
        gdata: gdata_vec,
        tspan: tspan_vec,
        events: schedule,
        propensities: registry,
        post_step: None,
    };
    let opts = RunOptions {
        seed,
        n_workers: n_threads,
        u_mask,
        v_mask,
        cancel: None,
    };
    let output = py.detach(move || run(&model, &opts))?;

    let result = PyDict::new(py);
    result.set_item(
        "u",
        export_output(py, &output.u, output.recorded, n_compartments * n_nodes)?,
    )?;
    result.set_item(
        "v",
        export_output(py, &output.v, output.recorded, n_vdim * n_nodes)?,
    )?;
    result.set_item("recorded", output.recorded)?;
    result.set_item("status", output.status.code())?;
    match &output.status {
        SimStatus::Failed(err) => {
            result.set_item("error", err.to_string())?;
            result.set_item("error_kind", err.kind())?;
        }
        _ => {
            result.set_item("error", py.None())?;
            result.set_item("error_kind", py.None())?;
        }
    }
    Ok(result.into_any().unbind())
}

#[pymodule]
fn metapop(_py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_function(wrap_pyfunction!(simulate, module)?)?;
    Ok(())
}

#[cfg(test)]
mod tests;
