use std::sync::Arc;

use crate::error::SimError;
use crate::events::{self, ScheduledEvent};
use crate::propensity::Propensity;
use crate::sparse::SparseMatrix;

/// Post-time-step capability, run once per node after every observation
/// point. The hook may update the node's continuous state `v`; the
/// discrete state is read-only here (only the stepper and the event
/// applier move individuals). `Ok(true)` tells the driver the node's
/// transition rates depend on what changed and must be recomputed;
/// `Err` aborts the run.
pub trait PostStep: Send + Sync {
    fn apply(
        &self,
        node: usize,
        u: &[i32],
        v: &mut [f64],
        ldata: &[f64],
        gdata: &[f64],
        t: f64,
    ) -> Result<bool, SimError>;
}

impl<F> PostStep for F
where
    F: Fn(usize, &[i32], &mut [f64], &[f64], &[f64], f64) -> Result<bool, SimError> + Send + Sync,
{
    fn apply(
        &self,
        node: usize,
        u: &[i32],
        v: &mut [f64],
        ldata: &[f64],
        gdata: &[f64],
        t: f64,
    ) -> Result<bool, SimError> {
        self(node, u, v, ldata, gdata, t)
    }
}

/// A fully assembled simulation: structure matrices, initial state, data
/// vectors, observation times, event schedule, and the propensity registry.
///
/// Fields are public so models can be built literally; `validate` runs
/// every construction-time check and is the first thing `run` does, so an
/// inconsistent model never starts stepping. All per-node storage is
/// column-major (`node * width + index`).
pub struct Model {
    pub n_compartments: usize,
    pub n_nodes: usize,
    pub n_vdim: usize,
    pub n_ldata: usize,
    /// `G`: transition-by-transition dependency graph, 0/1 entries.
    pub dep_graph: SparseMatrix,
    /// `S`: compartment-by-transition stoichiometry.
    pub stoich: SparseMatrix,
    /// `E`: compartment-by-select-class eligibility, 0/1 entries.
    pub select: SparseMatrix,
    /// `N`: compartment-by-shift-class remapping offsets.
    pub shift: SparseMatrix,
    pub u0: Vec<i32>,
    pub v0: Vec<f64>,
    pub ldata: Vec<f64>,
    pub gdata: Vec<f64>,
    pub tspan: Vec<f64>,
    /// Sorted by `(time, kind, select)`.
    pub events: Vec<ScheduledEvent>,
    pub propensities: Vec<Arc<dyn Propensity>>,
    pub post_step: Option<Arc<dyn PostStep>>,
}

impl Model {
    pub fn n_transitions(&self) -> usize {
        self.propensities.len()
    }

    /// The local-data column of one node (empty when the model carries no
    /// local data).
    pub fn ldata_col(&self, node: usize) -> &[f64] {
        let width = self.n_ldata;
        &self.ldata[node * width..(node + 1) * width]
    }

    pub fn validate(&self) -> Result<(), SimError> {
        let nc = self.n_compartments;
        let nn = self.n_nodes;
        let nt = self.n_transitions();
        if nc == 0 || nn == 0 {
            return Err(SimError::InvalidArgument(
                "the model needs at least one compartment and one node".into(),
            ));
        }
        if nt == 0 {
            return Err(SimError::InvalidArgument(
                "the propensity registry is empty".into(),
            ));
        }
        if self.stoich.nrow() != nc || self.stoich.ncol() != nt {
            return Err(SimError::Shape(format!(
                "stoichiometry is {}x{}, expected {}x{}",
                self.stoich.nrow(),
                self.stoich.ncol(),
                nc,
                nt
            )));
        }
        if self.dep_graph.nrow() != nt || self.dep_graph.ncol() != nt {
            return Err(SimError::Shape(format!(
                "dependency graph is {}x{}, expected {}x{}",
                self.dep_graph.nrow(),
                self.dep_graph.ncol(),
                nt,
                nt
            )));
        }
        if !self.dep_graph.is_zero_one() {
            return Err(SimError::InvalidArgument(
                "dependency graph entries must be 0 or 1".into(),
            ));
        }
        if self.select.nrow() != nc {
            return Err(SimError::Shape(format!(
                "select matrix has {} rows, expected {}",
                self.select.nrow(),
                nc
            )));
        }
        if !self.select.is_zero_one() {
            return Err(SimError::InvalidArgument(
                "select matrix entries must be 0 or 1".into(),
            ));
        }
        if self.shift.nrow() != nc {
            return Err(SimError::Shape(format!(
                "shift matrix has {} rows, expected {}",
                self.shift.nrow(),
                nc
            )));
        }
        if self.u0.len() != nc * nn {
            return Err(SimError::Shape(format!(
                "u0 has {} entries, expected {} compartments x {} nodes",
                self.u0.len(),
                nc,
                nn
            )));
        }
        if let Some(bad) = self.u0.iter().position(|&count| count < 0) {
            return Err(SimError::InvalidArgument(format!(
                "u0 is negative at compartment {} of node {}",
                bad % nc,
                bad / nc
            )));
        }
        if self.v0.len() != self.n_vdim * nn {
            return Err(SimError::Shape(format!(
                "v0 has {} entries, expected {} dims x {} nodes",
                self.v0.len(),
                self.n_vdim,
                nn
            )));
        }
        if self.ldata.len() != self.n_ldata * nn {
            return Err(SimError::Shape(format!(
                "ldata has {} entries, expected {} rows x {} nodes",
                self.ldata.len(),
                self.n_ldata,
                nn
            )));
        }
        if self.tspan.len() < 2 {
            return Err(SimError::InvalidArgument(
                "tspan needs at least two observation times".into(),
            ));
        }
        if self.tspan.iter().any(|t| !t.is_finite()) {
            return Err(SimError::InvalidArgument(
                "tspan entries must be finite".into(),
            ));
        }
        if self.tspan.windows(2).any(|w| w[0] >= w[1]) {
            return Err(SimError::InvalidArgument(
                "tspan must be strictly increasing".into(),
            ));
        }
        self.validate_events()?;
        Ok(())
    }

    fn validate_events(&self) -> Result<(), SimError> {
        let first_tick = self.tspan[0].ceil() as i64;
        let last_tick = self.tspan[self.tspan.len() - 1].floor() as i64;
        for pair in self.events.windows(2) {
            if events::schedule_order(&pair[0], &pair[1]) == std::cmp::Ordering::Greater {
                return Err(SimError::InvalidArgument(
                    "events must be sorted by (time, kind, select)".into(),
                ));
            }
        }
        for ev in &self.events {
            events::validate_event(ev, self.n_nodes, self.shift.ncol())?;
            if ev.time < first_tick || ev.time > last_tick {
                return Err(SimError::InvalidArgument(format!(
                    "event at t={} falls outside the processed ticks [{}, {}]",
                    ev.time, first_tick, last_tick
                )));
            }
        }
        Ok(())
    }
}
