use std::str::FromStr;
use std::sync::Arc;

use meval::{Context, ContextProvider, Expr};

use crate::error::SimError;

/// One transition rate function.
///
/// The engine treats the registry as an opaque capability set: it calls
/// `eval` with the node's current column views and does nothing else with
/// an entry. Implementations must be pure and deterministic; the stepper
/// turns a NaN, negative, or non-finite result into a fatal
/// `propensity_error`.
pub trait Propensity: Send + Sync {
    fn eval(&self, u: &[i32], v: &[f64], ldata: &[f64], gdata: &[f64], t: f64) -> f64;
}

impl<F> Propensity for F
where
    F: Fn(&[i32], &[f64], &[f64], &[f64], f64) -> f64 + Send + Sync,
{
    fn eval(&self, u: &[i32], v: &[f64], ldata: &[f64], gdata: &[f64], t: f64) -> f64 {
        self(u, v, ldata, gdata, t)
    }
}

/// Box a closure as a registry entry.
pub fn from_fn<F>(f: F) -> Arc<dyn Propensity>
where
    F: Fn(&[i32], &[f64], &[f64], &[f64], f64) -> f64 + Send + Sync + 'static,
{
    Arc::new(f)
}

/// `value * (value-1) * ... * (value-order+1)`, the distinct ordered ways
/// to pick `order` individuals out of `value`.
pub fn falling_factorial(value: i32, order: i32) -> f64 {
    if value < order {
        return 0.0;
    }
    let mut acc = 1.0;
    for i in 0..order {
        acc *= (value - i) as f64;
    }
    acc
}

/// Mass-action kinetics: rate constant times falling factorials of the
/// reactant counts.
pub struct MassAction {
    pub rate: f64,
    /// `(compartment, stoichiometric order)` pairs on the reactant side.
    pub reactants: Vec<(usize, i32)>,
}

impl Propensity for MassAction {
    fn eval(&self, u: &[i32], _v: &[f64], _ldata: &[f64], _gdata: &[f64], _t: f64) -> f64 {
        let mut propensity = self.rate;
        for &(compartment, order) in &self.reactants {
            let available = u[compartment];
            if available < order {
                return 0.0;
            }
            propensity *= falling_factorial(available, order);
        }
        propensity
    }
}

/// Where a variable name points inside a node's column views.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Time,
    Compartment(usize),
    Continuous(usize),
    Local(usize),
    Global(usize),
}

/// Name bindings for rate expressions: optional caller-supplied names per
/// dimension, with positional fallbacks `u<k>`, `v<k>`, `ld<k>`, `gd<k>`.
#[derive(Clone, Debug, Default)]
pub struct VarTable {
    pub n_compartments: usize,
    pub n_vdim: usize,
    pub n_ldata: usize,
    pub n_gdata: usize,
    pub compartments: Vec<String>,
    pub vdims: Vec<String>,
    pub ldata: Vec<String>,
    pub gdata: Vec<String>,
}

fn positional_index(name: &str, prefix: &str) -> Option<usize> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<usize>().ok()
}

impl VarTable {
    fn slot(&self, name: &str) -> Option<Slot> {
        if name == "t" {
            return Some(Slot::Time);
        }
        if let Some(i) = self.compartments.iter().position(|n| n == name) {
            return Some(Slot::Compartment(i));
        }
        if let Some(i) = self.vdims.iter().position(|n| n == name) {
            return Some(Slot::Continuous(i));
        }
        if let Some(i) = self.ldata.iter().position(|n| n == name) {
            return Some(Slot::Local(i));
        }
        if let Some(i) = self.gdata.iter().position(|n| n == name) {
            return Some(Slot::Global(i));
        }
        if let Some(i) = positional_index(name, "u") {
            return (i < self.n_compartments).then_some(Slot::Compartment(i));
        }
        if let Some(i) = positional_index(name, "v") {
            return (i < self.n_vdim).then_some(Slot::Continuous(i));
        }
        if let Some(i) = positional_index(name, "ld") {
            return (i < self.n_ldata).then_some(Slot::Local(i));
        }
        if let Some(i) = positional_index(name, "gd") {
            return (i < self.n_gdata).then_some(Slot::Global(i));
        }
        None
    }
}

struct NodeScope<'a> {
    table: &'a VarTable,
    u: &'a [i32],
    v: &'a [f64],
    ldata: &'a [f64],
    gdata: &'a [f64],
    t: f64,
}

impl<'a> ContextProvider for NodeScope<'a> {
    fn get_var(&self, name: &str) -> Option<f64> {
        self.table.slot(name).map(|slot| match slot {
            Slot::Time => self.t,
            Slot::Compartment(i) => self.u[i].max(0) as f64,
            Slot::Continuous(i) => self.v[i],
            Slot::Local(i) => self.ldata[i],
            Slot::Global(i) => self.gdata[i],
        })
    }
}

/// Resolves every known variable to 1.0; parse-time probe so an unknown
/// name fails at construction instead of mid-run.
struct ProbeScope<'a> {
    table: &'a VarTable,
}

impl<'a> ContextProvider for ProbeScope<'a> {
    fn get_var(&self, name: &str) -> Option<f64> {
        self.table.slot(name).map(|_| 1.0)
    }
}

/// Interpreted rate expression over a node's state.
///
/// Stands in for the source system's compiled rate code: callers that
/// cannot link a `Propensity` implementation hand over a formula string
/// instead.
#[derive(Clone, Debug)]
pub struct RateExpr {
    expr: Expr,
    table: Arc<VarTable>,
}

impl RateExpr {
    pub fn parse(src: &str, table: Arc<VarTable>) -> Result<Self, SimError> {
        let expr = Expr::from_str(src)
            .map_err(|err| SimError::InvalidArgument(format!("rate expression '{src}': {err}")))?;
        let probe = (ProbeScope { table: &table }, Context::new());
        expr.eval_with_context(probe).map_err(|err| {
            SimError::InvalidArgument(format!(
                "rate expression '{src}' references an unknown variable: {err}"
            ))
        })?;
        Ok(Self { expr, table })
    }
}

impl Propensity for RateExpr {
    fn eval(&self, u: &[i32], v: &[f64], ldata: &[f64], gdata: &[f64], t: f64) -> f64 {
        let scope = NodeScope {
            table: &self.table,
            u,
            v,
            ldata,
            gdata,
            t,
        };
        // Runtime evaluation failure becomes NaN, which the stepper
        // reports as a fatal propensity error.
        self.expr
            .eval_with_context((scope, Context::new()))
            .unwrap_or(f64::NAN)
    }
}
