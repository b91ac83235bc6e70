use crate::error::SimError;
use crate::model::Model;
use crate::rng::WorkerRng;

/// Full rate rebuild cadence. Incremental `rate_sum` maintenance
/// accumulates floating-point drift over long fire sequences; a periodic
/// rebuild bounds it.
const RATE_REFRESH_INTERVAL: u32 = 1024;

fn eval_checked(
    model: &Model,
    node: usize,
    transition: usize,
    u: &[i32],
    v: &[f64],
    ldata: &[f64],
    t: f64,
) -> Result<f64, SimError> {
    let rate = model.propensities[transition].eval(u, v, ldata, &model.gdata, t);
    if !rate.is_finite() || rate < 0.0 {
        return Err(SimError::Propensity(format!(
            "transition {} returned {} on node {} at t={}",
            transition, rate, node, t
        )));
    }
    Ok(rate)
}

fn refresh_rates(
    model: &Model,
    node: usize,
    u: &[i32],
    v: &[f64],
    ldata: &[f64],
    t: f64,
    rates: &mut [f64],
) -> Result<f64, SimError> {
    let mut sum = 0.0;
    for transition in 0..model.n_transitions() {
        let rate = eval_checked(model, node, transition, u, v, ldata, t)?;
        rates[transition] = rate;
        sum += rate;
    }
    if !sum.is_finite() {
        return Err(SimError::Internal(format!(
            "rate sum of node {} is {} after a full refresh",
            node, sum
        )));
    }
    Ok(sum)
}

/// Smallest channel whose cumulative rate reaches `threshold`, skipping
/// zero-rate channels so they can never fire. `None` means the cumulative
/// sum fell short of `threshold` (drift between `rate_sum` and the rate
/// vector) and the caller must rebuild.
fn select_transition(rates: &[f64], threshold: f64) -> Option<usize> {
    let mut acc = 0.0;
    for (j, &rate) in rates.iter().enumerate() {
        if rate <= 0.0 {
            continue;
        }
        acc += rate;
        if acc >= threshold {
            return Some(j);
        }
    }
    None
}

/// Advance one node's chain from its current clock up to, but never past,
/// `t_target` by the Gillespie direct method.
///
/// A candidate waiting time that overshoots `t_target` parks the clock at
/// `t_target` without firing. After each firing, only the rates named by
/// the fired transition's dependency-graph column are recomputed;
/// `rate_sum` is maintained incrementally and rebuilt from scratch on the
/// refresh cadence or whenever it goes non-finite or negative.
#[allow(clippy::too_many_arguments)]
pub fn advance_node(
    model: &Model,
    node: usize,
    u: &mut [i32],
    v: &[f64],
    rates: &mut [f64],
    rate_sum: &mut f64,
    t: &mut f64,
    stale: &mut bool,
    fires: &mut u32,
    t_target: f64,
    rng: &mut WorkerRng,
) -> Result<(), SimError> {
    let ldata = model.ldata_col(node);
    if *stale {
        *rate_sum = refresh_rates(model, node, u, v, ldata, *t, rates)?;
        *stale = false;
        *fires = 0;
    }
    loop {
        if *rate_sum <= 0.0 {
            *t = t_target;
            return Ok(());
        }
        let tau = rng.exponential(*rate_sum);
        if *t + tau > t_target {
            *t = t_target;
            return Ok(());
        }
        let threshold = rng.uniform() * *rate_sum;
        let Some(transition) = select_transition(rates, threshold) else {
            *rate_sum = refresh_rates(model, node, u, v, ldata, *t, rates)?;
            *fires = 0;
            continue;
        };
        *t += tau;
        let (compartments, deltas) = model.stoich.col(transition);
        for (&compartment, &delta) in compartments.iter().zip(deltas) {
            u[compartment] += delta;
            if u[compartment] < 0 {
                return Err(SimError::Stoichiometry(format!(
                    "transition {} drove compartment {} of node {} negative at t={}",
                    transition, compartment, node, *t
                )));
            }
        }
        let (dependents, _) = model.dep_graph.col(transition);
        for &dependent in dependents {
            let updated = eval_checked(model, node, dependent, u, v, ldata, *t)?;
            *rate_sum += updated - rates[dependent];
            rates[dependent] = updated;
        }
        *fires += 1;
        if *fires >= RATE_REFRESH_INTERVAL || !rate_sum.is_finite() || *rate_sum < 0.0 {
            *rate_sum = refresh_rates(model, node, u, v, ldata, *t, rates)?;
            *fires = 0;
        }
    }
}
