use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use crate::error::{SimError, SimStatus};
use crate::events::{self, EventKind, ScheduledEvent};
use crate::model::{Model, PostStep};
use crate::recorder::{OutputData, OutputMask, Recorder};
use crate::rng::WorkerRng;
use crate::ssa;

const DEFAULT_SEED: u64 = 0xDEADBEEFCAFEBABE;

/// Cooperative cancellation signal, checked at every tick and observation
/// boundary. Cancelling mid-run yields the columns recorded so far.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-run knobs. The model describes the system; this describes one
/// execution of it.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub seed: Option<u64>,
    /// Worker count; also the static node-partition count the RNG streams
    /// key off. Defaults to available hardware parallelism, clamped to
    /// the node count.
    pub n_workers: Option<usize>,
    /// Keep only these `(row, time_index)` entries of `U`.
    pub u_mask: Option<Vec<(usize, usize)>>,
    /// Keep only these `(row, time_index)` entries of `V`.
    pub v_mask: Option<Vec<(usize, usize)>>,
    pub cancel: Option<CancelToken>,
}

/// The recorded trajectories plus how the run ended. `recorded` counts the
/// observation columns actually written; on a clean run it equals
/// `tspan.len()`.
#[derive(Debug)]
pub struct SimOutput {
    pub u: OutputData<i32>,
    pub v: OutputData<f64>,
    pub recorded: usize,
    pub status: SimStatus,
}

/// Run the simulation. `Err` is reserved for invalid inputs caught before
/// any stepping; runtime failures and cancellation come back as
/// `SimOutput::status` together with the partial recording.
pub fn run(model: &Model, opts: &RunOptions) -> Result<SimOutput, SimError> {
    model.validate()?;
    let n_times = model.tspan.len();
    let u_rows = model.n_compartments * model.n_nodes;
    let v_rows = model.n_vdim * model.n_nodes;
    let rec_u = match &opts.u_mask {
        Some(entries) => Recorder::sparse(u_rows, OutputMask::new(u_rows, n_times, entries)?),
        None => Recorder::dense(u_rows, n_times),
    };
    let rec_v = match &opts.v_mask {
        Some(entries) => Recorder::sparse(v_rows, OutputMask::new(v_rows, n_times, entries)?),
        None => Recorder::dense(v_rows, n_times),
    };
    let workers = opts
        .n_workers
        .unwrap_or_else(default_workers)
        .clamp(1, model.n_nodes);
    let output = match opts.n_workers {
        Some(n) => ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|err| SimError::ThreadPool(err.to_string()))?
            .install(|| run_partitioned(model, opts, workers, rec_u, rec_v)),
        None => run_partitioned(model, opts, workers, rec_u, rec_v),
    };
    Ok(output)
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Contiguous node chunks, one per worker, remainder spread left to right.
fn chunk_sizes(n_nodes: usize, workers: usize) -> Vec<usize> {
    let base = n_nodes / workers;
    let extra = n_nodes % workers;
    (0..workers).map(|w| base + usize::from(w < extra)).collect()
}

struct SimState {
    u: Vec<i32>,
    v: Vec<f64>,
    rates: Vec<f64>,
    rate_sum: Vec<f64>,
    t_node: Vec<f64>,
    stale: Vec<bool>,
    fires: Vec<u32>,
}

/// One worker's exclusive view: its node chunk sliced out of every state
/// vector, plus its private random stream. Rebuilt per parallel phase;
/// the borrows end at the rayon join, which is where the driver regains
/// the whole state for event application and recording.
struct WorkerSlot<'a> {
    first_node: usize,
    len: usize,
    u: &'a mut [i32],
    v: &'a mut [f64],
    rates: &'a mut [f64],
    rate_sum: &'a mut [f64],
    t_node: &'a mut [f64],
    stale: &'a mut [bool],
    fires: &'a mut [u32],
    rng: &'a mut WorkerRng,
}

fn split_slots<'a>(
    state: &'a mut SimState,
    rngs: &'a mut [WorkerRng],
    sizes: &[usize],
    nc: usize,
    nd: usize,
    nt: usize,
) -> Vec<WorkerSlot<'a>> {
    let mut slots = Vec::with_capacity(sizes.len());
    let mut u = state.u.as_mut_slice();
    let mut v = state.v.as_mut_slice();
    let mut rates = state.rates.as_mut_slice();
    let mut rate_sum = state.rate_sum.as_mut_slice();
    let mut t_node = state.t_node.as_mut_slice();
    let mut stale = state.stale.as_mut_slice();
    let mut fires = state.fires.as_mut_slice();
    let mut rngs = rngs;
    let mut first_node = 0;
    for &len in sizes {
        let (u_head, u_rest) = u.split_at_mut(len * nc);
        u = u_rest;
        let (v_head, v_rest) = v.split_at_mut(len * nd);
        v = v_rest;
        let (rates_head, rates_rest) = rates.split_at_mut(len * nt);
        rates = rates_rest;
        let (sum_head, sum_rest) = rate_sum.split_at_mut(len);
        rate_sum = sum_rest;
        let (t_head, t_rest) = t_node.split_at_mut(len);
        t_node = t_rest;
        let (stale_head, stale_rest) = stale.split_at_mut(len);
        stale = stale_rest;
        let (fires_head, fires_rest) = fires.split_at_mut(len);
        fires = fires_rest;
        let (rng_head, rng_rest) = rngs.split_at_mut(1);
        rngs = rng_rest;
        slots.push(WorkerSlot {
            first_node,
            len,
            u: u_head,
            v: v_head,
            rates: rates_head,
            rate_sum: sum_head,
            t_node: t_head,
            stale: stale_head,
            fires: fires_head,
            rng: &mut rng_head[0],
        });
        first_node += len;
    }
    slots
}

#[inline]
fn col<T>(buf: &[T], idx: usize, width: usize) -> &[T] {
    &buf[idx * width..(idx + 1) * width]
}

#[inline]
fn col_mut<T>(buf: &mut [T], idx: usize, width: usize) -> &mut [T] {
    &mut buf[idx * width..(idx + 1) * width]
}

/// Parallel phase: advance every node's chain to `t_target`.
fn advance_all(
    model: &Model,
    state: &mut SimState,
    rngs: &mut [WorkerRng],
    sizes: &[usize],
    t_target: f64,
) -> Result<(), SimError> {
    let (nc, nd, nt) = (model.n_compartments, model.n_vdim, model.n_transitions());
    split_slots(state, rngs, sizes, nc, nd, nt)
        .into_par_iter()
        .try_for_each(|slot| {
            let WorkerSlot {
                first_node,
                len,
                u,
                v,
                rates,
                rate_sum,
                t_node,
                stale,
                fires,
                rng,
            } = slot;
            for i in 0..len {
                ssa::advance_node(
                    model,
                    first_node + i,
                    col_mut(u, i, nc),
                    col(v, i, nd),
                    col_mut(rates, i, nt),
                    &mut rate_sum[i],
                    &mut t_node[i],
                    &mut stale[i],
                    &mut fires[i],
                    t_target,
                    rng,
                )?;
            }
            Ok(())
        })
}

/// Parallel phase: each worker applies the tick's node-local events
/// (exits, enters, internal transfers) for the nodes it owns, in schedule
/// order, drawing from its own stream.
fn apply_local_events(
    model: &Model,
    state: &mut SimState,
    rngs: &mut [WorkerRng],
    sizes: &[usize],
    tick_events: &[ScheduledEvent],
) -> Result<(), SimError> {
    let (nc, nd, nt) = (model.n_compartments, model.n_vdim, model.n_transitions());
    split_slots(state, rngs, sizes, nc, nd, nt)
        .into_par_iter()
        .try_for_each(|slot| {
            let WorkerSlot {
                first_node,
                len,
                u,
                stale,
                rng,
                ..
            } = slot;
            for ev in tick_events {
                if ev.event == EventKind::ExternalTransfer.code() {
                    continue;
                }
                if ev.node < first_node || ev.node >= first_node + len {
                    continue;
                }
                let local = ev.node - first_node;
                events::apply_local(ev, &model.select, &model.shift, col_mut(u, local, nc), rng)?;
                stale[local] = true;
            }
            Ok(())
        })
}

/// Serial phase on the coordinating thread: external transfers cross node
/// (and possibly worker) boundaries, so they run after the join, still in
/// schedule order and still drawing from the source node's worker stream.
fn apply_transfers(
    model: &Model,
    state: &mut SimState,
    rngs: &mut [WorkerRng],
    node_worker: &[usize],
    tick_events: &[ScheduledEvent],
) -> Result<(), SimError> {
    for ev in tick_events {
        if ev.event != EventKind::ExternalTransfer.code() {
            continue;
        }
        let rng = &mut rngs[node_worker[ev.node]];
        events::apply_transfer(ev, &model.select, &mut state.u, model.n_compartments, rng)?;
        state.stale[ev.node] = true;
        state.stale[ev.dest] = true;
    }
    Ok(())
}

/// Parallel phase: run the post-time-step hook on every node.
fn apply_post_step(
    model: &Model,
    hook: &dyn PostStep,
    state: &mut SimState,
    rngs: &mut [WorkerRng],
    sizes: &[usize],
    t: f64,
) -> Result<(), SimError> {
    let (nc, nd, nt) = (model.n_compartments, model.n_vdim, model.n_transitions());
    split_slots(state, rngs, sizes, nc, nd, nt)
        .into_par_iter()
        .try_for_each(|slot| {
            let WorkerSlot {
                first_node,
                len,
                u,
                v,
                stale,
                ..
            } = slot;
            for i in 0..len {
                let node = first_node + i;
                let changed = hook.apply(
                    node,
                    col(u, i, nc),
                    col_mut(v, i, nd),
                    model.ldata_col(node),
                    &model.gdata,
                    t,
                )?;
                if changed {
                    stale[i] = true;
                }
            }
            Ok(())
        })
}

fn finish(status: SimStatus, rec_u: Recorder<i32>, rec_v: Recorder<f64>) -> SimOutput {
    SimOutput {
        recorded: rec_u.written(),
        u: rec_u.finish(),
        v: rec_v.finish(),
        status,
    }
}

fn cancelled(opts: &RunOptions) -> bool {
    opts.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
}

fn run_partitioned(
    model: &Model,
    opts: &RunOptions,
    workers: usize,
    mut rec_u: Recorder<i32>,
    mut rec_v: Recorder<f64>,
) -> SimOutput {
    let (nc, nd, nt, nn) = (
        model.n_compartments,
        model.n_vdim,
        model.n_transitions(),
        model.n_nodes,
    );
    let master_seed = opts.seed.unwrap_or(DEFAULT_SEED);
    let sizes = chunk_sizes(nn, workers);
    let mut node_worker = Vec::with_capacity(nn);
    for (worker, &len) in sizes.iter().enumerate() {
        node_worker.extend(std::iter::repeat(worker).take(len));
    }
    let mut rngs: Vec<WorkerRng> = (0..workers)
        .map(|w| WorkerRng::for_worker(master_seed, w))
        .collect();
    let mut state = SimState {
        u: model.u0.clone(),
        v: model.v0.clone(),
        rates: vec![0.0; nt * nn],
        rate_sum: vec![0.0; nn],
        t_node: vec![model.tspan[0]; nn],
        stale: vec![true; nn],
        fires: vec![0; nn],
    };
    let schedule = &model.events;
    let mut ev_cursor = 0usize;
    // Ticks run from ceil(tspan[0]) through floor(tspan[end]); a tick
    // coinciding with the window start is handled before the first
    // recording.
    let mut next_tick = model.tspan[0].ceil() as i64;

    for &t_target in &model.tspan {
        if cancelled(opts) {
            return finish(SimStatus::Cancelled, rec_u, rec_v);
        }
        while (next_tick as f64) <= t_target {
            if cancelled(opts) {
                return finish(SimStatus::Cancelled, rec_u, rec_v);
            }
            if let Err(err) = advance_all(model, &mut state, &mut rngs, &sizes, next_tick as f64) {
                return finish(SimStatus::Failed(err), rec_u, rec_v);
            }
            let begin = ev_cursor;
            while ev_cursor < schedule.len() && schedule[ev_cursor].time == next_tick {
                ev_cursor += 1;
            }
            let tick_events = &schedule[begin..ev_cursor];
            if !tick_events.is_empty() {
                if let Err(err) =
                    apply_local_events(model, &mut state, &mut rngs, &sizes, tick_events)
                {
                    return finish(SimStatus::Failed(err), rec_u, rec_v);
                }
                if let Err(err) =
                    apply_transfers(model, &mut state, &mut rngs, &node_worker, tick_events)
                {
                    return finish(SimStatus::Failed(err), rec_u, rec_v);
                }
            }
            next_tick += 1;
        }
        if let Err(err) = advance_all(model, &mut state, &mut rngs, &sizes, t_target) {
            return finish(SimStatus::Failed(err), rec_u, rec_v);
        }
        if let Some(hook) = &model.post_step {
            if let Err(err) =
                apply_post_step(model, hook.as_ref(), &mut state, &mut rngs, &sizes, t_target)
            {
                return finish(SimStatus::Failed(err), rec_u, rec_v);
            }
        }
        rec_u.push_column(&state.u);
        rec_v.push_column(&state.v);
    }
    finish(SimStatus::Ok, rec_u, rec_v)
}
