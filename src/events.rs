use std::cmp::Ordering;

use crate::error::SimError;
use crate::rng::WorkerRng;
use crate::sparse::SparseMatrix;

/// The four scheduled-event classes, in their wire order. The numeric code
/// doubles as the within-tick ordering: exits run before enters, and
/// external transfers sort last so the driver can run them on the
/// coordinating thread without breaking the schedule order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    Exit = 0,
    Enter = 1,
    InternalTransfer = 2,
    ExternalTransfer = 3,
}

impl TryFrom<i64> for EventKind {
    type Error = SimError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Exit),
            1 => Ok(Self::Enter),
            2 => Ok(Self::InternalTransfer),
            3 => Ok(Self::ExternalTransfer),
            other => Err(SimError::InconsistentEvent(format!(
                "unknown event kind {} (expected 0=exit, 1=enter, 2=internal transfer, 3=external transfer)",
                other
            ))),
        }
    }
}

impl EventKind {
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// One scheduled event. Node indices are 0-based here; the Python boundary
/// converts from the 1-based convention of the source data format.
#[derive(Clone, Debug)]
pub struct ScheduledEvent {
    /// Wire code of the event class. Decoded when the event is applied:
    /// an unknown code fails the run at its tick with the recording made
    /// so far, not at construction.
    pub event: i64,
    /// Integer tick at which the event fires.
    pub time: i64,
    pub node: usize,
    /// Destination node, used by external transfers only.
    pub dest: usize,
    /// Explicit individual count; 0 means proportional.
    pub n: i32,
    pub proportion: f64,
    /// Column of the select matrix naming the eligible compartments.
    /// Bounds are checked at application time.
    pub select: usize,
    /// Column of the shift matrix, present exactly for internal transfers.
    pub shift: Option<usize>,
}

/// Processing order inside the schedule: `(time, kind, select)`.
pub fn schedule_order(a: &ScheduledEvent, b: &ScheduledEvent) -> Ordering {
    (a.time, a.event, a.select).cmp(&(b.time, b.event, b.select))
}

/// Field-level checks that need no run-time state. Unknown event codes
/// and select-column bounds are left for application time, where they
/// surface as `inconsistent_event` alongside the partial recording.
pub fn validate_event(
    ev: &ScheduledEvent,
    n_nodes: usize,
    n_shift: usize,
) -> Result<(), SimError> {
    if ev.time < 1 {
        return Err(SimError::InvalidArgument(format!(
            "event at t={} has a non-positive time; event times are positive integers",
            ev.time
        )));
    }
    if ev.node >= n_nodes {
        return Err(SimError::InvalidArgument(format!(
            "event at t={} names node {} but the model has {} nodes",
            ev.time, ev.node, n_nodes
        )));
    }
    if ev.n < 0 {
        return Err(SimError::InvalidArgument(format!(
            "event at t={} has negative count {}",
            ev.time, ev.n
        )));
    }
    if !(0.0..=1.0).contains(&ev.proportion) {
        return Err(SimError::InvalidArgument(format!(
            "event at t={} has proportion {} outside [0, 1]",
            ev.time, ev.proportion
        )));
    }
    match EventKind::try_from(ev.event) {
        Ok(EventKind::ExternalTransfer) => {
            if ev.dest >= n_nodes {
                return Err(SimError::InvalidArgument(format!(
                    "transfer at t={} names destination {} but the model has {} nodes",
                    ev.time, ev.dest, n_nodes
                )));
            }
            if ev.dest == ev.node {
                return Err(SimError::InvalidArgument(format!(
                    "transfer at t={} has node {} as its own destination",
                    ev.time, ev.node
                )));
            }
        }
        Ok(EventKind::InternalTransfer) => match ev.shift {
            Some(shift) if shift < n_shift => {}
            Some(shift) => {
                return Err(SimError::InvalidArgument(format!(
                    "internal transfer at t={} uses shift column {} but the shift matrix has {} columns",
                    ev.time, shift, n_shift
                )));
            }
            None => {
                return Err(SimError::InvalidArgument(format!(
                    "internal transfer at t={} is missing its shift column",
                    ev.time
                )));
            }
        },
        Ok(EventKind::Exit) | Ok(EventKind::Enter) => {
            if ev.shift.is_some() {
                return Err(SimError::InvalidArgument(format!(
                    "event at t={} carries a shift column but is not an internal transfer",
                    ev.time
                )));
            }
        }
        Err(_) => {}
    }
    Ok(())
}

/// Number of individuals an event asks for, given the current selected
/// population `base`. Proportional counts round half away from zero.
fn requested_count(ev: &ScheduledEvent, base: i32) -> i32 {
    if ev.n > 0 {
        ev.n
    } else {
        (ev.proportion * base as f64).round() as i32
    }
}

fn check_select(ev: &ScheduledEvent, select: &SparseMatrix) -> Result<(), SimError> {
    if ev.select >= select.ncol() {
        return Err(SimError::InconsistentEvent(format!(
            "event at t={} uses select column {} but the select matrix has {} columns",
            ev.time,
            ev.select,
            select.ncol()
        )));
    }
    Ok(())
}

/// Sample the event's individuals without replacement from the selected
/// compartments of one node column. Returns `(compartment, count)` pairs
/// for the compartments that actually gave up individuals.
fn sample_selected(
    ev: &ScheduledEvent,
    select: &SparseMatrix,
    u_node: &[i32],
    rng: &mut WorkerRng,
) -> Result<Vec<(usize, i32)>, SimError> {
    let (rows, _) = select.col(ev.select);
    if rows.is_empty() {
        return Err(SimError::InconsistentEvent(format!(
            "event at t={} selects column {} which picks no compartments",
            ev.time, ev.select
        )));
    }
    let counts: Vec<i32> = rows.iter().map(|&c| u_node[c]).collect();
    let available: i32 = counts.iter().sum();
    let wanted = requested_count(ev, available);
    if wanted > available {
        return Err(SimError::InconsistentEvent(format!(
            "event at t={} on node {} asks for {} individuals but only {} are selectable",
            ev.time, ev.node, wanted, available
        )));
    }
    let taken = rng.sample_without_replacement(&counts, wanted);
    Ok(rows
        .iter()
        .copied()
        .zip(taken)
        .filter(|&(_, count)| count > 0)
        .collect())
}

/// Apply a node-local event (exit, enter, internal transfer) to one node
/// column. The caller marks the node's rates stale afterwards.
pub fn apply_local(
    ev: &ScheduledEvent,
    select: &SparseMatrix,
    shift: &SparseMatrix,
    u_node: &mut [i32],
    rng: &mut WorkerRng,
) -> Result<(), SimError> {
    check_select(ev, select)?;
    match EventKind::try_from(ev.event)? {
        EventKind::Exit => {
            for (compartment, count) in sample_selected(ev, select, u_node, rng)? {
                u_node[compartment] -= count;
                if u_node[compartment] < 0 {
                    return Err(SimError::Internal(format!(
                        "exit at t={} drove compartment {} of node {} negative",
                        ev.time, compartment, ev.node
                    )));
                }
            }
        }
        EventKind::Enter => {
            let (rows, _) = select.col(ev.select);
            let Some(&target) = rows.first() else {
                return Err(SimError::InconsistentEvent(format!(
                    "enter at t={} selects column {} which picks no compartments",
                    ev.time, ev.select
                )));
            };
            let base: i32 = rows.iter().map(|&c| u_node[c]).sum();
            u_node[target] += requested_count(ev, base);
        }
        EventKind::InternalTransfer => {
            let Some(shift_col) = ev.shift else {
                return Err(SimError::Internal(format!(
                    "internal transfer at t={} lost its shift column",
                    ev.time
                )));
            };
            let (shift_rows, shift_vals) = shift.col(shift_col);
            let moved = sample_selected(ev, select, u_node, rng)?;
            for (compartment, count) in moved {
                let Some(pos) = shift_rows.iter().position(|&r| r == compartment) else {
                    return Err(SimError::InconsistentEvent(format!(
                        "internal transfer at t={} sampled compartment {} but shift column {} does not remap it",
                        ev.time, compartment, shift_col
                    )));
                };
                let target = compartment as i64 + shift_vals[pos] as i64;
                if target < 0 || target >= u_node.len() as i64 {
                    return Err(SimError::InconsistentEvent(format!(
                        "internal transfer at t={} shifts compartment {} to {}, outside the model",
                        ev.time, compartment, target
                    )));
                }
                u_node[compartment] -= count;
                u_node[target as usize] += count;
            }
        }
        EventKind::ExternalTransfer => {
            return Err(SimError::Internal(
                "external transfer routed to the node-local applier".into(),
            ));
        }
    }
    Ok(())
}

/// Apply an external transfer across the full state vector: debit the
/// sampled individuals from the source column, then credit the same
/// compartments of the destination column.
pub fn apply_transfer(
    ev: &ScheduledEvent,
    select: &SparseMatrix,
    u: &mut [i32],
    n_compartments: usize,
    rng: &mut WorkerRng,
) -> Result<(), SimError> {
    check_select(ev, select)?;
    let src_start = ev.node * n_compartments;
    let dst_start = ev.dest * n_compartments;
    let (src_col, dst_col) = if src_start < dst_start {
        let (head, tail) = u.split_at_mut(dst_start);
        (
            &mut head[src_start..src_start + n_compartments],
            &mut tail[..n_compartments],
        )
    } else {
        let (head, tail) = u.split_at_mut(src_start);
        (
            &mut tail[..n_compartments],
            &mut head[dst_start..dst_start + n_compartments],
        )
    };
    let moved = sample_selected(ev, select, src_col, rng)?;
    for &(compartment, count) in &moved {
        src_col[compartment] -= count;
        if src_col[compartment] < 0 {
            return Err(SimError::Internal(format!(
                "transfer at t={} drove compartment {} of node {} negative",
                ev.time, compartment, ev.node
            )));
        }
    }
    for &(compartment, count) in &moved {
        dst_col[compartment] += count;
    }
    Ok(())
}
