use super::*;

fn dense(nrow: usize, ncol: usize, entries: &[i32]) -> SparseMatrix {
    SparseMatrix::from_dense(nrow, ncol, entries).unwrap()
}

fn null_registry(n: usize) -> Vec<Arc<dyn Propensity>> {
    (0..n)
        .map(|_| from_fn(|_u: &[i32], _v: &[f64], _ld: &[f64], _gd: &[f64], _t: f64| 0.0))
        .collect()
}

fn sir_registry() -> Vec<Arc<dyn Propensity>> {
    vec![
        from_fn(|u: &[i32], _v: &[f64], _ld: &[f64], gd: &[f64], _t: f64| {
            let total = u[0] + u[1] + u[2];
            if total == 0 {
                0.0
            } else {
                gd[0] * u[0] as f64 * u[1] as f64 / total as f64
            }
        }),
        from_fn(|u: &[i32], _v: &[f64], _ld: &[f64], gd: &[f64], _t: f64| gd[1] * u[1] as f64),
    ]
}

/// Frequency-dependent SIR over one or more nodes, beta 0.16, gamma 0.077.
fn sir_model(u0: Vec<i32>, tspan: Vec<f64>, events: Vec<ScheduledEvent>) -> Model {
    let n_nodes = u0.len() / 3;
    Model {
        n_compartments: 3,
        n_nodes,
        n_vdim: 0,
        n_ldata: 0,
        dep_graph: dense(2, 2, &[1, 1, 1, 1]),
        stoich: dense(3, 2, &[-1, 0, 1, -1, 0, 1]),
        select: dense(3, 1, &[1, 1, 1]),
        shift: SparseMatrix::zero(3, 0),
        u0,
        v0: Vec::new(),
        ldata: Vec::new(),
        gdata: vec![0.16, 0.077],
        tspan,
        events,
        propensities: sir_registry(),
        post_step: None,
    }
}

/// No transitions ever fire; state only moves through scheduled events.
fn inert_model(
    n_compartments: usize,
    u0: Vec<i32>,
    tspan: Vec<f64>,
    select: SparseMatrix,
    shift: SparseMatrix,
    events: Vec<ScheduledEvent>,
) -> Model {
    let n_nodes = u0.len() / n_compartments;
    Model {
        n_compartments,
        n_nodes,
        n_vdim: 0,
        n_ldata: 0,
        dep_graph: SparseMatrix::zero(1, 1),
        stoich: SparseMatrix::zero(n_compartments, 1),
        select,
        shift,
        u0,
        v0: Vec::new(),
        ldata: Vec::new(),
        gdata: Vec::new(),
        tspan,
        events,
        propensities: null_registry(1),
        post_step: None,
    }
}

fn event(kind: EventKind, time: i64, node: usize, n: i32) -> ScheduledEvent {
    ScheduledEvent {
        event: kind.code(),
        time,
        node,
        dest: 0,
        n,
        proportion: 0.0,
        select: 0,
        shift: None,
    }
}

fn dense_u(output: &SimOutput) -> &[i32] {
    match &output.u {
        OutputData::Dense(values) => values,
        OutputData::Sparse { .. } => panic!("expected a dense recording"),
    }
}

fn column<T>(values: &[T], k: usize, rows: usize) -> &[T] {
    &values[k * rows..(k + 1) * rows]
}

fn integer_tspan(last: i64) -> Vec<f64> {
    (0..=last).map(|t| t as f64).collect()
}

#[test]
fn sparse_from_dense_slices_columns() {
    let m = dense(3, 2, &[1, 0, 0, -1, 2, 1]);
    assert_eq!(m.nrow(), 3);
    assert_eq!(m.ncol(), 2);
    assert_eq!(m.nnz(), 4);
    let (rows, vals) = m.col(0);
    assert_eq!(rows, &[0, 2]);
    assert_eq!(vals, &[1, 2]);
    let (rows, vals) = m.col(1);
    assert_eq!(rows, &[1, 2]);
    assert_eq!(vals, &[-1, 1]);
    assert_eq!(m.get(1, 1), -1);
    assert_eq!(m.get(0, 1), 0);
}

#[test]
fn sparse_from_parts_validates_structure() {
    let err = SparseMatrix::from_parts(2, 2, vec![0, 1], vec![0], vec![1]).unwrap_err();
    assert!(matches!(err, SimError::Shape(_)));
    let err = SparseMatrix::from_parts(2, 1, vec![0, 1], vec![5], vec![1]).unwrap_err();
    assert!(matches!(err, SimError::Shape(msg) if msg.contains("row index")));
    let ok = SparseMatrix::from_parts(2, 2, vec![0, 1, 2], vec![0, 1], vec![3, -4]).unwrap();
    assert_eq!(ok.get(0, 0), 3);
    assert_eq!(ok.get(1, 1), -4);
}

#[test]
fn stream_seeds_are_deterministic_and_distinct() {
    assert_eq!(derive_stream_seed(42, 5), derive_stream_seed(42, 5));
    assert_ne!(derive_stream_seed(42, 5), derive_stream_seed(42, 6));
    assert_ne!(derive_stream_seed(42, 0), derive_stream_seed(43, 0));
}

#[test]
fn worker_streams_stay_in_the_unit_interval() {
    let mut rng = WorkerRng::for_worker(7, 0);
    for _ in 0..1000 {
        let draw = rng.uniform();
        assert!((0.0..1.0).contains(&draw));
        assert!(rng.exponential(2.5) >= 0.0);
    }
    let mut other = WorkerRng::for_worker(7, 1);
    assert_ne!(rng.uniform(), other.uniform());
}

#[test]
fn sampling_without_replacement_respects_bins() {
    let mut rng = WorkerRng::for_worker(11, 0);
    let taken = rng.sample_without_replacement(&[3, 5, 2], 10);
    assert_eq!(taken, vec![3, 5, 2]);

    for _ in 0..100 {
        let taken = rng.sample_without_replacement(&[3, 5, 2], 4);
        assert_eq!(taken.iter().sum::<i32>(), 4);
        assert!(taken[0] <= 3 && taken[1] <= 5 && taken[2] <= 2);
    }

    let taken = rng.sample_without_replacement(&[0, 6], 3);
    assert_eq!(taken[0], 0);
    assert_eq!(taken[1], 3);
}

#[test]
fn falling_factorial_basics() {
    assert_eq!(falling_factorial(5, 0), 1.0);
    assert_eq!(falling_factorial(5, 2), 20.0);
    assert_eq!(falling_factorial(3, 4), 0.0);
}

#[test]
fn mass_action_propensity_behaves() {
    let infection = MassAction {
        rate: 2.0,
        reactants: vec![(0, 1), (1, 1)],
    };
    assert_eq!(infection.eval(&[3, 4], &[], &[], &[], 0.0), 24.0);
    assert_eq!(infection.eval(&[0, 4], &[], &[], &[], 0.0), 0.0);

    let dimer = MassAction {
        rate: 1.0,
        reactants: vec![(0, 2)],
    };
    assert_eq!(dimer.eval(&[4], &[], &[], &[], 0.0), 12.0);
    assert_eq!(dimer.eval(&[1], &[], &[], &[], 0.0), 0.0);
}

#[test]
fn rate_expressions_resolve_names_and_positions() {
    let table = Arc::new(VarTable {
        n_compartments: 3,
        n_vdim: 1,
        n_ldata: 1,
        n_gdata: 2,
        compartments: vec!["S".into(), "I".into(), "R".into()],
        vdims: Vec::new(),
        ldata: Vec::new(),
        gdata: vec!["beta".into(), "gamma".into()],
    });
    let u = [10, 5, 5];
    let v = [2.0];
    let ld = [0.25];
    let gd = [0.5, 0.1];

    let named = RateExpr::parse("beta * S * I / (S + I + R)", Arc::clone(&table)).unwrap();
    assert!((named.eval(&u, &v, &ld, &gd, 0.0) - 1.25).abs() < 1e-12);

    let positional = RateExpr::parse("gd1 * u1 + ld0 + v0", Arc::clone(&table)).unwrap();
    assert!((positional.eval(&u, &v, &ld, &gd, 0.0) - 2.75).abs() < 1e-12);

    let timed = RateExpr::parse("t * gamma", table).unwrap();
    assert!((timed.eval(&u, &v, &ld, &gd, 3.0) - 0.3).abs() < 1e-12);
}

#[test]
fn rate_expressions_reject_unknown_variables() {
    let table = Arc::new(VarTable {
        n_compartments: 2,
        ..VarTable::default()
    });
    let err = RateExpr::parse("u0 * contact_rate", table).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(msg) if msg.contains("unknown variable")));
}

#[test]
fn event_kind_codes_are_strict() {
    assert!(EventKind::try_from(0).is_ok());
    assert!(EventKind::try_from(1).is_ok());
    assert!(EventKind::try_from(2).is_ok());
    assert!(EventKind::try_from(3).is_ok());
    assert!(matches!(
        EventKind::try_from(4),
        Err(SimError::InconsistentEvent(_))
    ));
    assert!(matches!(
        EventKind::try_from(-1),
        Err(SimError::InconsistentEvent(_))
    ));
}

#[test]
fn zero_propensity_keeps_state_constant() {
    let u0 = vec![4, 1, 7, 2];
    let model = inert_model(
        2,
        u0.clone(),
        integer_tspan(3),
        SparseMatrix::zero(2, 0),
        SparseMatrix::zero(2, 0),
        Vec::new(),
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(output.status.is_ok());
    assert_eq!(output.recorded, 4);
    let values = dense_u(&output);
    for k in 0..4 {
        assert_eq!(column(values, k, 4), &u0[..]);
    }
}

#[test]
fn sir_single_node_conserves_and_replays() {
    let tspan = integer_tspan(150);
    let model = sir_model(vec![99, 1, 0], tspan.clone(), Vec::new());
    let opts = RunOptions {
        seed: Some(1),
        n_workers: Some(1),
        ..RunOptions::default()
    };
    let output = run(&model, &opts).unwrap();
    assert!(output.status.is_ok());
    assert_eq!(output.recorded, tspan.len());
    let values = dense_u(&output);
    for k in 0..tspan.len() {
        let col = column(values, k, 3);
        assert_eq!(col.iter().sum::<i32>(), 100);
        assert!(col.iter().all(|&count| count >= 0));
    }
    // recovered counts never decrease
    for k in 1..tspan.len() {
        assert!(column(values, k, 3)[2] >= column(values, k - 1, 3)[2]);
    }

    let replay = run(&model, &opts).unwrap();
    assert_eq!(output.u, replay.u);
    assert_eq!(output.v, replay.v);
}

#[test]
fn sir_epidemic_takes_off_for_some_seed() {
    let tspan: Vec<f64> = (0..=15).map(|k| (k * 10) as f64).collect();
    let model = sir_model(vec![99, 1, 0], tspan.clone(), Vec::new());
    let mut best_final_recovered = 0;
    for seed in 0..30 {
        let opts = RunOptions {
            seed: Some(seed),
            n_workers: Some(1),
            ..RunOptions::default()
        };
        let output = run(&model, &opts).unwrap();
        let values = dense_u(&output);
        let last = column(values, tspan.len() - 1, 3);
        assert_eq!(last.iter().sum::<i32>(), 100);
        best_final_recovered = best_final_recovered.max(last[2]);
    }
    assert!(best_final_recovered >= 40);
}

#[test]
fn dependency_graph_matches_full_recompute() {
    // A -> B -> C -> A cycle; the exact graph is a strict subset of the
    // complete one, so agreement shows the per-column invalidation covers
    // every rate a firing can change.
    let stoich = &[-1, 0, 1, 1, -1, 0, 0, 1, -1];
    let exact = dense(3, 3, &[1, 0, 1, 1, 1, 0, 0, 1, 1]);
    let complete = dense(3, 3, &[1; 9]);
    let registry = || -> Vec<Arc<dyn Propensity>> {
        vec![
            from_fn(|u: &[i32], _v: &[f64], _ld: &[f64], _gd: &[f64], _t: f64| {
                0.4 * u[0] as f64
            }),
            from_fn(|u: &[i32], _v: &[f64], _ld: &[f64], _gd: &[f64], _t: f64| {
                0.3 * u[1] as f64
            }),
            from_fn(|u: &[i32], _v: &[f64], _ld: &[f64], _gd: &[f64], _t: f64| {
                0.5 * u[2] as f64
            }),
        ]
    };
    let build = |graph: SparseMatrix| Model {
        n_compartments: 3,
        n_nodes: 1,
        n_vdim: 0,
        n_ldata: 0,
        dep_graph: graph,
        stoich: dense(3, 3, stoich),
        select: SparseMatrix::zero(3, 0),
        shift: SparseMatrix::zero(3, 0),
        u0: vec![30, 20, 10],
        v0: Vec::new(),
        ldata: Vec::new(),
        gdata: Vec::new(),
        tspan: integer_tspan(20),
        events: Vec::new(),
        propensities: registry(),
        post_step: None,
    };
    let opts = RunOptions {
        seed: Some(99),
        n_workers: Some(1),
        ..RunOptions::default()
    };
    let with_exact = run(&build(exact), &opts).unwrap();
    let with_complete = run(&build(complete), &opts).unwrap();
    assert_eq!(dense_u(&with_exact), dense_u(&with_complete));
}

#[test]
fn scheduled_transfer_moves_individuals_between_nodes() {
    let mut transfer = event(EventKind::ExternalTransfer, 5, 0, 10);
    transfer.dest = 1;
    let model = inert_model(
        3,
        vec![100, 0, 0, 0, 0, 0],
        integer_tspan(7),
        dense(3, 1, &[1, 0, 0]),
        SparseMatrix::zero(3, 0),
        vec![transfer],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(output.status.is_ok());
    let values = dense_u(&output);
    for k in 0..5 {
        assert_eq!(column(values, k, 6), &[100, 0, 0, 0, 0, 0]);
    }
    for k in 5..8 {
        assert_eq!(column(values, k, 6), &[90, 0, 0, 10, 0, 0]);
    }
}

#[test]
fn transfer_preserves_compartment_identity() {
    let mut transfer = event(EventKind::ExternalTransfer, 1, 0, 20);
    transfer.dest = 1;
    let model = inert_model(
        3,
        vec![10, 10, 0, 0, 0, 0],
        integer_tspan(2),
        dense(3, 1, &[1, 1, 0]),
        SparseMatrix::zero(3, 0),
        vec![transfer],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(output.status.is_ok());
    let values = dense_u(&output);
    assert_eq!(column(values, 2, 6), &[0, 0, 0, 10, 10, 0]);
}

#[test]
fn internal_transfer_shifts_compartments() {
    let mut shift_event = event(EventKind::InternalTransfer, 3, 0, 20);
    shift_event.shift = Some(0);
    let model = inert_model(
        2,
        vec![50, 0],
        integer_tspan(5),
        dense(2, 1, &[1, 0]),
        dense(2, 1, &[1, 0]),
        vec![shift_event],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(output.status.is_ok());
    let values = dense_u(&output);
    for k in 0..3 {
        assert_eq!(column(values, k, 2), &[50, 0]);
    }
    for k in 3..6 {
        let col = column(values, k, 2);
        assert_eq!(col, &[30, 20]);
        assert_eq!(col.iter().sum::<i32>(), 50);
    }
}

#[test]
fn proportional_counts_round_half_away_from_zero() {
    let mut exit = event(EventKind::Exit, 1, 0, 0);
    exit.proportion = 0.5;
    let model = inert_model(
        1,
        vec![1],
        integer_tspan(2),
        dense(1, 1, &[1]),
        SparseMatrix::zero(1, 0),
        vec![exit],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(output.status.is_ok());
    // round(0.5 * 1) = 1, so the lone individual leaves
    assert_eq!(dense_u(&output), &[1, 0, 0]);
}

#[test]
fn proportional_exit_follows_the_hypergeometric_mean() {
    let mut exit = event(EventKind::Exit, 1, 0, 0);
    exit.proportion = 0.5;
    let model = inert_model(
        2,
        vec![80, 20],
        integer_tspan(1),
        dense(2, 1, &[1, 1]),
        SparseMatrix::zero(2, 0),
        vec![exit],
    );
    let replicates = 2000;
    let mut first_compartment_total = 0i64;
    for seed in 0..replicates {
        let opts = RunOptions {
            seed: Some(seed),
            ..RunOptions::default()
        };
        let output = run(&model, &opts).unwrap();
        assert!(output.status.is_ok());
        let survivors = column(dense_u(&output), 1, 2);
        assert_eq!(survivors.iter().sum::<i32>(), 50);
        first_compartment_total += i64::from(survivors[0]);
    }
    let mean = first_compartment_total as f64 / replicates as f64;
    // removal is multivariate hypergeometric, so 80 - 50*0.8 = 40 survive
    // in the first compartment on average
    assert!((mean - 40.0).abs() < 0.5, "sample mean {mean}");
}

#[test]
fn inconsistent_event_returns_partial_output() {
    let model = inert_model(
        1,
        vec![5],
        integer_tspan(2),
        dense(1, 1, &[1]),
        SparseMatrix::zero(1, 0),
        vec![event(EventKind::Exit, 1, 0, 10)],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(matches!(
        output.status,
        SimStatus::Failed(SimError::InconsistentEvent(_))
    ));
    assert_eq!(output.recorded, 1);
    assert_eq!(dense_u(&output), &[5]);
}

#[test]
fn exits_apply_before_enters_within_a_tick() {
    let mut drain = event(EventKind::Exit, 1, 0, 0);
    drain.proportion = 1.0;
    let model = inert_model(
        1,
        vec![5],
        integer_tspan(2),
        dense(1, 1, &[1]),
        SparseMatrix::zero(1, 0),
        vec![drain, event(EventKind::Enter, 1, 0, 7)],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(output.status.is_ok());
    // the drain empties the original 5 before the 7 arrivals land
    assert_eq!(dense_u(&output), &[5, 7, 7]);
}

#[test]
fn enter_credits_the_first_selected_compartment() {
    let model = inert_model(
        2,
        vec![0, 0],
        integer_tspan(1),
        dense(2, 1, &[0, 1]),
        SparseMatrix::zero(2, 0),
        vec![event(EventKind::Enter, 1, 0, 5)],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(output.status.is_ok());
    assert_eq!(column(dense_u(&output), 1, 2), &[0, 5]);
}

#[test]
fn every_tick_between_outputs_is_processed() {
    let model = inert_model(
        1,
        vec![0],
        vec![0.0, 2.5],
        dense(1, 1, &[1]),
        SparseMatrix::zero(1, 0),
        vec![
            event(EventKind::Enter, 1, 0, 1),
            event(EventKind::Enter, 2, 0, 1),
        ],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(output.status.is_ok());
    assert_eq!(dense_u(&output), &[0, 2]);
}

#[test]
fn unsorted_event_schedules_are_rejected() {
    let model = inert_model(
        1,
        vec![5],
        integer_tspan(2),
        dense(1, 1, &[1]),
        SparseMatrix::zero(1, 0),
        vec![
            event(EventKind::Enter, 1, 0, 1),
            event(EventKind::Exit, 1, 0, 1),
        ],
    );
    let err = run(&model, &RunOptions::default()).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(msg) if msg.contains("sorted")));
}

#[test]
fn events_outside_the_tick_window_are_rejected() {
    // ticks run from ceil(tspan[0]) through floor(tspan[end])
    for time in [1, 5] {
        let model = inert_model(
            1,
            vec![5],
            vec![2.0, 4.0],
            dense(1, 1, &[1]),
            SparseMatrix::zero(1, 0),
            vec![event(EventKind::Enter, time, 0, 1)],
        );
        let err = run(&model, &RunOptions::default()).unwrap_err();
        assert!(matches!(err, SimError::InvalidArgument(msg) if msg.contains("ticks")));
    }
}

#[test]
fn events_at_the_first_tick_apply_before_the_first_output() {
    let model = inert_model(
        1,
        vec![5],
        vec![1.0, 2.0],
        dense(1, 1, &[1]),
        SparseMatrix::zero(1, 0),
        vec![event(EventKind::Enter, 1, 0, 3)],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(output.status.is_ok());
    // tick 1 coincides with tspan[0], so the arrivals are already in the
    // first recorded column
    assert_eq!(dense_u(&output), &[8, 8]);
}

#[test]
fn transfers_conserve_the_global_population() {
    let mut events = Vec::new();
    for (time, source) in [(3, 0usize), (6, 1), (9, 2)] {
        let mut transfer = event(EventKind::ExternalTransfer, time, source, 5);
        transfer.dest = source + 1;
        events.push(transfer);
    }
    let mut u0 = Vec::new();
    for _ in 0..4 {
        u0.extend_from_slice(&[95, 5, 0]);
    }
    let model = sir_model(u0, integer_tspan(12), events);
    let opts = RunOptions {
        seed: Some(4),
        n_workers: Some(2),
        ..RunOptions::default()
    };
    let output = run(&model, &opts).unwrap();
    assert!(output.status.is_ok());
    let values = dense_u(&output);
    for k in 0..13 {
        let col = column(values, k, 12);
        assert_eq!(col.iter().sum::<i32>(), 400);
        assert!(col.iter().all(|&count| count >= 0));
    }

    let replay = run(&model, &opts).unwrap();
    assert_eq!(output.u, replay.u);
}

#[test]
fn post_step_hook_drives_the_continuous_state() {
    let hook = |_node: usize,
                _u: &[i32],
                v: &mut [f64],
                _ld: &[f64],
                _gd: &[f64],
                _t: f64|
     -> Result<bool, SimError> {
        v[0] = 10.0;
        Ok(true)
    };
    let model = Model {
        n_compartments: 1,
        n_nodes: 1,
        n_vdim: 1,
        n_ldata: 0,
        dep_graph: dense(1, 1, &[1]),
        stoich: dense(1, 1, &[1]),
        select: SparseMatrix::zero(1, 0),
        shift: SparseMatrix::zero(1, 0),
        u0: vec![0],
        v0: vec![0.0],
        ldata: Vec::new(),
        gdata: Vec::new(),
        tspan: integer_tspan(6),
        events: Vec::new(),
        propensities: vec![from_fn(
            |_u: &[i32], v: &[f64], _ld: &[f64], _gd: &[f64], _t: f64| v[0],
        )],
        post_step: Some(Arc::new(hook)),
    };
    let opts = RunOptions {
        seed: Some(3),
        n_workers: Some(1),
        ..RunOptions::default()
    };
    let output = run(&model, &opts).unwrap();
    assert!(output.status.is_ok());
    let births = dense_u(&output);
    // the birth rate is v[0]: zero until the first post-step write, then 10
    assert_eq!(births[0], 0);
    assert!(births[6] > 0);
    for k in 1..7 {
        assert!(births[k] >= births[k - 1]);
    }
    match &output.v {
        OutputData::Dense(values) => {
            assert!(values.iter().all(|&value| value == 10.0));
        }
        OutputData::Sparse { .. } => panic!("expected a dense recording"),
    }
}

#[test]
fn post_step_error_aborts_with_partial_output() {
    let hook = |_node: usize,
                _u: &[i32],
                _v: &mut [f64],
                _ld: &[f64],
                _gd: &[f64],
                t: f64|
     -> Result<bool, SimError> {
        if t >= 1.0 {
            Err(SimError::Internal("continuous state diverged".into()))
        } else {
            Ok(false)
        }
    };
    let mut model = inert_model(
        1,
        vec![5],
        integer_tspan(3),
        SparseMatrix::zero(1, 0),
        SparseMatrix::zero(1, 0),
        Vec::new(),
    );
    model.post_step = Some(Arc::new(hook));
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(matches!(
        output.status,
        SimStatus::Failed(SimError::Internal(_))
    ));
    assert_eq!(output.recorded, 1);
    assert_eq!(dense_u(&output), &[5]);
}

#[test]
fn cancel_token_stops_the_run() {
    let token = CancelToken::new();
    token.cancel();
    let model = sir_model(vec![99, 1, 0], integer_tspan(50), Vec::new());
    let opts = RunOptions {
        seed: Some(1),
        cancel: Some(token),
        ..RunOptions::default()
    };
    let output = run(&model, &opts).unwrap();
    assert!(matches!(output.status, SimStatus::Cancelled));
    assert_eq!(output.recorded, 0);
    assert!(dense_u(&output).is_empty());
}

#[test]
fn sparse_output_mask_matches_the_dense_recording() {
    let tspan = integer_tspan(20);
    let model = sir_model(vec![99, 1, 0], tspan.clone(), Vec::new());
    let base = RunOptions {
        seed: Some(7),
        n_workers: Some(1),
        ..RunOptions::default()
    };
    let dense_run = run(&model, &base).unwrap();
    let dense_values = dense_u(&dense_run).to_vec();

    let last = tspan.len() - 1;
    let mask: Vec<(usize, usize)> = (0..3).flat_map(|row| [(row, 0), (row, last)]).collect();
    let masked = RunOptions {
        u_mask: Some(mask),
        ..base
    };
    let output = run(&model, &masked).unwrap();
    match &output.u {
        OutputData::Sparse { rows, cols, values } => {
            assert_eq!(rows.len(), 6);
            for ((&row, &col), &value) in rows.iter().zip(cols).zip(values) {
                assert_eq!(value, dense_values[col * 3 + row]);
            }
        }
        OutputData::Dense(_) => panic!("expected a sparse recording"),
    }
}

#[test]
fn pure_death_process_matches_binomial_survival() {
    let model = Model {
        n_compartments: 1,
        n_nodes: 1,
        n_vdim: 0,
        n_ldata: 0,
        dep_graph: dense(1, 1, &[1]),
        stoich: dense(1, 1, &[-1]),
        select: SparseMatrix::zero(1, 0),
        shift: SparseMatrix::zero(1, 0),
        u0: vec![100],
        v0: Vec::new(),
        ldata: Vec::new(),
        gdata: vec![0.1],
        tspan: vec![0.0, 5.0],
        events: Vec::new(),
        propensities: vec![from_fn(
            |u: &[i32], _v: &[f64], _ld: &[f64], gd: &[f64], _t: f64| gd[0] * u[0] as f64,
        )],
        post_step: None,
    };
    let replicates = 400;
    let mut survivor_total = 0i64;
    for seed in 0..replicates {
        let opts = RunOptions {
            seed: Some(seed),
            n_workers: Some(1),
            ..RunOptions::default()
        };
        let output = run(&model, &opts).unwrap();
        let values = dense_u(&output);
        assert!(values[1] <= values[0]);
        survivor_total += i64::from(values[1]);
    }
    // each individual survives to t with probability exp(-gamma * t)
    let expected = 100.0 * (-0.5f64).exp();
    let mean = survivor_total as f64 / replicates as f64;
    assert!((mean - expected).abs() < 1.0, "sample mean {mean}");
}

#[test]
fn model_validation_catches_bad_inputs() {
    let good = sir_model(vec![99, 1, 0], integer_tspan(5), Vec::new());
    assert!(good.validate().is_ok());

    let negative = sir_model(vec![99, -1, 0], integer_tspan(5), Vec::new());
    assert!(matches!(
        negative.validate(),
        Err(SimError::InvalidArgument(msg)) if msg.contains("negative")
    ));

    let short = sir_model(vec![99, 1, 0], vec![0.0], Vec::new());
    assert!(matches!(
        short.validate(),
        Err(SimError::InvalidArgument(msg)) if msg.contains("two observation")
    ));

    let unordered = sir_model(vec![99, 1, 0], vec![0.0, 2.0, 1.0], Vec::new());
    assert!(matches!(
        unordered.validate(),
        Err(SimError::InvalidArgument(msg)) if msg.contains("increasing")
    ));

    let mut misshapen = sir_model(vec![99, 1, 0], integer_tspan(5), Vec::new());
    misshapen.stoich = dense(2, 2, &[-1, 0, 1, -1]);
    assert!(matches!(misshapen.validate(), Err(SimError::Shape(_))));

    let mut missing_rate = sir_model(vec![99, 1, 0], integer_tspan(5), Vec::new());
    missing_rate.propensities.pop();
    assert!(matches!(missing_rate.validate(), Err(SimError::Shape(_))));

    let mut bad_node = sir_model(vec![99, 1, 0], integer_tspan(5), Vec::new());
    bad_node.events = vec![event(EventKind::Exit, 1, 5, 1)];
    assert!(matches!(
        bad_node.validate(),
        Err(SimError::InvalidArgument(msg)) if msg.contains("node")
    ));
}

#[test]
fn out_of_range_select_fails_during_the_run() {
    let mut exit = event(EventKind::Exit, 1, 0, 1);
    exit.select = 4;
    let model = inert_model(
        1,
        vec![5],
        integer_tspan(2),
        dense(1, 1, &[1]),
        SparseMatrix::zero(1, 0),
        vec![exit],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(matches!(
        output.status,
        SimStatus::Failed(SimError::InconsistentEvent(_))
    ));
    assert_eq!(output.recorded, 1);
    assert_eq!(dense_u(&output), &[5]);
}

#[test]
fn unknown_event_kinds_fail_during_the_run() {
    let mut bogus = event(EventKind::Exit, 1, 0, 1);
    bogus.event = 7;
    let model = inert_model(
        1,
        vec![5],
        integer_tspan(2),
        dense(1, 1, &[1]),
        SparseMatrix::zero(1, 0),
        vec![bogus],
    );
    let output = run(&model, &RunOptions::default()).unwrap();
    assert!(matches!(
        output.status,
        SimStatus::Failed(SimError::InconsistentEvent(_))
    ));
    assert_eq!(output.recorded, 1);
    assert_eq!(dense_u(&output), &[5]);
}

#[test]
fn propensity_failures_are_fatal_with_partial_output() {
    // a death rate that goes negative once the compartment empties; the
    // dependency recomputation right after the final death trips on it
    let model = Model {
        n_compartments: 1,
        n_nodes: 1,
        n_vdim: 0,
        n_ldata: 0,
        dep_graph: dense(1, 1, &[1]),
        stoich: dense(1, 1, &[-1]),
        select: SparseMatrix::zero(1, 0),
        shift: SparseMatrix::zero(1, 0),
        u0: vec![1],
        v0: Vec::new(),
        ldata: Vec::new(),
        gdata: Vec::new(),
        tspan: integer_tspan(2),
        events: Vec::new(),
        propensities: vec![from_fn(
            |u: &[i32], _v: &[f64], _ld: &[f64], _gd: &[f64], _t: f64| {
                if u[0] > 0 { 1000.0 * u[0] as f64 } else { -1.0 }
            },
        )],
        post_step: None,
    };
    let opts = RunOptions {
        seed: Some(5),
        n_workers: Some(1),
        ..RunOptions::default()
    };
    let output = run(&model, &opts).unwrap();
    assert!(matches!(
        output.status,
        SimStatus::Failed(SimError::Propensity(_))
    ));
    assert_eq!(output.recorded, 1);
    assert_eq!(dense_u(&output), &[1]);
}
