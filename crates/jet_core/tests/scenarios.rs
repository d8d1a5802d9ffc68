use approx::assert_relative_eq;
use jet_core::decomposition::{decompose_ode, DecomposeOptions};
use jet_core::expression::{copy, cos, make_vars, par, pow, sin, square, Expression};
use jet_core::integrator::{Callback, NtEvent, PropagateOptions, StepCallback, TaylorAdaptive, TaylorOutcome};
use jet_core::ode::OdeSys;
use jet_core::registry::register_step_callback;
use jet_core::variational::{VarArg, VarOdeSys};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pendulum() -> OdeSys {
    let [x, v] = make_vars(["x", "v"]).unwrap();
    OdeSys::new(vec![(x.clone(), v.clone()), (v, -sin(x))]).unwrap()
}

fn oscillator() -> OdeSys {
    let [x, v] = make_vars(["x", "v"]).unwrap();
    OdeSys::new(vec![(x.clone(), v.clone()), (v, -x)]).unwrap()
}

fn pendulum_energy(s: &[f64]) -> f64 {
    s[1] * s[1] / 2.0 + 1.0 - s[0].cos()
}

#[test]
fn pendulum_conserves_energy() {
    init_logging();
    let mut ta = TaylorAdaptive::builder(pendulum(), vec![1.0, 0.0])
        .tol(1e-15)
        .build()
        .unwrap();
    let res = ta.propagate_for(10.0, Default::default()).unwrap();
    assert_eq!(res.outcome, TaylorOutcome::TimeLimit);
    assert_eq!(ta.time(), 10.0);
    assert!((pendulum_energy(ta.state()) - (1.0 - 1f64.cos())).abs() < 1e-10);
}

#[test]
fn oscillator_energy_over_many_periods() {
    init_logging();
    let mut ta = TaylorAdaptive::builder(oscillator(), vec![0.3, -0.4]).build().unwrap();
    ta.propagate_until(200.0 * PI, Default::default()).unwrap();
    let s = ta.state();
    assert_relative_eq!(s[0] * s[0] + s[1] * s[1], 0.25, epsilon = 1e-12);
    assert_relative_eq!(s[0], 0.3, epsilon = 1e-11);
    assert_relative_eq!(s[1], -0.4, epsilon = 1e-11);
}

fn assert_linear_drift(grid: &[f64], states: &[Vec<f64>], energy: impl Fn(&[f64]) -> f64) {
    assert_eq!(states.len(), grid.len());
    let e0 = energy(&states[0]);
    for (t, s) in grid.iter().zip(states).skip(1) {
        let drift = (energy(s) - e0).abs();
        assert!(drift <= 1e-8 * t, "energy drift {drift:e} at t = {t}");
    }
}

#[test]
fn long_horizon_energy_drift() {
    init_logging();
    let grid: Vec<f64> = (0..=100).map(|i| i as f64 * 1e4).collect();

    // slow oscillator, period 200π
    let w2 = 1e-4;
    let [x, v] = make_vars(["x", "v"]).unwrap();
    let sys = OdeSys::new(vec![(x.clone(), v.clone()), (v, -(x * w2))]).unwrap();
    let mut ta = TaylorAdaptive::builder(sys, vec![1.0, 0.0]).tol(1e-15).build().unwrap();
    let (res, states) = ta.propagate_grid(&grid, Default::default()).unwrap();
    assert_eq!(res.outcome, TaylorOutcome::TimeLimit);
    assert_linear_drift(&grid, &states, |s| 0.5 * s[1] * s[1] + 0.5 * w2 * s[0] * s[0]);

    // Kepler orbit with a = 100, e = 0.5 started at pericentre
    let [x, y, vx, vy] = make_vars(["x", "y", "vx", "vy"]).unwrap();
    let r3 = pow(square(x.clone()) + square(y.clone()), (-1.5).into());
    let sys = OdeSys::new(vec![
        (x.clone(), vx.clone()),
        (y.clone(), vy.clone()),
        (vx, -(x * r3.clone())),
        (vy, -(y * r3)),
    ])
    .unwrap();
    let mut ta = TaylorAdaptive::builder(sys, vec![50.0, 0.0, 0.0, 0.03f64.sqrt()])
        .tol(1e-15)
        .build()
        .unwrap();
    let (res, states) = ta.propagate_grid(&grid, Default::default()).unwrap();
    assert_eq!(res.outcome, TaylorOutcome::TimeLimit);
    let kepler_energy = |s: &[f64]| 0.5 * (s[2] * s[2] + s[3] * s[3]) - 1.0 / s[0].hypot(s[1]);
    assert_relative_eq!(kepler_energy(&states[0]), -0.005, epsilon = 1e-15);
    assert_linear_drift(&grid, &states, kepler_energy);
}

#[test]
fn non_terminal_events_at_zeros_of_the_position() {
    init_logging();
    let [x, _] = make_vars(["x", "v"]).unwrap();
    let times = Arc::new(Mutex::new(Vec::new()));
    let sink = times.clone();
    let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0])
        .nt_event(NtEvent::<f64>::new(x).callback(move |_, t, _| sink.lock().unwrap().push(t)))
        .build()
        .unwrap();
    ta.propagate_until(20.0, Default::default()).unwrap();
    let times = times.lock().unwrap();
    assert_eq!(times.len(), 6);
    for (k, t) in times.iter().enumerate() {
        assert_relative_eq!(*t, PI / 2.0 + k as f64 * PI, epsilon = 1e-12);
    }
}

#[derive(Clone)]
struct Counting {
    calls: Arc<AtomicUsize>,
    pre_hooks: Arc<AtomicUsize>,
    stop_after: usize,
}

impl StepCallback<f64> for Counting {
    fn call(&mut self, _ta: &mut TaylorAdaptive<f64>) -> anyhow::Result<bool> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(n < self.stop_after)
    }

    fn pre_hook(&mut self, _ta: &mut TaylorAdaptive<f64>) -> anyhow::Result<()> {
        self.pre_hooks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepCallback<f64>> {
        Box::new(self.clone())
    }
}

#[test]
fn callback_stops_an_unbounded_propagation() {
    init_logging();
    let calls = Arc::new(AtomicUsize::new(0));
    let pre_hooks = Arc::new(AtomicUsize::new(0));
    let cb = Callback::new(Counting {
        calls: calls.clone(),
        pre_hooks: pre_hooks.clone(),
        stop_after: 5,
    });
    let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
    let res = ta
        .propagate_until(f64::INFINITY, PropagateOptions::default().callback(cb))
        .unwrap();
    assert_eq!(res.outcome, TaylorOutcome::CbStop);
    assert_eq!(res.n_steps, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(pre_hooks.load(Ordering::SeqCst), 1);
    // the callback passed in the options is handed back
    assert!(res.callback.is_some_and(|cb| !cb.is_empty()));
    assert!(ta.callback().is_empty());
}

#[test]
fn variational_pendulum_matches_finite_differences() {
    init_logging();
    let sys = pendulum();
    let var = VarOdeSys::new(&sys, VarArg::all_vars(&sys), 2).unwrap();
    assert_eq!(var.n_eq(), 12);

    let x0 = [1.0, 0.2];
    let mut ta = TaylorAdaptive::builder_var(var.clone(), x0.to_vec())
        .tol(1e-15)
        .build()
        .unwrap();
    ta.propagate_until(1.5, Default::default()).unwrap();

    let flow = |x: f64| {
        let mut ta = TaylorAdaptive::builder(pendulum(), vec![x, x0[1]])
            .tol(1e-15)
            .build()
            .unwrap();
        ta.propagate_until(1.5, Default::default()).unwrap();
        ta.state().to_vec()
    };

    let mid = flow(x0[0]);
    assert_relative_eq!(ta.state()[0], mid[0], epsilon = 1e-13);
    let (h1, h2) = (1e-6, 1e-3);
    let (p1, m1) = (flow(x0[0] + h1), flow(x0[0] - h1));
    let (p2, m2) = (flow(x0[0] + h2), flow(x0[0] - h2));
    for k in 0..2 {
        let d1 = (p1[k] - m1[k]) / (2.0 * h1);
        let d2 = (p2[k] - 2.0 * mid[k] + m2[k]) / (h2 * h2);
        let i1 = var.index_of(k, &[1, 0]).unwrap();
        let i2 = var.index_of(k, &[2, 0]).unwrap();
        assert_relative_eq!(ta.state()[i1], d1, epsilon = 1e-6);
        assert_relative_eq!(ta.state()[i2], d2, epsilon = 1e-4);
    }
}

#[test]
fn parameter_sensitivity_of_a_decay() {
    init_logging();
    // x' = -p0 x, x(t) = x0 exp(-p0 t), dx/dp0 = -t x(t)
    let [x] = make_vars(["x"]).unwrap();
    let sys = OdeSys::new(vec![(x.clone(), -(par(0) * x))]).unwrap();
    let var = VarOdeSys::new(&sys, vec![VarArg::Param(0)], 1).unwrap();
    let mut ta = TaylorAdaptive::builder_var(var.clone(), vec![2.0])
        .pars(vec![0.7])
        .build()
        .unwrap();
    ta.propagate_until(3.0, Default::default()).unwrap();
    let exact = 2.0 * (-0.7f64 * 3.0).exp();
    assert_relative_eq!(ta.state()[0], exact, epsilon = 1e-14);
    let i = var.index_of(0, &[1]).unwrap();
    assert_relative_eq!(ta.state()[i], -3.0 * exact, epsilon = 1e-13);
}

#[test]
fn cse_shrinks_systems_with_repeated_subexpressions() {
    init_logging();
    // planar two-body problem with the distance term written out twice
    let [x, y, vx, vy] = make_vars(["x", "y", "vx", "vy"]).unwrap();
    let r3 = || pow(square(x.clone()) + square(y.clone()), (-1.5).into());
    let sys = OdeSys::new(vec![
        (x.clone(), vx.clone()),
        (y.clone(), vy.clone()),
        (vx, -(x.clone() * copy(&r3()))),
        (vy, -(y.clone() * copy(&r3()))),
    ])
    .unwrap();

    let raw = decompose_ode(
        &sys,
        &[],
        &DecomposeOptions {
            cse: false,
            ..Default::default()
        },
    )
    .unwrap();
    let dc = decompose_ode(&sys, &[], &DecomposeOptions::default()).unwrap();
    assert!(dc.len() < raw.len());
    assert_eq!(dc.n_outputs(), 4);

    // circular orbit of period 2π
    let mut ta = TaylorAdaptive::builder(sys, vec![1.0, 0.0, 0.0, 1.0]).build().unwrap();
    assert_eq!(ta.decomposition().len(), dc.len());
    ta.propagate_until(2.0 * PI, Default::default()).unwrap();
    assert_relative_eq!(ta.state()[0], 1.0, epsilon = 1e-12);
    assert_relative_eq!(ta.state()[1], 0.0, epsilon = 1e-12);
}

#[test]
fn split_propagation_matches_a_single_call() {
    init_logging();
    let mut once = TaylorAdaptive::builder(pendulum(), vec![1.0, 0.0]).build().unwrap();
    once.propagate_until(10.0, Default::default()).unwrap();

    let mut twice = TaylorAdaptive::builder(pendulum(), vec![1.0, 0.0]).build().unwrap();
    twice.propagate_until(4.0, Default::default()).unwrap();
    assert_eq!(twice.time(), 4.0);
    twice.propagate_until(10.0, Default::default()).unwrap();
    assert_eq!(twice.time(), 10.0);

    for k in 0..2 {
        assert_relative_eq!(once.state()[k], twice.state()[k], epsilon = 1e-13);
    }
}

#[test]
fn compact_and_scalar_modes_agree_on_a_forced_system() {
    init_logging();
    // damped oscillator driven by a parametrised cosine
    let [x, v] = make_vars(["x", "v"]).unwrap();
    let t = Expression::time();
    let sys = OdeSys::new(vec![
        (x.clone(), v.clone()),
        (v.clone(), -x - par(0) * v + par(1) * cos(t)),
    ])
    .unwrap();
    let build = |compact: bool| {
        TaylorAdaptive::builder(sys.clone(), vec![0.5, 0.0])
            .pars(vec![0.1, 0.3])
            .compact_mode(compact)
            .build()
            .unwrap()
    };
    let (mut scalar, mut compact) = (build(false), build(true));
    scalar.propagate_until(15.0, Default::default()).unwrap();
    compact.propagate_until(15.0, Default::default()).unwrap();
    for k in 0..2 {
        assert_relative_eq!(scalar.state()[k], compact.state()[k], epsilon = 1e-12);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepBudget {
    left: u32,
}

impl StepCallback<f64> for StepBudget {
    fn call(&mut self, _ta: &mut TaylorAdaptive<f64>) -> anyhow::Result<bool> {
        self.left = self.left.saturating_sub(1);
        Ok(self.left > 0)
    }

    fn clone_box(&self) -> Box<dyn StepCallback<f64>> {
        Box::new(self.clone())
    }

    fn tag(&self) -> Option<&str> {
        Some("scenarios.step_budget")
    }

    fn payload(&self) -> jet_core::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

#[test]
fn archived_integrator_resumes_with_its_callback() {
    init_logging();
    register_step_callback::<f64, StepBudget>("scenarios.step_budget").unwrap();
    let mut ta = TaylorAdaptive::builder(pendulum(), vec![1.0, 0.0])
        .callback(Callback::new(StepBudget { left: 6 }))
        .build()
        .unwrap();
    let res = ta.propagate_until(100.0, Default::default()).unwrap();
    assert_eq!(res.outcome, TaylorOutcome::CbStop);
    assert_eq!(res.n_steps, 6);

    ta.set_callback(Callback::new(StepBudget { left: 3 }));
    let bytes = ta.to_bytes().unwrap();
    let mut back = TaylorAdaptive::<f64>::from_bytes(&bytes).unwrap();
    assert_eq!(back.state(), ta.state());
    assert_eq!(back.time(), ta.time());

    let a = ta.propagate_until(100.0, Default::default()).unwrap();
    let b = back.propagate_until(100.0, Default::default()).unwrap();
    assert_eq!(a.n_steps, 3);
    assert_eq!(b.n_steps, 3);
    assert_eq!(back.state(), ta.state());
    assert_eq!(back.time_dfloat(), ta.time_dfloat());
}
