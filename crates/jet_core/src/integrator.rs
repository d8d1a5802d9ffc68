//! Adaptive Taylor integrator.
//!
//! One step computes the Taylor coefficients of the state (and of every
//! event expression) up to the chosen order with the compiled Taylor
//! function, deduces a step size from the last two orders, locates event
//! roots on the resulting polynomials, and advances the state by Horner
//! evaluation. A step that produces non-finite values is not committed and
//! reports [`TaylorOutcome::ErrNfState`].
//!
//! ```no_run
//! use jet_core::expression::{make_vars, sin};
//! use jet_core::integrator::TaylorAdaptive;
//! use jet_core::ode::OdeSys;
//!
//! let [x, v] = make_vars(["x", "v"])?;
//! let sys = OdeSys::new(vec![(x.clone(), v.clone()), (v, -sin(x))])?;
//! let mut ta = TaylorAdaptive::builder(sys, vec![1.0, 0.0]).tol(1e-15).build()?;
//! let res = ta.propagate_for(10.0, Default::default())?;
//! println!("{:?} after {} steps: {:?}", res.outcome, res.n_steps, ta.state());
//! # Ok::<(), jet_core::Error>(())
//! ```

pub mod callback;
pub mod continuous;
pub mod events;
pub mod poly;
pub mod types;

pub use callback::{AngleReducer, Callback, CallbackData, CallbackSet, StepCallback};
pub use continuous::ContinuousOutput;
pub use events::{NtEvent, TEvent};
pub use types::{
    default_order, EventDirection, NtEventHit, PropagateOptions, PropagateResult, TaylorConfig,
    TaylorOutcome, MAX_ORDER, MIN_ORDER,
};

use crate::decomposition::{decompose_ode, DecomposeOptions, TaylorDc};
use crate::emit::{emit, output_refs, OutputRef};
use crate::equation_engine::{IrModule, JitBackend, TaylorFn, VmBackend};
use crate::error::{invalid, Error, Result};
use crate::expression::{get_params, Expression, Variable};
use crate::ode::OdeSys;
use crate::traits::FpPolicy;
use crate::variational::VarOdeSys;
use events::{crossings, deduce_cooldown, Crossing, EventData};
use log::{debug, trace, warn};
use nalgebra::DMatrix;
use once_cell::sync::OnceCell;
use poly::{compensated_horner, horner, two_sum};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of one step, before the public outcome is reported.
struct StepReport<T> {
    outcome: TaylorOutcome,
    h: T,
    /// Set when a terminal event callback asked to carry on.
    te_continue: bool,
}

/// Adaptive Taylor integrator for an [`OdeSys`], parameterised on the fp
/// policy.
#[derive(Clone)]
pub struct TaylorAdaptive<T: FpPolicy = f64> {
    sys: OdeSys,
    var: Option<VarOdeSys>,
    state: Vec<T>,
    /// Time as an unevaluated sum `hi + lo`.
    time: (T, T),
    pars: Vec<T>,
    tol: T,
    order: u32,
    config: TaylorConfig,
    dc: TaylorDc,
    outputs: Vec<OutputRef>,
    ir: IrModule,
    backend: Arc<dyn JitBackend<T>>,
    compiled: OnceCell<Arc<dyn TaylorFn<T>>>,
    tape: Vec<T>,
    t_events: Vec<TEvent<T>>,
    nt_events: Vec<NtEvent<T>>,
    /// Time and length of the last cooldown of each terminal event.
    te_cooldowns: Vec<Option<(T, T)>>,
    last_h: T,
    last_nt_events: Vec<NtEventHit<T>>,
    callback: Callback<T>,
    coeff_buf: Vec<T>,
}

/// Collects the inputs of a [`TaylorAdaptive`].
pub struct TaylorAdaptiveBuilder<T: FpPolicy> {
    sys: OdeSys,
    var: Option<VarOdeSys>,
    state: Vec<T>,
    time: T,
    pars: Vec<T>,
    config: TaylorConfig,
    t_events: Vec<TEvent<T>>,
    nt_events: Vec<NtEvent<T>>,
    callback: Callback<T>,
    backend: Option<Arc<dyn JitBackend<T>>>,
}

impl<T: FpPolicy> TaylorAdaptiveBuilder<T> {
    pub fn time(mut self, t0: T) -> Self {
        self.time = t0;
        self
    }

    pub fn pars(mut self, pars: Vec<T>) -> Self {
        self.pars = pars;
        self
    }

    pub fn config(mut self, config: TaylorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tol(mut self, tol: f64) -> Self {
        self.config.tol = Some(tol);
        self
    }

    pub fn order(mut self, order: u32) -> Self {
        self.config.order = Some(order);
        self
    }

    pub fn compact_mode(mut self, on: bool) -> Self {
        self.config.compact_mode = on;
        self
    }

    pub fn high_accuracy(mut self, on: bool) -> Self {
        self.config.high_accuracy = on;
        self
    }

    pub fn t_event(mut self, ev: TEvent<T>) -> Self {
        self.t_events.push(ev);
        self
    }

    pub fn nt_event(mut self, ev: NtEvent<T>) -> Self {
        self.nt_events.push(ev);
        self
    }

    /// Callback used by `propagate_*` calls that do not pass their own.
    pub fn callback(mut self, cb: Callback<T>) -> Self {
        self.callback = cb;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn JitBackend<T>>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<TaylorAdaptive<T>> {
        let config = self.config;
        config.validate()?;

        let state = match &self.var {
            Some(var) if self.state.len() == var.n_orig() => {
                var.initial_state(&self.state, &self.pars, self.time)?
            }
            _ => self.state,
        };
        if state.len() != self.sys.dimension() {
            return invalid(format!(
                "the initial state has {} components, the system has dimension {}",
                state.len(),
                self.sys.dimension()
            ));
        }
        if !self.time.is_finite() {
            return invalid("the initial time must be finite");
        }

        let extra: Vec<Expression> = self
            .t_events
            .iter()
            .map(|e| e.expression.clone())
            .chain(self.nt_events.iter().map(|e| e.expression.clone()))
            .collect();
        let needed = self
            .sys
            .n_params()
            .max(extra.iter().flat_map(get_params).map(|p| p.index() as usize + 1).max().unwrap_or(0));
        if self.pars.len() < needed {
            return invalid(format!(
                "parameter index {} is out of range for a parameter vector of length {}",
                needed - 1,
                self.pars.len()
            ));
        }

        let tol = config.tol.map(T::from_f64_lossy).unwrap_or_else(T::default_tol);
        let order = match config.order {
            Some(order) => order,
            None => {
                let p = default_order(tol.to_f64().unwrap_or(f64::EPSILON));
                if p > MAX_ORDER {
                    warn!("Taylor order {p} deduced from the tolerance clamped to {MAX_ORDER}");
                }
                p.min(MAX_ORDER)
            }
        };

        let opts = DecomposeOptions {
            sum_split: config.sum_split,
            ..DecomposeOptions::default()
        };
        let dc = decompose_ode(&self.sys, &extra, &opts)?;
        let ir = emit::<T>(&dc, order, config.compact_mode)?;
        let outputs = output_refs(&dc);
        debug!(
            "taylor integrator for {}: dimension {}, order {}, tolerance {:?}, {} terminal and {} non-terminal events",
            T::name(),
            state.len(),
            order,
            tol,
            self.t_events.len(),
            self.nt_events.len()
        );

        Ok(TaylorAdaptive {
            tape: vec![T::zero(); ir.tape_len()],
            te_cooldowns: vec![None; self.t_events.len()],
            sys: self.sys,
            var: self.var,
            state,
            time: (self.time, T::zero()),
            pars: self.pars,
            tol,
            order,
            config,
            dc,
            outputs,
            ir,
            backend: self.backend.unwrap_or_else(|| Arc::new(VmBackend)),
            compiled: OnceCell::new(),
            t_events: self.t_events,
            nt_events: self.nt_events,
            last_h: T::zero(),
            last_nt_events: Vec::new(),
            callback: self.callback,
            coeff_buf: Vec::with_capacity(order as usize + 1),
        })
    }
}

impl<T: FpPolicy> TaylorAdaptive<T> {
    pub fn builder(sys: OdeSys, state: Vec<T>) -> TaylorAdaptiveBuilder<T> {
        TaylorAdaptiveBuilder {
            sys,
            var: None,
            state,
            time: T::zero(),
            pars: Vec::new(),
            config: TaylorConfig::default(),
            t_events: Vec::new(),
            nt_events: Vec::new(),
            callback: Callback::empty(),
            backend: None,
        }
    }

    /// Builder for a variational system. `state` may hold either the
    /// original state only, in which case the variational components are
    /// initialised from it, or the full augmented state.
    pub fn builder_var(var: VarOdeSys, state: Vec<T>) -> TaylorAdaptiveBuilder<T> {
        let mut b = Self::builder(var.sys().clone(), state);
        b.var = Some(var);
        b
    }

    pub fn state(&self) -> &[T] {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut [T] {
        &mut self.state
    }

    pub fn update_state(&mut self, state: &[T]) -> Result<()> {
        if state.len() != self.state.len() {
            return invalid(format!(
                "expected a state with {} components, got {}",
                self.state.len(),
                state.len()
            ));
        }
        self.state.copy_from_slice(state);
        Ok(())
    }

    pub fn state_vars(&self) -> &[Variable] {
        self.sys.state_vars()
    }

    pub fn dimension(&self) -> usize {
        self.state.len()
    }

    pub fn time(&self) -> T {
        self.time.0
    }

    /// Time as the unevaluated sum `hi + lo`.
    pub fn time_dfloat(&self) -> (T, T) {
        self.time
    }

    pub fn set_time(&mut self, t: T) {
        self.time = (t, T::zero());
    }

    pub fn pars(&self) -> &[T] {
        &self.pars
    }

    pub fn pars_mut(&mut self) -> &mut [T] {
        &mut self.pars
    }

    pub fn tol(&self) -> T {
        self.tol
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn config(&self) -> &TaylorConfig {
        &self.config
    }

    pub fn system(&self) -> &OdeSys {
        &self.sys
    }

    pub fn var_sys(&self) -> Option<&VarOdeSys> {
        self.var.as_ref()
    }

    pub fn decomposition(&self) -> &TaylorDc {
        &self.dc
    }

    pub fn ir(&self) -> &IrModule {
        &self.ir
    }

    /// Textual listing of the IR of the Taylor function.
    pub fn dump_ir(&self) -> String {
        self.ir.dump::<T>()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Signed size of the last committed step.
    pub fn last_h(&self) -> T {
        self.last_h
    }

    pub fn last_nt_events(&self) -> &[NtEventHit<T>] {
        &self.last_nt_events
    }

    pub fn t_events(&self) -> &[TEvent<T>] {
        &self.t_events
    }

    pub fn nt_events(&self) -> &[NtEvent<T>] {
        &self.nt_events
    }

    pub fn reset_cooldowns(&mut self) {
        self.te_cooldowns.iter_mut().for_each(|c| *c = None);
    }

    pub fn callback(&self) -> &Callback<T> {
        &self.callback
    }

    pub fn set_callback(&mut self, cb: Callback<T>) {
        self.callback = cb;
    }

    /// Order-`n` Taylor coefficient of state component `k` from the last
    /// step, expanded around the start of that step.
    pub fn taylor_coefficient(&self, k: usize, n: u32) -> Option<T> {
        if k >= self.state.len() || n > self.order {
            return None;
        }
        self.tape.get(n as usize * self.ir.n_entries as usize + k).copied()
    }

    fn function(&self) -> Result<Arc<dyn TaylorFn<T>>> {
        self.compiled
            .get_or_try_init(|| {
                debug!(
                    "compiling the Taylor function with the '{}' backend: {} instructions",
                    self.backend.name(),
                    self.ir.n_instructions()
                );
                self.backend.build_function(&self.ir).map(Arc::from)
            })
            .cloned()
    }

    /// Coefficients of output `j` at every order.
    fn output_coeffs(&self, j: usize) -> Vec<T> {
        let n = self.ir.n_entries as usize;
        (0..=self.order as usize)
            .map(|m| match self.outputs[j] {
                OutputRef::Entry(i) => self.tape[m * n + i],
                OutputRef::Number(c) if m == 0 => T::from_f64_lossy(c),
                OutputRef::Number(_) => T::zero(),
            })
            .collect()
    }

    /// Evaluates the state polynomials of the last step at `delta`.
    fn eval_step(&mut self, delta: T, out: &mut [T]) {
        let n = self.ir.n_entries as usize;
        let p = self.order as usize;
        for (k, slot) in out.iter_mut().enumerate() {
            self.coeff_buf.clear();
            self.coeff_buf.extend((0..=p).map(|m| self.tape[m * n + k]));
            *slot = if self.config.high_accuracy {
                compensated_horner(&self.coeff_buf, delta)
            } else {
                horner(&self.coeff_buf, delta)
            };
        }
    }

    /// One step of magnitude at most `limit` in the requested direction.
    fn step_impl(&mut self, limit: T, forward: bool) -> Result<StepReport<T>> {
        let f = self.function()?;
        let dim = self.state.len();
        let n = self.ir.n_entries as usize;
        let p = self.order as usize;
        let t0 = self.time.0;

        self.tape[..dim].copy_from_slice(&self.state);
        f.call(&mut self.tape, &self.pars, t0);

        let nf = StepReport {
            outcome: TaylorOutcome::ErrNfState,
            h: T::zero(),
            te_continue: false,
        };
        let mut max_abs = T::zero();
        for x in &self.state {
            max_abs = max_abs.max(x.abs());
        }
        let norm = |m: usize| {
            let mut acc = T::zero();
            for k in 0..dim {
                acc = acc.max(self.tape[m * n + k].abs());
            }
            acc
        };
        if (0..=p).any(|m| (0..dim).any(|k| !self.tape[m * n + k].is_finite())) {
            warn!("non-finite Taylor coefficients at t = {t0:?}");
            return Ok(nf);
        }

        let scaled_tol = self.tol * max_abs.max(T::one());
        let rho = |m: usize| {
            let nm = norm(m);
            if nm.is_zero() {
                T::infinity()
            } else {
                (scaled_tol / nm).powf(T::one() / T::from_usize(m).unwrap_or_else(T::nan))
            }
        };
        let safety = T::from_f64_lossy(self.config.safety_factor);
        let mut h = rho(p - 1).min(rho(p)) * safety;
        let mut outcome = TaylorOutcome::Success;
        if h >= limit {
            h = limit;
            outcome = TaylorOutcome::TimeLimit;
        }
        if !h.is_finite() {
            warn!("step size {h:?} at t = {t0:?} is not finite");
            return Ok(nf);
        }
        let backward = !forward;

        // Earliest terminal event.
        let mut first: Option<(usize, Crossing<T>, T)> = None;
        for i in 0..self.t_events.len() {
            let coeffs = self.output_coeffs(dim + i);
            let ev = &self.t_events[i];
            for c in crossings(&coeffs, h, backward, ev.direction) {
                let t_abs = if forward { t0 + c.tau } else { t0 - c.tau };
                if let Some((t_last, cd)) = self.te_cooldowns[i] {
                    if (t_abs - t_last).abs() < cd {
                        continue;
                    }
                }
                if first.map_or(true, |(_, best, _)| c.tau < best.tau) {
                    first = Some((i, c, coeffs[0].abs()));
                }
                break;
            }
        }
        if let Some((i, c, _)) = first {
            h = c.tau;
            outcome = TaylorOutcome::TerminalEvent(i);
        }

        let mut hits: Vec<(T, NtEventHit<T>)> = Vec::new();
        for i in 0..self.nt_events.len() {
            let coeffs = self.output_coeffs(dim + self.t_events.len() + i);
            for c in crossings(&coeffs, h, backward, self.nt_events[i].direction) {
                let time = if forward { t0 + c.tau } else { t0 - c.tau };
                hits.push((
                    c.tau,
                    NtEventHit {
                        index: i,
                        time,
                        direction: c.direction,
                    },
                ));
            }
        }
        hits.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let hs = if forward { h } else { -h };
        let mut next = vec![T::zero(); dim];
        self.eval_step(hs, &mut next);
        if next.iter().any(|x| !x.is_finite()) {
            warn!("non-finite state after a step of {hs:?} from t = {t0:?}");
            return Ok(nf);
        }

        // Commit.
        self.state = next;
        let (hi, lo) = self.time;
        let (s, e) = two_sum(hi, hs);
        self.time = two_sum(s, lo + e);
        self.last_h = hs;
        self.last_nt_events = hits.into_iter().map(|(_, hit)| hit).collect();
        trace!("step from t = {t0:?}: h = {hs:?}, outcome {outcome:?}");

        let mut te_continue = false;
        if let Some((i, c, g_scale)) = first {
            let t_event = self.time.0;
            let cd = match self.t_events[i].cooldown {
                Some(cd) => cd,
                None => deduce_cooldown(self.tol, g_scale, c.slope, t_event),
            };
            self.te_cooldowns[i] = Some((t_event, cd));
            if let Some(cb) = self.t_events[i].callback.clone() {
                te_continue = cb(self, c.direction);
            }
        }
        for hit in self.last_nt_events.clone() {
            if let Some(cb) = self.nt_events[hit.index].callback.clone() {
                cb(self, hit.time, hit.direction);
            }
        }

        Ok(StepReport {
            outcome,
            h: hs,
            te_continue,
        })
    }

    /// One forward step with the automatically deduced size.
    pub fn step(&mut self) -> Result<(TaylorOutcome, T)> {
        let r = self.step_impl(T::infinity(), true)?;
        Ok((r.outcome, r.h))
    }

    /// One backward step with the automatically deduced size.
    pub fn step_backward(&mut self) -> Result<(TaylorOutcome, T)> {
        let r = self.step_impl(T::infinity(), false)?;
        Ok((r.outcome, r.h))
    }

    /// One step whose magnitude is bounded by `|max_delta_t|`, in the
    /// direction of its sign. Reports `TimeLimit` when the bound was hit.
    pub fn step_with(&mut self, max_delta_t: T) -> Result<(TaylorOutcome, T)> {
        if max_delta_t.is_nan() {
            return invalid("the maximum step size must not be NaN");
        }
        let forward = max_delta_t >= T::zero();
        let r = self.step_impl(max_delta_t.abs(), forward)?;
        Ok((r.outcome, r.h))
    }

    pub fn propagate_for(&mut self, delta: T, opts: PropagateOptions<T>) -> Result<PropagateResult<T>> {
        let (hi, lo) = self.time;
        let t_end = hi + (lo + delta);
        self.propagate_until(t_end, opts)
    }

    pub fn propagate_until(&mut self, t_end: T, opts: PropagateOptions<T>) -> Result<PropagateResult<T>> {
        self.propagate_core(t_end, opts, &mut |_, _| {})
    }

    /// Propagates to the last point of `grid` and returns the state at every
    /// grid point reached. The grid must be strictly monotonic and must not
    /// start behind the current time.
    ///
    /// When a terminal event stops the integration, the grid points up to
    /// and including the event time are returned.
    pub fn propagate_grid(
        &mut self,
        grid: &[T],
        opts: PropagateOptions<T>,
    ) -> Result<(PropagateResult<T>, Vec<Vec<T>>)> {
        let Some(&t_end) = grid.last() else {
            return invalid("the time grid is empty");
        };
        if grid.iter().any(|t| !t.is_finite()) {
            return invalid("the time grid contains non-finite values");
        }
        let t0 = self.time.0;
        let forward = t_end >= t0;
        let ordered = grid
            .windows(2)
            .all(|w| if forward { w[1] > w[0] } else { w[1] < w[0] });
        if !ordered {
            return invalid("the time grid must be strictly monotonic in the direction of integration");
        }
        if (forward && grid[0] < t0) || (!forward && grid[0] > t0) {
            return invalid(format!(
                "the first grid point {:?} lies behind the current time {t0:?}",
                grid[0]
            ));
        }

        let mut states: Vec<Vec<T>> = Vec::with_capacity(grid.len());
        let mut next = 0;
        while next < grid.len() && grid[next] == t0 {
            states.push(self.state.clone());
            next += 1;
        }
        let mut on_step = |ta: &mut Self, (hi, lo): (T, T)| {
            let now = ta.time.0;
            while next < grid.len() && (if forward { grid[next] <= now } else { grid[next] >= now }) {
                let mut x = vec![T::zero(); ta.state.len()];
                if grid[next] == now {
                    x.copy_from_slice(&ta.state);
                } else {
                    ta.eval_step((grid[next] - hi) - lo, &mut x);
                }
                states.push(x);
                next += 1;
            }
        };
        let res = self.propagate_core(t_end, opts, &mut on_step)?;
        Ok((res, states))
    }

    fn propagate_core(
        &mut self,
        t_end: T,
        opts: PropagateOptions<T>,
        on_step: &mut dyn FnMut(&mut Self, (T, T)),
    ) -> Result<PropagateResult<T>> {
        if t_end.is_nan() {
            return invalid("the final time must not be NaN");
        }
        let max_delta_t = opts.max_delta_t.unwrap_or_else(T::infinity);
        if !(max_delta_t > T::zero()) {
            return invalid(format!("the maximum step size must be positive, got {max_delta_t:?}"));
        }

        let (mut cb, own) = match opts.callback {
            Some(cb) => (cb, false),
            None => (std::mem::take(&mut self.callback), true),
        };
        let run = self.propagate_loop(t_end, opts.max_steps, max_delta_t, opts.c_output, &mut cb, on_step);
        let callback = if own {
            self.callback = cb;
            None
        } else {
            Some(cb)
        };
        let (outcome, min_h, max_h, n_steps, c_output) = run?;
        Ok(PropagateResult {
            outcome,
            min_h,
            max_h,
            n_steps,
            c_output,
            callback,
        })
    }

    #[allow(clippy::type_complexity)]
    fn propagate_loop(
        &mut self,
        t_end: T,
        max_steps: Option<usize>,
        max_delta_t: T,
        c_output: bool,
        cb: &mut Callback<T>,
        on_step: &mut dyn FnMut(&mut Self, (T, T)),
    ) -> Result<(TaylorOutcome, T, T, usize, Option<ContinuousOutput<T>>)> {
        cb.pre_hook(self).map_err(Error::Callback)?;

        let forward = t_end >= self.time.0;
        let mut dense = c_output.then(|| ContinuousOutput::new(self.time.0));
        let (mut min_h, mut max_h) = (T::infinity(), T::zero());
        let mut n_steps = 0;
        let outcome = loop {
            if max_steps.is_some_and(|m| n_steps >= m) {
                break TaylorOutcome::StepLimit;
            }
            let remaining = ((t_end - self.time.0) - self.time.1).abs();
            if remaining.is_zero() {
                break TaylorOutcome::TimeLimit;
            }
            let limit = remaining.min(max_delta_t);
            let t_prev = self.time;
            let report = self.step_impl(limit, forward)?;
            if report.outcome == TaylorOutcome::ErrNfState {
                break TaylorOutcome::ErrNfState;
            }
            n_steps += 1;
            min_h = min_h.min(report.h.abs());
            max_h = max_h.max(report.h.abs());

            let reached = report.outcome == TaylorOutcome::TimeLimit && limit == remaining;
            if reached {
                self.time = (t_end, T::zero());
            }
            if let Some(d) = &mut dense {
                let dim = self.state.len();
                let p = self.order as usize;
                let n = self.ir.n_entries as usize;
                let m = DMatrix::from_fn(dim, p + 1, |k, o| self.tape[o * n + k]);
                d.push(self.time.0, m);
            }
            on_step(self, t_prev);

            // every step that does not end the propagation reaches the callback
            let stops =
                matches!(report.outcome, TaylorOutcome::TerminalEvent(_)) && !report.te_continue;
            if !stops && !cb.is_empty() {
                let before = self.time;
                let keep = cb.call(self).map_err(Error::Callback)?;
                if self.time != before {
                    return Err(Error::EventProtocolViolation(format!(
                        "a step callback changed the time from {:?} to {:?}",
                        before.0, self.time.0
                    )));
                }
                if !keep {
                    break TaylorOutcome::CbStop;
                }
            }

            match report.outcome {
                TaylorOutcome::TimeLimit if reached => break TaylorOutcome::TimeLimit,
                TaylorOutcome::TerminalEvent(i) if !report.te_continue => {
                    break TaylorOutcome::TerminalEvent(i)
                }
                _ => {}
            }
        };
        debug!("propagation ended with {outcome:?} after {n_steps} steps at t = {:?}", self.time.0);
        Ok((outcome, min_h, max_h, n_steps, dense))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let data = TaylorAdaptiveData {
            sys: self.sys.clone(),
            var: self.var.clone(),
            state: self.state.clone(),
            time: self.time,
            pars: self.pars.clone(),
            tol: self.tol,
            order: self.order,
            config: self.config,
            dc: self.dc.clone(),
            ir: self.ir.clone(),
            tape: self.tape.clone(),
            t_events: self.t_events.iter().map(EventData::from).collect(),
            nt_events: self.nt_events.iter().map(EventData::from).collect(),
            te_cooldowns: self.te_cooldowns.clone(),
            last_h: self.last_h,
            last_nt_events: self.last_nt_events.clone(),
            callback: self.callback.to_data()?,
        };
        Ok(bincode::serialize(&data)?)
    }

    /// Loads an integrator written by [`to_bytes`](Self::to_bytes), running
    /// on the default backend. Event callbacks are not part of the archive.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes_with_backend(bytes, Arc::new(VmBackend))
    }

    pub fn from_bytes_with_backend(bytes: &[u8], backend: Arc<dyn JitBackend<T>>) -> Result<Self> {
        let data: TaylorAdaptiveData<T> = bincode::deserialize(bytes)?;
        data.ir
            .validate()
            .map_err(|e| Error::Serialization(e.to_string()))?;
        if data.tape.len() != data.ir.tape_len() || data.te_cooldowns.len() != data.t_events.len() {
            return Err(Error::Serialization("inconsistent integrator archive".into()));
        }
        let callback = Callback::from_data(data.callback.as_ref())?;
        Ok(Self {
            outputs: output_refs(&data.dc),
            sys: data.sys,
            var: data.var,
            state: data.state,
            time: data.time,
            pars: data.pars,
            tol: data.tol,
            order: data.order,
            config: data.config,
            dc: data.dc,
            ir: data.ir,
            backend,
            compiled: OnceCell::new(),
            tape: data.tape,
            t_events: data.t_events.into_iter().map(TEvent::from).collect(),
            nt_events: data.nt_events.into_iter().map(NtEvent::from).collect(),
            te_cooldowns: data.te_cooldowns,
            last_h: data.last_h,
            last_nt_events: data.last_nt_events,
            callback,
            coeff_buf: Vec::with_capacity(data.order as usize + 1),
        })
    }
}

impl<T: FpPolicy> std::fmt::Debug for TaylorAdaptive<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaylorAdaptive")
            .field("fp", &T::name())
            .field("state", &self.state)
            .field("time", &self.time.0)
            .field("tol", &self.tol)
            .field("order", &self.order)
            .field("dc_len", &self.dc.len())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "T: FpPolicy")]
struct TaylorAdaptiveData<T: FpPolicy> {
    sys: OdeSys,
    var: Option<VarOdeSys>,
    state: Vec<T>,
    time: (T, T),
    pars: Vec<T>,
    tol: T,
    order: u32,
    config: TaylorConfig,
    dc: TaylorDc,
    ir: IrModule,
    tape: Vec<T>,
    t_events: Vec<EventData<T>>,
    nt_events: Vec<EventData<T>>,
    te_cooldowns: Vec<Option<(T, T)>>,
    last_h: T,
    last_nt_events: Vec<NtEventHit<T>>,
    callback: Option<CallbackData>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{cos, kep_e, make_vars, par, sin, time};
    use approx::assert_relative_eq;
    use parking_lot::Mutex;
    use std::f64::consts::PI;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn oscillator() -> OdeSys {
        let [x, v] = make_vars(["x", "v"]).unwrap();
        OdeSys::new(vec![(x.clone(), v.clone()), (v, -x)]).unwrap()
    }

    #[test]
    fn construction_rejects_bad_inputs() {
        assert_err_contains(
            TaylorAdaptive::builder(oscillator(), vec![1.0]).build(),
            "dimension 2",
        );
        assert_err_contains(
            TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).tol(-1.0).build(),
            "tolerance",
        );
        let [x] = make_vars(["x"]).unwrap();
        let sys = OdeSys::new(vec![(x.clone(), par(2) * x)]).unwrap();
        assert_err_contains(
            TaylorAdaptive::builder(sys, vec![1.0]).pars(vec![1.0]).build(),
            "parameter index 2",
        );
    }

    #[test]
    fn unsupported_operators_fail_at_construction() {
        let [x] = make_vars(["x"]).unwrap();
        let sys = OdeSys::new(vec![(x.clone(), kep_e(0.1.into(), x))]).unwrap();
        let err = TaylorAdaptive::<f32>::builder(sys, vec![0.5]).build().unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }

    #[test]
    fn default_order_and_tolerance() {
        let ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
        assert_eq!(ta.tol(), f64::EPSILON);
        assert_eq!(ta.order(), 20);
        let ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).tol(1e-15).build().unwrap();
        assert_eq!(ta.order(), 19);
        let ta = TaylorAdaptive::<f32>::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
        assert_eq!(ta.order(), 9);
    }

    #[test]
    fn oscillator_matches_closed_form() {
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
        let res = ta.propagate_until(10.0, Default::default()).unwrap();
        assert_eq!(res.outcome, TaylorOutcome::TimeLimit);
        assert_eq!(ta.time(), 10.0);
        assert_relative_eq!(ta.state()[0], 10f64.cos(), epsilon = 1e-13);
        assert_relative_eq!(ta.state()[1], -10f64.sin(), epsilon = 1e-13);
        assert!(res.min_h > 0.0 && res.max_h >= res.min_h);
    }

    #[test]
    fn backward_steps_retrace_forward_ones() {
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
        let (out, h) = ta.step().unwrap();
        assert_eq!(out, TaylorOutcome::Success);
        assert!(h > 0.0);
        ta.propagate_until(0.0, Default::default()).unwrap();
        assert_eq!(ta.time(), 0.0);
        assert_relative_eq!(ta.state()[0], 1.0, epsilon = 1e-14);

        let (_, h) = ta.step_backward().unwrap();
        assert!(h < 0.0);
        assert_eq!(ta.last_h(), h);
        let (out, h) = ta.step_with(-1e-3).unwrap();
        assert_eq!(out, TaylorOutcome::TimeLimit);
        assert_eq!(h, -1e-3);
    }

    #[test]
    fn time_dependent_systems_use_the_time_entry() {
        // x' = cos(t) -> x = sin(t)
        let [x] = make_vars(["x"]).unwrap();
        let sys = OdeSys::new(vec![(x, cos(time()))]).unwrap();
        let mut ta = TaylorAdaptive::builder(sys, vec![0.0]).time(1.0).build().unwrap();
        ta.propagate_until(4.0, Default::default()).unwrap();
        assert_relative_eq!(ta.state()[0], 4f64.sin() - 1f64.sin(), epsilon = 1e-13);
    }

    #[test]
    fn non_finite_state_is_not_committed() {
        let [x] = make_vars(["x"]).unwrap();
        let sys = OdeSys::new(vec![(x.clone(), x.clone() * x)]).unwrap();
        let mut ta = TaylorAdaptive::builder(sys, vec![f64::NAN]).build().unwrap();
        let (out, h) = ta.step().unwrap();
        assert_eq!(out, TaylorOutcome::ErrNfState);
        assert_eq!(h, 0.0);
        assert_eq!(ta.time(), 0.0);
        let res = ta.propagate_until(1.0, Default::default()).unwrap();
        assert_eq!(res.outcome, TaylorOutcome::ErrNfState);
        assert_eq!(res.n_steps, 0);
    }

    #[test]
    fn terminal_event_stops_at_the_root() {
        let [x, _] = make_vars(["x", "v"]).unwrap();
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0])
            .t_event(TEvent::new(x))
            .build()
            .unwrap();
        let res = ta.propagate_until(10.0, Default::default()).unwrap();
        assert_eq!(res.outcome, TaylorOutcome::TerminalEvent(0));
        assert_relative_eq!(ta.time(), PI / 2.0, epsilon = 1e-12);
        // the cooldown keeps the same root from triggering again
        let res = ta.propagate_until(10.0, Default::default()).unwrap();
        assert_eq!(res.outcome, TaylorOutcome::TerminalEvent(0));
        assert_relative_eq!(ta.time(), 3.0 * PI / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn terminal_event_direction_and_continuation() {
        let [x, _] = make_vars(["x", "v"]).unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = hits.clone();
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0])
            .t_event(
                TEvent::<f64>::new(x)
                    .direction(EventDirection::Positive)
                    .callback(move |ta, dir| {
                        sink.lock().push((ta.time(), dir));
                        true
                    }),
            )
            .build()
            .unwrap();
        let res = ta.propagate_until(12.0, Default::default()).unwrap();
        assert_eq!(res.outcome, TaylorOutcome::TimeLimit);
        let hits = hits.lock();
        assert_eq!(hits.len(), 2);
        assert_relative_eq!(hits[0].0, 1.5 * PI, epsilon = 1e-12);
        assert_relative_eq!(hits[1].0, 3.5 * PI, epsilon = 1e-12);
        assert!(hits.iter().all(|h| h.1 == EventDirection::Positive));
    }

    #[test]
    fn step_callback_runs_on_continued_terminal_event_steps() {
        let [x, _] = make_vars(["x", "v"]).unwrap();
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0])
            .t_event(TEvent::<f64>::new(x).callback(|_, _| true))
            .build()
            .unwrap();
        let cb = Callback::from_fn(move |_: &mut TaylorAdaptive<f64>| {
            *counter.lock() += 1;
            Ok(true)
        });
        let res = ta
            .propagate_until(20.0, PropagateOptions::default().callback(cb))
            .unwrap();
        assert_eq!(res.outcome, TaylorOutcome::TimeLimit);
        assert_eq!(*calls.lock(), res.n_steps);
    }

    #[test]
    fn step_callback_skips_the_stopping_terminal_event_step() {
        let [x, _] = make_vars(["x", "v"]).unwrap();
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0])
            .t_event(TEvent::new(x))
            .build()
            .unwrap();
        let cb = Callback::from_fn(move |_: &mut TaylorAdaptive<f64>| {
            *counter.lock() += 1;
            Ok(true)
        });
        let res = ta
            .propagate_until(20.0, PropagateOptions::default().callback(cb))
            .unwrap();
        assert_eq!(res.outcome, TaylorOutcome::TerminalEvent(0));
        assert_eq!(*calls.lock(), res.n_steps - 1);
    }

    #[test]
    fn non_terminal_events_are_reported_in_time_order() {
        let [x, v] = make_vars(["x", "v"]).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0])
            .time(0.1)
            .nt_event(NtEvent::<f64>::new(x).callback(move |_, t, _| sink.lock().push(t)))
            .nt_event(NtEvent::new(v).direction(EventDirection::Positive))
            .build()
            .unwrap();
        ta.propagate_until(7.0, Default::default()).unwrap();
        let seen = seen.lock();
        let expected: Vec<f64> = [0.5, 1.5].iter().map(|k| k * PI + 0.1).collect();
        assert_eq!(seen.len(), expected.len());
        for (s, e) in seen.iter().zip(&expected) {
            assert_relative_eq!(*s, *e, epsilon = 1e-12);
        }
    }

    #[test]
    fn step_limit_and_max_delta_t() {
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
        let res = ta
            .propagate_until(100.0, PropagateOptions::default().max_steps(3))
            .unwrap();
        assert_eq!(res.outcome, TaylorOutcome::StepLimit);
        assert_eq!(res.n_steps, 3);

        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
        let res = ta
            .propagate_until(1.0, PropagateOptions::default().max_delta_t(0.1))
            .unwrap();
        assert_eq!(res.outcome, TaylorOutcome::TimeLimit);
        assert!(res.n_steps >= 10);
        assert!(res.max_h <= 0.1);
    }

    #[test]
    fn grid_states_match_closed_form() {
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
        let grid: Vec<f64> = (0..=20).map(|i| i as f64 * 0.5).collect();
        let (res, states) = ta.propagate_grid(&grid, Default::default()).unwrap();
        assert_eq!(res.outcome, TaylorOutcome::TimeLimit);
        assert_eq!(states.len(), grid.len());
        for (t, s) in grid.iter().zip(&states) {
            assert_relative_eq!(s[0], t.cos(), epsilon = 1e-13);
        }
        assert_err_contains(ta.propagate_grid(&[11.0, 10.5], Default::default()), "monotonic");
        assert_err_contains(ta.propagate_grid(&[], Default::default()), "empty");
    }

    #[test]
    fn grid_offsets_use_the_full_step_start_time() {
        // x' = 1 far from the origin, with steps that leave a low word in the time
        let [x] = make_vars(["x"]).unwrap();
        let sys = OdeSys::new(vec![(x, 1.0.into())]).unwrap();
        let t0 = 1e8;
        let mut ta = TaylorAdaptive::builder(sys, vec![0.0]).time(t0).build().unwrap();
        let grid: Vec<f64> = [0.25, 0.55, 0.95, 1.35].iter().map(|d| t0 + d).collect();
        let (res, states) = ta
            .propagate_grid(&grid, PropagateOptions::default().max_delta_t(0.1))
            .unwrap();
        assert_eq!(res.outcome, TaylorOutcome::TimeLimit);
        for (t, s) in grid.iter().zip(&states) {
            assert_relative_eq!(s[0], t - t0, epsilon = 1e-12);
        }
    }

    #[test]
    fn grid_stops_at_terminal_event() {
        let [x, _] = make_vars(["x", "v"]).unwrap();
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0])
            .t_event(TEvent::new(x))
            .build()
            .unwrap();
        let grid = [0.0, 1.0, PI / 2.0, 2.0];
        let (res, states) = ta.propagate_grid(&grid, Default::default()).unwrap();
        assert_eq!(res.outcome, TaylorOutcome::TerminalEvent(0));
        assert!(states.len() >= 2);
        assert_relative_eq!(states[1][0], 1f64.cos(), epsilon = 1e-13);
        assert!(states.len() <= 3);
    }

    #[test]
    fn continuous_output_interpolates() {
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
        let res = ta
            .propagate_until(5.0, PropagateOptions::default().c_output(true))
            .unwrap();
        let c = res.c_output.unwrap();
        assert_eq!(c.n_steps(), res.n_steps);
        for t in [0.0_f64, 0.3, 2.2, 4.99, 5.0] {
            assert_relative_eq!(c.eval(t).unwrap()[0], t.cos(), epsilon = 1e-13);
        }
    }

    #[test]
    fn callback_changing_time_is_a_protocol_violation() {
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
        let cb = Callback::from_fn(|ta: &mut TaylorAdaptive<f64>| {
            let t = ta.time();
            ta.set_time(t + 1.0);
            Ok(true)
        });
        let err = ta
            .propagate_until(1.0, PropagateOptions::default().callback(cb))
            .unwrap_err();
        assert!(matches!(err, Error::EventProtocolViolation(_)));
    }

    #[test]
    fn callback_errors_propagate_unchanged() {
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0]).build().unwrap();
        let cb = Callback::from_fn(|_: &mut TaylorAdaptive<f64>| Err(anyhow::anyhow!("boom")));
        ta.set_callback(cb);
        let err = ta.propagate_until(1.0, Default::default()).unwrap_err();
        match err {
            Error::Callback(e) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected error {other:?}"),
        }
        // the integrator keeps its callback and its last committed step
        assert!(!ta.callback().is_empty());
        assert!(ta.time() > 0.0);
    }

    #[test]
    fn angle_reducer_wraps_state() {
        let [th] = make_vars(["th"]).unwrap();
        let sys = OdeSys::new(vec![(th.clone(), 1.0.into())]).unwrap();
        let mut ta = TaylorAdaptive::builder(sys, vec![0.0])
            .callback(Callback::new(AngleReducer::new([th]).unwrap()))
            .build()
            .unwrap();
        ta.propagate_until(10.0, Default::default()).unwrap();
        assert_relative_eq!(ta.state()[0], 10.0 - 2.0 * PI, epsilon = 1e-12);
    }

    #[test]
    fn high_accuracy_and_compact_modes_agree() {
        let [x, v] = make_vars(["x", "v"]).unwrap();
        let sys = OdeSys::new(vec![(x.clone(), v.clone()), (v, -sin(x))]).unwrap();
        let mut a = TaylorAdaptive::builder(sys.clone(), vec![1.0, 0.0]).build().unwrap();
        let mut b = TaylorAdaptive::builder(sys, vec![1.0, 0.0])
            .compact_mode(true)
            .high_accuracy(true)
            .build()
            .unwrap();
        a.propagate_until(20.0, Default::default()).unwrap();
        b.propagate_until(20.0, Default::default()).unwrap();
        assert_relative_eq!(a.state()[0], b.state()[0], epsilon = 1e-12);
        assert_relative_eq!(a.state()[1], b.state()[1], epsilon = 1e-12);
    }

    #[test]
    fn archive_round_trip() {
        let [x, _] = make_vars(["x", "v"]).unwrap();
        let mut ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0])
            .t_event(TEvent::new(x).cooldown(1e-6))
            .callback(Callback::new(CallbackSet::new(vec![])))
            .build()
            .unwrap();
        ta.propagate_until(3.0, Default::default()).unwrap();
        let bytes = ta.to_bytes().unwrap();
        let mut back = TaylorAdaptive::<f64>::from_bytes(&bytes).unwrap();
        assert_eq!(back.state(), ta.state());
        assert_eq!(back.time_dfloat(), ta.time_dfloat());
        assert_eq!(back.order(), ta.order());
        assert_eq!(back.tol(), ta.tol());
        assert_eq!(back.decomposition(), ta.decomposition());
        assert_eq!(back.ir(), ta.ir());
        assert_eq!(back.last_h(), ta.last_h());
        assert_eq!(back.taylor_coefficient(0, 3), ta.taylor_coefficient(0, 3));
        assert_eq!(back.callback().tag(), ta.callback().tag());

        ta.propagate_until(6.0, Default::default()).unwrap();
        back.propagate_until(6.0, Default::default()).unwrap();
        assert_eq!(back.state(), ta.state());

        assert!(TaylorAdaptive::<f64>::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn closures_block_serialization() {
        let ta = TaylorAdaptive::builder(oscillator(), vec![1.0, 0.0])
            .callback(Callback::from_fn(|_| Ok(true)))
            .build()
            .unwrap();
        assert!(matches!(ta.to_bytes(), Err(Error::Serialization(_))));
    }
}
