//! Settings and results of the adaptive Taylor integrator.

use super::callback::Callback;
use super::continuous::ContinuousOutput;
use crate::error::{invalid, Result};
use crate::traits::FpPolicy;
use serde::{Deserialize, Serialize};

/// Settings of a Taylor integrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaylorConfig {
    /// Defaults to the machine epsilon of the fp policy.
    pub tol: Option<f64>,
    /// Defaults to `ceil(-ln(tol) / 2 + 1)`.
    pub order: Option<u32>,
    /// Per-operator kernels looped over the decomposition instead of fully
    /// unrolled code.
    pub compact_mode: bool,
    /// Compensated state update and time accumulation.
    pub high_accuracy: bool,
    pub safety_factor: f64,
    /// Sums with more terms are split before decomposition.
    pub sum_split: usize,
}

impl Default for TaylorConfig {
    fn default() -> Self {
        Self {
            tol: None,
            order: None,
            compact_mode: false,
            high_accuracy: false,
            safety_factor: 0.9,
            sum_split: 8,
        }
    }
}

pub const MIN_ORDER: u32 = 2;
pub const MAX_ORDER: u32 = 255;

impl TaylorConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(tol) = self.tol {
            if !(tol.is_finite() && tol > 0.0) {
                return invalid(format!("the tolerance must be positive and finite, got {tol}"));
            }
        }
        if let Some(order) = self.order {
            if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
                return invalid(format!(
                    "the Taylor order must be between {MIN_ORDER} and {MAX_ORDER}, got {order}"
                ));
            }
        }
        if !(self.safety_factor > 0.0 && self.safety_factor <= 1.0) {
            return invalid(format!(
                "the safety factor must lie in (0, 1], got {}",
                self.safety_factor
            ));
        }
        if self.sum_split < 2 {
            return invalid(format!("sum_split must be at least 2, got {}", self.sum_split));
        }
        Ok(())
    }
}

/// Order derived from a tolerance.
pub fn default_order(tol: f64) -> u32 {
    let p = (-tol.ln() / 2.0 + 1.0).ceil();
    if p.is_finite() {
        p.max(MIN_ORDER as f64) as u32
    } else {
        MIN_ORDER
    }
}

/// How a step or a propagation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaylorOutcome {
    Success,
    TimeLimit,
    StepLimit,
    CbStop,
    ErrNfState,
    /// Index of the terminal event among the terminal events.
    TerminalEvent(usize),
}

/// Direction of a zero crossing, or the crossings an event reacts to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventDirection {
    #[default]
    Any,
    Positive,
    Negative,
}

impl EventDirection {
    pub fn accepts(self, crossing: EventDirection) -> bool {
        self == EventDirection::Any || self == crossing
    }
}

/// A non-terminal event triggered during the last step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: FpPolicy")]
pub struct NtEventHit<T: FpPolicy> {
    pub index: usize,
    pub time: T,
    pub direction: EventDirection,
}

/// Options of the `propagate_*` family.
pub struct PropagateOptions<T: FpPolicy> {
    pub max_steps: Option<usize>,
    /// Upper bound on the magnitude of every step.
    pub max_delta_t: Option<T>,
    /// Replaces the integrator's own callback for this call.
    pub callback: Option<Callback<T>>,
    /// Records the Taylor coefficients of every step.
    pub c_output: bool,
}

impl<T: FpPolicy> Default for PropagateOptions<T> {
    fn default() -> Self {
        Self {
            max_steps: None,
            max_delta_t: None,
            callback: None,
            c_output: false,
        }
    }
}

impl<T: FpPolicy> PropagateOptions<T> {
    pub fn max_steps(mut self, n: usize) -> Self {
        self.max_steps = Some(n);
        self
    }

    pub fn max_delta_t(mut self, dt: T) -> Self {
        self.max_delta_t = Some(dt);
        self
    }

    pub fn callback(mut self, cb: Callback<T>) -> Self {
        self.callback = Some(cb);
        self
    }

    pub fn c_output(mut self, on: bool) -> Self {
        self.c_output = on;
        self
    }
}

pub struct PropagateResult<T: FpPolicy> {
    pub outcome: TaylorOutcome,
    /// Smallest and largest step magnitudes, infinite and zero when no step
    /// was taken.
    pub min_h: T,
    pub max_h: T,
    pub n_steps: usize,
    pub c_output: Option<ContinuousOutput<T>>,
    /// The callback given in the options, handed back.
    pub callback: Option<Callback<T>>,
}

impl<T: FpPolicy> std::fmt::Debug for PropagateResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagateResult")
            .field("outcome", &self.outcome)
            .field("min_h", &self.min_h)
            .field("max_h", &self.max_h)
            .field("n_steps", &self.n_steps)
            .finish_non_exhaustive()
    }
}
