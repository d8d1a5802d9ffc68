//! Dense output over a completed propagation.

use super::poly::horner;
use crate::error::{invalid, Result};
use crate::traits::FpPolicy;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// The Taylor polynomials of every step of a propagation.
///
/// Step `i` spans `[times[i], times[i + 1]]` and its coefficients are the
/// columns of `coeffs[i]` (one row per state component, one column per
/// order), expanded around `times[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: FpPolicy")]
pub struct ContinuousOutput<T: FpPolicy> {
    times: Vec<T>,
    coeffs: Vec<DMatrix<T>>,
}

impl<T: FpPolicy> ContinuousOutput<T> {
    pub(crate) fn new(t0: T) -> Self {
        Self {
            times: vec![t0],
            coeffs: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, t_end: T, coeffs: DMatrix<T>) {
        self.times.push(t_end);
        self.coeffs.push(coeffs);
    }

    pub fn times(&self) -> &[T] {
        &self.times
    }

    pub fn n_steps(&self) -> usize {
        self.coeffs.len()
    }

    /// Covered time range, lower bound first.
    pub fn bounds(&self) -> (T, T) {
        let first = self.times[0];
        let last = self.times[self.times.len() - 1];
        (first.min(last), first.max(last))
    }

    fn forward(&self) -> bool {
        self.times[self.times.len() - 1] >= self.times[0]
    }

    /// State at time `t`.
    pub fn eval(&self, t: T) -> Result<DVector<T>> {
        let (lo, hi) = self.bounds();
        if self.coeffs.is_empty() || !(t >= lo && t <= hi) {
            return invalid(format!(
                "time {t:?} is outside the continuous output range [{lo:?}, {hi:?}]"
            ));
        }
        // First boundary past `t` in the direction of integration.
        let forward = self.forward();
        let upper = self.times[1..].partition_point(|&b| if forward { b < t } else { b > t });
        let step = upper.min(self.coeffs.len() - 1);
        let m = &self.coeffs[step];
        let dt = t - self.times[step];
        let mut buf = Vec::with_capacity(m.ncols());
        Ok(DVector::from_fn(m.nrows(), |k, _| {
            buf.clear();
            buf.extend(m.row(k).iter().copied());
            horner(&buf, dt)
        }))
    }
}
