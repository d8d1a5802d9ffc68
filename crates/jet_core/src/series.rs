//! Construction of Poisson series
//!
//! ```text
//! Σ_α t^α Σ_i (S_αi sin φ_αi + C_αi cos φ_αi),   φ_αi = Σ_j m_αij λ_j
//! ```
//!
//! from tables of coefficients and integer multipliers over a set of
//! fundamental arguments `λ_j` (typically linear in time). This is the shape
//! of analytical planetary theories; the tables themselves are supplied by
//! the caller.

use crate::error::{invalid, Result};
use crate::expression::{cos, mul, pow, sin, sum, Expression};
use crate::parallel::try_parallel_map;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row of a Poisson series table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoissonTerm {
    /// Power of time multiplying the term.
    pub t_power: u32,
    pub sin_coeff: f64,
    pub cos_coeff: f64,
    /// Integer multipliers of the fundamental arguments.
    pub multipliers: Vec<i32>,
}

impl PoissonTerm {
    pub fn amplitude(&self) -> f64 {
        self.sin_coeff.hypot(self.cos_coeff)
    }
}

/// `c0 + c1 * t`.
pub fn linear_argument(c0: f64, c1: f64, t: &Expression) -> Expression {
    sum(vec![c0.into(), mul(c1.into(), t.clone())])
}

/// Terms whose amplitude, weighted by `t_scale^t_power`, reaches `threshold`.
pub fn truncate_terms(terms: &[PoissonTerm], threshold: f64, t_scale: f64) -> Vec<PoissonTerm> {
    terms
        .iter()
        .filter(|term| term.amplitude() * t_scale.abs().powi(term.t_power as i32) >= threshold)
        .cloned()
        .collect()
}

fn phase(multipliers: &[i32], args: &[Expression]) -> Expression {
    sum(multipliers
        .iter()
        .zip(args)
        .filter(|(m, _)| **m != 0)
        .map(|(m, a)| mul(f64::from(*m).into(), a.clone()))
        .collect())
}

fn term_expression(term: &PoissonTerm, args: &[Expression]) -> Expression {
    let phi = phase(&term.multipliers, args);
    let mut parts = Vec::with_capacity(2);
    if term.sin_coeff != 0.0 {
        parts.push(mul(term.sin_coeff.into(), sin(phi.clone())));
    }
    if term.cos_coeff != 0.0 {
        parts.push(mul(term.cos_coeff.into(), cos(phi)));
    }
    sum(parts)
}

/// Builds the series over `args` in the time expression `t`.
///
/// Terms are built in parallel; the result does not depend on the schedule.
pub fn poisson_series(terms: &[PoissonTerm], args: &[Expression], t: &Expression) -> Result<Expression> {
    for (i, term) in terms.iter().enumerate() {
        if term.multipliers.len() != args.len() {
            return invalid(format!(
                "term {i} has {} multipliers for {} fundamental arguments",
                term.multipliers.len(),
                args.len()
            ));
        }
        if !(term.sin_coeff.is_finite() && term.cos_coeff.is_finite()) {
            return invalid(format!("term {i} has non-finite coefficients"));
        }
    }

    let mut by_power: BTreeMap<u32, Vec<&PoissonTerm>> = BTreeMap::new();
    for term in terms {
        by_power.entry(term.t_power).or_default().push(term);
    }

    let mut groups = Vec::with_capacity(by_power.len());
    for (power, group) in by_power {
        let built = try_parallel_map::<_, crate::error::Error, _>(group.len(), |i| {
            Ok(term_expression(group[i], args))
        })?;
        let inner = sum(built);
        groups.push(match power {
            0 => inner,
            1 => mul(t.clone(), inner),
            p => mul(pow(t.clone(), f64::from(p).into()), inner),
        });
    }
    debug!("poisson series: {} terms in {} time powers", terms.len(), groups.len());
    Ok(sum(groups))
}
