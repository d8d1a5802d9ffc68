//! Validated ODE systems `x_k' = f_k(x, p, t)`.

use crate::error::{invalid, Result};
use crate::expression::{get_params, get_variables, has_time, Expression, Variable};
use crate::traits::{DynamicalSystem, Scalar};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// An ordered list of `(state variable, right-hand side)` pairs.
///
/// Construction rejects empty systems, duplicate state variables, left-hand
/// sides that are not variables, elementary names (`u_<digits>`), and
/// right-hand sides referring to variables outside the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdeSys {
    state: Vec<Variable>,
    rhs: Vec<Expression>,
}

impl OdeSys {
    pub fn new(equations: Vec<(Expression, Expression)>) -> Result<Self> {
        if equations.is_empty() {
            return invalid("an ODE system needs at least one equation");
        }

        let mut state = Vec::with_capacity(equations.len());
        let mut rhs = Vec::with_capacity(equations.len());
        let mut seen = HashSet::new();
        for (lhs, f) in equations {
            let Expression::Variable(v) = lhs else {
                return invalid(format!(
                    "the left-hand side of an equation must be a variable, got '{lhs}'"
                ));
            };
            if v.is_elementary() {
                return invalid(format!(
                    "the state variable name '{v}' is reserved for internal use"
                ));
            }
            if !seen.insert(v.clone()) {
                return invalid(format!("duplicate state variable '{v}'"));
            }
            state.push(v);
            rhs.push(f);
        }

        for f in &rhs {
            if let Some(unknown) = get_variables(f).into_iter().find(|v| !seen.contains(v)) {
                return invalid(format!(
                    "the right-hand side '{f}' refers to the variable '{unknown}', which is not a state variable"
                ));
            }
        }

        Ok(Self { state, rhs })
    }

    pub fn dimension(&self) -> usize {
        self.state.len()
    }

    pub fn state_vars(&self) -> &[Variable] {
        &self.state
    }

    pub fn rhs(&self) -> &[Expression] {
        &self.rhs
    }

    pub fn equations(&self) -> impl Iterator<Item = (&Variable, &Expression)> {
        self.state.iter().zip(&self.rhs)
    }

    /// Position of `v` in the state vector.
    pub fn index_of(&self, v: &Variable) -> Option<usize> {
        self.state.iter().position(|s| s == v)
    }

    /// Length of the smallest parameter vector covering every referenced index.
    pub fn n_params(&self) -> usize {
        self.rhs
            .iter()
            .flat_map(get_params)
            .map(|p| p.index() as usize + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn is_autonomous(&self) -> bool {
        !self.rhs.iter().any(has_time)
    }

    /// Reference evaluator of the right-hand sides.
    pub fn evaluator<'a, T: Scalar>(&'a self, pars: &'a [T]) -> OdeRhs<'a, T> {
        OdeRhs { sys: self, pars }
    }
}

/// Direct evaluation of an [`OdeSys`] through the expression evaluator.
/// Evaluation failures (e.g. missing parameters) produce NaN components.
pub struct OdeRhs<'a, T: Scalar> {
    sys: &'a OdeSys,
    pars: &'a [T],
}

impl<T: Scalar> DynamicalSystem<T> for OdeRhs<'_, T> {
    fn dimension(&self) -> usize {
        self.sys.dimension()
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        let vars: HashMap<Variable, T> = self
            .sys
            .state
            .iter()
            .cloned()
            .zip(x.iter().copied())
            .collect();
        for (slot, f) in out.iter_mut().zip(&self.sys.rhs) {
            *slot = f.eval(&vars, self.pars, t).unwrap_or_else(|_| T::nan());
        }
    }
}
