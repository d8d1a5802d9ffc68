//! Variational equations.
//!
//! For `x_k' = f_k(x, p, t)` and a list of arguments drawn from the initial
//! state, the parameters and the initial time, [`VarOdeSys`] adds one state
//! variable per partial derivative `∂^m x_k / ∂a^m` of total order `1..=K`,
//! named `∂[(i, e), ...]x_k` after the non-zero entries of the multi-index.
//!
//! Equations are built order by order: the right-hand side for `m` is the
//! total derivative, with respect to one argument, of the right-hand side
//! for `m - e_a`. Initial conditions follow the same recursion on the
//! identity map `x_k(t0) = x0_k`.

use crate::error::{invalid, Error, Result};
use crate::expression::{
    diff, get_variables, gradient, mul, normalise, subs, sum, time, Expression, Variable,
    VARIATIONAL_PREFIX,
};
use crate::ode::OdeSys;
use crate::parallel::try_parallel_map;
use crate::traits::Scalar;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Range;

/// Argument of the variational equations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarArg {
    /// Initial value of a state variable.
    Var(Variable),
    Param(u32),
    /// Initial time.
    Time,
}

impl VarArg {
    /// Every state variable of `sys`, in state order.
    pub fn all_vars(sys: &OdeSys) -> Vec<VarArg> {
        sys.state_vars().iter().cloned().map(VarArg::Var).collect()
    }
}

/// Multi-indices over `n_args` arguments with total order `order`, in
/// decreasing lexicographic order.
fn multi_indices(n_args: usize, order: u32) -> Vec<Vec<u32>> {
    fn rec(pos: usize, left: u32, cur: &mut Vec<u32>, out: &mut Vec<Vec<u32>>) {
        if pos + 1 == cur.len() {
            cur[pos] = left;
            out.push(cur.clone());
            return;
        }
        for e in (0..=left).rev() {
            cur[pos] = e;
            rec(pos + 1, left - e, cur, out);
        }
    }
    let mut out = Vec::new();
    if n_args > 0 {
        rec(0, order, &mut vec![0; n_args], &mut out);
    }
    out
}

fn var_name(base: &Variable, m: &[u32]) -> String {
    let parts: Vec<String> = m
        .iter()
        .enumerate()
        .filter(|(_, e)| **e > 0)
        .map(|(i, e)| format!("({i},{e})"))
        .collect();
    format!("{VARIATIONAL_PREFIX}[{}]{}", parts.join(","), base.name())
}

/// An ODE system augmented with its variational equations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarOdeSys {
    sys: OdeSys,
    n_orig: usize,
    args: Vec<VarArg>,
    order: u32,
    /// Component and multi-index of every state variable; the original
    /// variables carry the zero index.
    mindices: Vec<(usize, Vec<u32>)>,
    /// Initial value of every state variable in terms of the original
    /// state, the parameters and time.
    ics: Vec<Expression>,
}

impl VarOdeSys {
    pub fn new(sys: &OdeSys, args: Vec<VarArg>, order: u32) -> Result<Self> {
        if order == 0 {
            return invalid("the variational order must be at least 1");
        }
        if args.is_empty() {
            return invalid("the variational equations need at least one argument");
        }
        let mut seen = HashSet::new();
        for a in &args {
            if !seen.insert(a) {
                return invalid(format!("duplicate variational argument {a:?}"));
            }
            if let VarArg::Var(v) = a {
                if sys.index_of(v).is_none() {
                    return invalid(format!("'{v}' is not a state variable of the system"));
                }
            }
        }
        if let Some(v) = sys.state_vars().iter().find(|v| v.is_variational()) {
            return invalid(format!(
                "the state variable '{v}' uses the prefix reserved for variational variables"
            ));
        }

        let dim = sys.dimension();
        let n_args = args.len();
        let state = sys.state_vars();
        let arg_exprs: Vec<Option<Expression>> = args
            .iter()
            .map(|a| match a {
                VarArg::Var(v) => Some(Expression::Variable(v.clone())),
                VarArg::Param(p) => Some(Expression::par(*p)),
                VarArg::Time => None,
            })
            .collect();

        let mut mindices: Vec<(usize, Vec<u32>)> = (0..dim).map(|k| (k, vec![0; n_args])).collect();
        let mut names: Vec<Variable> = state.to_vec();
        let mut rhs: Vec<Expression> = sys.rhs().to_vec();
        let mut ics: Vec<Expression> = state.iter().cloned().map(Expression::Variable).collect();
        let mut lookup: HashMap<(usize, Vec<u32>), usize> = HashMap::new();
        let mut by_name: HashMap<Variable, usize> = HashMap::new();
        for k in 0..dim {
            lookup.insert((k, vec![0; n_args]), k);
            by_name.insert(state[k].clone(), k);
        }

        for j in 1..=order {
            let layer: Vec<(usize, Vec<u32>)> = multi_indices(n_args, j)
                .into_iter()
                .flat_map(|m| (0..dim).map(move |k| (k, m.clone())))
                .collect();
            let start = names.len();
            for (i, (k, m)) in layer.iter().enumerate() {
                let v = Variable::new(var_name(&state[*k], m))?;
                lookup.insert((*k, m.clone()), start + i);
                by_name.insert(v.clone(), start + i);
                names.push(v);
                mindices.push((*k, m.clone()));
            }

            let built = try_parallel_map(layer.len(), |i| -> Result<(Expression, Expression)> {
                let (k, m) = &layer[i];
                let a = m.iter().position(|e| *e > 0).unwrap_or(0);
                let mut parent = m.clone();
                parent[a] -= 1;
                let p = lookup[&(*k, parent)];
                let bump = |idx: usize| -> Option<Expression> {
                    let (kk, mm) = &mindices[idx];
                    let mut mm = mm.clone();
                    mm[a] += 1;
                    lookup
                        .get(&(*kk, mm))
                        .map(|&i| Expression::Variable(names[i].clone()))
                };
                let rhs_m = total_derivative(&rhs[p], arg_exprs[a].as_ref(), &by_name, &bump)?;

                let ic_m = match &args[a] {
                    VarArg::Var(_) | VarArg::Param(_) => {
                        let arg = arg_exprs[a].as_ref().ok_or_else(|| {
                            Error::InvalidInput("missing variational argument".into())
                        })?;
                        diff(&ics[p], arg)?
                    }
                    VarArg::Time => {
                        let at_t0: HashMap<Expression, Expression> = names[..start]
                            .iter()
                            .zip(&ics)
                            .map(|(n, ic)| (Expression::Variable(n.clone()), ic.clone()))
                            .collect();
                        let flow = normalise(&subs(&rhs[p], &at_t0))?;
                        normalise(&(diff(&ics[p], &time())? - flow))?
                    }
                };
                Ok((rhs_m, ic_m))
            })?;
            for (r, ic) in built {
                rhs.push(r);
                ics.push(ic);
            }
        }

        let equations = names
            .iter()
            .cloned()
            .map(Expression::Variable)
            .zip(rhs)
            .collect();
        let augmented = OdeSys::new(equations)?;
        debug!(
            "variational system of order {order} over {n_args} arguments: {} equations",
            augmented.dimension()
        );
        Ok(Self {
            sys: augmented,
            n_orig: dim,
            args,
            order,
            mindices,
            ics,
        })
    }

    /// The augmented system.
    pub fn sys(&self) -> &OdeSys {
        &self.sys
    }

    pub fn n_orig(&self) -> usize {
        self.n_orig
    }

    pub fn n_eq(&self) -> usize {
        self.sys.dimension()
    }

    pub fn args(&self) -> &[VarArg] {
        &self.args
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    /// Component and multi-index of state variable `i`.
    pub fn mindex(&self, i: usize) -> Option<(usize, &[u32])> {
        self.mindices.get(i).map(|(k, m)| (*k, m.as_slice()))
    }

    /// Position of `∂^m x_k` in the augmented state.
    pub fn index_of(&self, k: usize, m: &[u32]) -> Option<usize> {
        self.mindices.iter().position(|(kk, mm)| *kk == k && mm.as_slice() == m)
    }

    /// State indices of the derivatives of total order `j`.
    pub fn order_range(&self, j: u32) -> Range<usize> {
        let start = self
            .mindices
            .iter()
            .position(|(_, m)| m.iter().sum::<u32>() >= j)
            .unwrap_or(self.mindices.len());
        let end = self
            .mindices
            .iter()
            .position(|(_, m)| m.iter().sum::<u32>() > j)
            .unwrap_or(self.mindices.len());
        start..end.max(start)
    }

    /// Symbolic initial values of the augmented state.
    pub fn ics(&self) -> &[Expression] {
        &self.ics
    }

    /// Augmented initial state from the original one.
    pub fn initial_state<T: Scalar>(&self, x0: &[T], pars: &[T], t0: T) -> Result<Vec<T>> {
        if x0.len() != self.n_orig {
            return invalid(format!(
                "expected {} initial values, got {}",
                self.n_orig,
                x0.len()
            ));
        }
        let vars: HashMap<Variable, T> = self.sys.state_vars()[..self.n_orig]
            .iter()
            .cloned()
            .zip(x0.iter().copied())
            .collect();
        self.ics.iter().map(|ic| ic.eval(&vars, pars, t0)).collect()
    }
}

/// `D_a E = Σ_s ∂E/∂s · ∂s/∂a + ∂E/∂a`, where `s` ranges over the state
/// variables in `E` and `∂s/∂a` is the variational variable one order up.
fn total_derivative(
    e: &Expression,
    arg: Option<&Expression>,
    by_name: &HashMap<Variable, usize>,
    bump: &dyn Fn(usize) -> Option<Expression>,
) -> Result<Expression> {
    let vars: Vec<Variable> = get_variables(e);
    let mut wrt: Vec<Expression> = vars.iter().cloned().map(Expression::Variable).collect();
    let direct = matches!(arg, Some(Expression::Param(_)));
    if let (true, Some(a)) = (direct, arg) {
        wrt.push(a.clone());
    }
    let grads = gradient(e, &wrt)?;

    let mut terms = Vec::with_capacity(grads.len());
    for (v, g) in vars.iter().zip(&grads) {
        if g.is_zero() {
            continue;
        }
        let idx = by_name.get(v).copied().ok_or_else(|| {
            Error::InvalidInput(format!("'{v}' is not a variable of the variational system"))
        })?;
        let dv = bump(idx).ok_or_else(|| {
            Error::InvalidInput(format!("no variational variable above '{v}'"))
        })?;
        terms.push(mul(g.clone(), dv));
    }
    if direct {
        if let Some(g) = grads.last() {
            terms.push(g.clone());
        }
    }
    Ok(sum(terms))
}
