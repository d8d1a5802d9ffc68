//! Symbolic differentiation.

use super::ops::{mul, sum};
use super::Expression;
use crate::error::{Error, Result};
use std::collections::HashMap;

fn check_diff_arg(arg: &Expression) -> Result<()> {
    match arg {
        Expression::Variable(_) | Expression::Param(_) | Expression::Time => Ok(()),
        other => Err(Error::InvalidInput(format!(
            "cannot differentiate with respect to '{other}': expected a variable, a parameter or time"
        ))),
    }
}

/// Derivative of `e` with respect to a variable, a parameter or time.
///
/// Forward mode: each function node delegates to its operator gradient and
/// the chain rule. Derivatives of structurally equal subterms are computed
/// once.
pub fn diff(e: &Expression, arg: &Expression) -> Result<Expression> {
    check_diff_arg(arg)?;
    let mut cache = HashMap::new();
    Ok(diff_cached(e, arg, &mut cache))
}

/// [`diff`] with a caller-owned cache, for repeated derivatives of related
/// expressions with respect to the same argument.
pub(crate) fn diff_cached(
    e: &Expression,
    arg: &Expression,
    cache: &mut HashMap<Expression, Expression>,
) -> Expression {
    let Expression::Func(f) = e else {
        return if e == arg {
            Expression::one()
        } else {
            Expression::zero()
        };
    };
    if let Some(d) = cache.get(e) {
        return d.clone();
    }

    let darg: Vec<Expression> = f
        .args()
        .iter()
        .map(|a| diff_cached(a, arg, cache))
        .collect();
    let result = if darg.iter().all(Expression::is_zero) {
        Expression::zero()
    } else {
        let grad = f.op().gradient(f.args(), e);
        let terms = grad
            .into_iter()
            .zip(darg)
            .filter(|(_, d)| !d.is_zero())
            .map(|(g, d)| mul(g, d))
            .collect();
        sum(terms)
    };
    cache.insert(e.clone(), result.clone());
    result
}

/// Derivatives of `e` with respect to each of `args`, by reverse accumulation
/// over the DAG. Adjoint contributions are collected per node and summed once
/// all consumers have been processed.
pub fn gradient(e: &Expression, args: &[Expression]) -> Result<Vec<Expression>> {
    for a in args {
        check_diff_arg(a)?;
    }

    // post-order list of unique function nodes
    let mut order: Vec<Expression> = Vec::new();
    let mut seen: HashMap<usize, ()> = HashMap::new();
    let mut stack: Vec<(Expression, bool)> = vec![(e.clone(), false)];
    while let Some((node, expanded)) = stack.pop() {
        let Some(id) = node.node_id() else { continue };
        if expanded {
            order.push(node);
            continue;
        }
        if seen.insert(id, ()).is_some() {
            continue;
        }
        stack.push((node.clone(), true));
        if let Expression::Func(f) = &node {
            for a in f.args().iter().rev() {
                if a.node_id().is_some_and(|i| !seen.contains_key(&i)) {
                    stack.push((a.clone(), false));
                }
            }
        }
    }

    let mut adjoints: HashMap<usize, Vec<Expression>> = HashMap::new();
    let mut atom_adjoints: Vec<Vec<Expression>> = vec![Vec::new(); args.len()];
    let seed = Expression::one();
    match e.node_id() {
        Some(id) => {
            adjoints.insert(id, vec![seed]);
        }
        None => {
            for (i, a) in args.iter().enumerate() {
                if a == e {
                    atom_adjoints[i].push(seed.clone());
                }
            }
        }
    }

    for node in order.iter().rev() {
        let Expression::Func(f) = node else { continue };
        let adj = sum(adjoints.remove(&f.node_id()).unwrap_or_default());
        if adj.is_zero() {
            continue;
        }
        let grad = f.op().gradient(f.args(), node);
        for (a, g) in f.args().iter().zip(grad) {
            if a.is_number() {
                continue;
            }
            let contrib = mul(adj.clone(), g);
            if contrib.is_zero() {
                continue;
            }
            match a.node_id() {
                Some(id) => adjoints.entry(id).or_default().push(contrib),
                None => {
                    for (i, target) in args.iter().enumerate() {
                        if target == a {
                            atom_adjoints[i].push(contrib.clone());
                        }
                    }
                }
            }
        }
    }

    Ok(atom_adjoints.into_iter().map(sum).collect())
}

#[cfg(test)]
mod tests {
    use super::super::ops::{atan2, cos, div, exp, kep_e, log, neg, pow, sin, sqrt, square};
    use super::super::{make_vars, par, time, Variable};
    use super::*;
    use approx::assert_relative_eq;

    fn at(pairs: &[(&str, f64)]) -> HashMap<Variable, f64> {
        pairs
            .iter()
            .map(|(n, v)| (Variable::new(n).unwrap(), *v))
            .collect()
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected an error");
        assert!(
            format!("{err}").contains(needle),
            "error '{err}' does not contain '{needle}'"
        );
    }

    #[test]
    fn derivative_of_numbers_is_zero() {
        let [x] = make_vars(["x"]).unwrap();
        for v in [0.0, -0.0, 3.5, f64::INFINITY] {
            assert!(diff(&Expression::from(v), &x).unwrap().is_zero());
        }
    }

    #[test]
    fn chain_rule_for_unary_functions() {
        let [x, y] = make_vars(["x", "y"]).unwrap();
        let inner = x.clone() * y.clone() + square(x.clone());
        let d_inner = diff(&inner, &x).unwrap();
        for (outer, derivative) in [
            (sin(inner.clone()), cos(inner.clone())),
            (exp(inner.clone()), exp(inner.clone())),
            (log(inner.clone()), div(1.0.into(), inner.clone())),
        ] {
            let lhs = diff(&outer, &x).unwrap();
            let rhs = mul(derivative, d_inner.clone());
            let vals = at(&[("x", 0.7), ("y", -0.3)]);
            assert_relative_eq!(
                lhs.eval(&vals, &[], 0.0).unwrap(),
                rhs.eval(&vals, &[], 0.0).unwrap(),
                max_relative = 1e-14
            );
        }
        assert_eq!(diff(&sin(x.clone()), &x).unwrap(), cos(x));
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let [x, y] = make_vars(["x", "y"]).unwrap();
        let exprs = vec![
            pow(x.clone(), 2.5.into()) * y.clone(),
            atan2(y.clone(), x.clone()),
            kep_e(0.3.into(), x.clone() * y.clone()),
            sqrt(x.clone()) / (1.0 + y.clone()),
            pow(x.clone(), y.clone()),
            super::super::ops::tan(x.clone()) - super::super::ops::tanh(y.clone()),
            super::super::ops::asin(x.clone() / 2.0) + super::super::ops::acos(y.clone() / 3.0),
            super::super::ops::atan(x.clone()) * super::super::ops::cosh(y.clone()),
        ];
        let (x0, y0, h) = (0.8, 0.45, 1e-6);
        for e in exprs {
            let dx = diff(&e, &x).unwrap();
            let f = |a: f64, b: f64| e.eval(&at(&[("x", a), ("y", b)]), &[], 0.0).unwrap();
            let fd = (f(x0 + h, y0) - f(x0 - h, y0)) / (2.0 * h);
            let exact = dx.eval(&at(&[("x", x0), ("y", y0)]), &[], 0.0).unwrap();
            assert_relative_eq!(exact, fd, max_relative = 1e-7);
        }
    }

    #[test]
    fn parameters_and_time_are_differentiable() {
        let [x] = make_vars(["x"]).unwrap();
        let e = par(1) * x.clone() + sin(time());
        assert_eq!(diff(&e, &par(1)).unwrap(), x);
        assert_eq!(diff(&e, &time()).unwrap(), cos(time()));
        assert!(diff(&e, &par(0)).unwrap().is_zero());
        assert_err_contains(diff(&e, &Expression::from(1.0)), "cannot differentiate");
    }

    #[test]
    fn gradient_agrees_with_forward_mode() {
        let [x, y] = make_vars(["x", "y"]).unwrap();
        let s = x.clone() + y.clone();
        let e = mul(s.clone(), s.clone()) - sin(s) + neg(par(0) * exp(x.clone()));
        let args = [x.clone(), y.clone(), par(0), time()];
        let grad = gradient(&e, &args).unwrap();
        let vals = at(&[("x", 0.2), ("y", 1.1)]);
        for (g, a) in grad.iter().zip(&args) {
            let fwd = diff(&e, a).unwrap();
            assert_relative_eq!(
                g.eval(&vals, &[0.5], 0.0).unwrap(),
                fwd.eval(&vals, &[0.5], 0.0).unwrap(),
                max_relative = 1e-14
            );
        }
        assert!(grad[3].is_zero());
    }

    #[test]
    fn gradient_of_an_atom() {
        let [x, y] = make_vars(["x", "y"]).unwrap();
        let g = gradient(&x, &[x.clone(), y]).unwrap();
        assert_eq!(g, vec![Expression::one(), Expression::zero()]);
    }
}
