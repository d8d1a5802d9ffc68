//! Function nodes and the per-operator capability table.

use super::ops::{
    add, cos, cosh, div, exp, kep_e, log, mul, neg, pow, sin, sinh, sqrt, square, sub, tan, tanh,
};
use super::Expression;
use crate::error::{Error, Result};
use crate::traits::Scalar;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

/// Operator identity of a function node.
///
/// The serde names double as the stable serialization tags of the operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Sum,
    Mul,
    Div,
    Neg,
    Square,
    Sqrt,
    Exp,
    Log,
    Pow,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    #[serde(rename = "kepE")]
    KepE,
}

/// Argument count rule of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    /// Any positive number of arguments.
    Variadic,
}

impl Op {
    pub const ALL: [Op; 20] = [
        Op::Sum,
        Op::Mul,
        Op::Div,
        Op::Neg,
        Op::Square,
        Op::Sqrt,
        Op::Exp,
        Op::Log,
        Op::Pow,
        Op::Sin,
        Op::Cos,
        Op::Tan,
        Op::Asin,
        Op::Acos,
        Op::Atan,
        Op::Atan2,
        Op::Sinh,
        Op::Cosh,
        Op::Tanh,
        Op::KepE,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Op::Sum => "sum",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Neg => "neg",
            Op::Square => "square",
            Op::Sqrt => "sqrt",
            Op::Exp => "exp",
            Op::Log => "log",
            Op::Pow => "pow",
            Op::Sin => "sin",
            Op::Cos => "cos",
            Op::Tan => "tan",
            Op::Asin => "asin",
            Op::Acos => "acos",
            Op::Atan => "atan",
            Op::Atan2 => "atan2",
            Op::Sinh => "sinh",
            Op::Cosh => "cosh",
            Op::Tanh => "tanh",
            Op::KepE => "kepE",
        }
    }

    pub fn arity(self) -> Arity {
        match self {
            Op::Sum => Arity::Variadic,
            Op::Mul | Op::Div | Op::Pow | Op::Atan2 | Op::KepE => Arity::Fixed(2),
            _ => Arity::Fixed(1),
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(self, Op::Sum | Op::Mul)
    }

    pub fn check_arity(self, n_args: usize) -> Result<()> {
        let ok = match self.arity() {
            Arity::Fixed(n) => n == n_args,
            Arity::Variadic => n_args > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "operator '{}' cannot be applied to {} argument(s)",
                self.name(),
                n_args
            )))
        }
    }

    /// Numerical evaluator, used for constant folding and reference values.
    pub fn eval<T: Scalar>(self, args: &[T]) -> T {
        match self {
            Op::Sum => args.iter().fold(T::zero(), |acc, &v| acc + v),
            Op::Mul => args[0] * args[1],
            Op::Div => args[0] / args[1],
            Op::Neg => -args[0],
            Op::Square => args[0] * args[0],
            Op::Sqrt => args[0].sqrt(),
            Op::Exp => args[0].exp(),
            Op::Log => args[0].ln(),
            Op::Pow => args[0].powf(args[1]),
            Op::Sin => args[0].sin(),
            Op::Cos => args[0].cos(),
            Op::Tan => args[0].tan(),
            Op::Asin => args[0].asin(),
            Op::Acos => args[0].acos(),
            Op::Atan => args[0].atan(),
            Op::Atan2 => args[0].atan2(args[1]),
            Op::Sinh => args[0].sinh(),
            Op::Cosh => args[0].cosh(),
            Op::Tanh => args[0].tanh(),
            Op::KepE => solve_kepler(args[0], args[1]),
        }
    }

    /// Partial derivatives `[∂f/∂arg_i]`. `this` is the node `f(args)` itself,
    /// reused where the derivative is expressed through the function value.
    pub fn gradient(self, args: &[Expression], this: &Expression) -> Vec<Expression> {
        let one = Expression::from(1.0);
        match self {
            Op::Sum => vec![one; args.len()],
            Op::Mul => vec![args[1].clone(), args[0].clone()],
            Op::Div => {
                let (a, b) = (&args[0], &args[1]);
                vec![
                    div(one, b.clone()),
                    neg(div(a.clone(), square(b.clone()))),
                ]
            }
            Op::Neg => vec![Expression::from(-1.0)],
            Op::Square => vec![mul(2.0.into(), args[0].clone())],
            Op::Sqrt => vec![div(0.5.into(), this.clone())],
            Op::Exp => vec![this.clone()],
            Op::Log => vec![div(one, args[0].clone())],
            Op::Pow => {
                let (base, expo) = (&args[0], &args[1]);
                vec![
                    mul(expo.clone(), pow(base.clone(), sub(expo.clone(), one))),
                    mul(this.clone(), log(base.clone())),
                ]
            }
            Op::Sin => vec![cos(args[0].clone())],
            Op::Cos => vec![neg(sin(args[0].clone()))],
            Op::Tan => vec![add(one, square(this.clone()))],
            Op::Asin => vec![div(one, sqrt(sub(1.0.into(), square(args[0].clone()))))],
            Op::Acos => vec![neg(div(
                one,
                sqrt(sub(1.0.into(), square(args[0].clone()))),
            ))],
            Op::Atan => vec![div(one, add(1.0.into(), square(args[0].clone())))],
            Op::Atan2 => {
                let (y, x) = (&args[0], &args[1]);
                let den = add(square(y.clone()), square(x.clone()));
                vec![div(x.clone(), den.clone()), neg(div(y.clone(), den))]
            }
            Op::Sinh => vec![cosh(args[0].clone())],
            Op::Cosh => vec![sinh(args[0].clone())],
            Op::Tanh => vec![sub(one, square(this.clone()))],
            Op::KepE => {
                let ecc = &args[0];
                let den = sub(one, mul(ecc.clone(), cos(this.clone())));
                vec![
                    div(sin(this.clone()), den.clone()),
                    div(1.0.into(), den),
                ]
            }
        }
    }
}

/// Eccentric anomaly `E` solving `E - e sin(E) = M` for `0 <= e < 1`.
///
/// Safeguarded Newton iteration inside the bracket `[M - e, M + e]`;
/// NaN outside the elliptic range.
pub fn solve_kepler<T: Scalar>(ecc: T, mean_anomaly: T) -> T {
    let zero = T::zero();
    let one = T::one();
    if !(ecc >= zero && ecc < one) || !mean_anomaly.is_finite() {
        return T::nan();
    }
    if ecc == zero {
        return mean_anomaly;
    }

    let mut lo = mean_anomaly - ecc;
    let mut hi = mean_anomaly + ecc;
    let tol = T::epsilon() * T::from_f64(4.0).unwrap_or(one) * mean_anomaly.abs().max(one);
    let mut x = (mean_anomaly + ecc * mean_anomaly.sin()).max(lo).min(hi);

    for _ in 0..100 {
        let f = x - ecc * x.sin() - mean_anomaly;
        if f == zero {
            return x;
        }
        if f > zero {
            hi = x;
        } else {
            lo = x;
        }
        let fp = one - ecc * x.cos();
        let mut next = x - f / fp;
        if !(next > lo && next < hi) {
            next = (lo + hi) / (one + one);
        }
        if (next - x).abs() <= tol {
            return next;
        }
        x = next;
    }
    x
}

struct FuncNode {
    op: Op,
    args: Vec<Expression>,
    hash: u64,
}

/// An operator applied to an ordered argument list.
///
/// Nodes are shared through `Arc`; the structural hash is computed once at
/// construction.
#[derive(Clone)]
pub struct Func(Arc<FuncNode>);

impl Func {
    /// Raw constructor: checks the arity but applies no canonicalisation.
    pub fn new(op: Op, args: Vec<Expression>) -> Result<Self> {
        op.check_arity(args.len())?;
        Ok(Self::new_unchecked(op, args))
    }

    pub(crate) fn new_unchecked(op: Op, args: Vec<Expression>) -> Self {
        let mut hasher = DefaultHasher::new();
        hasher.write_u8(op as u8);
        hasher.write_usize(args.len());
        for arg in &args {
            hasher.write_u64(arg.structural_hash());
        }
        Self(Arc::new(FuncNode {
            op,
            args,
            hash: hasher.finish(),
        }))
    }

    pub fn op(&self) -> Op {
        self.0.op
    }

    pub fn args(&self) -> &[Expression] {
        &self.0.args
    }

    pub fn structural_hash(&self) -> u64 {
        self.0.hash
    }

    /// Same operator over a new argument list.
    pub(crate) fn with_args(&self, args: Vec<Expression>) -> Self {
        Self::new_unchecked(self.op(), args)
    }

    /// Identity of the shared node, used as a memoisation key during traversals.
    pub(crate) fn node_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &Func) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Func {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
            || (self.0.hash == other.0.hash
                && self.0.op == other.0.op
                && self.0.args == other.0.args)
    }
}

impl Eq for Func {}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("op", &self.0.op)
            .field("args", &self.0.args)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn kepler_solution_satisfies_equation() {
        for &e in &[0.0, 0.1, 0.5, 0.9, 0.99] {
            for &m in &[-7.0, -1.0, 0.0, 0.3, PI, 5.5, 100.0] {
                let big_e: f64 = solve_kepler(e, m);
                assert!(
                    (big_e - e * big_e.sin() - m).abs() < 1e-12,
                    "e={e}, M={m}, E={big_e}"
                );
            }
        }
    }

    #[test]
    fn kepler_rejects_non_elliptic_eccentricity() {
        assert!(solve_kepler(1.0_f64, 0.5).is_nan());
        assert!(solve_kepler(-0.1_f64, 0.5).is_nan());
    }

    #[test]
    fn arity_is_enforced() {
        let x = Expression::from(1.0);
        assert!(Func::new(Op::Sin, vec![x.clone(), x.clone()]).is_err());
        assert!(Func::new(Op::Sum, vec![]).is_err());
        assert!(Func::new(Op::Atan2, vec![x.clone(), x]).is_ok());
    }

    #[test]
    fn op_tags_are_stable() {
        assert_eq!(serde_json::to_string(&Op::KepE).unwrap(), "\"kepE\"");
        assert_eq!(serde_json::to_string(&Op::Atan2).unwrap(), "\"atan2\"");
        let parsed: std::result::Result<Op, _> = serde_json::from_str("\"frobnicate\"");
        assert!(parsed.is_err());
    }
}
