//! Canonical constructors for every operator.
//!
//! Rules applied here:
//! - `sum` flattens nested sums, sorts its terms, folds numeric terms into a
//!   single trailing number, drops a zero constant and collapses singletons;
//! - `neg(neg(x)) = x`, `sin(neg(x)) = neg(sin(x))`, `cos(neg(x)) = cos(x)`;
//! - numeric arguments fold for `neg`, `square`, `exp` and the binary
//!   arithmetic operators whenever the folded value is not NaN; the result
//!   takes the common kind of the folded literals;
//! - identity elements collapse: `1*x`, `x/1`, `x^1`, `x^0`, `1^x`. A zero
//!   factor also collapses `0*x` and `0/x` to `0`, so symbolic derivatives do
//!   not carry dead terms around.

use super::{Expression, Func, Number, Op};
use crate::error::Result;
use crate::traits::FpKind;
use std::ops::{Add, Div, Mul, Neg, Sub};

fn node(op: Op, args: Vec<Expression>) -> Expression {
    Expression::Func(Func::new_unchecked(op, args))
}

fn fold(value: f64, kind: FpKind) -> Option<Expression> {
    Number::folded(value, kind).map(Expression::Number)
}

/// Applies `op` through its canonical constructor.
pub fn apply(op: Op, args: Vec<Expression>) -> Result<Expression> {
    op.check_arity(args.len())?;
    if op == Op::Sum {
        return Ok(sum(args));
    }
    let mut it = args.into_iter();
    let a = it.next().unwrap_or_else(Expression::zero);
    let b = it.next();
    let second = move || b.unwrap_or_else(Expression::zero);
    Ok(match op {
        Op::Sum => unreachable!(),
        Op::Mul => mul(a, second()),
        Op::Div => div(a, second()),
        Op::Pow => pow(a, second()),
        Op::Atan2 => atan2(a, second()),
        Op::KepE => kep_e(a, second()),
        Op::Neg => neg(a),
        Op::Square => square(a),
        Op::Sqrt => sqrt(a),
        Op::Exp => exp(a),
        Op::Log => log(a),
        Op::Sin => sin(a),
        Op::Cos => cos(a),
        Op::Tan => tan(a),
        Op::Asin => asin(a),
        Op::Acos => acos(a),
        Op::Atan => atan(a),
        Op::Sinh => sinh(a),
        Op::Cosh => cosh(a),
        Op::Tanh => tanh(a),
    })
}

pub fn sum(args: Vec<Expression>) -> Expression {
    fn collect(e: Expression, terms: &mut Vec<Expression>, numbers: &mut Vec<Number>) {
        match e {
            Expression::Number(n) => numbers.push(n),
            Expression::Func(f) if f.op() == Op::Sum => {
                for a in f.args() {
                    collect(a.clone(), terms, numbers);
                }
            }
            other => terms.push(other),
        }
    }

    let mut terms = Vec::with_capacity(args.len());
    let mut numbers = Vec::new();
    for a in args {
        collect(a, &mut terms, &mut numbers);
    }
    terms.sort_by(|a, b| a.canonical_cmp(b));

    if !numbers.is_empty() {
        let total: f64 = numbers.iter().map(|n| n.value()).sum();
        let kind = numbers
            .iter()
            .map(|n| n.kind())
            .fold(FpKind::Binary32, FpKind::common);
        match fold(total, kind) {
            Some(c) if c.is_zero() => {}
            Some(c) => terms.push(c),
            // inf + (-inf): keep the literals unfolded
            None => terms.extend(numbers.into_iter().map(Expression::Number)),
        }
    }

    match terms.len() {
        0 => Expression::zero(),
        1 => terms.pop().unwrap_or_else(Expression::zero),
        _ => node(Op::Sum, terms),
    }
}

pub fn add(a: Expression, b: Expression) -> Expression {
    sum(vec![a, b])
}

pub fn sub(a: Expression, b: Expression) -> Expression {
    sum(vec![a, neg(b)])
}

pub fn neg(a: Expression) -> Expression {
    match a {
        Expression::Number(n) => match fold(-n.value(), n.kind()) {
            Some(folded) => folded,
            None => node(Op::Neg, vec![Expression::Number(n)]),
        },
        Expression::Func(f) if f.op() == Op::Neg => f.args()[0].clone(),
        other => node(Op::Neg, vec![other]),
    }
}

pub fn mul(a: Expression, b: Expression) -> Expression {
    if let (Some(x), Some(y)) = (a.as_literal(), b.as_literal()) {
        if let Some(folded) = fold(x.value() * y.value(), x.kind().common(y.kind())) {
            return folded;
        }
    }
    if a.is_zero() || b.is_zero() {
        return Expression::zero();
    }
    if a.is_one() {
        return b;
    }
    if b.is_one() {
        return a;
    }
    if a.as_number() == Some(-1.0) {
        return neg(b);
    }
    if b.as_number() == Some(-1.0) {
        return neg(a);
    }
    if b.canonical_cmp(&a).is_lt() {
        node(Op::Mul, vec![b, a])
    } else {
        node(Op::Mul, vec![a, b])
    }
}

pub fn div(a: Expression, b: Expression) -> Expression {
    if let (Some(x), Some(y)) = (a.as_literal(), b.as_literal()) {
        if let Some(folded) = fold(x.value() / y.value(), x.kind().common(y.kind())) {
            return folded;
        }
    }
    if b.is_one() {
        return a;
    }
    if a.is_zero() && !b.is_zero() {
        return Expression::zero();
    }
    node(Op::Div, vec![a, b])
}

pub fn square(a: Expression) -> Expression {
    if let Some(folded) = a.as_literal().and_then(|x| fold(x.value() * x.value(), x.kind())) {
        return folded;
    }
    node(Op::Square, vec![a])
}

pub fn sqrt(a: Expression) -> Expression {
    node(Op::Sqrt, vec![a])
}

pub fn exp(a: Expression) -> Expression {
    if let Some(folded) = a.as_literal().and_then(|x| fold(x.value().exp(), x.kind())) {
        return folded;
    }
    node(Op::Exp, vec![a])
}

pub fn log(a: Expression) -> Expression {
    if a.is_one() {
        return Expression::zero();
    }
    node(Op::Log, vec![a])
}

pub fn pow(base: Expression, expo: Expression) -> Expression {
    if expo.is_zero() || base.is_one() {
        return Expression::one();
    }
    if expo.is_one() {
        return base;
    }
    if let (Some(b), Some(e)) = (base.as_literal(), expo.as_literal()) {
        if let Some(folded) = fold(b.value().powf(e.value()), b.kind().common(e.kind())) {
            return folded;
        }
    }
    node(Op::Pow, vec![base, expo])
}

pub fn sin(a: Expression) -> Expression {
    match a {
        Expression::Func(f) if f.op() == Op::Neg => neg(sin(f.args()[0].clone())),
        other => node(Op::Sin, vec![other]),
    }
}

pub fn cos(a: Expression) -> Expression {
    match a {
        Expression::Func(f) if f.op() == Op::Neg => cos(f.args()[0].clone()),
        other => node(Op::Cos, vec![other]),
    }
}

pub fn tan(a: Expression) -> Expression {
    node(Op::Tan, vec![a])
}

pub fn asin(a: Expression) -> Expression {
    node(Op::Asin, vec![a])
}

pub fn acos(a: Expression) -> Expression {
    node(Op::Acos, vec![a])
}

pub fn atan(a: Expression) -> Expression {
    node(Op::Atan, vec![a])
}

/// `atan2(y, x)`.
pub fn atan2(y: Expression, x: Expression) -> Expression {
    node(Op::Atan2, vec![y, x])
}

pub fn sinh(a: Expression) -> Expression {
    node(Op::Sinh, vec![a])
}

pub fn cosh(a: Expression) -> Expression {
    node(Op::Cosh, vec![a])
}

pub fn tanh(a: Expression) -> Expression {
    node(Op::Tanh, vec![a])
}

/// Eccentric anomaly: the root `E` of `E - e sin(E) = M`.
pub fn kep_e(ecc: Expression, mean_anomaly: Expression) -> Expression {
    node(Op::KepE, vec![ecc, mean_anomaly])
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $ctor:ident) => {
        impl $trait for Expression {
            type Output = Expression;
            fn $method(self, rhs: Expression) -> Expression {
                $ctor(self, rhs)
            }
        }

        impl $trait<&Expression> for &Expression {
            type Output = Expression;
            fn $method(self, rhs: &Expression) -> Expression {
                $ctor(self.clone(), rhs.clone())
            }
        }

        /// # Panics
        ///
        /// When `rhs` is NaN. Build the literal with [`Expression::num`]
        /// first to get an error instead.
        impl $trait<f64> for Expression {
            type Output = Expression;
            fn $method(self, rhs: f64) -> Expression {
                $ctor(self, Expression::from(rhs))
            }
        }

        /// # Panics
        ///
        /// When `self` is NaN. Build the literal with [`Expression::num`]
        /// first to get an error instead.
        impl $trait<Expression> for f64 {
            type Output = Expression;
            fn $method(self, rhs: Expression) -> Expression {
                $ctor(Expression::from(self), rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, add);
impl_binary_op!(Sub, sub, sub);
impl_binary_op!(Mul, mul, mul);
impl_binary_op!(Div, div, div);

impl Neg for Expression {
    type Output = Expression;
    fn neg(self) -> Expression {
        neg(self)
    }
}

impl Neg for &Expression {
    type Output = Expression;
    fn neg(self) -> Expression {
        neg(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{make_vars, par};
    use super::*;

    #[test]
    fn sums_flatten_and_fold_constants() {
        let [x, y, z] = make_vars(["x", "y", "z"]).unwrap();
        let e = sum(vec![
            add(z.clone(), 1.0.into()),
            add(y.clone(), 2.0.into()),
            x.clone(),
        ]);
        let f = e.as_func().unwrap();
        assert_eq!(f.op(), Op::Sum);
        assert_eq!(f.args(), &[x.clone(), y.clone(), z.clone(), 3.0.into()]);

        assert_eq!(sum(vec![x.clone(), 1.0.into(), (-1.0).into()]), x);
        assert_eq!(sum(vec![]), Expression::zero());
        assert_eq!(sum(vec![2.0.into(), 0.5.into()]), Expression::from(2.5));
        // order of construction does not matter
        assert_eq!(x.clone() + y.clone(), y + x);
    }

    #[test]
    fn folding_keeps_the_common_kind() {
        let single = |v: f64| Expression::Number(Number::with_kind(v, FpKind::Binary32).unwrap());
        let folded = mul(single(0.1), single(3.0));
        let n = folded.as_literal().unwrap();
        assert_eq!(n.kind(), FpKind::Binary32);
        assert_eq!(n.value(), (0.1f32 * 3.0f32) as f64);

        let mixed = sum(vec![single(0.5), 0.25.into()]).as_literal().unwrap();
        assert_eq!(mixed.kind(), FpKind::Binary64);
        assert_eq!(mixed.value(), 0.75);
        assert_eq!(neg(single(2.0)).as_literal().unwrap().kind(), FpKind::Binary32);
    }

    #[test]
    fn nan_literals_are_errors_through_num() {
        let err = Expression::num(f64::NAN).unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidInput(_)));
    }

    #[test]
    #[should_panic(expected = "NaN cannot be used as a numeric literal")]
    fn nan_operands_panic_in_operators() {
        let [x] = make_vars(["x"]).unwrap();
        let _ = x * f64::NAN;
    }

    #[test]
    fn peephole_rewrites() {
        let [x] = make_vars(["x"]).unwrap();
        assert_eq!(neg(neg(x.clone())), x);
        assert_eq!(cos(neg(x.clone())), cos(x.clone()));
        assert_eq!(sin(neg(x.clone())), neg(sin(x.clone())));
        assert_eq!(exp(Expression::from(0.0)), Expression::one());
        assert_eq!(mul(1.0.into(), x.clone()), x);
        assert_eq!(mul(x.clone(), 0.0.into()), Expression::zero());
        assert_eq!(pow(x.clone(), 1.0.into()), x);
        assert_eq!(pow(x.clone(), 0.0.into()), Expression::one());
        assert_eq!(div(x.clone(), 1.0.into()), x);
        assert_eq!(mul((-1.0).into(), x.clone()), neg(x));
    }

    #[test]
    fn numbers_sort_first_in_products() {
        let [x] = make_vars(["x"]).unwrap();
        let e = x * 2.0;
        assert_eq!(e.as_func().unwrap().args()[0], Expression::from(2.0));
    }

    #[test]
    fn nan_folds_are_not_performed() {
        let e = div(0.0.into(), 0.0.into());
        assert!(e.is_op(Op::Div));
        let e = sum(vec![f64::INFINITY.into(), f64::NEG_INFINITY.into(), par(0)]);
        assert_eq!(e.as_func().unwrap().args().len(), 3);
    }

    #[test]
    fn apply_checks_arity_and_canonicalises() {
        let [x] = make_vars(["x"]).unwrap();
        assert!(apply(Op::Sin, vec![]).is_err());
        assert_eq!(
            apply(Op::Neg, vec![neg(x.clone())]).unwrap(),
            x.clone()
        );
        assert_eq!(
            apply(Op::Sum, vec![x.clone(), 0.0.into()]).unwrap(),
            x
        );
    }
}
