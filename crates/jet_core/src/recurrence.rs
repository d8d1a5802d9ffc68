//! Order-`n` Taylor coefficient recurrences.
//!
//! Each formula is written once against [`CoeffBuilder`], which abstracts
//! over what a "value" is: an SSA value in the IR emitter, or a plain number
//! when the recurrences are evaluated directly. Coefficients of numeric
//! arguments vanish above order 0 and the formulas skip those terms.
//!
//! Notation below: `a` is the entry being computed, `b`, `c` its arguments
//! and `h` its hidden dependencies; `x^[k]` is the order-`k` coefficient.
//! Sums are reduced pairwise.

use crate::equation_engine::{BinaryFn, UnaryFn};
use crate::error::{Error, Result};
use crate::expression::Op;
use std::ops::RangeInclusive;

pub trait CoeffBuilder {
    type Val: Clone;
    /// Handle on an argument: a tape entry or a literal.
    type Ref: Copy;

    fn load(&mut self, r: Self::Ref, order: u32) -> Self::Val;

    /// Literals have no coefficients above order 0.
    fn is_constant(&self, r: Self::Ref) -> bool;

    fn constant(&mut self, value: f64) -> Self::Val;

    fn unary(&mut self, f: UnaryFn, a: Self::Val) -> Self::Val;

    fn binary(&mut self, f: BinaryFn, a: Self::Val, b: Self::Val) -> Self::Val;
}

/// Number of hidden dependencies the recurrence of `op` reads.
pub fn hidden_count(op: Op) -> usize {
    match op {
        Op::Sin | Op::Cos | Op::Sinh | Op::Cosh | Op::Tan | Op::Tanh => 1,
        Op::Asin | Op::Acos | Op::Atan | Op::Atan2 => 1,
        Op::KepE => 2,
        _ => 0,
    }
}

fn unary_fn(op: Op) -> Option<UnaryFn> {
    Some(match op {
        Op::Neg => UnaryFn::Neg,
        Op::Sqrt => UnaryFn::Sqrt,
        Op::Exp => UnaryFn::Exp,
        Op::Log => UnaryFn::Log,
        Op::Sin => UnaryFn::Sin,
        Op::Cos => UnaryFn::Cos,
        Op::Tan => UnaryFn::Tan,
        Op::Asin => UnaryFn::Asin,
        Op::Acos => UnaryFn::Acos,
        Op::Atan => UnaryFn::Atan,
        Op::Sinh => UnaryFn::Sinh,
        Op::Cosh => UnaryFn::Cosh,
        Op::Tanh => UnaryFn::Tanh,
        _ => return None,
    })
}

/// Emits the order-`order` coefficient of `this = op(args)`.
///
/// Lower orders of every entry, and order `order` of the arguments, must be
/// available through `b`.
pub fn coefficient<B: CoeffBuilder>(
    b: &mut B,
    op: Op,
    this: B::Ref,
    args: &[B::Ref],
    hidden: &[B::Ref],
    order: u32,
) -> Result<B::Val> {
    op.check_arity(args.len())?;
    if hidden.len() != hidden_count(op) {
        return Err(Error::InvalidInput(format!(
            "operator '{}' expects {} hidden dependencies, got {}",
            op.name(),
            hidden_count(op),
            hidden.len()
        )));
    }
    if op == Op::Pow && !b.is_constant(args[1]) {
        return Err(Error::UnsupportedOperation(
            "the Taylor recurrence of pow requires a numeric exponent".to_string(),
        ));
    }

    let mut r = Rec { b };
    if order == 0 {
        return Ok(r.direct(op, args));
    }
    let n = order;
    let nf = n as f64;
    let val = match op {
        Op::Sum => {
            let terms = args.iter().filter_map(|&a| r.coeff(a, n)).collect();
            r.sum(terms)
        }
        Op::Neg => {
            let x = r.coeff(args[0], n);
            r.neg(x)
        }
        Op::Mul => r.conv(args[0], args[1], n, 0..=n, |_| 1.0),
        Op::Div => {
            // a^[n] = (b^[n] - sum_{j=1}^{n} c^[j] a^[n-j]) / c^[0]
            let bn = r.coeff(args[0], n);
            let s = r.conv(args[1], this, n, 1..=n, |_| 1.0);
            let num = r.sub(bn, s);
            let c0 = r.b.load(args[1], 0);
            r.div_by(num, c0)
        }
        Op::Square => {
            let half = r.conv(args[0], args[0], n, 0..=(n - 1) / 2, |_| 1.0);
            let twice = r.scale(2.0, half);
            if n % 2 == 0 {
                let mid = r.coeff(args[0], n / 2);
                let sq = r.mul(mid.clone(), mid);
                r.add(twice, sq)
            } else {
                twice
            }
        }
        Op::Sqrt => {
            // a^[n] = (b^[n] - sum_{j=1}^{n-1} a^[j] a^[n-j]) / (2 a^[0])
            let bn = r.coeff(args[0], n);
            let s = r.conv(this, this, n, 1..=n - 1, |_| 1.0);
            let num = r.sub(bn, s);
            let a0 = r.b.load(this, 0);
            let q = r.div_by(num, a0);
            r.scale(0.5, q)
        }
        Op::Exp => {
            let s = r.conv(args[0], this, n, 1..=n, |j| j as f64);
            r.scale(1.0 / nf, s)
        }
        Op::Log => {
            // a^[n] = (n b^[n] - sum_{j=1}^{n-1} j a^[j] b^[n-j]) / (n b^[0])
            let bn = r.coeff(args[0], n);
            let nb = r.scale(nf, bn);
            let s = r.conv(this, args[0], n, 1..=n - 1, |j| j as f64);
            let num = r.sub(nb, s);
            let b0 = r.b.load(args[0], 0);
            let q = r.div_by(num, b0);
            r.scale(1.0 / nf, q)
        }
        Op::Pow => {
            // a^[n] = sum_{j=0}^{n-1} (alpha (n-j) - j) b^[n-j] a^[j] / (n b^[0])
            let alpha = r.b.load(args[1], 0);
            let mut terms = Vec::with_capacity(n as usize);
            for j in 0..n {
                let (Some(bk), Some(aj)) = (r.coeff(args[0], n - j), r.coeff(this, j)) else {
                    continue;
                };
                let k = r.b.constant((n - j) as f64);
                let mut w = r.b.binary(BinaryFn::Mul, alpha.clone(), k);
                if j > 0 {
                    let jj = r.b.constant(j as f64);
                    w = r.b.binary(BinaryFn::Sub, w, jj);
                }
                let prod = r.b.binary(BinaryFn::Mul, bk, aj);
                terms.push(r.b.binary(BinaryFn::Mul, w, prod));
            }
            let s = r.sum(terms);
            let b0 = r.b.load(args[0], 0);
            let q = r.div_by(s, b0);
            r.scale(1.0 / nf, q)
        }
        Op::Sin | Op::Sinh | Op::Cosh => {
            // the partner (cos, cosh, sinh) is hidden[0]
            let s = r.conv(args[0], hidden[0], n, 1..=n, |j| j as f64);
            r.scale(1.0 / nf, s)
        }
        Op::Cos => {
            let s = r.conv(args[0], hidden[0], n, 1..=n, |j| j as f64);
            r.scale(-1.0 / nf, s)
        }
        Op::Tan | Op::Tanh => {
            // hidden[0] = a^2; a' = b' (1 +- a^2)
            let bn = r.coeff(args[0], n);
            let s = r.conv(args[0], hidden[0], n, 1..=n, |j| j as f64);
            let s = r.scale(1.0 / nf, s);
            if op == Op::Tan {
                r.add(bn, s)
            } else {
                r.sub(bn, s)
            }
        }
        Op::Asin | Op::Acos | Op::Atan => {
            // hidden[0] = sqrt(1 - b^2) for asin/acos, b^2 for atan
            let bn = r.coeff(args[0], n);
            let sign = if op == Op::Acos { -nf } else { nf };
            let nb = r.scale(sign, bn);
            let s = r.conv(this, hidden[0], n, 1..=n - 1, |j| j as f64);
            let num = r.sub(nb, s);
            let h0 = r.b.load(hidden[0], 0);
            let den = if op == Op::Atan {
                let one = r.b.constant(1.0);
                r.b.binary(BinaryFn::Add, one, h0)
            } else {
                h0
            };
            let q = r.div_by(num, den);
            r.scale(1.0 / nf, q)
        }
        Op::Atan2 => {
            // a = atan2(y, x), hidden[0] = y^2 + x^2; d a' = x y' - y x'
            let (y, x) = (args[0], args[1]);
            let yx = r.conv(y, x, n, 1..=n, |j| j as f64);
            let xy = r.conv(x, y, n, 1..=n, |j| j as f64);
            let cross = r.sub(yx, xy);
            let s = r.conv(this, hidden[0], n, 1..=n - 1, |j| j as f64);
            let num = r.sub(cross, s);
            let d0 = r.b.load(hidden[0], 0);
            let q = r.div_by(num, d0);
            r.scale(1.0 / nf, q)
        }
        Op::KepE => {
            // E - e sin(E) = M, hidden = [sin(E), cos(E)]:
            // E'(1 - e cos E) = M' + e' sin E
            let (e, m) = (args[0], args[1]);
            let (s, co) = (hidden[0], hidden[1]);
            let mn = r.coeff(m, n);
            let t1 = r.scale(nf, mn);
            let t2 = r.conv(e, s, n, 1..=n, |j| j as f64);
            let mut t3 = Vec::new();
            for j in 1..n {
                // w^[k] = (e cos E)^[k]
                let w = r.conv(e, co, n - j, 0..=n - j, |_| 1.0);
                let aj = r.coeff(this, j);
                let aj = r.scale(j as f64, aj);
                if let Some(t) = r.mul(aj, w) {
                    t3.push(t);
                }
            }
            let t3 = r.sum(t3);
            let mut num = Vec::new();
            num.extend(t1);
            num.extend(t2);
            num.extend(t3);
            let num = r.sum(num);
            let e0 = r.b.load(e, 0);
            let co0 = r.b.load(co, 0);
            let one = r.b.constant(1.0);
            let ec = r.b.binary(BinaryFn::Mul, e0, co0);
            let den = r.b.binary(BinaryFn::Sub, one, ec);
            let q = r.div_by(num, den);
            r.scale(1.0 / nf, q)
        }
    };
    Ok(r.or_zero(val))
}

/// Pairwise (tree) reduction.
pub fn pairwise_sum<B: CoeffBuilder>(b: &mut B, mut terms: Vec<B::Val>) -> Option<B::Val> {
    while terms.len() > 1 {
        let mut next = Vec::with_capacity(terms.len().div_ceil(2));
        let mut it = terms.into_iter();
        while let Some(x) = it.next() {
            match it.next() {
                Some(y) => next.push(b.binary(BinaryFn::Add, x, y)),
                None => next.push(x),
            }
        }
        terms = next;
    }
    terms.pop()
}

/// Helpers over optional values, `None` standing for an exact zero.
struct Rec<'b, B: CoeffBuilder> {
    b: &'b mut B,
}

impl<B: CoeffBuilder> Rec<'_, B> {
    fn coeff(&mut self, r: B::Ref, order: u32) -> Option<B::Val> {
        if order > 0 && self.b.is_constant(r) {
            None
        } else {
            Some(self.b.load(r, order))
        }
    }

    fn direct(&mut self, op: Op, args: &[B::Ref]) -> B::Val {
        let vals: Vec<B::Val> = args.iter().map(|&a| self.b.load(a, 0)).collect();
        if let Some(f) = unary_fn(op) {
            return self.b.unary(f, vals[0].clone());
        }
        let x = vals[0].clone();
        let f = match op {
            Op::Sum => return pairwise_sum(self.b, vals).unwrap_or_else(|| self.b.constant(0.0)),
            Op::Square => return self.b.binary(BinaryFn::Mul, x.clone(), x),
            Op::Mul => BinaryFn::Mul,
            Op::Div => BinaryFn::Div,
            Op::Pow => BinaryFn::Pow,
            Op::Atan2 => BinaryFn::Atan2,
            Op::KepE => BinaryFn::Kepler,
            _ => unreachable!("unary operators are handled above"),
        };
        let y = vals[1].clone();
        self.b.binary(f, x, y)
    }

    fn sum(&mut self, terms: Vec<B::Val>) -> Option<B::Val> {
        pairwise_sum(self.b, terms)
    }

    /// `sum_{j in range} w(j) x^[j] y^[n-j]`
    fn conv(
        &mut self,
        x: B::Ref,
        y: B::Ref,
        n: u32,
        range: RangeInclusive<u32>,
        weight: impl Fn(u32) -> f64,
    ) -> Option<B::Val> {
        let mut terms = Vec::new();
        for j in range {
            let (Some(xj), Some(yk)) = (self.coeff(x, j), self.coeff(y, n - j)) else {
                continue;
            };
            let prod = self.b.binary(BinaryFn::Mul, xj, yk);
            terms.extend(self.scale(weight(j), Some(prod)));
        }
        self.sum(terms)
    }

    fn scale(&mut self, c: f64, x: Option<B::Val>) -> Option<B::Val> {
        let x = x?;
        if c == 1.0 {
            return Some(x);
        }
        if c == -1.0 {
            return Some(self.b.unary(UnaryFn::Neg, x));
        }
        let k = self.b.constant(c);
        Some(self.b.binary(BinaryFn::Mul, k, x))
    }

    fn mul(&mut self, x: Option<B::Val>, y: Option<B::Val>) -> Option<B::Val> {
        Some(self.b.binary(BinaryFn::Mul, x?, y?))
    }

    fn add(&mut self, x: Option<B::Val>, y: Option<B::Val>) -> Option<B::Val> {
        match (x, y) {
            (Some(x), Some(y)) => Some(self.b.binary(BinaryFn::Add, x, y)),
            (x, None) => x,
            (None, y) => y,
        }
    }

    fn sub(&mut self, x: Option<B::Val>, y: Option<B::Val>) -> Option<B::Val> {
        match (x, y) {
            (Some(x), Some(y)) => Some(self.b.binary(BinaryFn::Sub, x, y)),
            (x, None) => x,
            (None, y) => self.neg(y),
        }
    }

    fn neg(&mut self, x: Option<B::Val>) -> Option<B::Val> {
        x.map(|x| self.b.unary(UnaryFn::Neg, x))
    }

    fn div_by(&mut self, x: Option<B::Val>, d: B::Val) -> Option<B::Val> {
        x.map(|x| self.b.binary(BinaryFn::Div, x, d))
    }

    fn or_zero(&mut self, x: Option<B::Val>) -> B::Val {
        match x {
            Some(x) => x,
            None => self.b.constant(0.0),
        }
    }
}
