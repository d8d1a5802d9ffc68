//! Polynomial kernels used by the stepper: Horner evaluation, Taylor shifts
//! and real root isolation on an interval.
//!
//! Coefficients are stored in increasing degree.

use crate::traits::Scalar;
use log::warn;

/// Recursion limit of the root isolation.
const MAX_DEPTH: usize = 48;

pub fn horner<T: Scalar>(coeffs: &[T], x: T) -> T {
    coeffs.iter().rev().fold(T::zero(), |acc, &c| acc * x + c)
}

/// Error-free sum: `a + b = s + e` exactly.
pub fn two_sum<T: Scalar>(a: T, b: T) -> (T, T) {
    let s = a + b;
    let bb = s - a;
    let e = (a - (s - bb)) + (b - bb);
    (s, e)
}

/// Error-free product: `a * b = p + e` exactly.
pub fn two_prod<T: Scalar>(a: T, b: T) -> (T, T) {
    let p = a * b;
    (p, a.mul_add(b, -p))
}

/// Horner evaluation with the rounding errors of every step accumulated
/// and added back at the end.
pub fn compensated_horner<T: Scalar>(coeffs: &[T], x: T) -> T {
    let Some((&last, rest)) = coeffs.split_last() else {
        return T::zero();
    };
    let mut s = last;
    let mut err = T::zero();
    for &c in rest.iter().rev() {
        let (p, pe) = two_prod(s, x);
        let (next, se) = two_sum(p, c);
        s = next;
        err = err * x + (pe + se);
    }
    s + err
}

pub fn derivative<T: Scalar>(coeffs: &[T]) -> Vec<T> {
    coeffs
        .iter()
        .enumerate()
        .skip(1)
        .map(|(n, &c)| c * T::from_usize(n).unwrap_or_else(T::nan))
        .collect()
}

/// Coefficients of `p(x + a)`.
pub fn taylor_shift<T: Scalar>(coeffs: &mut [T], a: T) {
    let n = coeffs.len();
    for i in 0..n.saturating_sub(1) {
        for j in (i..n - 1).rev() {
            coeffs[j] = coeffs[j] + a * coeffs[j + 1];
        }
    }
}

/// Coefficients of `p(s * x)`.
pub fn rescale<T: Scalar>(coeffs: &mut [T], s: T) {
    let mut f = T::one();
    for c in coeffs.iter_mut() {
        *c = *c * f;
        f = f * s;
    }
}

fn sign_changes<T: Scalar>(coeffs: &[T]) -> usize {
    let mut last = 0i8;
    let mut count = 0;
    for c in coeffs {
        let s = if *c > T::zero() {
            1
        } else if *c < T::zero() {
            -1
        } else {
            continue;
        };
        if last != 0 && s != last {
            count += 1;
        }
        last = s;
    }
    count
}

/// Upper bound on the number of roots of `p` in `(0, 1)` (Descartes' rule
/// applied to `(1 + x)^deg p(1 / (1 + x))`).
fn descartes_bound<T: Scalar>(coeffs: &[T]) -> usize {
    let mut r: Vec<T> = coeffs.iter().rev().copied().collect();
    taylor_shift(&mut r, T::one());
    sign_changes(&r)
}

/// Real roots of `p` in `[0, h)`, in increasing order.
///
/// Roots are isolated by bisection of the interval driven by Descartes'
/// rule of signs, then refined by bisection on the sign of `p`.
pub fn roots_in<T: Scalar>(coeffs: &[T], h: T) -> Vec<T> {
    let mut q = coeffs.to_vec();
    while q.last().is_some_and(|c| c.is_zero()) {
        q.pop();
    }
    let mut roots = Vec::new();
    if q.len() < 2 || !(h > T::zero()) || q.iter().any(|c| !c.is_finite()) {
        return roots;
    }
    rescale(&mut q, h);

    let half = T::from_f64(0.5).unwrap_or_else(T::nan);
    // Depth-first, left child processed first so roots come out sorted.
    let mut stack: Vec<(T, T, Vec<T>, usize)> = vec![(T::zero(), T::one(), q.clone(), 0)];
    while let Some((lb, ub, mut r, depth)) = stack.pop() {
        while r.first().is_some_and(|c| c.is_zero()) && r.len() > 1 {
            if roots.last() != Some(&lb) {
                roots.push(lb);
            }
            r.remove(0);
        }
        match descartes_bound(&r) {
            0 => {}
            1 => {
                if let Some(s) = bisect(&q, lb, ub) {
                    roots.push(s);
                }
            }
            _ if depth < MAX_DEPTH => {
                let mut left = r;
                rescale(&mut left, half);
                let mut right = left.clone();
                taylor_shift(&mut right, T::one());
                let mid = (lb + ub) * half;
                stack.push((mid, ub, right, depth + 1));
                stack.push((lb, mid, left, depth + 1));
            }
            _ => {
                warn!("root isolation did not converge on [{lb:?}, {ub:?}]");
                if let Some(s) = bisect(&q, lb, ub) {
                    roots.push(s);
                }
            }
        }
    }
    roots.iter().map(|&s| s * h).filter(|&t| t < h).collect()
}

/// Sign-change bisection of `q` on `(lb, ub)`.
fn bisect<T: Scalar>(q: &[T], mut lb: T, mut ub: T) -> Option<T> {
    let mut f_lb = horner(q, lb);
    let f_ub = horner(q, ub);
    if f_lb.is_zero() {
        return Some(lb);
    }
    if f_ub.is_zero() || f_lb.signum() == f_ub.signum() {
        return None;
    }
    let two = T::one() + T::one();
    for _ in 0..256 {
        let mid = (lb + ub) / two;
        if !(mid > lb && mid < ub) {
            break;
        }
        let f_mid = horner(q, mid);
        if f_mid.is_zero() {
            return Some(mid);
        }
        if f_mid.signum() == f_lb.signum() {
            lb = mid;
            f_lb = f_mid;
        } else {
            ub = mid;
        }
    }
    Some((lb + ub) / two)
}
