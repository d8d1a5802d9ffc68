//! Fork-join helpers over the rayon pool.
//!
//! Iterations must not depend on each other; running serially gives the same
//! results. Small ranges run on the calling thread. Results land in
//! pre-sized write-once slots, one per index.

use once_cell::sync::OnceCell;
use rayon::prelude::*;
use std::ops::Range;

/// Ranges shorter than this are not split across threads.
pub const SERIAL_THRESHOLD: usize = 16;

pub fn parallel_for<F>(range: Range<usize>, body: F)
where
    F: Fn(usize) + Send + Sync,
{
    if range.len() < SERIAL_THRESHOLD {
        range.for_each(body);
    } else {
        range.into_par_iter().for_each(body);
    }
}

/// `n` empty slots for [`parallel_fill`].
pub fn slots<R>(n: usize) -> Vec<OnceCell<R>> {
    (0..n).map(|_| OnceCell::new()).collect()
}

/// Fills every empty slot of `slots` with `f(index)`. Each slot is written at
/// most once; slots that already hold a value are left alone.
pub fn parallel_fill<R, F>(slots: &[OnceCell<R>], f: F)
where
    R: Send + Sync,
    F: Fn(usize) -> R + Send + Sync,
{
    parallel_for(0..slots.len(), |i| {
        slots[i].get_or_init(|| f(i));
    });
}

/// `(0..n).map(f)` collected in index order.
pub fn parallel_map<R, F>(n: usize, f: F) -> Vec<R>
where
    R: Send + Sync,
    F: Fn(usize) -> R + Send + Sync,
{
    let out = slots(n);
    parallel_fill(&out, f);
    out.into_iter().filter_map(OnceCell::into_inner).collect()
}

/// Like [`parallel_map`], returning the first error in index order.
pub fn try_parallel_map<R, E, F>(n: usize, f: F) -> Result<Vec<R>, E>
where
    R: Send + Sync,
    E: Send + Sync,
    F: Fn(usize) -> Result<R, E> + Send + Sync,
{
    parallel_map(n, f).into_iter().collect()
}
