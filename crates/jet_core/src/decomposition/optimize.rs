//! Decomposition passes: CSE, dead-code elimination, breadth-first reorder.
//!
//! Every pass keeps the prefix in place and the outputs last, and rewrites
//! argument references and hidden dependencies through an old -> new remap.

use super::{u, u_index, DcEntry, TaylorDc};
use crate::expression::{Expression, Func};
use std::collections::{BTreeMap, HashMap};

fn remap_rhs(rhs: &Expression, remap: &[usize]) -> Expression {
    match rhs {
        Expression::Func(f) => Expression::Func(Func::new_unchecked(
            f.op(),
            f.args().iter().map(|a| remap_rhs(a, remap)).collect(),
        )),
        other => match u_index(other) {
            Some(j) => u(remap[j]),
            None => other.clone(),
        },
    }
}

/// Keeps the first of each group of structurally equal function entries.
pub(super) fn cse(dc: TaylorDc) -> TaylorDc {
    let n = dc.entries.len();
    let n_prefix = dc.n_prefix();
    let first_output = n - dc.n_outputs;

    let mut remap = vec![usize::MAX; n];
    let mut out: Vec<DcEntry> = Vec::with_capacity(n);
    let mut seen: HashMap<Expression, usize> = HashMap::new();

    for (i, entry) in dc.entries.into_iter().enumerate() {
        if i < n_prefix {
            remap[i] = i;
            out.push(entry);
            continue;
        }
        let rhs = remap_rhs(&entry.rhs, &remap);
        if i >= first_output {
            remap[i] = out.len();
            out.push(DcEntry::new(rhs));
            continue;
        }
        if let Some(&k) = seen.get(&rhs) {
            remap[i] = k;
            continue;
        }
        remap[i] = out.len();
        seen.insert(rhs.clone(), out.len());
        out.push(DcEntry {
            rhs,
            hidden: entry.hidden,
        });
    }

    // hidden dependencies may point forward, so they are remapped last
    for entry in &mut out[n_prefix..] {
        for h in &mut entry.hidden {
            *h = remap[*h];
        }
    }

    TaylorDc {
        entries: out,
        ..dc
    }
}

/// Removes function entries no output depends on. Hidden dependencies count
/// as uses.
pub(super) fn dce(dc: TaylorDc) -> TaylorDc {
    let n = dc.entries.len();
    let n_prefix = dc.n_prefix();
    let first_output = n - dc.n_outputs;

    let mut live = vec![false; n];
    live[..n_prefix].fill(true);
    let mut stack: Vec<usize> = Vec::new();
    for i in first_output..n {
        live[i] = true;
        stack.extend(dc.entries[i].refs());
    }
    while let Some(j) = stack.pop() {
        if live[j] {
            continue;
        }
        live[j] = true;
        stack.extend(dc.entries[j].refs());
        stack.extend(dc.entries[j].hidden.iter().copied());
    }

    let mut remap = vec![usize::MAX; n];
    let mut next = 0;
    for (i, alive) in live.iter().enumerate() {
        if *alive {
            remap[i] = next;
            next += 1;
        }
    }

    let entries = dc
        .entries
        .into_iter()
        .enumerate()
        .filter(|(i, _)| live[*i])
        .map(|(i, entry)| {
            if i < n_prefix {
                entry
            } else {
                DcEntry {
                    rhs: remap_rhs(&entry.rhs, &remap),
                    hidden: entry.hidden.iter().map(|h| remap[*h]).collect(),
                }
            }
        })
        .collect();

    TaylorDc { entries, ..dc }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ArgKey {
    Ref(usize),
    Number(u64),
}

/// Groups function entries by level, and within a level by operator and
/// (already renumbered) argument tuple.
pub(super) fn reorder(dc: TaylorDc) -> TaylorDc {
    let n = dc.entries.len();
    let n_prefix = dc.n_prefix();
    let first_output = n - dc.n_outputs;
    let levels = dc.levels();

    let mut by_level: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in n_prefix..first_output {
        by_level.entry(levels[i]).or_default().push(i);
    }

    let mut remap: Vec<usize> = (0..n).collect();
    let mut order: Vec<usize> = (0..n_prefix).collect();
    for (_, mut members) in by_level {
        let key = |i: usize, remap: &[usize]| {
            let entry = &dc.entries[i];
            let rank = entry.op().map_or(0, |op| op as u8 as usize + 1);
            let args: Vec<ArgKey> = match &entry.rhs {
                Expression::Func(f) => f
                    .args()
                    .iter()
                    .map(|a| match (u_index(a), a.as_number()) {
                        (Some(j), _) => ArgKey::Ref(remap[j]),
                        (None, Some(v)) => ArgKey::Number(v.to_bits()),
                        (None, None) => ArgKey::Ref(usize::MAX),
                    })
                    .collect(),
                _ => Vec::new(),
            };
            (rank, args)
        };
        let mut keyed: Vec<_> = members.drain(..).map(|i| (key(i, &remap), i)).collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, i) in keyed {
            remap[i] = order.len();
            order.push(i);
        }
    }
    for i in first_output..n {
        remap[i] = order.len();
        order.push(i);
    }

    let entries = order
        .iter()
        .map(|&old| {
            let entry = &dc.entries[old];
            if old < n_prefix {
                entry.clone()
            } else {
                DcEntry {
                    rhs: remap_rhs(&entry.rhs, &remap),
                    hidden: entry.hidden.iter().map(|h| remap[*h]).collect(),
                }
            }
        })
        .collect();

    TaylorDc { entries, ..dc }
}
