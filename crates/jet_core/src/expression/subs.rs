//! Substitution, traversal and structural rewrites.

use super::ops::apply;
use super::{Expression, Func, Op, Param, Variable};
use crate::error::{invalid, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Replaces every subterm equal to a key of `map` by its image.
///
/// The result is not re-canonicalised and argument order is preserved.
/// Subterms containing no match are returned as the original shared nodes.
pub fn subs(e: &Expression, map: &HashMap<Expression, Expression>) -> Expression {
    let mut memo = HashMap::new();
    subs_memo(e, map, &mut memo)
}

fn subs_memo(
    e: &Expression,
    map: &HashMap<Expression, Expression>,
    memo: &mut HashMap<usize, Expression>,
) -> Expression {
    if let Some(image) = map.get(e) {
        return image.clone();
    }
    let Expression::Func(f) = e else {
        return e.clone();
    };
    if let Some(done) = memo.get(&f.node_id()) {
        return done.clone();
    }
    let args: Vec<Expression> = f.args().iter().map(|a| subs_memo(a, map, memo)).collect();
    let result = if args.iter().zip(f.args()).all(|(n, o)| n.same_node(o)) {
        e.clone()
    } else {
        Expression::Func(f.with_args(args))
    };
    memo.insert(f.node_id(), result.clone());
    result
}

/// Renames variables. Variables missing from `names` are kept.
pub fn rename_variables(e: &Expression, names: &HashMap<Variable, Variable>) -> Expression {
    let map = names
        .iter()
        .map(|(from, to)| {
            (
                Expression::Variable(from.clone()),
                Expression::Variable(to.clone()),
            )
        })
        .collect();
    subs(e, &map)
}

/// Rebuilds `e` bottom-up through the canonical constructors.
pub fn normalise(e: &Expression) -> Result<Expression> {
    fn go(e: &Expression, memo: &mut HashMap<usize, Expression>) -> Result<Expression> {
        let Expression::Func(f) = e else {
            return Ok(e.clone());
        };
        if let Some(done) = memo.get(&f.node_id()) {
            return Ok(done.clone());
        }
        let args = f
            .args()
            .iter()
            .map(|a| go(a, memo))
            .collect::<Result<Vec<_>>>()?;
        let result = apply(f.op(), args)?;
        memo.insert(f.node_id(), result.clone());
        Ok(result)
    }
    go(e, &mut HashMap::new())
}

/// Structural deep copy: the result shares no function node with `e`.
pub fn copy(e: &Expression) -> Expression {
    match e {
        Expression::Func(f) => Expression::Func(f.with_args(f.args().iter().map(copy).collect())),
        other => other.clone(),
    }
}

fn visit_atoms(e: &Expression, seen: &mut HashSet<usize>, on_atom: &mut impl FnMut(&Expression)) {
    match e {
        Expression::Func(f) => {
            if seen.insert(f.node_id()) {
                for a in f.args() {
                    visit_atoms(a, seen, on_atom);
                }
            }
        }
        atom => on_atom(atom),
    }
}

/// The variables appearing in `e`, sorted by name.
pub fn get_variables(e: &Expression) -> Vec<Variable> {
    let mut out = BTreeSet::new();
    visit_atoms(e, &mut HashSet::new(), &mut |a| {
        if let Expression::Variable(v) = a {
            out.insert(v.clone());
        }
    });
    out.into_iter().collect()
}

/// The parameters appearing in `e`, sorted by index.
pub fn get_params(e: &Expression) -> Vec<Param> {
    let mut out = BTreeSet::new();
    visit_atoms(e, &mut HashSet::new(), &mut |a| {
        if let Expression::Param(p) = a {
            out.insert(*p);
        }
    });
    out.into_iter().collect()
}

pub fn has_time(e: &Expression) -> bool {
    let mut found = false;
    visit_atoms(e, &mut HashSet::new(), &mut |a| {
        found |= matches!(a, Expression::Time);
    });
    found
}

/// Rewrites every sum of more than `split` terms into a balanced nest of
/// sums with at most `split` terms each.
pub fn split_sums(e: &Expression, split: usize) -> Result<Expression> {
    if split < 2 {
        return invalid(format!(
            "the split value for sums must be at least 2, got {split}"
        ));
    }

    fn go(e: &Expression, split: usize, memo: &mut HashMap<usize, Expression>) -> Expression {
        let Expression::Func(f) = e else {
            return e.clone();
        };
        if let Some(done) = memo.get(&f.node_id()) {
            return done.clone();
        }
        let args: Vec<Expression> = f.args().iter().map(|a| go(a, split, memo)).collect();
        let mut result = if args.iter().zip(f.args()).all(|(n, o)| n.same_node(o)) {
            e.clone()
        } else {
            Expression::Func(f.with_args(args.clone()))
        };
        if f.op() == Op::Sum && args.len() > split {
            let mut level = args;
            while level.len() > split {
                level = level
                    .chunks(split)
                    .map(|chunk| match chunk {
                        [single] => single.clone(),
                        many => Expression::Func(Func::new_unchecked(Op::Sum, many.to_vec())),
                    })
                    .collect();
            }
            result = Expression::Func(Func::new_unchecked(Op::Sum, level));
        }
        memo.insert(f.node_id(), result.clone());
        result
    }

    Ok(go(e, split, &mut HashMap::new()))
}
