//! Taylor decomposition: lowering expressions into ordered elementary
//! assignments `u_i = op(...)`.
//!
//! Layout of a [`TaylorDc`]:
//! - a prefix of renamed originals, variables first and parameters after;
//! - function entries whose arguments are numbers or `u_j` with `j < i`
//!   (the time atom, when used, is one of these entries);
//! - one output entry per decomposed expression, each a `u_j` or a number.
//!
//! Hidden dependencies may point forward: recurrences only read their
//! lower-order coefficients, which are complete when order `n` is processed.

mod optimize;
mod verify;

use crate::error::{Error, Result};
use crate::expression::{
    exp, get_params, get_variables, log, mul, split_sums, Expression, Func, Op, Param, Variable,
};
use crate::ode::OdeSys;
use crate::parallel::{parallel_fill, slots};
use log::debug;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

/// One elementary assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcEntry {
    pub rhs: Expression,
    /// Auxiliary entries whose coefficients the recurrence of this entry reads.
    pub hidden: Vec<usize>,
}

impl DcEntry {
    fn new(rhs: Expression) -> Self {
        Self {
            rhs,
            hidden: Vec::new(),
        }
    }

    /// Indices of the `u_j` arguments of the right-hand side.
    pub fn refs(&self) -> impl Iterator<Item = usize> + '_ {
        let args: &[Expression] = match &self.rhs {
            Expression::Func(f) => f.args(),
            other => std::slice::from_ref(other),
        };
        args.iter().filter_map(u_index)
    }

    pub fn op(&self) -> Option<Op> {
        self.rhs.as_func().map(Func::op)
    }
}

/// The elementary variable `u_i`.
pub fn u(i: usize) -> Expression {
    Expression::Variable(Variable::elementary(i))
}

/// Index of an elementary variable expression.
pub fn u_index(e: &Expression) -> Option<usize> {
    e.as_variable().and_then(Variable::elementary_index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecomposeOptions {
    /// Maximum number of terms of a sum entry. Must be at least 2.
    pub sum_split: usize,
    /// Common subexpression elimination followed by dead-code elimination.
    pub cse: bool,
    /// Breadth-first reordering by level.
    pub reorder: bool,
}

impl Default for DecomposeOptions {
    fn default() -> Self {
        Self {
            sum_split: 8,
            cse: true,
            reorder: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaylorDc {
    entries: Vec<DcEntry>,
    variables: Vec<Variable>,
    params: Vec<Param>,
    n_outputs: usize,
}

impl TaylorDc {
    pub fn entries(&self) -> &[DcEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The renamed variables, in prefix order.
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// The renamed parameters, in prefix order.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn n_vars(&self) -> usize {
        self.variables.len()
    }

    pub fn n_prefix(&self) -> usize {
        self.variables.len() + self.params.len()
    }

    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    /// Indices of the function entries.
    pub fn functions(&self) -> Range<usize> {
        self.n_prefix()..self.entries.len() - self.n_outputs
    }

    pub fn outputs(&self) -> &[DcEntry] {
        &self.entries[self.entries.len() - self.n_outputs..]
    }

    /// Longest path from the prefix: 0 for prefix entries, one more than the
    /// deepest argument for function entries.
    pub fn levels(&self) -> Vec<usize> {
        let mut levels = vec![0; self.entries.len()];
        for i in self.functions() {
            levels[i] = 1 + self.entries[i]
                .refs()
                .map(|j| levels[j])
                .max()
                .unwrap_or(0);
        }
        levels
    }

    /// Number of function entries with operator `op`.
    pub fn count_op(&self, op: Op) -> usize {
        self.entries[self.functions()]
            .iter()
            .filter(|e| e.op() == Some(op))
            .count()
    }

    /// Expands the outputs back into expressions over the original atoms.
    pub fn reconstruct(&self) -> Vec<Expression> {
        verify::reconstruct(self)
    }

    /// Checks ordering, reference validity and that the outputs expand back
    /// into `originals`.
    pub fn verify(&self, originals: &[Expression]) -> Result<()> {
        verify::verify(self, originals)
    }
}

/// Decomposes a single expression. Variables are numbered alphabetically.
pub fn decompose(e: &Expression) -> Result<TaylorDc> {
    decompose_with(e, &DecomposeOptions::default())
}

pub fn decompose_with(e: &Expression, opts: &DecomposeOptions) -> Result<TaylorDc> {
    let variables = get_variables(e);
    if let Some(v) = variables.iter().find(|v| v.is_elementary()) {
        return Err(Error::InvalidInput(format!(
            "the variable name '{v}' is reserved for internal use"
        )));
    }
    build(variables, std::slice::from_ref(e), opts)
}

/// Decomposes the right-hand sides of `sys` followed by `extra` outputs
/// (event functions). Variables are numbered in state order, so `u_k` is
/// the state component `k`.
pub fn decompose_ode(sys: &OdeSys, extra: &[Expression], opts: &DecomposeOptions) -> Result<TaylorDc> {
    for e in extra {
        if let Some(v) = get_variables(e)
            .into_iter()
            .find(|v| sys.index_of(v).is_none())
        {
            return Err(Error::InvalidInput(format!(
                "the expression '{e}' refers to '{v}', which is not a state variable"
            )));
        }
    }
    let outputs: Vec<Expression> = sys.rhs().iter().chain(extra).cloned().collect();
    build(sys.state_vars().to_vec(), &outputs, opts)
}

/// Rewrites applied before decomposition: sum splitting, and `pow` with a
/// non-numeric exponent expanded into `exp(e * log(b))`.
fn prepare(e: &Expression, sum_split: usize) -> Result<Expression> {
    fn expand_pow(e: &Expression, memo: &mut HashMap<usize, Expression>) -> Expression {
        let Expression::Func(f) = e else {
            return e.clone();
        };
        if let Some(done) = memo.get(&f.node_id()) {
            return done.clone();
        }
        let args: Vec<Expression> = f.args().iter().map(|a| expand_pow(a, memo)).collect();
        let result = if f.op() == Op::Pow && !args[1].is_number() {
            exp(mul(args[1].clone(), log(args[0].clone())))
        } else if args.iter().zip(f.args()).all(|(n, o)| n.same_node(o)) {
            e.clone()
        } else {
            Expression::Func(f.with_args(args))
        };
        memo.insert(f.node_id(), result.clone());
        result
    }

    let split = split_sums(e, sum_split)?;
    Ok(expand_pow(&split, &mut HashMap::new()))
}

fn build(variables: Vec<Variable>, outputs: &[Expression], opts: &DecomposeOptions) -> Result<TaylorDc> {
    // outputs are prepared independently, one slot each
    let cells = slots(outputs.len());
    parallel_fill(&cells, |i| prepare(&outputs[i], opts.sum_split));
    let prepared = cells
        .into_iter()
        .filter_map(OnceCell::into_inner)
        .collect::<Result<Vec<_>>>()?;
    let params: Vec<Param> = prepared
        .iter()
        .flat_map(get_params)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut builder = Builder::new(&variables, &params);
    let refs = prepared
        .iter()
        .map(|e| builder.node(e))
        .collect::<Result<Vec<_>>>()?;
    let mut entries = builder.entries;
    entries.extend(refs.into_iter().map(DcEntry::new));

    let mut dc = TaylorDc {
        entries,
        variables,
        params,
        n_outputs: prepared.len(),
    };
    debug_assert!(dc.verify(&prepared).is_ok(), "raw decomposition is inconsistent");

    let raw_len = dc.len();
    if opts.cse {
        dc = optimize::cse(dc);
        let after_cse = dc.len();
        dc = optimize::dce(dc);
        debug!(
            "decomposition: {} raw entries, {} removed by CSE, {} removed as dead code",
            raw_len,
            raw_len - after_cse,
            after_cse - dc.len()
        );
        debug_assert!(dc.verify(&prepared).is_ok(), "CSE broke the decomposition");
    }
    if opts.reorder {
        dc = optimize::reorder(dc);
        debug_assert!(dc.verify(&prepared).is_ok(), "reordering broke the decomposition");
    }
    debug!(
        "decomposition: {} entries ({} prefix, {} outputs)",
        dc.len(),
        dc.n_prefix(),
        dc.n_outputs()
    );
    Ok(dc)
}

struct Builder {
    entries: Vec<DcEntry>,
    var_index: HashMap<Variable, usize>,
    par_index: HashMap<Param, usize>,
    memo: HashMap<usize, Expression>,
    time: Option<Expression>,
}

fn raw(op: Op, args: Vec<Expression>) -> Expression {
    Expression::Func(Func::new_unchecked(op, args))
}

impl Builder {
    fn new(variables: &[Variable], params: &[Param]) -> Self {
        let mut entries = Vec::new();
        let mut var_index = HashMap::new();
        let mut par_index = HashMap::new();
        for v in variables {
            var_index.insert(v.clone(), entries.len());
            entries.push(DcEntry::new(Expression::Variable(v.clone())));
        }
        for p in params {
            par_index.insert(*p, entries.len());
            entries.push(DcEntry::new(Expression::Param(*p)));
        }
        Self {
            entries,
            var_index,
            par_index,
            memo: HashMap::new(),
            time: None,
        }
    }

    fn push(&mut self, rhs: Expression, hidden: Vec<usize>) -> usize {
        self.entries.push(DcEntry { rhs, hidden });
        self.entries.len() - 1
    }

    /// Returns a number or the `u_i` standing for `e`.
    fn node(&mut self, e: &Expression) -> Result<Expression> {
        match e {
            Expression::Number(_) => Ok(e.clone()),
            Expression::Variable(v) => self
                .var_index
                .get(v)
                .map(|&i| u(i))
                .ok_or_else(|| Error::InvalidInput(format!("unknown variable '{v}'"))),
            Expression::Param(p) => self
                .par_index
                .get(p)
                .map(|&i| u(i))
                .ok_or_else(|| Error::InvalidInput(format!("unknown parameter {p}"))),
            Expression::Time => {
                if let Some(t) = &self.time {
                    return Ok(t.clone());
                }
                let t = u(self.push(Expression::Time, Vec::new()));
                self.time = Some(t.clone());
                Ok(t)
            }
            Expression::Func(f) => {
                if let Some(done) = self.memo.get(&f.node_id()) {
                    return Ok(done.clone());
                }
                let args = f
                    .args()
                    .iter()
                    .map(|a| self.node(a))
                    .collect::<Result<Vec<_>>>()?;
                let idx = self.append(f.op(), args);
                self.memo.insert(f.node_id(), u(idx));
                Ok(u(idx))
            }
        }
    }

    /// Appends the entry for `op(args)` together with the auxiliary entries
    /// its recurrence needs, returning the index of the entry itself.
    fn append(&mut self, op: Op, args: Vec<Expression>) -> usize {
        match op {
            Op::Sin | Op::Cos | Op::Sinh | Op::Cosh => {
                let partner = match op {
                    Op::Sin => Op::Cos,
                    Op::Cos => Op::Sin,
                    Op::Sinh => Op::Cosh,
                    _ => Op::Sinh,
                };
                let a = self.entries.len();
                self.push(raw(op, args.clone()), vec![a + 1]);
                self.push(raw(partner, args), vec![a]);
                a
            }
            Op::Tan | Op::Tanh => {
                let a = self.entries.len();
                self.push(raw(op, args), vec![a + 1]);
                self.push(raw(Op::Square, vec![u(a)]), Vec::new());
                a
            }
            Op::Asin | Op::Acos => {
                // sqrt(1 - b^2), in the shape the canonical constructors give it
                let sq = self.push(raw(Op::Square, vec![args[0].clone()]), Vec::new());
                let ng = self.push(raw(Op::Neg, vec![u(sq)]), Vec::new());
                let diff = self.push(raw(Op::Sum, vec![u(ng), 1.0.into()]), Vec::new());
                let root = self.push(raw(Op::Sqrt, vec![u(diff)]), Vec::new());
                self.push(raw(op, args), vec![root])
            }
            Op::Atan => {
                let sq = self.push(raw(Op::Square, vec![args[0].clone()]), Vec::new());
                self.push(raw(op, args), vec![sq])
            }
            Op::Atan2 => {
                let sy = self.push(raw(Op::Square, vec![args[0].clone()]), Vec::new());
                let sx = self.push(raw(Op::Square, vec![args[1].clone()]), Vec::new());
                let den = self.push(raw(Op::Sum, vec![u(sy), u(sx)]), Vec::new());
                self.push(raw(op, args), vec![den])
            }
            Op::KepE => {
                let a = self.entries.len();
                self.push(raw(op, args), vec![a + 1, a + 2]);
                self.push(raw(Op::Sin, vec![u(a)]), vec![a + 2]);
                self.push(raw(Op::Cos, vec![u(a)]), vec![a + 1]);
                a
            }
            _ => self.push(raw(op, args), Vec::new()),
        }
    }
}
