//! Symbolic expression algebra.
//!
//! An [`Expression`] is an immutable handle over a DAG of atoms and function
//! nodes. Function nodes are shared through `Arc`, so cloning is cheap and
//! common subterms are stored once. Construction through the functions in
//! [`ops`] applies the canonicalisation rules (flattened sums with a single
//! trailing constant, peephole rewrites of `neg`/`sin`/`cos`, folding of
//! numeric identities). The raw [`Func::new`] constructor applies none.

pub mod atoms;
pub mod diff;
pub mod func;
pub mod ops;
pub mod subs;

pub use atoms::{Number, Param, Variable, VARIATIONAL_PREFIX};
pub use diff::{diff, gradient};
pub use func::{solve_kepler, Arity, Func, Op};
pub use ops::{
    acos, add, apply, asin, atan, atan2, cos, cosh, div, exp, kep_e, log, mul, neg, pow, sin,
    sinh, sqrt, square, sub, sum, tan, tanh,
};
pub use subs::{copy, get_params, get_variables, has_time, normalise, rename_variables, split_sums, subs};

use crate::error::{Error, Result};
use crate::traits::Scalar;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Number(Number),
    Param(Param),
    Variable(Variable),
    /// The independent variable. Distinct from any variable named `t`.
    Time,
    Func(Func),
}

impl Expression {
    pub fn num(value: f64) -> Result<Self> {
        Number::new(value).map(Expression::Number)
    }

    pub fn var(name: impl AsRef<str>) -> Result<Self> {
        Variable::new(name).map(Expression::Variable)
    }

    pub fn par(index: u32) -> Self {
        Expression::Param(Param(index))
    }

    pub fn time() -> Self {
        Expression::Time
    }

    pub fn zero() -> Self {
        Expression::from(0.0)
    }

    pub fn one() -> Self {
        Expression::from(1.0)
    }

    pub fn as_literal(&self) -> Option<Number> {
        match self {
            Expression::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expression::Number(n) => Some(n.value()),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Expression::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<&Func> {
        match self {
            Expression::Func(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Expression::Number(_))
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expression::Number(n) if n.is_zero())
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expression::Number(n) if n.is_one())
    }

    /// True when `self` is a function node with operator `op`.
    pub fn is_op(&self, op: Op) -> bool {
        matches!(self, Expression::Func(f) if f.op() == op)
    }

    /// Hash of the DAG structure. Function nodes cache theirs.
    pub fn structural_hash(&self) -> u64 {
        if let Expression::Func(f) = self {
            return f.structural_hash();
        }
        let mut hasher = DefaultHasher::new();
        match self {
            Expression::Number(n) => {
                hasher.write_u8(0);
                hasher.write_u64(n.value().to_bits());
            }
            Expression::Param(p) => {
                hasher.write_u8(1);
                hasher.write_u32(p.index());
            }
            Expression::Variable(v) => {
                hasher.write_u8(2);
                hasher.write(v.name().as_bytes());
            }
            Expression::Time => hasher.write_u8(3),
            Expression::Func(_) => unreachable!(),
        }
        hasher.finish()
    }

    /// Node identity for memoised traversals: `Some` only for function nodes.
    pub(crate) fn node_id(&self) -> Option<usize> {
        self.as_func().map(Func::node_id)
    }

    /// Identity comparison: same shared node, or equal atoms.
    pub(crate) fn same_node(&self, other: &Expression) -> bool {
        match (self, other) {
            (Expression::Func(a), Expression::Func(b)) => a.ptr_eq(b),
            (Expression::Func(_), _) | (_, Expression::Func(_)) => false,
            (a, b) => a == b,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Expression::Number(_) => 0,
            Expression::Param(_) => 1,
            Expression::Time => 2,
            Expression::Variable(_) => 3,
            Expression::Func(_) => 4,
        }
    }

    /// Total order used to sort the arguments of commutative operators.
    pub fn canonical_cmp(&self, other: &Expression) -> Ordering {
        match (self, other) {
            (Expression::Number(a), Expression::Number(b)) => a.value().total_cmp(&b.value()),
            (Expression::Param(a), Expression::Param(b)) => a.cmp(b),
            (Expression::Variable(a), Expression::Variable(b)) => a.cmp(b),
            (Expression::Time, Expression::Time) => Ordering::Equal,
            (Expression::Func(a), Expression::Func(b)) => {
                if a.ptr_eq(b) {
                    return Ordering::Equal;
                }
                a.op()
                    .cmp(&b.op())
                    .then_with(|| a.args().len().cmp(&b.args().len()))
                    .then_with(|| a.structural_hash().cmp(&b.structural_hash()))
                    .then_with(|| {
                        a.args()
                            .iter()
                            .zip(b.args())
                            .map(|(x, y)| x.canonical_cmp(y))
                            .find(|o| *o != Ordering::Equal)
                            .unwrap_or(Ordering::Equal)
                    })
            }
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }

    /// Numerical evaluation.
    ///
    /// Fails on variables missing from `vars` and on parameter indices out of
    /// range. Shared nodes are evaluated once.
    pub fn eval<T: Scalar>(&self, vars: &HashMap<Variable, T>, pars: &[T], time: T) -> Result<T> {
        let mut memo = HashMap::new();
        self.eval_memo(vars, pars, time, &mut memo)
    }

    fn eval_memo<T: Scalar>(
        &self,
        vars: &HashMap<Variable, T>,
        pars: &[T],
        time: T,
        memo: &mut HashMap<usize, T>,
    ) -> Result<T> {
        match self {
            Expression::Number(n) => T::from_f64(n.value()).ok_or_else(|| {
                Error::InvalidInput(format!("literal {n} is not representable"))
            }),
            Expression::Param(p) => pars.get(p.index() as usize).copied().ok_or_else(|| {
                Error::InvalidInput(format!(
                    "parameter index {} is out of range for {} parameter(s)",
                    p.index(),
                    pars.len()
                ))
            }),
            Expression::Variable(v) => vars
                .get(v)
                .copied()
                .ok_or_else(|| Error::InvalidInput(format!("no value for variable '{v}'"))),
            Expression::Time => Ok(time),
            Expression::Func(f) => {
                if let Some(&value) = memo.get(&f.node_id()) {
                    return Ok(value);
                }
                let args = f
                    .args()
                    .iter()
                    .map(|a| a.eval_memo(vars, pars, time, memo))
                    .collect::<Result<Vec<T>>>()?;
                let value = f.op().eval(&args);
                memo.insert(f.node_id(), value);
                Ok(value)
            }
        }
    }
}

/// Builds a literal.
///
/// # Panics
///
/// On NaN. Use [`Expression::num`] for values that are not known constants.
impl From<f64> for Expression {
    fn from(value: f64) -> Self {
        match Number::new(value) {
            Ok(n) => Expression::Number(n),
            Err(_) => panic!("NaN cannot be used as a numeric literal"),
        }
    }
}

impl From<Variable> for Expression {
    fn from(v: Variable) -> Self {
        Expression::Variable(v)
    }
}

impl From<Param> for Expression {
    fn from(p: Param) -> Self {
        Expression::Param(p)
    }
}

impl Hash for Expression {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.structural_hash());
    }
}

/// Creates the variables named `names`.
pub fn make_vars<const N: usize>(names: [&str; N]) -> Result<[Expression; N]> {
    let mut out: [Expression; N] = std::array::from_fn(|_| Expression::Time);
    for (slot, name) in out.iter_mut().zip(names) {
        *slot = Expression::var(name)?;
    }
    Ok(out)
}

pub fn par(index: u32) -> Expression {
    Expression::par(index)
}

pub fn time() -> Expression {
    Expression::Time
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Number(n) if n.value() < 0.0 => write!(f, "({n})"),
            Expression::Number(n) => write!(f, "{n}"),
            Expression::Param(p) => write!(f, "{p}"),
            Expression::Variable(v) => write!(f, "{v}"),
            Expression::Time => f.write_str("t"),
            Expression::Func(func) => {
                let args = func.args();
                let infix = |f: &mut fmt::Formatter<'_>, sep: &str| -> fmt::Result {
                    f.write_str("(")?;
                    for (i, a) in args.iter().enumerate() {
                        if i > 0 {
                            f.write_str(sep)?;
                        }
                        write!(f, "{a}")?;
                    }
                    f.write_str(")")
                };
                match func.op() {
                    Op::Sum => infix(f, " + "),
                    Op::Mul => infix(f, " * "),
                    Op::Div => infix(f, " / "),
                    Op::Pow => infix(f, "**"),
                    Op::Neg => write!(f, "-{}", args[0]),
                    Op::Square => write!(f, "{}**2", args[0]),
                    op => {
                        write!(f, "{}(", op.name())?;
                        for (i, a) in args.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "{a}")?;
                        }
                        f.write_str(")")
                    }
                }
            }
        }
    }
}

/// One node of the flattened serialized form. Function arguments refer to
/// earlier nodes by position.
#[derive(Serialize, Deserialize)]
enum NodeData {
    Number(Number),
    Param(Param),
    Variable(Variable),
    Time,
    Func { op: Op, args: Vec<u32> },
}

/// Serialized form of an expression: shared nodes are written once.
#[derive(Serialize, Deserialize)]
struct ExpressionData {
    nodes: Vec<NodeData>,
}

impl ExpressionData {
    fn flatten(root: &Expression) -> Self {
        fn visit(
            e: &Expression,
            nodes: &mut Vec<NodeData>,
            seen: &mut HashMap<usize, u32>,
        ) -> u32 {
            if let Some(id) = e.node_id() {
                if let Some(&pos) = seen.get(&id) {
                    return pos;
                }
            }
            let data = match e {
                Expression::Number(n) => NodeData::Number(*n),
                Expression::Param(p) => NodeData::Param(*p),
                Expression::Variable(v) => NodeData::Variable(v.clone()),
                Expression::Time => NodeData::Time,
                Expression::Func(f) => {
                    let args = f.args().iter().map(|a| visit(a, nodes, seen)).collect();
                    NodeData::Func { op: f.op(), args }
                }
            };
            let pos = nodes.len() as u32;
            nodes.push(data);
            if let Some(id) = e.node_id() {
                seen.insert(id, pos);
            }
            pos
        }

        let mut nodes = Vec::new();
        visit(root, &mut nodes, &mut HashMap::new());
        Self { nodes }
    }

    fn rebuild(self) -> Result<Expression> {
        let mut built: Vec<Expression> = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            let e = match node {
                NodeData::Number(n) => Expression::Number(n),
                NodeData::Param(p) => Expression::Param(p),
                NodeData::Variable(v) => Expression::Variable(v),
                NodeData::Time => Expression::Time,
                NodeData::Func { op, args } => {
                    let args = args
                        .into_iter()
                        .map(|i| {
                            built.get(i as usize).cloned().ok_or_else(|| {
                                Error::Serialization(format!(
                                    "expression node refers to unknown node {i}"
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Expression::Func(Func::new(op, args)?)
                }
            };
            built.push(e);
        }
        built
            .pop()
            .ok_or_else(|| Error::Serialization("empty expression archive".to_string()))
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ExpressionData::flatten(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        ExpressionData::deserialize(deserializer)?
            .rebuild()
            .map_err(serde::de::Error::custom)
    }
}
