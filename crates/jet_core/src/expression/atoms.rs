//! Leaf atoms of the expression DAG.

use crate::error::{Error, Result};
use crate::traits::FpKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// An immutable literal, tagged with the floating-point kind it was written
/// in.
///
/// Values are held in binary64: binary32 literals are rounded on
/// construction and wider kinds keep binary64 precision. Equality and hashing
/// compare the value under the common kind of both sides, which is the
/// bit pattern of the stored binary64 value, so `0.0` and `-0.0` are
/// distinct numbers. NaN cannot be represented.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "NumberRepr", into = "NumberRepr")]
pub struct Number {
    value: f64,
    kind: FpKind,
}

#[derive(Serialize, Deserialize)]
struct NumberRepr {
    value: f64,
    kind: FpKind,
}

impl Number {
    pub fn new(value: f64) -> Result<Self> {
        Self::with_kind(value, FpKind::Binary64)
    }

    pub fn with_kind(value: f64, kind: FpKind) -> Result<Self> {
        if value.is_nan() {
            return Err(Error::InvalidInput(
                "NaN cannot be used as a numeric literal".to_string(),
            ));
        }
        let value = match kind {
            FpKind::Binary32 => value as f32 as f64,
            _ => value,
        };
        Ok(Self { value, kind })
    }

    /// Folding helper: `None` when the folded value would be NaN.
    pub(crate) fn folded(value: f64, kind: FpKind) -> Option<Self> {
        Self::with_kind(value, kind).ok()
    }

    pub fn value(self) -> f64 {
        self.value
    }

    pub fn kind(self) -> FpKind {
        self.kind
    }

    /// True for both signed zeros.
    pub fn is_zero(self) -> bool {
        self.value == 0.0
    }

    pub fn is_one(self) -> bool {
        self.value == 1.0
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.value.to_bits() == other.value.to_bits()
    }
}

impl Eq for Number {}

impl Hash for Number {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.to_bits().hash(state);
    }
}

impl TryFrom<NumberRepr> for Number {
    type Error = Error;

    fn try_from(repr: NumberRepr) -> Result<Self> {
        Number::with_kind(repr.value, repr.kind)
    }
}

impl From<Number> for NumberRepr {
    fn from(n: Number) -> Self {
        NumberRepr {
            value: n.value,
            kind: n.kind,
        }
    }
}

impl From<Number> for f64 {
    fn from(n: Number) -> f64 {
        n.value
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Index into the external parameter array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Param(pub u32);

impl Param {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p[{}]", self.0)
    }
}

/// Prefix of the state variables created by the variational builder.
pub const VARIATIONAL_PREFIX: &str = "∂";

/// A named variable. Equality is by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variable(Arc<str>);

impl Variable {
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(Error::InvalidInput(
                "variable names cannot be empty".to_string(),
            ));
        }
        Ok(Self(Arc::from(name)))
    }

    /// The elementary variable `u_{index}` used inside decompositions.
    pub(crate) fn elementary(index: usize) -> Self {
        Self(Arc::from(format!("u_{index}")))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Index of an elementary variable (`u_` followed by decimal digits).
    pub fn elementary_index(&self) -> Option<usize> {
        let digits = self.0.strip_prefix("u_")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub fn is_elementary(&self) -> bool {
        self.elementary_index().is_some()
    }

    pub fn is_variational(&self) -> bool {
        self.0.starts_with(VARIATIONAL_PREFIX)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
