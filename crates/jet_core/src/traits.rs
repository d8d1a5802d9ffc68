use crate::expression::Op;
use num_traits::{Float, FromPrimitive};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in expressions and Taylor tapes.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + Send + Sync + 'static {}

impl<T: Float + FromPrimitive + Debug + Send + Sync + 'static> Scalar for T {}

/// Represents a dynamical system (flow) that can be evaluated pointwise.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// x: current state
    /// t: current time
    /// out: buffer to write dx/dt
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// Floating-point formats an fp policy can describe, from the narrowest to
/// the widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FpKind {
    Binary32,
    Binary64,
    Binary80,
    Binary128,
    Arbitrary,
}

impl FpKind {
    /// The wider of two kinds; mixed literals fold in it.
    pub fn common(self, other: FpKind) -> FpKind {
        self.max(other)
    }

    pub fn name(self) -> &'static str {
        match self {
            FpKind::Binary32 => "binary32",
            FpKind::Binary64 => "binary64",
            FpKind::Binary80 => "binary80",
            FpKind::Binary128 => "binary128",
            FpKind::Arbitrary => "arbitrary",
        }
    }
}

/// Operator capability matrix: whether `op` has an evaluator and a Taylor
/// recurrence for scalars of the given kind.
///
/// The extended-precision kinds have no backend in this crate; the matrix
/// still describes them so that a backend plugging in such a type inherits
/// the same restrictions.
pub fn op_supported(kind: FpKind, op: Op) -> bool {
    match kind {
        FpKind::Binary64 => true,
        // Single precision cannot resolve the Kepler solve to the tolerances
        // the recurrence assumes.
        FpKind::Binary32 => op != Op::KepE,
        FpKind::Binary80 | FpKind::Binary128 => true,
        FpKind::Arbitrary => !matches!(op, Op::KepE | Op::Atan2),
    }
}

/// An fp policy: the scalar family the integrator is parameterised on.
///
/// Provides the policy name, the vector width used by the IR, the textual
/// forms used when dumping IR, and the default tolerance.
pub trait FpPolicy:
    Scalar + nalgebra::Scalar + Serialize + DeserializeOwned + Default
{
    const KIND: FpKind;

    fn name() -> &'static str {
        Self::KIND.name()
    }

    /// Number of SIMD lanes the generated code operates on.
    fn vector_width() -> usize {
        1
    }

    /// Default tolerance: machine epsilon.
    fn default_tol() -> Self {
        Self::epsilon()
    }

    /// Literal as it appears in an IR dump.
    fn literal(value: f64) -> String;

    /// Name of the external math routine implementing `func` for this type.
    fn intrinsic(func: &str) -> String;

    fn from_f64_lossy(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }
}

impl FpPolicy for f64 {
    const KIND: FpKind = FpKind::Binary64;

    fn literal(value: f64) -> String {
        format!("double {value:e}")
    }

    fn intrinsic(func: &str) -> String {
        func.to_string()
    }
}

impl FpPolicy for f32 {
    const KIND: FpKind = FpKind::Binary32;

    fn literal(value: f64) -> String {
        format!("float {:e}", value as f32)
    }

    fn intrinsic(func: &str) -> String {
        format!("{func}f")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_matrix_disables_kepler_in_single_precision() {
        assert!(op_supported(FpKind::Binary64, Op::KepE));
        assert!(!op_supported(FpKind::Binary32, Op::KepE));
        assert!(op_supported(FpKind::Binary32, Op::Sin));
    }

    #[test]
    fn policies_report_names_and_tolerances() {
        assert_eq!(<f64 as FpPolicy>::name(), "binary64");
        assert_eq!(<f32 as FpPolicy>::name(), "binary32");
        assert_eq!(<f64 as FpPolicy>::default_tol(), f64::EPSILON);
        assert_eq!(<f32 as FpPolicy>::intrinsic("sin"), "sinf");
        assert!(<f64 as FpPolicy>::literal(0.5).starts_with("double"));
    }
}
