//! The `jet_core` crate turns systems of ODEs written as symbolic expressions
//! into compiled Taylor-coefficient functions and integrates them with an
//! adaptive Taylor method.
//!
//! Key components:
//! - **Expression**: immutable, shared expression DAG with differentiation and substitution.
//! - **Decomposition**: Taylor decomposition of a system into elementary operations.
//! - **Recurrence / Emit**: coefficient recurrences lowered to an SSA IR.
//! - **Equation Engine**: the IR, the `JitBackend`/`TaylorFn` seam and the VM backend.
//! - **Integrator**: `TaylorAdaptive` with events, callbacks and dense output.
//! - **Variational**: variational equations with respect to states, parameters and time.

pub mod decomposition;
pub mod emit;
pub mod equation_engine;
pub mod error;
pub mod expression;
pub mod integrator;
pub mod ode;
pub mod parallel;
pub mod recurrence;
pub mod registry;
pub mod series;
pub mod traits;
pub mod variational;

pub use error::{Error, Result};
pub use expression::{make_vars, par, time, Expression, Variable};
pub use integrator::{
    Callback, EventDirection, NtEvent, PropagateOptions, TEvent, TaylorAdaptive, TaylorConfig,
    TaylorOutcome,
};
pub use ode::OdeSys;
pub use traits::FpPolicy;
pub use variational::{VarArg, VarOdeSys};
