//! Step callbacks.
//!
//! A callback runs after every successful step of a `propagate_*` call and
//! may stop the propagation by returning `false`. Its pre-hook runs once,
//! before the first step. Callbacks may change the state and the parameters
//! of the integrator but not its time.
//!
//! [`CallbackSet`] and [`AngleReducer`] serialize through built-in tags;
//! other callback types serialize once registered with
//! [`register_step_callback`](crate::registry::register_step_callback).

use super::TaylorAdaptive;
use crate::error::{Error, Result};
use crate::expression::{Expression, Variable};
use crate::registry;
use crate::traits::FpPolicy;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

pub const CALLBACK_SET_TAG: &str = "jet.callback_set";
pub const ANGLE_REDUCER_TAG: &str = "jet.angle_reducer";

pub trait StepCallback<T: FpPolicy>: Send {
    fn call(&mut self, ta: &mut TaylorAdaptive<T>) -> anyhow::Result<bool>;

    fn pre_hook(&mut self, _ta: &mut TaylorAdaptive<T>) -> anyhow::Result<()> {
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepCallback<T>>;

    /// Serialization tag; `None` for callbacks that cannot be serialized.
    fn tag(&self) -> Option<&str> {
        None
    }

    fn payload(&self) -> Result<Vec<u8>> {
        Err(Error::Serialization("this callback has no serialized form".into()))
    }
}

/// Serialized form of a callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackData {
    pub tag: String,
    pub payload: Vec<u8>,
}

/// Type-erased, possibly empty step callback. An empty callback behaves as
/// no callback at all.
pub struct Callback<T: FpPolicy>(Option<Box<dyn StepCallback<T>>>);

impl<T: FpPolicy> Callback<T> {
    pub fn new(cb: impl StepCallback<T> + 'static) -> Self {
        Self(Some(Box::new(cb)))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    /// Callback from a closure. Closures have no serialized form.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut(&mut TaylorAdaptive<T>) -> anyhow::Result<bool> + Clone + Send + 'static,
    {
        Self::new(FnCallback(f))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn call(&mut self, ta: &mut TaylorAdaptive<T>) -> anyhow::Result<bool> {
        match &mut self.0 {
            Some(cb) => cb.call(ta),
            None => Ok(true),
        }
    }

    pub fn pre_hook(&mut self, ta: &mut TaylorAdaptive<T>) -> anyhow::Result<()> {
        match &mut self.0 {
            Some(cb) => cb.pre_hook(ta),
            None => Ok(()),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.0.as_ref().and_then(|cb| cb.tag())
    }

    pub fn to_data(&self) -> Result<Option<CallbackData>> {
        let Some(cb) = &self.0 else {
            return Ok(None);
        };
        let Some(tag) = cb.tag() else {
            return Err(Error::Serialization(
                "the step callback has no serialization tag".into(),
            ));
        };
        Ok(Some(CallbackData {
            tag: tag.to_string(),
            payload: cb.payload()?,
        }))
    }

    pub fn from_data(data: Option<&CallbackData>) -> Result<Self> {
        let Some(data) = data else {
            return Ok(Self::empty());
        };
        let cb: Box<dyn StepCallback<T>> = match data.tag.as_str() {
            CALLBACK_SET_TAG => {
                let parts: Vec<CallbackData> = bincode::deserialize(&data.payload)?;
                let callbacks = parts
                    .iter()
                    .map(|p| Self::from_data(Some(p)))
                    .collect::<Result<Vec<_>>>()?;
                Box::new(CallbackSet { callbacks })
            }
            ANGLE_REDUCER_TAG => {
                let names: Vec<String> = bincode::deserialize(&data.payload)?;
                let vars = names
                    .iter()
                    .map(Variable::new)
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                Box::new(AngleReducer { vars, indices: Vec::new() })
            }
            tag => registry::load_step_callback::<T>(tag, &data.payload)?,
        };
        Ok(Self(Some(cb)))
    }
}

impl<T: FpPolicy> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self(self.0.as_ref().map(|cb| cb.clone_box()))
    }
}

impl<T: FpPolicy> Default for Callback<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: FpPolicy> std::fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            None => f.write_str("Callback(empty)"),
            Some(cb) => write!(f, "Callback({})", cb.tag().unwrap_or("<untagged>")),
        }
    }
}

#[derive(Clone)]
struct FnCallback<F>(F);

impl<T, F> StepCallback<T> for FnCallback<F>
where
    T: FpPolicy,
    F: FnMut(&mut TaylorAdaptive<T>) -> anyhow::Result<bool> + Clone + Send + 'static,
{
    fn call(&mut self, ta: &mut TaylorAdaptive<T>) -> anyhow::Result<bool> {
        (self.0)(ta)
    }

    fn clone_box(&self) -> Box<dyn StepCallback<T>> {
        Box::new(self.clone())
    }
}

/// Runs callbacks in sequence. Every member runs at every step; the set
/// returns `false` when any member does.
#[derive(Debug, Clone, Default)]
pub struct CallbackSet<T: FpPolicy> {
    callbacks: Vec<Callback<T>>,
}

impl<T: FpPolicy> CallbackSet<T> {
    pub fn new(callbacks: Vec<Callback<T>>) -> Self {
        Self {
            callbacks: callbacks.into_iter().filter(|c| !c.is_empty()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<T: FpPolicy> StepCallback<T> for CallbackSet<T> {
    fn call(&mut self, ta: &mut TaylorAdaptive<T>) -> anyhow::Result<bool> {
        let mut keep = true;
        for cb in &mut self.callbacks {
            keep &= cb.call(ta)?;
        }
        Ok(keep)
    }

    fn pre_hook(&mut self, ta: &mut TaylorAdaptive<T>) -> anyhow::Result<()> {
        for cb in &mut self.callbacks {
            cb.pre_hook(ta)?;
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepCallback<T>> {
        Box::new(self.clone())
    }

    fn tag(&self) -> Option<&str> {
        Some(CALLBACK_SET_TAG)
    }

    fn payload(&self) -> Result<Vec<u8>> {
        let parts = self
            .callbacks
            .iter()
            .map(|c| {
                c.to_data()?.ok_or_else(|| Error::Serialization("empty callback in a set".into()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(bincode::serialize(&parts)?)
    }
}

/// Wraps the listed state components into `[0, 2π)` after every step.
#[derive(Debug, Clone)]
pub struct AngleReducer {
    vars: Vec<Variable>,
    indices: Vec<usize>,
}

impl AngleReducer {
    pub fn new(vars: impl IntoIterator<Item = Expression>) -> Result<Self> {
        let vars = vars
            .into_iter()
            .map(|e| match e {
                Expression::Variable(v) => Ok(v),
                other => Err(Error::InvalidInput(format!(
                    "the angle reducer expects variables, got '{other}'"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        if vars.is_empty() {
            return Err(Error::InvalidInput("the angle reducer needs at least one variable".into()));
        }
        Ok(Self {
            vars,
            indices: Vec::new(),
        })
    }
}

fn reduce_angle<T: FpPolicy>(x: T) -> T {
    let tau = T::from_f64_lossy(TAU);
    let r = x - tau * (x / tau).floor();
    if r >= tau || r < T::zero() {
        T::zero()
    } else {
        r
    }
}

impl<T: FpPolicy> StepCallback<T> for AngleReducer {
    fn call(&mut self, ta: &mut TaylorAdaptive<T>) -> anyhow::Result<bool> {
        let state = ta.state_mut();
        for &i in &self.indices {
            state[i] = reduce_angle(state[i]);
        }
        Ok(true)
    }

    fn pre_hook(&mut self, ta: &mut TaylorAdaptive<T>) -> anyhow::Result<()> {
        self.indices = self
            .vars
            .iter()
            .map(|v| {
                ta.state_vars()
                    .iter()
                    .position(|s| s == v)
                    .ok_or_else(|| anyhow::anyhow!("the angle reducer variable '{v}' is not a state variable"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepCallback<T>> {
        Box::new(self.clone())
    }

    fn tag(&self) -> Option<&str> {
        Some(ANGLE_REDUCER_TAG)
    }

    fn payload(&self) -> Result<Vec<u8>> {
        let names: Vec<&str> = self.vars.iter().map(Variable::name).collect();
        Ok(bincode::serialize(&names)?)
    }
}
