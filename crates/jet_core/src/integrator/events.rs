//! Terminal and non-terminal events.
//!
//! An event is an expression `g(x, p, t)` whose zero crossings are located
//! on the Taylor polynomial of `g` over every step. Events are compiled into
//! the same decomposition as the system, so their coefficients come out of
//! the same tape.

use super::poly::{derivative, horner, roots_in};
use super::types::EventDirection;
use super::TaylorAdaptive;
use crate::expression::Expression;
use crate::traits::FpPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Called after a terminal event stopped a step; returning `true` lets a
/// `propagate_*` call continue.
pub type TerminalCallback<T> = Arc<dyn Fn(&mut TaylorAdaptive<T>, EventDirection) -> bool + Send + Sync>;

/// Called with the event time and the crossing direction.
pub type NtCallback<T> = Arc<dyn Fn(&mut TaylorAdaptive<T>, T, EventDirection) + Send + Sync>;

/// An event that ends the step at its earliest root.
#[derive(Clone)]
pub struct TEvent<T: FpPolicy> {
    pub(crate) expression: Expression,
    pub(crate) direction: EventDirection,
    pub(crate) cooldown: Option<T>,
    pub(crate) callback: Option<TerminalCallback<T>>,
}

impl<T: FpPolicy> TEvent<T> {
    pub fn new(expression: Expression) -> Self {
        Self {
            expression,
            direction: EventDirection::Any,
            cooldown: None,
            callback: None,
        }
    }

    pub fn direction(mut self, direction: EventDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Time window after a trigger during which the event is ignored. When
    /// not set it is deduced from the tolerance and the slope of `g`.
    pub fn cooldown(mut self, cooldown: T) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn callback(
        mut self,
        f: impl Fn(&mut TaylorAdaptive<T>, EventDirection) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(f));
        self
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }
}

/// An event reported during integration without stopping it.
#[derive(Clone)]
pub struct NtEvent<T: FpPolicy> {
    pub(crate) expression: Expression,
    pub(crate) direction: EventDirection,
    pub(crate) callback: Option<NtCallback<T>>,
}

impl<T: FpPolicy> NtEvent<T> {
    pub fn new(expression: Expression) -> Self {
        Self {
            expression,
            direction: EventDirection::Any,
            callback: None,
        }
    }

    pub fn direction(mut self, direction: EventDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn callback(
        mut self,
        f: impl Fn(&mut TaylorAdaptive<T>, T, EventDirection) + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(f));
        self
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }
}

impl<T: FpPolicy> std::fmt::Debug for TEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TEvent")
            .field("expression", &self.expression)
            .field("direction", &self.direction)
            .field("cooldown", &self.cooldown)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl<T: FpPolicy> std::fmt::Debug for NtEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtEvent")
            .field("expression", &self.expression)
            .field("direction", &self.direction)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Serialized form of an event. Callbacks are not serialized and must be
/// attached again after loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: FpPolicy")]
pub(crate) struct EventData<T: FpPolicy> {
    pub expression: Expression,
    pub direction: EventDirection,
    pub cooldown: Option<T>,
}

impl<T: FpPolicy> From<&TEvent<T>> for EventData<T> {
    fn from(ev: &TEvent<T>) -> Self {
        Self {
            expression: ev.expression.clone(),
            direction: ev.direction,
            cooldown: ev.cooldown,
        }
    }
}

impl<T: FpPolicy> From<&NtEvent<T>> for EventData<T> {
    fn from(ev: &NtEvent<T>) -> Self {
        Self {
            expression: ev.expression.clone(),
            direction: ev.direction,
            cooldown: None,
        }
    }
}

impl<T: FpPolicy> From<EventData<T>> for TEvent<T> {
    fn from(data: EventData<T>) -> Self {
        Self {
            expression: data.expression,
            direction: data.direction,
            cooldown: data.cooldown,
            callback: None,
        }
    }
}

impl<T: FpPolicy> From<EventData<T>> for NtEvent<T> {
    fn from(data: EventData<T>) -> Self {
        Self {
            expression: data.expression,
            direction: data.direction,
            callback: None,
        }
    }
}

/// A root of an event polynomial inside a step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Crossing<T> {
    /// Distance from the start of the step, always non-negative.
    pub tau: T,
    pub direction: EventDirection,
    /// `|dg/dt|` at the root.
    pub slope: T,
}

/// Crossings of `g` in `[0, h_abs)` that pass the direction filter, in time
/// order.
///
/// `coeffs` are the Taylor coefficients of `g` in the signed step variable;
/// `backward` flips them to the distance variable.
pub(crate) fn crossings<T: FpPolicy>(
    coeffs: &[T],
    h_abs: T,
    backward: bool,
    filter: EventDirection,
) -> Vec<Crossing<T>> {
    let signed: Vec<T> = coeffs
        .iter()
        .enumerate()
        .map(|(n, &c)| if backward && n % 2 == 1 { -c } else { c })
        .collect();
    let der = derivative(coeffs);
    roots_in(&signed, h_abs)
        .into_iter()
        .filter_map(|tau| {
            let delta = if backward { -tau } else { tau };
            let d = horner(&der, delta);
            let direction = if d > T::zero() {
                EventDirection::Positive
            } else if d < T::zero() {
                EventDirection::Negative
            } else {
                EventDirection::Any
            };
            filter.accepts(direction).then_some(Crossing {
                tau,
                direction,
                slope: d.abs(),
            })
        })
        .collect()
}

/// Cooldown used when a terminal event has none.
pub(crate) fn deduce_cooldown<T: FpPolicy>(tol: T, g_scale: T, slope: T, time: T) -> T {
    let floor = T::from_f64_lossy(4.0) * T::epsilon() * time.abs();
    if slope > T::zero() && slope.is_finite() {
        let cd = T::from_f64_lossy(10.0) * tol * g_scale.max(T::one()) / slope;
        cd.max(floor)
    } else {
        floor
    }
}
