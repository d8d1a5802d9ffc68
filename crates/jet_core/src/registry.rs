//! Process-wide table of serializable step callback types, keyed by tag.

use crate::error::{Error, Result};
use crate::integrator::callback::{StepCallback, ANGLE_REDUCER_TAG, CALLBACK_SET_TAG};
use crate::traits::FpPolicy;
use log::debug;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::HashMap;

type Loader<T> = fn(&[u8]) -> Result<Box<dyn StepCallback<T>>>;

/// Loaders are stored type-erased; the key carries the fp policy they
/// produce callbacks for.
static REGISTRY: Lazy<RwLock<HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn load<T: FpPolicy, C>(payload: &[u8]) -> Result<Box<dyn StepCallback<T>>>
where
    C: StepCallback<T> + DeserializeOwned + 'static,
{
    let cb: C = bincode::deserialize(payload)?;
    Ok(Box::new(cb))
}

/// Makes callbacks of type `C` deserializable under `tag`.
///
/// `C::tag` must return the same tag and `C::payload` the bincode encoding
/// of the callback. A tag can be registered once per fp policy.
pub fn register_step_callback<T, C>(tag: &str) -> Result<()>
where
    T: FpPolicy,
    C: StepCallback<T> + DeserializeOwned + 'static,
{
    if tag == CALLBACK_SET_TAG || tag == ANGLE_REDUCER_TAG || tag.is_empty() {
        return Err(Error::InvalidInput(format!("the callback tag '{tag}' is reserved")));
    }
    let key = (TypeId::of::<T>(), tag.to_string());
    let mut registry = REGISTRY.write();
    if registry.contains_key(&key) {
        return Err(Error::InvalidInput(format!(
            "the callback tag '{tag}' is already registered for {}",
            T::name()
        )));
    }
    let loader: Loader<T> = load::<T, C>;
    registry.insert(key, Box::new(loader));
    debug!("registered step callback '{tag}' for {}", T::name());
    Ok(())
}

pub fn is_registered<T: FpPolicy>(tag: &str) -> bool {
    REGISTRY
        .read()
        .contains_key(&(TypeId::of::<T>(), tag.to_string()))
}

pub(crate) fn load_step_callback<T: FpPolicy>(
    tag: &str,
    payload: &[u8],
) -> Result<Box<dyn StepCallback<T>>> {
    let loader = {
        let registry = REGISTRY.read();
        registry
            .get(&(TypeId::of::<T>(), tag.to_string()))
            .and_then(|entry| entry.downcast_ref::<Loader<T>>())
            .copied()
    };
    match loader {
        Some(f) => f(payload),
        None => Err(Error::Serialization(format!(
            "no step callback is registered under the tag '{tag}' for {}",
            T::name()
        ))),
    }
}
