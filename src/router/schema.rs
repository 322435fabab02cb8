//! Schema capability used by the router to match and type inbound payloads.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Validates an untyped JSON value, producing a typed value on success.
///
/// Rejecting a value is the normal outcome when several schemas are registered side by side;
/// implementations return `None` for mismatches and never panic on well-formed input.
pub trait Schema: Send + Sync + 'static {
    type Output: Send + 'static;

    fn validate(&self, value: &Value) -> Option<Self::Output>;
}

/// Accepts any value that deserializes into `T`.
pub struct Typed<T>(PhantomData<fn() -> T>);

impl<T> fmt::Debug for Typed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Typed")
            .field(&std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Clone for Typed<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Typed<T> {}

impl<T: DeserializeOwned + Send + 'static> Schema for Typed<T> {
    type Output = T;

    fn validate(&self, value: &Value) -> Option<T> {
        deserialize(value)
    }
}

/// Accepts objects whose `field` is the string `tag` and that deserialize into `T`.
///
/// This is the usual shape for event-typed protocols such as `{"type": "trade", ...}`.
pub struct Tagged<T> {
    field: String,
    tag: String,
    _output: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Tagged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagged")
            .field("field", &self.field)
            .field("tag", &self.tag)
            .field("output", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: DeserializeOwned + Send + 'static> Schema for Tagged<T> {
    type Output = T;

    fn validate(&self, value: &Value) -> Option<T> {
        let tag = value.get(&self.field)?.as_str()?;
        if tag != self.tag {
            return None;
        }
        deserialize(value)
    }
}

/// Schema backed by a closure.
#[derive(Clone)]
pub struct FnSchema<F>(F);

impl<F> fmt::Debug for FnSchema<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnSchema")
    }
}

impl<F, T> Schema for FnSchema<F>
where
    F: Fn(&Value) -> Option<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn validate(&self, value: &Value) -> Option<T> {
        (self.0)(value)
    }
}

/// Schema accepting anything that deserializes into `T`.
#[must_use]
pub fn typed<T: DeserializeOwned + Send + 'static>() -> Typed<T> {
    Typed(PhantomData)
}

/// Schema accepting objects with `field == tag` that deserialize into `T`.
#[must_use]
pub fn tagged<T: DeserializeOwned + Send + 'static>(field: &str, tag: &str) -> Tagged<T> {
    Tagged {
        field: field.to_owned(),
        tag: tag.to_owned(),
        _output: PhantomData,
    }
}

/// Schema from a validation closure.
#[must_use]
pub fn from_fn<F, T>(validate: F) -> FnSchema<F>
where
    F: Fn(&Value) -> Option<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    FnSchema(validate)
}

#[cfg(feature = "tracing")]
fn deserialize<T: DeserializeOwned>(value: &Value) -> Option<T> {
    match serde_path_to_error::deserialize::<_, T>(value) {
        Ok(typed) => Some(typed),
        Err(e) => {
            tracing::trace!(
                type_name = %std::any::type_name::<T>(),
                path = %e.path(),
                error = %e.inner(),
                "schema mismatch"
            );
            None
        }
    }
}

#[cfg(not(feature = "tracing"))]
fn deserialize<T: DeserializeOwned>(value: &Value) -> Option<T> {
    T::deserialize(value).ok()
}
