//! Result validation for outgoing requests.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::types::ValidationError;

/// Validates a raw result value into the type the caller expects.
pub trait ResultSchema: Send + Sync + 'static {
    type Output: Send + 'static;

    fn validate(&self, value: Value) -> Result<Self::Output, ValidationError>;
}

/// Decodes the result with serde.
pub struct Typed<T>(PhantomData<fn() -> T>);

impl<T> Typed<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Typed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Typed<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Send + 'static> ResultSchema for Typed<T> {
    type Output = T;

    fn validate(&self, value: Value) -> Result<T, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError(e.to_string()))
    }
}

/// Accepts any result unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyResult;

impl ResultSchema for AnyResult {
    type Output = Value;

    fn validate(&self, value: Value) -> Result<Value, ValidationError> {
        Ok(value)
    }
}
