//! Procedure registry contract.
//!
//! The engine never runs business logic itself: it hands every call to a
//! [`ProcedureRegistry`] and turns the outcome into response envelopes.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use procmux_protocol::{ErrorKind, ErrorShape, ProcedureKind};

use crate::stream::Observable;

/// Failure reported by a procedure or by the engine on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ProcedureError {
    kind: ErrorKind,
    message: String,
}

impl ProcedureError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a BAD_REQUEST error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Creates a NOT_FOUND error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Creates an INTERNAL_SERVER_ERROR.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalServerError, message)
    }

    /// Builds the error for a panic payload caught while running a procedure.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "procedure panicked".to_string());
        Self::internal(message)
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Wire error shape for a call on `path`.
    pub fn to_shape(&self, path: &str) -> ErrorShape {
        ErrorShape::new(self.kind, self.message.clone()).with_path(path)
    }
}

/// One call handed to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureCall {
    /// Procedure path.
    pub path: String,
    /// Requested kind.
    pub kind: ProcedureKind,
    /// Input after the transformer's `deserialize` step.
    pub input: Option<Value>,
}

/// What a procedure produced.
pub enum ProcedureOutput {
    /// A single value (queries and mutations).
    Value(Value),
    /// A stream of values (subscriptions).
    Stream(Box<dyn Observable>),
}

impl fmt::Debug for ProcedureOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Future returned by [`ProcedureRegistry::invoke`].
pub type ProcedureFuture =
    Pin<Box<dyn Future<Output = Result<ProcedureOutput, ProcedureError>> + Send>>;

/// Resolves and runs procedures by path.
pub trait ProcedureRegistry<C>: Send + Sync + 'static {
    /// Runs `call` with the connection context.
    ///
    /// Unknown paths (or a kind mismatch) must fail with NOT_FOUND. No
    /// timeout is applied by the caller.
    fn invoke(&self, call: ProcedureCall, ctx: Arc<C>) -> ProcedureFuture;
}

/// Deserializes procedure input, reporting BAD_REQUEST on mismatch.
pub fn parse_input<T: DeserializeOwned>(input: Option<Value>) -> Result<T, ProcedureError> {
    serde_json::from_value(input.unwrap_or(Value::Null))
        .map_err(|e| ProcedureError::bad_request(format!("invalid input: {e}")))
}

/// Serializes a procedure result, reporting INTERNAL_SERVER_ERROR on failure.
pub fn to_output<T: Serialize>(value: &T) -> Result<Value, ProcedureError> {
    serde_json::to_value(value)
        .map_err(|e| ProcedureError::internal(format!("failed to serialize output: {e}")))
}
