//! Response encoding with a pluggable data transformer.

use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;

use crate::types::{ErrorShape, ResponseEnvelope};

/// A transformer failed to convert a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("data transformer failed: {message}")]
pub struct TransformError {
    message: String,
}

impl TransformError {
    /// Creates a transform error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Converts payloads between their domain and wire representations.
///
/// `serialize` is applied to every outgoing `data` and `error` payload,
/// `deserialize` to every incoming procedure input. Both must be pure.
pub trait DataTransformer: Send + Sync {
    /// Domain value to wire value.
    fn serialize(&self, value: Value) -> Result<Value, TransformError>;

    /// Wire value to domain value.
    fn deserialize(&self, value: Value) -> Result<Value, TransformError>;
}

/// Passes values through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl DataTransformer for IdentityTransformer {
    fn serialize(&self, value: Value) -> Result<Value, TransformError> {
        Ok(value)
    }

    fn deserialize(&self, value: Value) -> Result<Value, TransformError> {
        Ok(value)
    }
}

/// Turns response envelopes into wire bytes.
#[derive(Clone)]
pub struct ResponseEncoder {
    transformer: Arc<dyn DataTransformer>,
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self::new(Arc::new(IdentityTransformer))
    }
}

impl std::fmt::Debug for ResponseEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseEncoder").finish_non_exhaustive()
    }
}

impl ResponseEncoder {
    /// Creates an encoder using the given transformer.
    pub fn new(transformer: Arc<dyn DataTransformer>) -> Self {
        Self { transformer }
    }

    /// Returns the transformer, shared with input decoding.
    pub fn transformer(&self) -> &Arc<dyn DataTransformer> {
        &self.transformer
    }

    /// Encodes an envelope as a JSON document.
    ///
    /// Never fails: if the payload cannot be transformed or serialized, an
    /// INTERNAL_SERVER_ERROR for the same id is encoded instead.
    pub fn encode(&self, envelope: &ResponseEnvelope) -> Vec<u8> {
        match self.to_wire(envelope) {
            Ok(wire) => wire.to_string().into_bytes(),
            Err(message) => {
                let fallback = ResponseEnvelope::error(
                    envelope.id.clone(),
                    ErrorShape::internal(message),
                )
                .with_jsonrpc(envelope.jsonrpc);
                match serde_json::to_value(&fallback) {
                    Ok(wire) => wire.to_string().into_bytes(),
                    Err(_) => json!({
                        "id": Value::Null,
                        "error": {
                            "code": -32603,
                            "message": "failed to encode response",
                            "data": {"kind": "INTERNAL_SERVER_ERROR", "httpStatus": 500}
                        }
                    })
                    .to_string()
                    .into_bytes(),
                }
            }
        }
    }

    /// Builds the wire value, applying the transformer to the payload.
    pub fn to_wire(&self, envelope: &ResponseEnvelope) -> Result<Value, String> {
        let mut wire = serde_json::to_value(envelope).map_err(|e| e.to_string())?;

        if let Some(error) = wire.get_mut("error") {
            let payload = error.take();
            *error = self
                .transformer
                .serialize(payload)
                .map_err(|e| e.to_string())?;
        } else if let Some(data) = wire.get_mut("result").and_then(|r| r.get_mut("data")) {
            let payload = data.take();
            *data = self
                .transformer
                .serialize(payload)
                .map_err(|e| e.to_string())?;
        }

        Ok(wire)
    }
}
