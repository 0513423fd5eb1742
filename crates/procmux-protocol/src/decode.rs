//! Frame decoding and per-item request validation.
//!
//! A frame holds either one request object or an array of them. A frame that
//! is not JSON at all is a connection-level failure ([`DecodeError`]); every
//! other problem is reported per item so one bad entry never sinks its batch.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::JSONRPC_VERSION;
use crate::types::{
    ErrorShape, JsonRpc, Method, RequestEnvelope, RequestId, RequestParams, ResponseEnvelope,
};

/// Outcome of validating one batch item.
pub type DecodedItem = Result<RequestEnvelope, InvalidRequest>;

/// The frame could not be decoded into any value.
#[derive(Debug, Error)]
#[error("failed to parse frame: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl DecodeError {
    /// Connection-level response for this failure.
    pub fn to_response(&self) -> ResponseEnvelope {
        ResponseEnvelope::error(None, ErrorShape::parse_error(self.to_string()))
    }
}

/// First validation failure of a request item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("request must be an object")]
    NotAnObject,

    #[error("missing request id")]
    MissingId,

    #[error("invalid request id: expected a string or an integer")]
    InvalidId,

    #[error("unsupported protocol version {0}, must be \"2.0\"")]
    UnsupportedVersion(String),

    #[error("missing method")]
    MissingMethod,

    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("params must be an object")]
    InvalidParams,

    #[error("params.path must be a non-empty string")]
    InvalidPath,
}

/// A batch item that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRequest {
    /// Recovered id, `None` when the id itself is missing or invalid.
    pub id: Option<RequestId>,
    /// Recovered version tag.
    pub jsonrpc: Option<JsonRpc>,
    /// What was wrong.
    pub error: ValidationError,
}

impl InvalidRequest {
    /// BAD_REQUEST response correlated with the item.
    pub fn into_response(self) -> ResponseEnvelope {
        ResponseEnvelope::error(self.id, ErrorShape::bad_request(self.error.to_string()))
            .with_jsonrpc(self.jsonrpc)
    }
}

/// Decodes a raw frame into its ordered list of validated items.
pub fn decode_requests(raw: &[u8]) -> Result<Vec<DecodedItem>, DecodeError> {
    let value: Value = serde_json::from_slice(raw)?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok(items.into_iter().map(validate_request).collect())
}

/// Validates one raw item, returning the first failure.
pub fn validate_request(item: Value) -> DecodedItem {
    let Value::Object(mut object) = item else {
        return Err(InvalidRequest {
            id: None,
            jsonrpc: None,
            error: ValidationError::NotAnObject,
        });
    };

    let fail = |id: Option<RequestId>, jsonrpc: Option<JsonRpc>, error| {
        Err(InvalidRequest { id, jsonrpc, error })
    };

    let id = match object.get("id") {
        None | Some(Value::Null) => return fail(None, None, ValidationError::MissingId),
        Some(raw) => match RequestId::from_value(raw) {
            Some(id) => id,
            None => return fail(None, None, ValidationError::InvalidId),
        },
    };

    let jsonrpc = match object.get("jsonrpc") {
        None => None,
        Some(Value::String(tag)) if tag == JSONRPC_VERSION => Some(JsonRpc::V2),
        Some(other) => {
            return fail(
                Some(id),
                None,
                ValidationError::UnsupportedVersion(other.to_string()),
            );
        }
    };

    let method = match object.get("method") {
        None | Some(Value::Null) => {
            return fail(Some(id), jsonrpc, ValidationError::MissingMethod);
        }
        Some(Value::String(name)) => match Method::parse(name) {
            Some(method) => method,
            None => {
                return fail(
                    Some(id),
                    jsonrpc,
                    ValidationError::UnknownMethod(format!("{name:?}")),
                );
            }
        },
        Some(other) => {
            return fail(
                Some(id),
                jsonrpc,
                ValidationError::UnknownMethod(other.to_string()),
            );
        }
    };

    let params = match object.remove("params") {
        Some(Value::Object(params)) => params,
        _ => return fail(Some(id), jsonrpc, ValidationError::InvalidParams),
    };

    match parse_params(params) {
        Some(params) => Ok(RequestEnvelope {
            id,
            jsonrpc,
            method,
            params,
        }),
        None => fail(Some(id), jsonrpc, ValidationError::InvalidPath),
    }
}

fn parse_params(mut params: Map<String, Value>) -> Option<RequestParams> {
    let path = match params.remove("path") {
        Some(Value::String(path)) if !path.is_empty() => path,
        _ => return None,
    };
    let input = match params.remove("input") {
        None | Some(Value::Null) => None,
        Some(input) => Some(input),
    };
    Some(RequestParams { path, input })
}
