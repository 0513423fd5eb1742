//! Wire envelopes, decoding, encoding and framing for procmux.
//!
//! A single connection multiplexes many calls, each correlated by a
//! caller-chosen id. Clients send request envelopes, alone or batched in an
//! array:
//!
//! ```json
//! {"id": 1, "method": "subscription", "params": {"path": "online", "input": {"username": "a"}}}
//! ```
//!
//! and the server answers with result or error envelopes:
//!
//! ```json
//! {"id": 1, "result": {"type": "started"}}
//! {"id": 1, "result": {"type": "data", "data": {"username": "a"}}}
//! {"id": null, "error": {"code": -32700, "message": "...", "data": {"kind": "PARSE_ERROR"}}}
//! ```
//!
//! # Example
//!
//! ```rust
//! use procmux_protocol::{decode_requests, Method, ResponseEncoder, ResponseEnvelope};
//!
//! let items = decode_requests(br#"{"id":1,"method":"query","params":{"path":"greet"}}"#).unwrap();
//! let request = items.into_iter().next().unwrap().unwrap();
//! assert_eq!(request.method, Method::Query);
//!
//! let bytes = ResponseEncoder::default().encode(&ResponseEnvelope::started(request.id));
//! assert_eq!(bytes, br#"{"id":1,"result":{"type":"started"}}"#);
//! ```

mod decode;
mod encode;
mod error;
mod framing;
mod types;

pub use decode::{
    DecodeError, DecodedItem, InvalidRequest, ValidationError, decode_requests, validate_request,
};
pub use encode::{DataTransformer, IdentityTransformer, ResponseEncoder, TransformError};
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{encode_frame, frame_len};
pub use types::{
    ErrorData, ErrorKind, ErrorShape, JsonRpc, Method, ProcedureKind, RequestEnvelope, RequestId,
    RequestParams, ResponseBody, ResponseEnvelope, ResultPayload,
};

/// Protocol version tag accepted in the optional `jsonrpc` field.
pub const JSONRPC_VERSION: &str = "2.0";

/// Maximum frame payload size (1 MB).
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
