//! Request and response envelopes exchanged over a connection.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller-chosen request identifier.
///
/// Ids are scoped to a single connection and correlate every response with
/// the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl RequestId {
    /// Reads an id from a raw JSON value.
    ///
    /// Only strings and integers are accepted; `null`, floats, booleans and
    /// containers yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Number),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

/// The only protocol version tag accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JsonRpc {
    /// JSON-RPC 2.0.
    #[serde(rename = "2.0")]
    V2,
}

/// Call kind requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// One-shot read.
    #[serde(rename = "query")]
    Query,
    /// One-shot write.
    #[serde(rename = "mutation")]
    Mutation,
    /// Start a stream of results.
    #[serde(rename = "subscription")]
    Subscription,
    /// Cancel a running stream.
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

impl Method {
    /// Parses a wire method name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "query" => Some(Self::Query),
            "mutation" => Some(Self::Mutation),
            "subscription" => Some(Self::Subscription),
            "subscription.stop" => Some(Self::SubscriptionStop),
            _ => None,
        }
    }

    /// Returns the wire method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
            Self::SubscriptionStop => "subscription.stop",
        }
    }

    /// Returns the procedure kind invoked by this method, if any.
    pub fn procedure_kind(&self) -> Option<ProcedureKind> {
        match self {
            Self::Query => Some(ProcedureKind::Query),
            Self::Mutation => Some(ProcedureKind::Mutation),
            Self::Subscription => Some(ProcedureKind::Subscription),
            Self::SubscriptionStop => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a registered procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    /// Returns one value, no side effects expected.
    Query,
    /// Returns one value, may have side effects.
    Mutation,
    /// Returns a stream of values.
    Subscription,
}

impl ProcedureKind {
    /// Returns the lowercase kind name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    /// Procedure path, e.g. `"post.byId"`.
    pub path: String,
    /// Opaque procedure input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// A structurally valid request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Caller-chosen id.
    pub id: RequestId,
    /// Optional protocol version tag, echoed on responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<JsonRpc>,
    /// Call kind.
    pub method: Method,
    /// Call parameters.
    pub params: RequestParams,
}

impl RequestEnvelope {
    /// Creates a request envelope without a version tag.
    pub fn new(
        id: impl Into<RequestId>,
        method: Method,
        path: impl Into<String>,
        input: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            jsonrpc: None,
            method,
            params: RequestParams {
                path: path.into(),
                input,
            },
        }
    }

    /// Creates a query request.
    pub fn query(id: impl Into<RequestId>, path: impl Into<String>, input: Option<Value>) -> Self {
        Self::new(id, Method::Query, path, input)
    }

    /// Creates a mutation request.
    pub fn mutation(
        id: impl Into<RequestId>,
        path: impl Into<String>,
        input: Option<Value>,
    ) -> Self {
        Self::new(id, Method::Mutation, path, input)
    }

    /// Creates a subscription request.
    pub fn subscription(
        id: impl Into<RequestId>,
        path: impl Into<String>,
        input: Option<Value>,
    ) -> Self {
        Self::new(id, Method::Subscription, path, input)
    }

    /// Creates a subscription stop request.
    pub fn stop(id: impl Into<RequestId>, path: impl Into<String>) -> Self {
        Self::new(id, Method::SubscriptionStop, path, None)
    }

    /// Builder: tag the request as JSON-RPC 2.0.
    pub fn with_jsonrpc(mut self) -> Self {
        self.jsonrpc = Some(JsonRpc::V2);
        self
    }
}

/// A response sent back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Id of the originating request, `None` for connection-level failures.
    pub id: Option<RequestId>,
    /// Version tag echoed from the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<JsonRpc>,
    /// Result or error.
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    /// Creates a `started` response.
    pub fn started(id: RequestId) -> Self {
        Self::result(id, ResultPayload::Started)
    }

    /// Creates a `stopped` response.
    pub fn stopped(id: RequestId) -> Self {
        Self::result(id, ResultPayload::Stopped)
    }

    /// Creates a `data` response.
    pub fn data(id: RequestId, data: Value) -> Self {
        Self::result(id, ResultPayload::Data { data })
    }

    /// Creates an error response.
    pub fn error(id: Option<RequestId>, error: ErrorShape) -> Self {
        Self {
            id,
            jsonrpc: None,
            body: ResponseBody::Error(error),
        }
    }

    fn result(id: RequestId, result: ResultPayload) -> Self {
        Self {
            id: Some(id),
            jsonrpc: None,
            body: ResponseBody::Result(result),
        }
    }

    /// Builder: echo a version tag.
    pub fn with_jsonrpc(mut self, jsonrpc: Option<JsonRpc>) -> Self {
        self.jsonrpc = jsonrpc;
        self
    }

    /// Returns the error if this is an error response.
    pub fn as_error(&self) -> Option<&ErrorShape> {
        match &self.body {
            ResponseBody::Error(error) => Some(error),
            ResponseBody::Result(_) => None,
        }
    }

    /// Returns the result payload if this is a success response.
    pub fn as_result(&self) -> Option<&ResultPayload> {
        match &self.body {
            ResponseBody::Result(result) => Some(result),
            ResponseBody::Error(_) => None,
        }
    }
}

/// Body of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseBody {
    /// Successful outcome.
    Result(ResultPayload),
    /// Failure.
    Error(ErrorShape),
}

/// Successful response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultPayload {
    /// Subscription registered.
    Started,
    /// Subscription ended.
    Stopped,
    /// A value: the single reply of a query/mutation or one stream item.
    Data {
        /// The value.
        data: Value,
    },
}

/// Error kinds and their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Frame could not be parsed.
    ParseError,
    /// Malformed request.
    BadRequest,
    /// Unexpected failure.
    InternalServerError,
    /// Missing credentials.
    Unauthorized,
    /// Credentials rejected.
    Forbidden,
    /// Unknown procedure.
    NotFound,
    /// Method not allowed on this procedure.
    MethodNotSupported,
    /// Procedure timed out.
    Timeout,
    /// Conflicting state.
    Conflict,
    /// Precondition not met.
    PreconditionFailed,
    /// Payload exceeds limits.
    PayloadTooLarge,
    /// Semantically invalid input.
    UnprocessableContent,
    /// Rate limited.
    TooManyRequests,
    /// Client went away.
    ClientClosedRequest,
}

impl ErrorKind {
    /// Numeric wire code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::BadRequest => -32600,
            Self::InternalServerError => -32603,
            Self::Unauthorized => -32001,
            Self::Forbidden => -32003,
            Self::NotFound => -32004,
            Self::MethodNotSupported => -32005,
            Self::Timeout => -32008,
            Self::Conflict => -32009,
            Self::PreconditionFailed => -32012,
            Self::PayloadTooLarge => -32013,
            Self::UnprocessableContent => -32022,
            Self::TooManyRequests => -32029,
            Self::ClientClosedRequest => -32099,
        }
    }

    /// HTTP status reported for diagnostics.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ParseError | Self::BadRequest => 400,
            Self::InternalServerError => 500,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotSupported => 405,
            Self::Timeout => 408,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::PayloadTooLarge => 413,
            Self::UnprocessableContent => 422,
            Self::TooManyRequests => 429,
            Self::ClientClosedRequest => 499,
        }
    }

    /// Wire name, e.g. `"NOT_FOUND"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::BadRequest => "BAD_REQUEST",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            Self::Timeout => "TIMEOUT",
            Self::Conflict => "CONFLICT",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::UnprocessableContent => "UNPROCESSABLE_CONTENT",
            Self::TooManyRequests => "TOO_MANY_REQUESTS",
            Self::ClientClosedRequest => "CLIENT_CLOSED_REQUEST",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload carried by an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    /// Numeric code derived from the kind.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    pub data: ErrorData,
}

/// Structured error details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Error kind.
    pub kind: ErrorKind,
    /// HTTP status equivalent.
    #[serde(
        rename = "httpStatus",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub http_status: Option<u16>,
    /// Procedure path, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ErrorShape {
    /// Creates an error shape for the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
            data: ErrorData {
                kind,
                http_status: Some(kind.http_status()),
                path: None,
            },
        }
    }

    /// Creates a parse error.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, message)
    }

    /// Creates a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Creates an internal server error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalServerError, message)
    }

    /// Builder: attach the procedure path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.data.path = Some(path.into());
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.data.kind
    }
}

impl fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.data.kind, self.message)
    }
}

impl std::error::Error for ErrorShape {}
