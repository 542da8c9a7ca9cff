//! Wire frame model: requests, notifications, responses.
//!
//! Classification follows the presence of `id` and `method`:
//!
//! | `id` | `method` | Frame                         |
//! |------|----------|-------------------------------|
//! | yes  | yes      | [`Frame::Request`]            |
//! | no   | yes      | [`Frame::Notification`]       |
//! | yes  | no       | [`Frame::Response`]           |
//!
//! A `null` id counts as absent. Outbound frames carry `"jsonrpc": "2.0"`;
//! inbound frames may omit it.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::AppError;

/// JSON-RPC error code: invalid JSON was received.
pub const PARSE_ERROR: i64 = -32_700;
/// JSON-RPC error code: the JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32_600;
/// JSON-RPC error code: the method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32_601;
/// JSON-RPC error code: invalid method parameters.
pub const INVALID_PARAMS: i64 = -32_602;
/// JSON-RPC error code: internal handler failure.
pub const INTERNAL_ERROR: i64 = -32_603;
/// Generic server-side failure.
pub const SERVER_ERROR: i64 = -32_000;
/// The referenced session does not exist.
pub const SESSION_NOT_FOUND: i64 = -32_001;

/// Request identifier; echoed verbatim in the matching response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id (used for every outbound request).
    Number(i64),
    /// String id.
    Text(String),
    /// Any other JSON number (fractional, or beyond `i64`), kept verbatim.
    Other(serde_json::Number),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Other(n) => write!(f, "{n}"),
        }
    }
}

/// Error object carried in a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error with no `data` payload.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `-32601` for `method`.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("unknown method: {method}"))
    }

    /// `-32602` with the given reason.
    #[must_use]
    pub fn invalid_params(reason: impl Display) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {reason}"))
    }

    /// `-32603` with the given reason.
    #[must_use]
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, reason)
    }
}

impl From<AppError> for RpcError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Remote { code, message } => Self::new(code, message),
            AppError::Protocol(msg) => Self::invalid_params(msg),
            AppError::NotFound(msg) => Self::new(SESSION_NOT_FOUND, msg),
            other => Self::new(SERVER_ERROR, other.to_string()),
        }
    }
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Remote {
            code: err.code,
            message: err.message,
        }
    }
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Call expecting exactly one response with the same id.
    Request {
        /// Correlation id.
        id: RequestId,
        /// Method name.
        method: String,
        /// Method parameters (`null` when absent).
        params: Value,
    },
    /// Fire-and-forget call.
    Notification {
        /// Method name.
        method: String,
        /// Method parameters (`null` when absent).
        params: Value,
    },
    /// Reply to an earlier request.
    Response {
        /// Id of the request being answered.
        id: RequestId,
        /// `result` on success, `error` on failure.
        outcome: std::result::Result<Value, RpcError>,
    },
}

/// A line that could not be classified as a frame.
///
/// `id` is populated when the line was a JSON object carrying a usable id,
/// so the caller can still answer with an error response.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedFrame {
    /// Recovered request id, if any.
    pub id: Option<RequestId>,
    /// Error to report.
    pub error: RpcError,
}

impl Frame {
    /// Parse and classify one line.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedFrame`] when the line is not JSON, not an object,
    /// or has neither a usable `method` nor a usable `id`.
    pub fn parse(line: &str) -> std::result::Result<Self, MalformedFrame> {
        let value: Value = serde_json::from_str(line).map_err(|e| MalformedFrame {
            id: None,
            error: RpcError::new(PARSE_ERROR, format!("malformed json: {e}")),
        })?;

        let Value::Object(mut object) = value else {
            return Err(MalformedFrame {
                id: None,
                error: RpcError::new(INVALID_REQUEST, "frame is not a json object"),
            });
        };

        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw).map_err(|_| {
                MalformedFrame {
                    id: None,
                    error: RpcError::new(INVALID_REQUEST, "id must be a number or string"),
                }
            })?),
        };

        let params = object.remove("params").unwrap_or(Value::Null);

        match (object.remove("method"), id) {
            (Some(Value::String(method)), Some(id)) => Ok(Self::Request { id, method, params }),
            (Some(Value::String(method)), None) => Ok(Self::Notification { method, params }),
            (Some(_), id) => Err(MalformedFrame {
                id,
                error: RpcError::new(INVALID_REQUEST, "method must be a string"),
            }),
            (None, Some(id)) => Ok(Self::Response {
                outcome: parse_outcome(&mut object),
                id,
            }),
            (None, None) => Err(MalformedFrame {
                id: None,
                error: RpcError::new(INVALID_REQUEST, "frame has neither id nor method"),
            }),
        }
    }

    /// Serialize into a single-line JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Request { id, method, params } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }),
            Self::Notification { method, params } => json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
            Self::Response {
                id,
                outcome: Ok(result),
            } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
            Self::Response {
                id,
                outcome: Err(error),
            } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": error,
            }),
        }
    }
}

fn parse_outcome(object: &mut Map<String, Value>) -> std::result::Result<Value, RpcError> {
    match object.remove("error") {
        None | Some(Value::Null) => Ok(object.remove("result").unwrap_or(Value::Null)),
        Some(raw) => Err(serde_json::from_value::<RpcError>(raw.clone()).unwrap_or_else(|_| {
            // Non-conforming error payloads keep their content as the message.
            let message = raw
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| raw.to_string(), str::to_owned);
            RpcError {
                code: SERVER_ERROR,
                message,
                data: Some(raw),
            }
        })),
    }
}
