//! RPC-level errors and their wire representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC 2.0 error codes, plus the implementation-defined ones.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error while executing the method.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The caller gave up waiting for a response.
    pub const NO_RESPONSE: i64 = -32605;
    /// The request could not be handed to the transport.
    pub const TRANSPORT_ERROR: i64 = -32000;
}

/// The `error` member of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Additional detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Errors surfaced to RPC callers.
///
/// ```
/// use hostwire::jsonrpc::{RpcError, error_codes};
///
/// let err = RpcError::MethodNotFound("missing_method".into());
/// assert_eq!(err.code(), error_codes::METHOD_NOT_FOUND);
/// assert!(err.to_string().contains("missing_method"));
/// ```
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    /// Malformed JSON.
    #[error("parse error: {0}")]
    ParseError(String),
    /// Well-formed JSON that is not a valid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// No method of that name.
    #[error("the method {0} does not exist")]
    MethodNotFound(String),
    /// The method rejected its parameters.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// The method failed.
    #[error("internal error: {0}")]
    InternalError(String),
    /// No response arrived before the caller's timeout.
    #[error("no response for JSON-RPC request: {0}")]
    NoResponse(String),
    /// The request never reached the wire.
    #[error("transport error: {0}")]
    Transport(String),
    /// Any other error code returned by the server.
    #[error("{message} (code {code})")]
    Application {
        /// Error code.
        code: i64,
        /// Error message.
        message: String,
        /// Additional detail.
        data: Option<Value>,
    },
}

impl RpcError {
    /// Wire code of this error.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::ParseError(_) => error_codes::PARSE_ERROR,
            Self::InvalidRequest(_) => error_codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => error_codes::INVALID_PARAMS,
            Self::InternalError(_) => error_codes::INTERNAL_ERROR,
            Self::NoResponse(_) => error_codes::NO_RESPONSE,
            Self::Transport(_) => error_codes::TRANSPORT_ERROR,
            Self::Application { code, .. } => *code,
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn to_object(&self) -> ErrorObject {
        match self {
            Self::Application {
                code,
                message,
                data,
            } => ErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => ErrorObject {
                code: other.code(),
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl From<ErrorObject> for RpcError {
    /// Errors read off the wire keep the server's message verbatim, so they
    /// all surface as [`RpcError::Application`] with the original code.
    fn from(object: ErrorObject) -> Self {
        Self::Application {
            code: object.code,
            message: object.message,
            data: object.data,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self { Self::ParseError(err.to_string()) }
}
