use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::value::Value;

/// Message kinds that can travel through a pump.
///
/// Both pump directions are generic over this trait, so the same reader and
/// writer machinery carries calls on one side and replies on the other.
pub trait WireMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Pump name used in logs and shutdown errors for the reading direction.
    const READER: &'static str;
    /// Pump name used in logs and shutdown errors for the writing direction.
    const WRITER: &'static str;

    /// Correlation id carried by the message.
    fn id(&self) -> i64;
}

/// Call message: `{"id"?: integer, "method": string, "params": array}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Correlation id. Zero means no reply is expected and is left off the wire.
    #[serde(default, skip_serializing_if = "is_fire_and_forget")]
    pub id: i64,

    /// Method name to be invoked
    pub method: String,

    /// Positional parameters
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Reply message: `{"id", "result"}` or `{"id", "error"}`, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Request identifier from the original call
    #[serde(default)]
    pub id: i64,

    /// Result value (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error object (present on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Error object carried by a failed reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i64,

    pub message: String,

    /// Additional error information (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Pre-defined JSON-RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
}

impl ErrorCode {
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
        }
    }
}

fn is_fire_and_forget(id: &i64) -> bool {
    *id == 0
}

impl Request {
    pub fn new(id: i64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Check if this call expects no reply (id 0)
    pub fn is_notification(&self) -> bool {
        self.id == 0
    }
}

impl Response {
    /// Create a success response
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: i64, error: ErrorObject) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Outcome of the call this reply answers. An error object takes
    /// precedence; a reply with neither field resolves to `Null`.
    pub fn into_outcome(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(RpcError::Protocol {
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result.unwrap_or_default()),
        }
    }
}

impl ErrorObject {
    /// Create a new error object
    pub fn new(code: ErrorCode, data: Option<Value>) -> Self {
        Self {
            code: code as i64,
            message: code.message().to_string(),
            data,
        }
    }

    /// Create a custom error
    pub fn custom(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
}

impl From<ErrorCode> for ErrorObject {
    fn from(code: ErrorCode) -> Self {
        ErrorObject::new(code, None)
    }
}

impl WireMessage for Request {
    const READER: &'static str = "MethodReader";
    const WRITER: &'static str = "MethodWriter";

    fn id(&self) -> i64 {
        self.id
    }
}

impl WireMessage for Response {
    const READER: &'static str = "ResponseReader";
    const WRITER: &'static str = "ResponseWriter";

    fn id(&self) -> i64 {
        self.id
    }
}
