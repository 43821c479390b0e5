//! Error taxonomy and JSON-RPC error objects for the gateway

use serde::Serialize;
use serde_json::Value;

/// JSON-RPC error codes produced by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Client sent something that is not JSON
    ParseError,
    /// JSON was valid but not a usable request object
    InvalidRequest,
    /// Method is not part of the client-facing surface
    MethodNotFound,
    /// Required parameters are missing
    InvalidParams,
    /// Worker-side fault or gateway failure while handling the request
    InternalError,
    /// Capability discovery has not completed yet
    ServerNotReady,
    /// The worker restart budget is exhausted
    WorkerUnavailable,
    /// The request queue is at its configured depth
    QueueFull,
}

impl ErrorCode {
    /// Get the numeric JSON-RPC code for this error
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ServerNotReady => -32000,
            ErrorCode::WorkerUnavailable => -32001,
            ErrorCode::QueueFull => -32002,
        }
    }
}

/// Errors reported back to a client as a JSON-RPC error response
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Parse error")]
    Parse(String),

    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: '{0}'. Use 'tools/call' to invoke worker methods.")]
    MethodNotFound(String),

    #[error("Invalid params for '{method}': {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("Server not ready: worker tools not yet available.")]
    NotReady,

    #[error("Worker unavailable: restart limit reached")]
    WorkerUnavailable,

    #[error("Request queue is full ({0} entries)")]
    QueueFull(usize),

    #[error("Internal error")]
    WorkerFault(String),

    #[error("Method not supported in multiplexed mode")]
    UnsupportedWorkerRequest,
}

impl GatewayError {
    /// Standard fault used when the worker exits with requests outstanding
    pub fn worker_terminated() -> Self {
        GatewayError::WorkerFault("Worker process terminated".to_string())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Parse(_) => ErrorCode::ParseError,
            GatewayError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            GatewayError::MethodNotFound(_) | GatewayError::UnsupportedWorkerRequest => {
                ErrorCode::MethodNotFound
            }
            GatewayError::InvalidParams { .. } => ErrorCode::InvalidParams,
            GatewayError::NotReady => ErrorCode::ServerNotReady,
            GatewayError::WorkerUnavailable => ErrorCode::WorkerUnavailable,
            GatewayError::QueueFull(_) => ErrorCode::QueueFull,
            GatewayError::WorkerFault(_) => ErrorCode::InternalError,
        }
    }

    /// Build the `error` member of a JSON-RPC response
    pub fn to_error_object(&self) -> ErrorObject {
        let data = match self {
            GatewayError::Parse(original) | GatewayError::WorkerFault(original) => {
                Some(serde_json::json!({ "originalError": original }))
            }
            _ => None,
        };
        ErrorObject {
            code: self.code().code(),
            message: self.to_string(),
            data,
        }
    }
}

/// The `error` member of a JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
