//! Client-facing JSON-RPC surface
//!
//! Clients speak a small MCP-style protocol: `initialize`, `tools/list` and
//! `tools/call`. Everything else is rejected here, before the request ever
//! reaches the queue. Accepted invocations are rewritten into the worker's
//! native request shape with the client's id carried through unchanged.

use crate::error::{ErrorObject, GatewayError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// MCP protocol revision announced in the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Id of the capability discovery request the gateway sends on every worker start
pub const DISCOVERY_REQUEST_ID: &str = "__gateway_tools_list";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";

/// A JSON-RPC request id. Ids round-trip verbatim to the client that sent them,
/// including floats and integers outside the `i64` range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A request or notification sent by a client
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<RequestId>,
}

/// A request written to the worker's stdin
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

impl WorkerRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }

    /// Serialize as a single line, without the trailing newline
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            serde_json::json!({
                "jsonrpc": self.jsonrpc,
                "id": self.id,
                "method": self.method,
                "params": {},
            })
            .to_string()
        })
    }
}

/// A response sent to a client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl RpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: &GatewayError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error.to_error_object()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#
                .to_string()
        })
    }
}

/// A message read from the worker's stdout
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerMessage {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl WorkerMessage {
    /// Tool schema announced by a capability reply or an initialization notification
    pub fn announced_tools(&self) -> Option<Vec<Value>> {
        let source = if self.method.is_some() {
            self.params.as_ref()
        } else {
            self.result.as_ref()
        };
        source?.get("tools")?.as_array().cloned()
    }

    /// String handle found in the result under `field`
    pub fn result_handle(&self, field: &str) -> Option<String> {
        self.result
            .as_ref()?
            .get(field)?
            .as_str()
            .map(str::to_string)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// What to do with a client request
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    /// Answer the client directly
    Respond(RpcResponse),
    /// Queue this request for the worker
    Forward(WorkerRequest),
    /// Nothing to send back (client notifications)
    Ignore,
}

/// Server identity returned by the handshake
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Parse a raw client frame into a request, or the error response for it
pub fn parse_client_message(text: &str) -> Result<ClientRequest, RpcResponse> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RpcResponse::failure(None, &GatewayError::Parse(e.to_string())))?;

    // Keep the id when it is usable so the client can match the error
    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

    if !value.is_object() {
        return Err(RpcResponse::failure(
            None,
            &GatewayError::InvalidRequest("expected a JSON object".to_string()),
        ));
    }

    serde_json::from_value::<ClientRequest>(value)
        .map_err(|e| RpcResponse::failure(id, &GatewayError::InvalidRequest(e.to_string())))
}

/// Translate a parsed client request
///
/// `tools` is the cached worker capability schema, `None` until discovery completes.
pub fn translate(request: ClientRequest, server: &ServerInfo, tools: Option<&[Value]>) -> Translation {
    let ClientRequest { method, params, id } = request;
    let is_notification = id.is_none() && method.starts_with("notifications/");

    match method.as_str() {
        METHOD_INITIALIZE => Translation::Respond(RpcResponse::success(
            id,
            serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": { "name": server.name, "version": server.version },
                "capabilities": { "tools": {} },
            }),
        )),

        METHOD_TOOLS_LIST => match tools {
            Some(tools) => Translation::Respond(RpcResponse::success(
                id,
                serde_json::json!({ "tools": tools }),
            )),
            None => Translation::Respond(RpcResponse::failure(id, &GatewayError::NotReady)),
        },

        METHOD_TOOLS_CALL => {
            let params = params.unwrap_or(Value::Null);
            let name = match params.get("name").and_then(Value::as_str) {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => {
                    return Translation::Respond(RpcResponse::failure(
                        id,
                        &GatewayError::InvalidParams {
                            method: METHOD_TOOLS_CALL.to_string(),
                            reason: "missing 'name'.".to_string(),
                        },
                    ))
                }
            };
            let Some(id) = id else {
                return Translation::Respond(RpcResponse::failure(
                    None,
                    &GatewayError::InvalidRequest("'tools/call' requires an id".to_string()),
                ));
            };
            let arguments = match params.get("arguments") {
                Some(Value::Null) | None => Value::Object(Default::default()),
                Some(args) => args.clone(),
            };
            Translation::Forward(WorkerRequest::new(id, name, arguments))
        }

        _ if is_notification => Translation::Ignore,

        _ => Translation::Respond(RpcResponse::failure(
            id,
            &GatewayError::MethodNotFound(method.clone()),
        )),
    }
}
