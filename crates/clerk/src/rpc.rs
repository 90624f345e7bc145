//! JSON-RPC 2.0 envelope handling: parse, route, encode, and the mapping of
//! every failure kind onto its stable numeric code. Both transports feed
//! lines or bodies through [`parse`] and [`handle`].

use std::sync::Arc;

use serde_json::{json, Value};

use crate::tools::{self, ToolError};
use crate::App;

/// Stable client-facing error codes. The -32700..-32600 range is the
/// JSON-RPC standard set; -320xx are this server's.
pub mod code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;

    pub const UNAUTHORIZED: i64 = -32001;
    pub const FORBIDDEN: i64 = -32003;
    pub const NOT_FOUND: i64 = -32004;
    pub const RATE_LIMITED: i64 = -32005;
    pub const TIMEOUT: i64 = -32008;
    pub const CONFLICT: i64 = -32009;
    pub const UPSTREAM_UNAVAILABLE: i64 = -32050;
    pub const CREDENTIAL_UNAVAILABLE: i64 = -32051;
    pub const UPSTREAM_REJECTED: i64 = -32052;
}

#[derive(Debug, serde::Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Absent for notifications, which produce no response.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(code::INVALID_PARAMS, message)
    }

    pub fn timeout(request_id: Option<&str>) -> Self {
        let mut err = Self::new(code::TIMEOUT, "deadline exceeded");
        if let Some(request_id) = request_id {
            err.data = Some(json!({ "request-id": request_id }));
        }
        err
    }

    /// Classify a handler failure. Upstream context rides along in `data`;
    /// secrets never do.
    fn from_tool(err: ToolError, request_id: &str) -> Self {
        use portal_client::Error as Up;

        let err = match err {
            ToolError::InvalidParams(message) => return Self::invalid_params(message),
            ToolError::Upstream(err) => err,
        };

        let code = match &err {
            Up::NotFound { .. } => code::NOT_FOUND,
            Up::Conflict { .. } => code::CONFLICT,
            Up::Rejected { .. } => code::UPSTREAM_REJECTED,
            Up::Unavailable { .. } | Up::Kv(_) => code::UPSTREAM_UNAVAILABLE,
            Up::Timeout => code::TIMEOUT,
            Up::RefreshRejected { .. } | Up::CredentialUnavailable(_) => {
                code::CREDENTIAL_UNAVAILABLE
            }
            Up::Internal(_) => code::INTERNAL,
        };

        let mut data = serde_json::Map::new();
        data.insert("request-id".to_string(), json!(request_id));
        if let Some(status) = err.upstream_status() {
            data.insert("upstream-status".to_string(), json!(status));
        }
        match &err {
            Up::NotFound { message }
            | Up::Conflict { message }
            | Up::Rejected { message, .. }
            | Up::Unavailable { message, .. } => {
                data.insert("upstream-message".to_string(), json!(message));
            }
            _ => {}
        }

        Self {
            code,
            message: err.to_string(),
            data: Some(Value::Object(data)),
        }
    }
}

pub fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "result": result, "id": id })
}

pub fn error_response(id: Value, err: RpcError) -> Value {
    let mut body = json!({ "code": err.code, "message": err.message });
    if let Some(data) = err.data {
        body["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "error": body, "id": id })
}

/// Parse a raw envelope. Failures become a parse-error response with a null
/// id, per the JSON-RPC spec.
pub fn parse(raw: &str) -> Result<Envelope, Value> {
    serde_json::from_str(raw).map_err(|err| {
        error_response(
            Value::Null,
            RpcError::new(code::PARSE_ERROR, format!("invalid JSON-RPC envelope: {err}")),
        )
    })
}

/// Route one request. Returns None for notifications: their errors are
/// logged, never returned.
#[tracing::instrument(level = "debug", skip_all, fields(method = %envelope.method))]
pub async fn handle(app: &Arc<App>, envelope: Envelope) -> Option<Value> {
    let Envelope {
        jsonrpc,
        method,
        params,
        id,
    } = envelope;

    let outcome = if jsonrpc != "2.0" {
        Err(RpcError::new(
            code::INVALID_REQUEST,
            "jsonrpc must be \"2.0\"",
        ))
    } else {
        route(app, &method, params).await
    };

    let Some(id) = id else {
        if let Err(err) = &outcome {
            tracing::warn!(%method, code = err.code, error = %err.message, "notification failed");
        }
        return None;
    };

    Some(match outcome {
        Ok(result) => result_response(id, result),
        Err(err) => error_response(id, err),
    })
}

async fn route(app: &Arc<App>, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "initialize" => Ok(json!({
            "server": { "name": "clerk", "version": env!("CARGO_PKG_VERSION") },
            "protocol": "2.0",
        })),
        "listTools" => Ok(crate::registry::manifest()),
        "callTool" => call_tool(app, params).await,
        _ => Err(RpcError::new(
            code::METHOD_NOT_FOUND,
            format!("no such method {method}"),
        )),
    }
}

#[derive(serde::Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: serde_json::Map<String, Value>,
}

async fn call_tool(app: &Arc<App>, params: Value) -> Result<Value, RpcError> {
    let CallParams { name, arguments } = serde_json::from_value(params)
        .map_err(|err| RpcError::invalid_params(format!("malformed callTool params: {err}")))?;

    let spec = crate::registry::find(&name)
        .ok_or_else(|| RpcError::invalid_params(format!("unknown tool {name}")))?;

    crate::registry::validate(spec, &arguments).map_err(RpcError::invalid_params)?;

    let request_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!("tool", tool = spec.name, request_id = %request_id);

    use tracing::Instrument;
    match tokio::time::timeout(app.handler_timeout, tools::invoke_cached(app, spec, arguments))
        .instrument(span)
        .await
    {
        Err(_) => {
            tracing::warn!(tool = spec.name, "handler exceeded its deadline");
            Err(RpcError::timeout(Some(&request_id)))
        }
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(RpcError::from_tool(err, &request_id)),
    }
}
