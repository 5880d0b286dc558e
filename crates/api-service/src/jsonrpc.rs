use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;

/// Domain codes carried alongside the standard JSON-RPC range.
pub const REORGING: i64 = 100;
pub const UNAVAILABLE: i64 = 101;
pub const GENERATING: i64 = 102;

#[derive(Debug, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(NOT_FOUND, message)
    }

    pub fn reorging() -> Self {
        Self::new(REORGING, "reorging")
    }

    pub fn unavailable() -> Self {
        Self::new(UNAVAILABLE, "unavailable")
    }

    pub fn generating() -> Self {
        Self::new(GENERATING, "generating")
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
pub struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ErrorBody {
                code: error.code,
                message: error.message,
            }),
        }
    }
}

/// Server-initiated notification (no id).
pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_envelope_shapes() {
        let ok = serde_json::to_value(Response::ok(json!(1), json!("81457-100"))).expect("ok");
        assert_eq!(ok["jsonrpc"], "2.0");
        assert_eq!(ok["result"], "81457-100");
        assert!(ok.get("error").is_none());

        let err =
            serde_json::to_value(Response::err(json!(2), RpcError::generating())).expect("err");
        assert_eq!(err["error"]["code"], 102);
        assert!(err.get("result").is_none());
    }

    #[test]
    fn request_accepts_missing_params() {
        let req: Request =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 5, "method": "listSnapshots"}))
                .expect("parse");
        assert_eq!(req.method, "listSnapshots");
        assert!(req.params.is_null());
    }
}
