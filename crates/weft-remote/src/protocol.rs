//! JSON-RPC 2.0 framing

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Worker method names
pub mod methods {
    pub const DISCOVER: &str = "worker/discover";
    pub const INVOKE: &str = "worker/invoke";
    pub const INVOKE_STREAM: &str = "worker/invoke_stream";
    /// Notification carrying one chunk of a streamed invocation
    pub const CHUNK: &str = "worker/chunk";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Absent on parse-failure responses
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Failure kind carried in the error data, when the worker sent one
    pub fn kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("kind")?.as_str()
    }
}

/// One inbound message, already classified
///
/// Workers emit exactly two shapes: responses (carry an `id`) and
/// `worker/chunk` notifications during a streamed invocation. Transports
/// classify at the wire so the client never touches raw values.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Response(JsonRpcResponse),
    Chunk(Value),
}

impl WorkerMessage {
    pub fn from_value(value: Value) -> Result<Self, crate::RemoteError> {
        if value.get("method").and_then(|m| m.as_str()) == Some(methods::CHUNK) {
            let chunk = value.pointer("/params/chunk").cloned().ok_or_else(|| {
                crate::RemoteError::Protocol("chunk notification without params.chunk".into())
            })?;
            return Ok(WorkerMessage::Chunk(chunk));
        }
        if value.get("id").is_some() {
            let response = serde_json::from_value(value)
                .map_err(|e| crate::RemoteError::Protocol(e.to_string()))?;
            return Ok(WorkerMessage::Response(response));
        }
        Err(crate::RemoteError::Protocol(
            "worker message is neither a response nor a chunk".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest::new(RequestId::Number(7), methods::INVOKE)
            .with_params(json!({"tool": "echo", "input": {"text": "hi"}}));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], json!("2.0"));
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["method"], json!("worker/invoke"));
        assert_eq!(value["params"]["tool"], json!("echo"));
    }

    #[test]
    fn test_response_with_error_kind() {
        let text = r#"{
            "jsonrpc": "2.0",
            "id": 7,
            "error": {"code": -32000, "message": "no such tool", "data": {"kind": "not_found"}}
        }"#;
        let response: JsonRpcResponse = serde_json::from_str(text).unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.kind(), Some("not_found"));
        assert_eq!(response.id, Some(RequestId::Number(7)));
    }

    #[test]
    fn test_string_ids_round_trip() {
        let request = JsonRpcRequest::new(RequestId::String("abc".into()), methods::DISCOVER);
        let text = serde_json::to_string(&request).unwrap();
        let back: JsonRpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, RequestId::String("abc".into()));
    }

    #[test]
    fn test_classify_response() {
        let message = WorkerMessage::from_value(json!({
            "jsonrpc": "2.0", "id": 3, "result": {"result": 1}
        }))
        .unwrap();
        match message {
            WorkerMessage::Response(response) => {
                assert_eq!(response.id, Some(RequestId::Number(3)));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_chunk() {
        let message = WorkerMessage::from_value(json!({
            "jsonrpc": "2.0", "method": "worker/chunk", "params": {"chunk": "piece"}
        }))
        .unwrap();
        assert!(matches!(message, WorkerMessage::Chunk(chunk) if chunk == json!("piece")));
    }

    #[test]
    fn test_classify_rejects_other_shapes() {
        assert!(WorkerMessage::from_value(json!({"jsonrpc": "2.0", "method": "other"})).is_err());
        assert!(
            WorkerMessage::from_value(json!({"jsonrpc": "2.0", "method": "worker/chunk"}))
                .is_err()
        );
    }
}
