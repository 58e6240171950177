//! Remote worker client
//!
//! Sends typed requests over a transport and matches classified responses
//! by id. Responses for unknown ids and stray chunks are logged and dropped
//! rather than failing the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId, RpcError, WorkerMessage, methods};
use crate::transport::Transport;
use crate::{RemoteError, WorkerToolSpec};

/// Client for one remote worker connection
pub struct RemoteClient {
    transport: Arc<Mutex<Box<dyn Transport>>>,
    request_id: AtomicI64,
}

impl RemoteClient {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(Mutex::new(Box::new(transport))),
            request_id: AtomicI64::new(1),
        }
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Retrieve the worker's tool specs
    pub async fn discover(&self) -> Result<Vec<WorkerToolSpec>, RemoteError> {
        let request = JsonRpcRequest::new(self.next_id(), methods::DISCOVER)
            .with_params(json!({ "protocolVersion": crate::PROTOCOL_VERSION }));
        let response = self.send_request(&request).await?;

        #[derive(Deserialize)]
        struct DiscoverResult {
            tools: Vec<WorkerToolSpec>,
        }

        match response.result {
            Some(result) => {
                let parsed: DiscoverResult = serde_json::from_value(result)
                    .map_err(|e| RemoteError::Protocol(e.to_string()))?;
                debug!(count = parsed.tools.len(), "discovered worker tools");
                Ok(parsed.tools)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Invoke a tool and wait for its single result
    pub async fn invoke(&self, tool: &str, input: Value) -> Result<Value, RemoteError> {
        let request = JsonRpcRequest::new(self.next_id(), methods::INVOKE)
            .with_params(json!({ "tool": tool, "input": input }));
        let response = self.send_request(&request).await?;

        if let Some(error) = response.error {
            return Err(server_error(error));
        }
        let result = response
            .result
            .ok_or_else(|| RemoteError::Protocol("response carries neither result nor error".into()))?;
        result
            .get("result")
            .cloned()
            .ok_or_else(|| RemoteError::Protocol("invoke result missing result field".into()))
    }

    /// Invoke a tool with chunked incremental emission
    ///
    /// Chunks arrive on the returned channel; the channel closes after the
    /// final response. A worker-side failure closes the channel early after
    /// sending no further chunks.
    pub async fn invoke_stream(
        &self,
        tool: &str,
        input: Value,
    ) -> Result<mpsc::Receiver<Value>, RemoteError> {
        let request = JsonRpcRequest::new(self.next_id(), methods::INVOKE_STREAM)
            .with_params(json!({ "tool": tool, "input": input }));

        let (tx, rx) = mpsc::channel(32);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let mut transport = transport.lock().await;
            if let Err(e) = transport.send(&request).await {
                warn!(error = %e, "stream request failed to send");
                return;
            }
            loop {
                match transport.receive().await {
                    Ok(Some(WorkerMessage::Chunk(chunk))) => {
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Ok(Some(WorkerMessage::Response(response))) => {
                        if response.id.as_ref() != Some(&request.id) {
                            warn!(id = ?response.id, "dropping response for unknown request id");
                            continue;
                        }
                        return;
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!(error = %e, "stream receive failed");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn send_request(
        &self,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, RemoteError> {
        let mut transport = self.transport.lock().await;
        transport.send(request).await?;

        loop {
            match transport.receive().await? {
                None => return Err(RemoteError::Closed),
                Some(WorkerMessage::Chunk(_)) => {
                    warn!("dropping stream chunk outside a streamed invocation");
                }
                Some(WorkerMessage::Response(response)) => {
                    if response.id.as_ref() == Some(&request.id) {
                        return Ok(response);
                    }
                    warn!(id = ?response.id, "dropping response for unknown request id");
                }
            }
        }
    }
}

fn server_error(error: RpcError) -> RemoteError {
    let kind = error
        .kind()
        .map(|k| k.to_string())
        .unwrap_or_else(|| match error.code {
            -32601 => "not_found".to_string(),
            code if (-32099..=-32000).contains(&code) => "server".to_string(),
            _ => "protocol".to_string(),
        });
    RemoteError::Server {
        kind,
        message: error.message,
    }
}
