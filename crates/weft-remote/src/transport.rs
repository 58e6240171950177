//! Transport layer
//!
//! A transport carries the worker protocol, not raw bytes: requests go out
//! as typed JSON-RPC frames and inbound lines come back already classified
//! into responses and stream chunks. The stdio transport runs the worker as
//! a child process with one frame per line; the HTTP transport POSTs each
//! request and drains the (possibly multi-line) body, which is how chunked
//! invocations arrive without a persistent connection.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::RemoteError;
use crate::protocol::{JsonRpcRequest, WorkerMessage};

/// Transport trait for worker communication
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&mut self, request: &JsonRpcRequest) -> Result<(), RemoteError>;
    /// Next classified message, or `None` once the peer is gone
    async fn receive(&mut self) -> Result<Option<WorkerMessage>, RemoteError>;
    async fn close(&mut self) -> Result<(), RemoteError>;
}

/// How long a closing worker gets to exit on its own before being killed
const SHUTDOWN_WINDOW: Duration = Duration::from_secs(2);

/// Worker spawned as a child process, one JSON-RPC frame per line
///
/// Closing is cooperative: dropping stdin gives the worker EOF as its
/// shutdown signal, and the process is killed only when it overstays the
/// shutdown window.
pub struct StdioTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
}

impl StdioTransport {
    pub async fn spawn(program: &str, args: &[&str]) -> Result<Self, RemoteError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::Transport(format!("cannot spawn worker {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RemoteError::Transport("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RemoteError::Transport("worker stdout not captured".into()))?;

        debug!(program, "worker process started");
        Ok(Self {
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, request: &JsonRpcRequest) -> Result<(), RemoteError> {
        let stdin = self.stdin.as_mut().ok_or(RemoteError::Closed)?;
        // One frame per write keeps concurrent callers from interleaving.
        let mut frame =
            serde_json::to_vec(request).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        frame.push(b'\n');
        stdin
            .write_all(&frame)
            .await
            .map_err(|e| RemoteError::Transport(format!("worker stdin: {e}")))
    }

    async fn receive(&mut self) -> Result<Option<WorkerMessage>, RemoteError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| RemoteError::Transport(format!("worker stdout: {e}")))?;
            let Some(line) = line else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            let value = serde_json::from_str(&line)
                .map_err(|e| RemoteError::Protocol(format!("worker emitted invalid JSON: {e}")))?;
            return WorkerMessage::from_value(value).map(Some);
        }
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        // EOF on stdin is the worker's signal to exit.
        self.stdin.take();
        match tokio::time::timeout(SHUTDOWN_WINDOW, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "worker exited");
                Ok(())
            }
            Ok(Err(e)) => Err(RemoteError::Transport(format!("worker wait: {e}"))),
            Err(_) => self
                .child
                .kill()
                .await
                .map_err(|e| RemoteError::Transport(format!("worker kill: {e}"))),
        }
    }
}

/// JSON-RPC over HTTP POST
///
/// Each request is one POST; the worker answers with newline-delimited
/// frames in the body (a single response, or chunks followed by the final
/// response for streamed invocations), which are classified and queued.
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
    inbound: VecDeque<WorkerMessage>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            inbound: VecDeque::new(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, request: &JsonRpcRequest) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RemoteError::Timeout
                } else {
                    RemoteError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RemoteError::Transport(format!("worker returned HTTP {status}")));
        }
        if !status.is_success() {
            return Err(RemoteError::Protocol(format!("worker returned HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        for line in body.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let value = serde_json::from_str(line)
                .map_err(|e| RemoteError::Protocol(format!("worker emitted invalid JSON: {e}")))?;
            self.inbound.push_back(WorkerMessage::from_value(value)?);
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<WorkerMessage>, RemoteError> {
        Ok(self.inbound.pop_front())
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        self.inbound.clear();
        Ok(())
    }
}
