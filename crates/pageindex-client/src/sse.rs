//! Legacy SSE (Server-Sent Events) transport for remote MCP servers.
//!
//! The client holds one long-lived GET event stream. The server's first
//! `endpoint` event names the URL that requests are POSTed to; responses come
//! back over the stream as `message` events and are matched by request id.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::streamable::map_send_error;
use crate::transport::{RequestDecorator, Transport, TransportKind};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the server names none.
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental parser for the `text/event-stream` format.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseEventParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseEventParser {
    /// Feed a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            id,
        })
    }
}

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>>;

/// Legacy SSE transport.
pub struct SseTransport {
    /// URL that requests are POSTed to, announced by the server.
    endpoint: String,
    client: Client,
    decorator: RequestDecorator,
    timeout: Duration,
    pending: Pending,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SseTransport {
    /// Open the event stream and wait for the server's endpoint announcement.
    pub(crate) async fn connect(
        stream_url: &str,
        decorator: RequestDecorator,
        timeout: Duration,
    ) -> McpResult<Self> {
        let base = url::Url::parse(stream_url)
            .map_err(|e| McpError::connection_failed(format!("Invalid SSE URL {stream_url}: {e}")))?;

        // No overall timeout here: it would cut the long-lived stream.
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                McpError::connection_failed(format!("Failed to create HTTP client: {e}"))
            })?;

        let req = client
            .get(stream_url)
            .header("Accept", "text/event-stream");
        let response = tokio::time::timeout(timeout, decorator.decorate(req).await.send())
            .await
            .map_err(|_| McpError::Timeout)?
            .map_err(map_send_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired);
        }
        if !status.is_success() {
            return Err(McpError::connection_failed(format!(
                "SSE stream returned {status}"
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.contains("text/event-stream") {
            return Err(McpError::protocol_error(format!(
                "Expected an event stream, got '{content_type}'"
            )));
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        tokio::spawn(read_stream(
            response,
            endpoint_tx,
            pending.clone(),
            connected.clone(),
            cancel.clone(),
        ));

        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                cancel.cancel();
                return Err(McpError::connection_failed(
                    "SSE stream closed before announcing an endpoint",
                ));
            }
            Err(_) => {
                cancel.cancel();
                return Err(McpError::Timeout);
            }
        };

        let endpoint = base
            .join(&endpoint)
            .map_err(|e| McpError::protocol_error(format!("Invalid endpoint '{endpoint}': {e}")))?
            .to_string();

        info!(endpoint = %endpoint, "SSE stream established");

        Ok(Self {
            endpoint,
            client,
            decorator,
            timeout,
            pending,
            connected,
            cancel,
        })
    }

    /// Get the POST endpoint announced by the server.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, body: String) -> McpResult<reqwest::Response> {
        let req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .body(body);

        let response = self
            .decorator
            .decorate(req)
            .await
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::protocol_error(format!(
                "Server returned {status}: {text}"
            )));
        }

        Ok(response)
    }
}

/// Reader task: routes `message` events to waiting requests.
async fn read_stream(
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut stream = response.bytes_stream();
    let mut parser = SseEventParser::default();
    let mut endpoint_tx = Some(endpoint_tx);

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = stream.next() => chunk,
        };

        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!(error = %e, "SSE stream error");
                break;
            }
            None => {
                debug!("SSE stream ended");
                break;
            }
        };

        for event in parser.push(&chunk) {
            match event.event.as_str() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data);
                    }
                }
                "message" => route_message(&event.data, &pending).await,
                other => debug!(event = other, "Ignoring SSE event"),
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a closed channel.
    pending.lock().await.clear();
}

async fn route_message(data: &str, pending: &Pending) {
    let response = match serde_json::from_str::<JsonRpcResponse>(data) {
        Ok(resp) if resp.result.is_some() || resp.error.is_some() => resp,
        _ => {
            debug!(data = %data, "Skipping non-response message");
            return;
        }
    };

    let Some(id) = response.id.clone() else {
        return;
    };

    match pending.lock().await.remove(&id) {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => debug!(id = %id, "Response for unknown request"),
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| McpError::protocol_error("Request without id"))?;

        if !self.is_connected() {
            return Err(McpError::connection_failed("SSE stream is closed"));
        }

        let request_json = serde_json::to_string(&request)?;
        debug!(id = %id, method = %request.method, "Sending SSE request");

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.post(request_json).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::connection_failed(
                "SSE stream closed before the response arrived",
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout)
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let notification_json = serde_json::to_string(&notification)?;
        debug!(method = %notification.method, "Sending SSE notification");
        self.post(notification_json).await?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().await.clear();
        debug!("Closed SSE transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
