//! Streamable HTTP transport for remote MCP servers.
//!
//! Every message is an HTTP POST; the server answers with either a JSON body
//! or a short-lived event stream carrying the response.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::sse::SseEventParser;
use crate::transport::{RequestDecorator, Transport, TransportKind};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Header carrying the server-assigned session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport.
pub struct StreamableHttpTransport {
    url: String,
    client: Client,
    decorator: RequestDecorator,
    connected: AtomicBool,
    /// Session id assigned by the server, echoed on later requests.
    session_id: RwLock<Option<String>>,
}

impl StreamableHttpTransport {
    /// Create a new transport. No I/O happens until the first request.
    pub(crate) fn new(
        url: impl Into<String>,
        decorator: RequestDecorator,
        timeout: Duration,
    ) -> McpResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            McpError::connection_failed(format!("Failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            url: url.into(),
            client,
            decorator,
            connected: AtomicBool::new(false),
            session_id: RwLock::new(None),
        })
    }

    /// Get the session id assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Build request with common headers.
    async fn build_request(&self, body: String) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);

        if let Some(ref id) = *self.session_id.read().await {
            req = req.header(SESSION_HEADER, id);
        }

        self.decorator.decorate(req).await
    }

    async fn send(&self, body: String) -> McpResult<reqwest::Response> {
        let response = self
            .build_request(body)
            .await
            .send()
            .await
            .map_err(map_send_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired);
        }

        if let Some(session_id) = response.headers().get(SESSION_HEADER) {
            if let Ok(id) = session_id.to_str() {
                *self.session_id.write().await = Some(id.to_string());
            }
        }

        Ok(response)
    }

    /// Parse a response body, JSON or event stream.
    async fn parse_response(
        &self,
        id: Option<&RequestId>,
        response: reqwest::Response,
    ) -> McpResult<JsonRpcResponse> {
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::protocol_error(format!(
                "Server returned {status}: {text}"
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if content_type.contains("text/event-stream") {
            self.parse_event_stream(id, response).await
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::protocol_error(format!("Failed to read response: {e}")))?;

            serde_json::from_str(&text)
                .map_err(|e| McpError::protocol_error(format!("Invalid JSON response: {e}")))
        }
    }

    /// Read events until the one answering `id` arrives.
    async fn parse_event_stream(
        &self,
        id: Option<&RequestId>,
        response: reqwest::Response,
    ) -> McpResult<JsonRpcResponse> {
        use futures::StreamExt;

        let mut stream = response.bytes_stream();
        let mut parser = SseEventParser::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| McpError::protocol_error(format!("Stream error: {e}")))?;

            for event in parser.push(&chunk) {
                if event.event != "message" {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    // Server-initiated requests and notifications are not answered.
                    Ok(resp) if resp.result.is_none() && resp.error.is_none() => {
                        debug!(data = %event.data, "Skipping non-response event")
                    }
                    Ok(resp) if id.is_none() || resp.id.as_ref() == id => return Ok(resp),
                    Ok(_) => debug!("Skipping response for another request"),
                    Err(e) => debug!(error = %e, "Skipping unparsable event"),
                }
            }
        }

        Err(McpError::protocol_error("Event stream ended without response"))
    }
}

pub(crate) fn map_send_error(e: reqwest::Error) -> McpError {
    if e.is_timeout() {
        McpError::Timeout
    } else if e.is_connect() {
        McpError::connection_failed(e.to_string())
    } else {
        McpError::from(e)
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let request_json = serde_json::to_string(&request)?;

        debug!(id = ?request.id, method = %request.method, "Sending streamable HTTP request");

        let response = self.send(request_json).await?;
        self.connected.store(true, Ordering::SeqCst);
        self.parse_response(request.id.as_ref(), response).await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let notification_json = serde_json::to_string(&notification)?;

        debug!(method = %notification.method, "Sending streamable HTTP notification");

        let response = self.send(notification_json).await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Notification returned non-success status");
        }

        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(id) = self.session_id.write().await.take() {
            let req = self.client.delete(&self.url).header(SESSION_HEADER, &id);
            let req = self.decorator.decorate(req).await;
            if let Err(e) = req.send().await {
                debug!(error = %e, "Session termination request failed");
            }
        }

        debug!("Closed streamable HTTP transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }
}
