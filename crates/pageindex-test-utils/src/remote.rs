//! In-process fake of the PageIndex remote MCP endpoint.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Session id handed out on the streamable transport.
pub const FAKE_SESSION_ID: &str = "fake-session";

#[derive(Default)]
struct Counters {
    initialize: AtomicU32,
    streamable_posts: AtomicU32,
    sse_connects: AtomicU32,
    tool_calls: AtomicU32,
    deletes: AtomicU32,
    unauthorized: AtomicU32,
}

struct Inner {
    token: RwLock<Option<String>>,
    streamable: bool,
    tools: Vec<Value>,
    page_size: usize,
    counters: Counters,
    sse_sessions: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
    seen_headers: Mutex<Vec<HeaderMap>>,
}

#[derive(Clone)]
struct FakeState {
    inner: Arc<Inner>,
}

impl FakeState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        self.inner
            .seen_headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(headers.clone());

        let token = self.inner.token.read().unwrap_or_else(|e| e.into_inner());
        let Some(expected) = token.as_deref() else {
            return true;
        };
        let ok = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {expected}"));
        if !ok {
            self.inner.counters.unauthorized.fetch_add(1, Ordering::SeqCst);
        }
        ok
    }

    /// Answer one JSON-RPC message. Notifications yield `None`.
    fn dispatch(&self, message: &Value) -> Option<Value> {
        let id = message.get("id").cloned()?;
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        debug!(method, "Fake remote request");

        let outcome = match method {
            "initialize" => {
                self.inner.counters.initialize.fetch_add(1, Ordering::SeqCst);
                Ok(json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": {"tools": {}, "resources": {}},
                    "serverInfo": {"name": "fake-pageindex", "version": "0.0.0"}
                }))
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_page(&params)),
            "tools/call" => self.call_tool(&params),
            "resources/list" => Ok(json!({
                "resources": [{"uri": "pageindex://documents", "name": "documents"}]
            })),
            "resources/read" => match params.get("uri").and_then(Value::as_str) {
                Some(uri @ "pageindex://documents") => Ok(json!({
                    "contents": [{"uri": uri, "mimeType": "application/json", "text": "[]"}]
                })),
                Some(uri) => Err((-32002, format!("Resource not found: {uri}"))),
                None => Err((-32602, "missing uri".to_string())),
            },
            "resources/templates/list" => Ok(json!({
                "resourceTemplates": [
                    {"uriTemplate": "pageindex://documents/{doc_id}", "name": "document"}
                ]
            })),
            other => Err((-32601, format!("Method not found: {other}"))),
        };

        Some(match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            }),
        })
    }

    fn tools_page(&self, params: &Value) -> Value {
        let start = params
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let tools = &self.inner.tools;
        let end = (start + self.inner.page_size).min(tools.len());
        let page = tools.get(start..end).unwrap_or(&[]).to_vec();

        if end < tools.len() {
            json!({"tools": page, "nextCursor": end.to_string()})
        } else {
            json!({"tools": page})
        }
    }

    fn call_tool(&self, params: &Value) -> Result<Value, (i64, String)> {
        self.inner.counters.tool_calls.fetch_add(1, Ordering::SeqCst);
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let known = self
            .inner
            .tools
            .iter()
            .any(|t| t.get("name").and_then(Value::as_str) == Some(name));
        if !known {
            return Err((-32602, format!("Unknown tool: {name}")));
        }

        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        Ok(json!({
            "content": [{"type": "text", "text": arguments.to_string()}]
        }))
    }
}

async fn streamable_post(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> Response {
    if !state.inner.streamable {
        return StatusCode::NOT_FOUND.into_response();
    }
    state
        .inner
        .counters
        .streamable_posts
        .fetch_add(1, Ordering::SeqCst);
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match state.dispatch(&message) {
        Some(response) => ([("mcp-session-id", FAKE_SESSION_ID)], Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn streamable_delete(State(state): State<FakeState>) -> StatusCode {
    state.inner.counters.deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn sse_stream(State(state): State<FakeState>, headers: HeaderMap) -> Response {
    state.inner.counters.sse_connects.fetch_add(1, Ordering::SeqCst);
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    state
        .inner
        .sse_sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(session_id.clone(), tx);

    // Relative on purpose: clients must resolve it against the stream URL.
    let endpoint = format!("messages?sessionId={session_id}");

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint));

        while let Some(message) = rx.recv().await {
            yield Ok(Event::default().event("message").data(message.to_string()));
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
        .into_response()
}

#[derive(Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn sse_message(
    State(state): State<FakeState>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> StatusCode {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }

    let sender = state
        .inner
        .sse_sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&query.session_id)
        .cloned();
    let Some(sender) = sender else {
        return StatusCode::NOT_FOUND;
    };

    if let Some(response) = state.dispatch(&message) {
        let _ = sender.send(response);
    }
    StatusCode::ACCEPTED
}

/// Configures a [`FakeRemote`].
pub struct FakeRemoteBuilder {
    token: Option<String>,
    streamable: bool,
    tools: Vec<Value>,
    page_size: usize,
}

impl Default for FakeRemoteBuilder {
    fn default() -> Self {
        Self {
            token: None,
            streamable: true,
            tools: vec![
                json!({
                    "name": "ask_document",
                    "description": "Ask a question about a document",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "doc_id": {"type": "string"},
                            "question": {"type": "string"}
                        },
                        "required": ["doc_id"]
                    }
                }),
                json!({"name": "get_signed_upload_url", "inputSchema": {"type": "object"}}),
                json!({"name": "submit_document", "inputSchema": {"type": "object"}}),
            ],
            page_size: 50,
        }
    }
}

impl FakeRemoteBuilder {
    /// Require `Authorization: Bearer <token>` on every request.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Answer 404 on the streamable endpoint so clients must fall back to SSE.
    pub fn sse_only(mut self) -> Self {
        self.streamable = false;
        self
    }

    pub fn tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    /// Split `tools/list` into pages of `size` entries.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub async fn start(self) -> FakeRemote {
        let state = FakeState {
            inner: Arc::new(Inner {
                token: RwLock::new(self.token),
                streamable: self.streamable,
                tools: self.tools,
                page_size: self.page_size,
                counters: Counters::default(),
                sse_sessions: Mutex::new(HashMap::new()),
                seen_headers: Mutex::new(Vec::new()),
            }),
        };

        let router = Router::new()
            .route("/mcp", post(streamable_post).delete(streamable_delete))
            .route("/mcp/sse", get(sse_stream))
            .route("/mcp/messages", post(sse_message))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake remote");
        let addr = listener.local_addr().expect("fake remote address");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        FakeRemote { addr, state, task }
    }
}

/// A running fake remote. Stops when dropped.
pub struct FakeRemote {
    addr: SocketAddr,
    state: FakeState,
    task: JoinHandle<()>,
}

impl FakeRemote {
    pub fn builder() -> FakeRemoteBuilder {
        FakeRemoteBuilder::default()
    }

    /// Start with default settings: no auth, both transports.
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    /// Endpoint base, e.g. `http://127.0.0.1:41234`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Change the accepted token; `None` disables the check.
    pub fn set_token(&self, token: Option<&str>) {
        *self.state.inner.token.write().unwrap_or_else(|e| e.into_inner()) =
            token.map(str::to_string);
    }

    pub fn initialize_count(&self) -> u32 {
        self.state.inner.counters.initialize.load(Ordering::SeqCst)
    }

    pub fn streamable_posts(&self) -> u32 {
        self.state.inner.counters.streamable_posts.load(Ordering::SeqCst)
    }

    pub fn sse_connects(&self) -> u32 {
        self.state.inner.counters.sse_connects.load(Ordering::SeqCst)
    }

    pub fn tool_calls(&self) -> u32 {
        self.state.inner.counters.tool_calls.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u32 {
        self.state.inner.counters.deletes.load(Ordering::SeqCst)
    }

    pub fn unauthorized_count(&self) -> u32 {
        self.state.inner.counters.unauthorized.load(Ordering::SeqCst)
    }

    /// Value of `name` on the most recent request that carried it.
    pub fn last_header(&self, name: &str) -> Option<String> {
        self.state
            .inner
            .seen_headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find_map(|h| h.get(name).and_then(|v| v.to_str().ok()).map(str::to_string))
    }
}

impl Drop for FakeRemote {
    fn drop(&mut self) {
        self.task.abort();
    }
}
