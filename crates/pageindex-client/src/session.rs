//! A live, initialized connection to the remote endpoint.

use crate::error::{McpError, McpResult};
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, Implementation, JsonRpcNotification,
    JsonRpcRequest, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, McpTool,
    PaginatedParams, ReadResourceParams, ReadResourceResult, ToolCallResult,
};
use crate::transport::{Transport, TransportKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Upper bound on pages followed when listing, against a remote that keeps
/// returning cursors.
const MAX_PAGES: usize = 100;

/// One authenticated, transport-bound connection.
pub struct Session {
    transport: Box<dyn Transport>,
    next_id: AtomicU64,
    server: InitializeResult,
}

impl Session {
    /// Run the MCP handshake over `transport`.
    pub async fn initialize(
        transport: Box<dyn Transport>,
        client_info: Implementation,
    ) -> McpResult<Self> {
        let next_id = AtomicU64::new(1);
        let id = next_id.fetch_add(1, Ordering::SeqCst);
        let params = serde_json::to_value(InitializeParams::new(client_info))?;

        let response = transport
            .request(JsonRpcRequest::new(id, "initialize", Some(params)))
            .await?;
        let server: InitializeResult = decode(response_result(response)?)?;

        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        info!(
            server = %server.server_info.name,
            protocol = %server.protocol_version,
            transport = %transport.kind(),
            "MCP session initialized"
        );

        Ok(Self {
            transport,
            next_id,
            server,
        })
    }

    /// Get what the server reported during the handshake.
    pub fn server(&self) -> &InitializeResult {
        &self.server
    }

    /// Get the transport this session is bound to.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Send a request and decode its result.
    pub async fn request<P, R>(&self, method: &str, params: Option<P>) -> McpResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = params.map(serde_json::to_value).transpose()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(id, method, "Remote request");

        let response = self
            .transport
            .request(JsonRpcRequest::new(id, method, params))
            .await?;
        decode(response_result(response)?)
    }

    /// List every tool, following pagination.
    pub async fn list_tools(&self) -> McpResult<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor = None;

        for _ in 0..MAX_PAGES {
            let page: ListToolsResult = self
                .request("tools/list", Some(PaginatedParams { cursor }))
                .await?;
            tools.extend(page.tools);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        self.request("tools/call", Some(params)).await
    }

    /// List every resource, following pagination.
    pub async fn list_resources(&self) -> McpResult<ListResourcesResult> {
        let mut all = ListResourcesResult {
            resources: Vec::new(),
            next_cursor: None,
        };
        let mut cursor = None;

        for _ in 0..MAX_PAGES {
            let page: ListResourcesResult = self
                .request("resources/list", Some(PaginatedParams { cursor }))
                .await?;
            all.resources.extend(page.resources);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        Ok(all)
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.request("resources/read", Some(params)).await
    }

    /// List every resource template, following pagination.
    pub async fn list_resource_templates(&self) -> McpResult<ListResourceTemplatesResult> {
        let mut all = ListResourceTemplatesResult {
            resource_templates: Vec::new(),
            next_cursor: None,
        };
        let mut cursor = None;

        for _ in 0..MAX_PAGES {
            let page: ListResourceTemplatesResult = self
                .request("resources/templates/list", Some(PaginatedParams { cursor }))
                .await?;
            all.resource_templates.extend(page.resource_templates);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        Ok(all)
    }

    /// Release the transport.
    pub async fn close(&self) -> McpResult<()> {
        self.transport.close().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.transport.kind())
            .field("server", &self.server.server_info.name)
            .finish()
    }
}

fn response_result(response: crate::protocol::JsonRpcResponse) -> McpResult<Value> {
    if let Some(error) = response.error {
        return Err(McpError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

fn decode<R: DeserializeOwned>(value: Value) -> McpResult<R> {
    serde_json::from_value(value)
        .map_err(|e| McpError::protocol_error(format!("Unexpected result shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcError, JsonRpcResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replays canned results in order and records requests.
    struct Scripted {
        replies: Mutex<Vec<JsonRpcResponse>>,
        seen: std::sync::Arc<Mutex<Vec<JsonRpcRequest>>>,
        notified: std::sync::Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<Value, JsonRpcError>>) -> Self {
            let replies = results
                .into_iter()
                .rev()
                .map(|r| match r {
                    Ok(v) => JsonRpcResponse::success(None, v),
                    Err(e) => JsonRpcResponse::error(None, e),
                })
                .collect();
            Self {
                replies: Mutex::new(replies),
                seen: Default::default(),
                notified: Default::default(),
            }
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
            self.seen.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| McpError::protocol_error("no more replies"))
        }

        async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
            self.notified.lock().unwrap().push(notification.method);
            Ok(())
        }

        async fn close(&self) -> McpResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn kind(&self) -> TransportKind {
            TransportKind::StreamableHttp
        }
    }

    fn init_result() -> Value {
        json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "pageindex", "version": "1.0"}
        })
    }

    fn client_info() -> Implementation {
        Implementation::new("pageindex-mcp", "test")
    }

    #[tokio::test]
    async fn test_initialize_handshake() {
        let transport = Scripted::new(vec![Ok(init_result())]);
        let seen = transport.seen.clone();
        let notified = transport.notified.clone();

        let session = Session::initialize(Box::new(transport), client_info())
            .await
            .unwrap();

        assert_eq!(session.server().server_info.name, "pageindex");
        assert_eq!(seen.lock().unwrap()[0].method, "initialize");
        assert_eq!(notified.lock().unwrap().as_slice(), ["notifications/initialized"]);
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let transport = Scripted::new(vec![
            Ok(init_result()),
            Ok(json!({"tools": [{"name": "a"}], "nextCursor": "2"})),
            Ok(json!({"tools": [{"name": "b"}]})),
        ]);
        let seen = transport.seen.clone();
        let session = Session::initialize(Box::new(transport), client_info())
            .await
            .unwrap();

        let tools = session.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[2].params.as_ref().unwrap()["cursor"], "2");
    }

    #[tokio::test]
    async fn test_rpc_error_is_surfaced() {
        let transport = Scripted::new(vec![
            Ok(init_result()),
            Err(JsonRpcError::new(-32602, "Unknown tool")),
        ]);
        let session = Session::initialize(Box::new(transport), client_info())
            .await
            .unwrap();

        let err = session.call_tool("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_read_resource() {
        let transport = Scripted::new(vec![
            Ok(init_result()),
            Ok(json!({"contents": [{"uri": "pageindex://doc/1", "text": "hi"}]})),
        ]);
        let session = Session::initialize(Box::new(transport), client_info())
            .await
            .unwrap();

        let result = session.read_resource("pageindex://doc/1").await.unwrap();
        assert_eq!(result.contents[0].text.as_deref(), Some("hi"));
    }
}
