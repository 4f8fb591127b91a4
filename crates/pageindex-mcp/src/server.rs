//! Stdio MCP server that fronts the remote PageIndex session.
//!
//! Newline-delimited JSON-RPC is read from the input and every request is
//! handled on its own task; responses are funneled through one writer task
//! so lines never interleave.

use pageindex_client::protocol::{
    codes, CallToolParams, Implementation, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, ReadResourceParams, ResourcesCapability, ServerCapabilities,
    ToolsCapability, PROTOCOL_VERSION,
};
use pageindex_client::{McpError, RemoteCaller, SessionManager, ToolCallResult};
use pageindex_tools::local::local_tools;
use pageindex_tools::ToolRegistry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Name reported to the local client.
pub const SERVER_NAME: &str = "pageindex-mcp";

type RpcResult = Result<Value, JsonRpcError>;

fn internal_error(message: impl Into<String>) -> JsonRpcError {
    JsonRpcError::new(codes::INTERNAL_ERROR, message)
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| JsonRpcError::new(codes::INVALID_PARAMS, format!("Invalid params: {e}")))
}

fn to_value<T: Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| internal_error(e.to_string()))
}

/// Body of a failed `tools/call`.
fn tool_failure(tool: &str, error: &McpError) -> ToolCallResult {
    let body = json!({
        "error": error.to_string(),
        "tool": tool,
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    });
    let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| error.to_string());
    ToolCallResult::error_text(text)
}

/// JSON-RPC error for a failed resource read.
fn read_failure(uri: &str, error: &McpError) -> JsonRpcError {
    let message = error.to_string();
    let code = if message.to_lowercase().contains("not found") {
        codes::RESOURCE_NOT_FOUND
    } else {
        codes::INTERNAL_ERROR
    };
    JsonRpcError::new(code, message).with_data(json!({"uri": uri}))
}

/// The local side of the bridge.
pub struct Bridge {
    manager: SessionManager,
    caller: Arc<dyn RemoteCaller>,
    registry: ToolRegistry,
}

impl Bridge {
    pub fn new(manager: SessionManager) -> Self {
        let caller: Arc<dyn RemoteCaller> = Arc::new(manager.clone());
        Self {
            registry: ToolRegistry::new(local_tools(caller.clone())),
            manager,
            caller,
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    async fn refresh_tools(&self) -> usize {
        self.registry.refresh(self.caller.clone()).await
    }

    /// Handle one message. Notifications produce no response.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            debug!(method = %request.method, "Notification");
            return None;
        }

        let id = request.id.clone();
        let response = match self.dispatch(&request.method, request.params).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => {
                debug!(method = %request.method, code = error.code, "Request failed");
                JsonRpcResponse::error(id, error)
            }
        };
        Some(response)
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> RpcResult {
        match method {
            "initialize" => to_value(InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities {
                    tools: Some(ToolsCapability::default()),
                    resources: Some(ResourcesCapability::default()),
                },
                server_info: Implementation::new(SERVER_NAME, env!("CARGO_PKG_VERSION")),
                instructions: None,
            }),
            "ping" => Ok(json!({})),
            "tools/list" => self.list_tools().await,
            "tools/call" => self.call_tool(parse_params(params)?).await,
            "resources/list" => self.list_resources(params).await,
            "resources/read" => self.read_resource(parse_params(params)?).await,
            "resources/templates/list" => self.list_resource_templates().await,
            other => Err(JsonRpcError::new(
                codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    async fn list_tools(&self) -> RpcResult {
        self.manager
            .connect()
            .await
            .map_err(|e| internal_error(e.to_string()))?;
        self.refresh_tools().await;
        Ok(json!({"tools": self.registry.descriptors()}))
    }

    async fn call_tool(&self, params: CallToolParams) -> RpcResult {
        let name = params.name;
        let outcome = async {
            self.manager.connect().await?;
            // Unknown names may be tools the remote added since the last listing.
            if self.registry.get(&name).is_none() {
                self.refresh_tools().await;
            }
            self.registry.execute(&name, params.arguments).await
        }
        .await;

        let result = outcome.unwrap_or_else(|e| {
            warn!(tool = %name, error = %e, "Tool call failed");
            tool_failure(&name, &e)
        });
        to_value(result)
    }

    async fn list_resources(&self, params: Option<Value>) -> RpcResult {
        let cursor = params.as_ref().and_then(|p| p.get("cursor")).cloned();
        let outcome = async {
            self.manager.connect().await?;
            self.manager.list_resources().await
        }
        .await;

        match outcome {
            Ok(result) => to_value(result),
            Err(e) => Err(internal_error(e.to_string()).with_data(json!({"cursor": cursor}))),
        }
    }

    async fn read_resource(&self, params: ReadResourceParams) -> RpcResult {
        let outcome = async {
            self.manager.connect().await?;
            self.manager.read_resource(&params.uri).await
        }
        .await;

        match outcome {
            Ok(result) => to_value(result),
            Err(e) => Err(read_failure(&params.uri, &e)),
        }
    }

    async fn list_resource_templates(&self) -> RpcResult {
        let outcome = async {
            self.manager.connect().await?;
            self.manager.list_resource_templates().await
        }
        .await;

        outcome
            .map_err(|e| internal_error(e.to_string()))
            .and_then(to_value)
    }

    /// Serve until `reader` reaches EOF, then close the remote session.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_loop(writer, rx));
        let mut in_flight = JoinSet::new();
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            debug!("Received: {}", line);

            let request = match serde_json::from_str::<JsonRpcRequest>(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Failed to parse message");
                    let error = JsonRpcError::new(codes::PARSE_ERROR, format!("Parse error: {e}"));
                    send(&tx, &JsonRpcResponse::error(None, error));
                    continue;
                }
            };

            let bridge = self.clone();
            let tx = tx.clone();
            in_flight.spawn(async move {
                if let Some(response) = bridge.handle(request).await {
                    send(&tx, &response);
                }
            });

            // Reap finished handlers so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}
        }

        info!("Input closed, shutting down");
        while in_flight.join_next().await.is_some() {}
        drop(tx);
        if let Err(e) = writer_task.await {
            error!(error = %e, "Writer task failed");
        }

        self.shutdown().await;
        Ok(())
    }

    /// Close the remote session, logging failures.
    pub async fn shutdown(&self) {
        if let Err(e) = self.manager.close().await {
            warn!(error = %e, "Error during shutdown");
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, response: &JsonRpcResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => error!(error = %e, "Failed to serialize response"),
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        debug!("Sending: {}", line);
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            error!(error = %e, "Error writing response");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageindex_client::{
        Anonymous, ClientIdentity, RetryPolicy, StaticToken, TransportNegotiator,
    };
    use pageindex_test_utils::FakeRemote;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, BufReader};

    fn bridge_for(remote: &FakeRemote, token: Option<&str>) -> Arc<Bridge> {
        let credentials: Arc<dyn pageindex_client::CredentialSupplier> = match token {
            Some(t) => Arc::new(StaticToken::new(t)),
            None => Arc::new(Anonymous),
        };
        let negotiator =
            TransportNegotiator::new(&remote.base_url(), ClientIdentity::default(), credentials)
                .with_timeout(Duration::from_secs(5));
        let manager = SessionManager::with_retry(Arc::new(negotiator), None, RetryPolicy::none());
        Arc::new(Bridge::new(manager))
    }

    async fn request(bridge: &Bridge, id: u64, method: &str, params: Value) -> JsonRpcResponse {
        bridge
            .handle(JsonRpcRequest::new(id, method, Some(params)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_does_not_connect() {
        let remote = FakeRemote::start().await;
        let bridge = bridge_for(&remote, None);

        let response = request(&bridge, 1, "initialize", json!({})).await;
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert!(!bridge.manager().is_connected());
        assert_eq!(remote.initialize_count(), 0);
    }

    #[tokio::test]
    async fn test_tools_list_merges_local_and_remote() {
        let remote = FakeRemote::start().await;
        let bridge = bridge_for(&remote, None);

        let response = request(&bridge, 1, "tools/list", json!({})).await;
        let tools = response.result.unwrap()["tools"].clone();
        let names: Vec<_> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["process_document", "ask_document"]);
    }

    #[tokio::test]
    async fn test_tools_call_without_prior_listing() {
        let remote = FakeRemote::start().await;
        let bridge = bridge_for(&remote, None);

        let response = request(
            &bridge,
            2,
            "tools/call",
            json!({"name": "ask_document", "arguments": {"doc_id": "pi-9", "junk": 1}}),
        )
        .await;
        let result: ToolCallResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(!result.is_error);
        // Undeclared keys never reach the remote.
        assert_eq!(result.joined_text(), r#"{"doc_id":"pi-9"}"#);
    }

    #[tokio::test]
    async fn test_tools_call_failures_become_error_results() {
        let remote = FakeRemote::start().await;
        let bridge = bridge_for(&remote, None);

        let response = request(
            &bridge,
            3,
            "tools/call",
            json!({"name": "ask_document", "arguments": {}}),
        )
        .await;
        let result: ToolCallResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(result.is_error);

        let body: Value = serde_json::from_str(&result.joined_text()).unwrap();
        assert_eq!(body["tool"], "ask_document");
        assert!(body["error"].as_str().unwrap().contains("doc_id: Required"));
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(remote.tool_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_in_tools_call() {
        let remote = FakeRemote::builder().token("secret").start().await;
        let bridge = bridge_for(&remote, Some("wrong"));

        let response = request(&bridge, 4, "tools/call", json!({"name": "ask_document"})).await;
        let result: ToolCallResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(result.is_error);
        assert!(result.joined_text().contains("Authentication required"));
    }

    #[tokio::test]
    async fn test_resource_errors() {
        let remote = FakeRemote::start().await;
        let bridge = bridge_for(&remote, None);

        let ok = request(&bridge, 5, "resources/read", json!({"uri": "pageindex://documents"})).await;
        assert!(ok.error.is_none());

        let missing =
            request(&bridge, 6, "resources/read", json!({"uri": "pageindex://nope"})).await;
        let error = missing.error.unwrap();
        assert_eq!(error.code, codes::RESOURCE_NOT_FOUND);
        assert_eq!(error.data.unwrap()["uri"], "pageindex://nope");

        let templates = request(&bridge, 7, "resources/templates/list", json!({})).await;
        assert_eq!(
            templates.result.unwrap()["resourceTemplates"][0]["name"],
            "document"
        );
    }

    #[tokio::test]
    async fn test_listing_failure_is_rpc_error() {
        let remote = FakeRemote::builder().token("secret").start().await;
        let bridge = bridge_for(&remote, None);

        let response = request(&bridge, 8, "resources/list", json!({"cursor": "c1"})).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, codes::INTERNAL_ERROR);
        assert_eq!(error.data.unwrap()["cursor"], "c1");
    }

    #[tokio::test]
    async fn test_unknown_method_and_notifications() {
        let remote = FakeRemote::start().await;
        let bridge = bridge_for(&remote, None);

        let response = request(&bridge, 9, "sampling/createMessage", json!({})).await;
        assert_eq!(response.error.unwrap().code, codes::METHOD_NOT_FOUND);

        let notification = JsonRpcRequest {
            id: None,
            ..JsonRpcRequest::new(0u64, "notifications/initialized", None)
        };
        assert!(bridge.handle(notification).await.is_none());
    }

    #[tokio::test]
    async fn test_serve_over_pipes() {
        let remote = FakeRemote::start().await;
        let bridge = bridge_for(&remote, None);

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n",
            "not json\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
        );
        let (out_writer, mut out_reader) = tokio::io::duplex(64 * 1024);

        bridge
            .clone()
            .serve(BufReader::new(input.as_bytes()), out_writer)
            .await
            .unwrap();

        let mut output = String::new();
        out_reader.read_to_string(&mut output).await.unwrap();
        let responses: Vec<Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 3);

        let parse_error = responses
            .iter()
            .find(|r| r["id"].is_null())
            .expect("parse error response");
        assert_eq!(parse_error["error"]["code"], codes::PARSE_ERROR);
        assert!(responses.iter().any(|r| r["id"] == 1));
        assert!(responses.iter().any(|r| r["id"] == 2 && r["result"]["tools"].is_array()));

        // EOF closes the session.
        assert!(!bridge.manager().is_connected());
        assert_eq!(remote.deletes(), 1);
    }
}
