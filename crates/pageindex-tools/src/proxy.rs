//! Local wrappers for the remote endpoint's tools.

use crate::schema::Validator;
use crate::{BoxedTool, ToolHandler};
use async_trait::async_trait;
use pageindex_client::{McpResult, McpTool, RemoteCaller, ToolCallResult};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Remote tools that only local tools may call.
pub const EXCLUDED_TOOLS: &[&str] = &["get_signed_upload_url", "submit_document"];

/// A remote tool invoked through the session.
pub struct RemoteTool {
    name: String,
    description: String,
    schema: Value,
    validator: Validator,
    caller: Arc<dyn RemoteCaller>,
}

impl RemoteTool {
    pub fn new(def: McpTool, caller: Arc<dyn RemoteCaller>) -> Self {
        let validator = def
            .input_schema
            .as_ref()
            .map(Validator::from_schema)
            .unwrap_or(Validator::Any);
        let description = def
            .description
            .unwrap_or_else(|| format!("Remote tool: {}", def.name));
        let schema = def
            .input_schema
            .unwrap_or_else(|| json!({"type": "object"}));

        Self {
            name: def.name,
            description,
            schema,
            validator,
            caller,
        }
    }
}

#[async_trait]
impl ToolHandler for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    fn validator(&self) -> &Validator {
        &self.validator
    }

    async fn execute(&self, params: Value) -> McpResult<ToolCallResult> {
        self.caller.call(&self.name, params).await
    }
}

/// List the remote tools and wrap every one that is not reserved.
///
/// Order follows the remote listing.
pub async fn discover(caller: Arc<dyn RemoteCaller>) -> McpResult<Vec<BoxedTool>> {
    let operations = caller.list_operations().await?;
    let total = operations.len();

    let tools: Vec<BoxedTool> = operations
        .into_iter()
        .filter(|op| !EXCLUDED_TOOLS.contains(&op.name.as_str()))
        .map(|op| Arc::new(RemoteTool::new(op, caller.clone())) as BoxedTool)
        .collect();

    debug!(total, exposed = tools.len(), "Discovered remote tools");
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockCaller;
    use pageindex_client::McpError;

    fn op(name: &str, schema: Option<Value>) -> McpTool {
        McpTool {
            name: name.to_string(),
            description: None,
            input_schema: schema,
        }
    }

    #[tokio::test]
    async fn test_discover_excludes_reserved_tools() {
        let mut caller = MockCaller::new();
        caller.expect_list_operations().times(1).returning(|| {
            Ok(vec![
                op("get_signed_upload_url", None),
                op("list_documents", None),
                op("submit_document", None),
                op("ask_document", Some(json!({"type": "object"}))),
            ])
        });

        let tools = discover(Arc::new(caller)).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, ["list_documents", "ask_document"]);

        assert_eq!(tools[0].description(), "Remote tool: list_documents");
        assert_eq!(tools[0].validator(), &Validator::Any);
        assert_eq!(tools[0].input_schema(), json!({"type": "object"}));
    }

    #[tokio::test]
    async fn test_discover_propagates_listing_failure() {
        let mut caller = MockCaller::new();
        caller
            .expect_list_operations()
            .returning(|| Err(McpError::NotConnected));

        assert!(matches!(
            discover(Arc::new(caller)).await,
            Err(McpError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_remote_tool_forwards_to_caller() {
        let mut caller = MockCaller::new();
        caller
            .expect_call()
            .times(1)
            .returning(|name, params| Ok(ToolCallResult::text(format!("{name} {params}"))));

        let tool = RemoteTool::new(op("ask_document", None), Arc::new(caller));
        let result = tool.execute(json!({"doc_id": "d"})).await.unwrap();
        assert_eq!(result.joined_text(), r#"ask_document {"doc_id":"d"}"#);
    }
}
