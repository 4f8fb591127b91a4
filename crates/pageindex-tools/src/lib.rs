//! Tools exposed by the PageIndex bridge.
//!
//! The set of tools is the remote endpoint's own tools, discovered at
//! runtime and validated locally, merged with tools that run inside the
//! bridge. Local tools win on name collisions.

pub mod local;
pub mod proxy;
pub mod registry;
pub mod result;
pub mod schema;

pub use proxy::{discover, RemoteTool, EXCLUDED_TOOLS};
pub use registry::ToolRegistry;
pub use result::{ErrorResponse, NextSteps};
pub use schema::Validator;

use async_trait::async_trait;
use pageindex_client::{McpResult, McpTool, ToolCallResult};
use serde_json::Value;
use std::sync::Arc;

/// A tool the bridge can list and execute.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Get the tool description.
    fn description(&self) -> &str;

    /// Get the JSON Schema advertised for the tool's parameters.
    fn input_schema(&self) -> Value;

    /// Get the validator applied before execution.
    fn validator(&self) -> &Validator;

    /// Execute the tool with already validated parameters.
    async fn execute(&self, params: Value) -> McpResult<ToolCallResult>;

    /// Descriptor as returned from `tools/list`.
    fn descriptor(&self) -> McpTool {
        McpTool {
            name: self.name().to_string(),
            description: Some(self.description().to_string()),
            input_schema: Some(self.input_schema()),
        }
    }
}

/// A shared tool for dynamic dispatch.
pub type BoxedTool = Arc<dyn ToolHandler>;
