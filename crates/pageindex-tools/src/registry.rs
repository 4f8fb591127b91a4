//! Tool registry.

use crate::{proxy, BoxedTool};
use pageindex_client::{McpError, McpResult, McpTool, RemoteCaller, ToolCallResult};
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Registry of local and discovered tools.
///
/// The merged list is swapped as a whole, so readers always see either the
/// old or the new set.
pub struct ToolRegistry {
    local: Vec<BoxedTool>,
    tools: RwLock<Arc<Vec<BoxedTool>>>,
}

impl ToolRegistry {
    /// Create a registry holding only `local` tools.
    pub fn new(local: Vec<BoxedTool>) -> Self {
        let tools = Arc::new(local.clone());
        Self {
            local,
            tools: RwLock::new(tools),
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.local.iter().any(|t| t.name() == name)
    }

    /// Replace the remote part of the registry.
    ///
    /// Remote tools named like a local tool are dropped.
    pub fn merge(&self, remote: Vec<BoxedTool>) {
        let mut merged = self.local.clone();
        for tool in remote {
            if self.is_local(tool.name()) {
                debug!(tool = tool.name(), "Remote tool shadowed by local tool");
                continue;
            }
            merged.push(tool);
        }

        *self.tools.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(merged);
    }

    /// Re-run discovery and swap in the result.
    ///
    /// If discovery fails only the local tools remain. Returns the number of
    /// tools now registered.
    pub async fn refresh(&self, caller: Arc<dyn RemoteCaller>) -> usize {
        match proxy::discover(caller).await {
            Ok(remote) => self.merge(remote),
            Err(e) => {
                warn!(error = %e, "Failed to fetch remote tools");
                self.merge(Vec::new());
            }
        }

        let count = self.tools().len();
        info!(count, "Tool registry updated");
        count
    }

    /// Snapshot of the current tool list, local tools first.
    pub fn tools(&self) -> Arc<Vec<BoxedTool>> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Descriptors for `tools/list`.
    pub fn descriptors(&self) -> Vec<McpTool> {
        self.tools().iter().map(|t| t.descriptor()).collect()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<BoxedTool> {
        self.tools().iter().find(|t| t.name() == name).cloned()
    }

    /// Validate `params` and run the named tool.
    ///
    /// Invalid input fails with [`McpError::Validation`] before the tool runs.
    pub async fn execute(&self, name: &str, params: Option<Value>) -> McpResult<ToolCallResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;

        let params = params.unwrap_or_else(|| json!({}));
        let validated = tool
            .validator()
            .validate(&params)
            .map_err(|violations| McpError::Validation {
                operation: name.to_string(),
                violations,
            })?;

        tool.execute(validated).await
    }
}
