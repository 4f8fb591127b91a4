//! Structured error results returned to the local client.

use pageindex_client::ToolCallResult;
use serde::Serialize;
use serde_json::{Map, Value};

/// Guidance attached to an error result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextSteps {
    pub immediate: String,
    pub options: Vec<String>,
    pub auto_retry: String,
}

impl NextSteps {
    pub fn new(immediate: impl Into<String>, options: &[&str], auto_retry: impl Into<String>) -> Self {
        Self {
            immediate: immediate.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
            auto_retry: auto_retry.into(),
        }
    }
}

/// Body of an `isError: true` tool result.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    error: String,
    #[serde(flatten)]
    details: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_steps: Option<NextSteps>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Map::new(),
            hint: None,
            next_steps: None,
        }
    }

    /// Add a top-level detail field.
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn next_steps(mut self, steps: NextSteps) -> Self {
        self.next_steps = Some(steps);
        self
    }

    /// Render as a tool result whose text is the pretty-printed JSON body.
    pub fn into_result(self) -> ToolCallResult {
        let text = serde_json::to_string_pretty(&self).unwrap_or_else(|_| self.error.clone());
        ToolCallResult::error_text(text)
    }
}
