//! Tools that run inside the bridge.

pub mod process_document;

pub use process_document::ProcessDocumentTool;

use crate::BoxedTool;
use pageindex_client::RemoteCaller;
use std::sync::Arc;

/// Every local tool, wired to `caller`.
pub fn local_tools(caller: Arc<dyn RemoteCaller>) -> Vec<BoxedTool> {
    vec![Arc::new(ProcessDocumentTool::new(caller))]
}
