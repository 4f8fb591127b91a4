//! Transport negotiation: streamable HTTP first, legacy SSE as fallback.

use crate::error::{McpError, McpResult};
use crate::identity::ClientIdentity;
use crate::protocol::Implementation;
use crate::session::Session;
use crate::sse::SseTransport;
use crate::streamable::StreamableHttpTransport;
use crate::transport::{CredentialSupplier, RequestDecorator};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Produces a fresh, initialized session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> McpResult<Session>;
}

/// The two URLs derived from the endpoint base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateUrls {
    pub streamable: String,
    pub sse: String,
}

impl CandidateUrls {
    pub fn from_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            streamable: format!("{base}/mcp?local_upload=1"),
            sse: format!("{base}/mcp/sse?local_upload=1"),
        }
    }
}

/// Establishes a session against one remote endpoint.
pub struct TransportNegotiator {
    urls: CandidateUrls,
    identity: ClientIdentity,
    credentials: Arc<dyn CredentialSupplier>,
    timeout: Duration,
}

impl TransportNegotiator {
    pub fn new(
        endpoint_base: &str,
        identity: ClientIdentity,
        credentials: Arc<dyn CredentialSupplier>,
    ) -> Self {
        Self {
            urls: CandidateUrls::from_base(endpoint_base),
            identity,
            credentials,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn urls(&self) -> &CandidateUrls {
        &self.urls
    }

    fn decorator(&self) -> RequestDecorator {
        RequestDecorator::new(self.identity.clone(), self.credentials.clone())
    }

    fn client_info(&self) -> Implementation {
        Implementation::new("pageindex-mcp", self.identity.version.clone())
    }

    async fn try_streamable(&self) -> McpResult<Session> {
        let transport =
            StreamableHttpTransport::new(&self.urls.streamable, self.decorator(), self.timeout)?;
        Session::initialize(Box::new(transport), self.client_info()).await
    }

    async fn try_sse(&self) -> McpResult<Session> {
        let transport = SseTransport::connect(&self.urls.sse, self.decorator(), self.timeout).await?;
        Session::initialize(Box::new(transport), self.client_info()).await
    }
}

#[async_trait]
impl Connector for TransportNegotiator {
    async fn connect(&self) -> McpResult<Session> {
        debug!(url = %self.urls.streamable, "Trying streamable HTTP transport");

        let primary = match self.try_streamable().await {
            Ok(session) => {
                info!(transport = "streamable-http", "Connected to remote");
                return Ok(session);
            }
            // The fallback would be rejected identically.
            Err(McpError::AuthRequired) => return Err(McpError::AuthRequired),
            Err(e) => e,
        };

        warn!(error = %primary, "Streamable HTTP failed, falling back to SSE");

        match self.try_sse().await {
            Ok(session) => {
                info!(transport = "sse", "Connected to remote");
                Ok(session)
            }
            Err(McpError::AuthRequired) => Err(McpError::AuthRequired),
            Err(fallback) => Err(McpError::connection_failed(format!(
                "streamable HTTP: {primary}; SSE: {fallback}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_urls() {
        let urls = CandidateUrls::from_base("https://pageindex.vercel.app/");
        assert_eq!(urls.streamable, "https://pageindex.vercel.app/mcp?local_upload=1");
        assert_eq!(urls.sse, "https://pageindex.vercel.app/mcp/sse?local_upload=1");
    }

    #[tokio::test]
    async fn test_both_transports_unreachable() {
        let negotiator = TransportNegotiator::new(
            "http://127.0.0.1:1",
            ClientIdentity::default(),
            Arc::new(crate::transport::Anonymous),
        )
        .with_timeout(Duration::from_secs(2));

        let err = negotiator.connect().await.unwrap_err();
        match err {
            McpError::ConnectionFailed(message) => {
                assert!(message.contains("streamable HTTP"));
                assert!(message.contains("SSE"));
            }
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
    }
}
