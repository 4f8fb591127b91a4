//! MCP transport abstraction.

use crate::error::McpResult;
use crate::identity::ClientIdentity;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Which wire mechanism a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    StreamableHttp,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamableHttp => f.write_str("streamable-http"),
            Self::Sse => f.write_str("sse"),
        }
    }
}

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for a response.
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()>;

    /// Close the transport.
    async fn close(&self) -> McpResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    fn kind(&self) -> TransportKind;
}

/// Source of the bearer token attached to every outbound request.
///
/// Queried per request so a refreshed token is picked up without rebuilding
/// the transport.
#[async_trait]
pub trait CredentialSupplier: Send + Sync {
    async fn access_token(&self) -> Option<String>;
}

/// A fixed token, used when an API key is configured.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialSupplier for StaticToken {
    async fn access_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Supplies no credential at all.
pub struct Anonymous;

#[async_trait]
impl CredentialSupplier for Anonymous {
    async fn access_token(&self) -> Option<String> {
        None
    }
}

/// Builds the headers shared by both transports.
#[derive(Clone)]
pub(crate) struct RequestDecorator {
    identity: ClientIdentity,
    credentials: Arc<dyn CredentialSupplier>,
}

impl RequestDecorator {
    pub(crate) fn new(identity: ClientIdentity, credentials: Arc<dyn CredentialSupplier>) -> Self {
        Self {
            identity,
            credentials,
        }
    }

    /// Attach identification and authorization headers.
    pub(crate) async fn decorate(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut req = req
            .header("X-Client-Type", self.identity.kind.as_str())
            .header("X-Client-Version", &self.identity.version);

        if let Some(token) = self.credentials.access_token().await {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        req
    }
}
