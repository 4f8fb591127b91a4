//! Remote MCP client for the PageIndex bridge.
//!
//! Connects to the PageIndex remote MCP endpoint, authorizes with OAuth 2.0
//! when the remote demands it, and keeps a single shared session alive for
//! the local stdio shell.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌─────────────────────┐     ┌──────────────┐
//! │ SessionManager │────▶│ TransportNegotiator │────▶│ PageIndex    │
//! │  (retry, auth) │◀────│ (HTTP first, SSE)   │◀────│ remote MCP   │
//! └────────────────┘     └─────────────────────┘     └──────────────┘
//!         │
//!         ▼
//! ┌────────────────┐     ┌─────────────────────┐
//! │ OAuthProvider  │────▶│ AuthorizationFlow   │
//! │ (PKCE, DCR)    │     │ (browser, loopback) │
//! └────────────────┘     └─────────────────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **Streamable HTTP**: JSON-RPC over POST, session id in `Mcp-Session-Id`
//! - **SSE**: legacy GET event stream with a POST message endpoint
//!
//! # Example
//!
//! ```no_run
//! use pageindex_client::{
//!     ClientIdentity, OAuthConfig, OAuthProvider, SessionManager, TransportNegotiator,
//! };
//! use pageindex_auth::CredentialStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(CredentialStore::new()?);
//! let provider = Arc::new(
//!     OAuthProvider::new(OAuthConfig::new("https://pageindex.vercel.app"), store).await?,
//! );
//!
//! let negotiator = TransportNegotiator::new(
//!     "https://pageindex.vercel.app",
//!     ClientIdentity::default(),
//!     provider.clone(),
//! );
//! let manager = SessionManager::new(Arc::new(negotiator), None);
//! manager.connect().await?;
//!
//! let tools = manager.list_operations().await?;
//! println!("{} remote tools", tools.len());
//! # Ok(())
//! # }
//! ```

pub mod callback;
mod error;
mod identity;
mod manager;
mod negotiator;
pub mod oauth;
pub mod protocol;
pub mod retry;
mod session;
pub mod sse;
pub mod streamable;
mod transport;

pub use callback::{AuthorizationFlow, BrowserLauncher, FlowState, RedirectTarget, SystemBrowser};
pub use error::{McpError, McpResult};
pub use identity::{ClientIdentity, ClientKind};
pub use manager::{Authorizer, OAuthAuthorizer, RemoteCaller, SessionManager};
pub use negotiator::{CandidateUrls, Connector, TransportNegotiator, DEFAULT_TIMEOUT};
pub use oauth::{AuthorizationRequest, OAuthConfig, OAuthProvider};
pub use protocol::{McpTool, ToolCallResult, ToolContent};
pub use retry::RetryPolicy;
pub use session::Session;
pub use sse::SseTransport;
pub use streamable::StreamableHttpTransport;
pub use transport::{Anonymous, CredentialSupplier, StaticToken, Transport, TransportKind};
