//! Testing utilities for the PageIndex bridge.
//!
//! - **Fake remote**: an in-process MCP server speaking both the streamable
//!   HTTP and the legacy SSE transport, with optional bearer-token checks
//! - **Ports**: helpers for tests that need a free loopback port
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use pageindex_test_utils::FakeRemote;
//!
//! #[tokio::test]
//! async fn test_connects() {
//!     let remote = FakeRemote::builder().token("secret").start().await;
//!     // Point the client at remote.base_url()
//! }
//! ```

pub mod remote;

pub use remote::{FakeRemote, FakeRemoteBuilder, FAKE_SESSION_ID};

/// Find a loopback port that is currently free.
///
/// The port is released before returning, so another process could grab it
/// in between; good enough for tests.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(0)
}

/// Check whether `port` can be bound on loopback right now.
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
