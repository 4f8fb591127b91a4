//! Credential storage for the PageIndex MCP bridge.
//!
//! This crate owns the only durable state of the bridge: a single JSON file
//! holding the OAuth tokens, the dynamically registered client identity and
//! the PKCE verifier of an in-progress authorization.
//!
//! # Storage Location
//!
//! By default the record lives at `~/.pageindex-mcp/oauth-tokens.json`.
//! The file is written atomically and with owner-only permissions (0600 on
//! Unix; permission bits are skipped on platforms without them).
//!
//! A missing or unreadable file is a normal first-run state: [`CredentialStore::load`]
//! returns an empty [`CredentialRecord`] instead of failing.
//!
//! # Example
//!
//! ```no_run
//! use pageindex_auth::{CredentialStore, InvalidateScope};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = CredentialStore::new()?;
//!
//!     let record = store.load().await;
//!     if record.tokens.is_some() {
//!         // The remote rejected the access token: drop it but keep the client.
//!         store.invalidate(InvalidateScope::Tokens).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

mod error;
mod record;
mod storage;

pub use error::{AuthError, AuthResult};
pub use record::{ClientInfo, CredentialRecord, InvalidateScope, OAuthTokens};
pub use storage::CredentialStore;

/// Directory under the user's home that holds the credential file.
pub const CREDENTIALS_DIR: &str = ".pageindex-mcp";

/// File name of the credential record.
pub const CREDENTIALS_FILE: &str = "oauth-tokens.json";

/// Get the default credential file path for the current user.
///
/// Returns `None` if the home directory cannot be determined.
pub fn default_credentials_path() -> Option<std::path::PathBuf> {
    dirs::home_dir().map(|p| p.join(CREDENTIALS_DIR).join(CREDENTIALS_FILE))
}

/// Get the current time in seconds since Unix epoch.
pub fn current_time_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
