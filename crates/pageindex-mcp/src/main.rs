//! pageindex-mcp - local stdio bridge to the PageIndex MCP service.

mod config;
mod logging;
mod server;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use pageindex_auth::{CredentialStore, InvalidateScope};
use pageindex_client::{
    AuthorizationFlow, Authorizer, ClientIdentity, ClientKind, CredentialSupplier,
    OAuthAuthorizer, OAuthConfig, OAuthProvider, SessionManager, StaticToken, SystemBrowser,
    TransportNegotiator,
};
use server::Bridge;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pageindex-mcp")]
#[command(author, version, about = "Stdio MCP bridge to PageIndex", long_about = None)]
struct Cli {
    /// Remote endpoint base URL (overrides PAGEINDEX_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Static API key; skips OAuth (overrides PAGEINDEX_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// OAuth redirect URL (overrides PAGEINDEX_REDIRECT_URL)
    #[arg(long)]
    redirect_url: Option<String>,

    /// Client kind reported to the remote: cli, dxt or mcpb
    #[arg(long)]
    client_kind: Option<ClientKind>,

    /// Credential file (overrides PAGEINDEX_CREDENTIALS_PATH)
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Per-request timeout in milliseconds (overrides CONNECTION_TIMEOUT)
    #[arg(long)]
    timeout_ms: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete stored tokens and client registration
    Logout,
}

impl Cli {
    fn apply(self, mut config: Config) -> anyhow::Result<Config> {
        if let Some(url) = self.api_url {
            config.api_url = url;
        }
        if self.api_key.is_some() {
            config.api_key = self.api_key;
        }
        if let Some(url) = self.redirect_url {
            config.redirect_url = url;
        }
        if let Some(kind) = self.client_kind {
            config.client_kind = kind;
        }
        if self.credentials.is_some() {
            config.credentials_path = self.credentials;
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout = config::parse_timeout(&ms)?;
        }
        config.debug |= self.verbose;
        config.validate()?;
        Ok(config)
    }
}

fn credential_store(config: &Config) -> anyhow::Result<Arc<CredentialStore>> {
    let store = match &config.credentials_path {
        Some(path) => CredentialStore::with_path(path.clone()),
        None => CredentialStore::new().context("Failed to locate the credential file")?,
    };
    Ok(Arc::new(store))
}

/// Wire the session manager for either API-key or OAuth mode.
async fn build_manager(config: &Config) -> anyhow::Result<SessionManager> {
    let identity = ClientIdentity::new(config.client_kind);

    let (credentials, authorizer): (Arc<dyn CredentialSupplier>, Option<Arc<dyn Authorizer>>) =
        match &config.api_key {
            Some(key) => {
                info!("Using API key authentication");
                let credentials: Arc<dyn CredentialSupplier> =
                    Arc::new(StaticToken::new(key.clone()));
                (credentials, None)
            }
            None => {
                let store = credential_store(config)?;
                info!(path = ?store.path(), "Using OAuth authentication");

                let oauth_config = OAuthConfig {
                    redirect_url: config.redirect_url.clone(),
                    client_kind: config.client_kind,
                    timeout: config.timeout,
                    ..OAuthConfig::new(config.api_url.clone())
                };
                let provider = Arc::new(OAuthProvider::new(oauth_config, store).await?);
                let flow = AuthorizationFlow::new(
                    &config.redirect_url,
                    config.client_kind,
                    Arc::new(SystemBrowser),
                )?;
                let authorizer: Arc<dyn Authorizer> =
                    Arc::new(OAuthAuthorizer::new(provider.clone(), flow));
                let credentials: Arc<dyn CredentialSupplier> = provider;
                (credentials, Some(authorizer))
            }
        };

    let negotiator = TransportNegotiator::new(&config.api_url, identity, credentials)
        .with_timeout(config.timeout);
    Ok(SessionManager::new(Arc::new(negotiator), authorizer))
}

async fn logout(config: &Config) -> anyhow::Result<()> {
    let store = credential_store(config)?;
    store
        .invalidate(InvalidateScope::All)
        .await
        .context("Failed to clear stored credentials")?;
    eprintln!("Cleared credentials at {}", store.path().display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let logout_requested = matches!(cli.command, Some(Commands::Logout));
    let config = cli.apply(Config::from_env()?)?;

    logging::init_logging(config.debug);

    if logout_requested {
        return logout(&config).await;
    }

    info!(
        api_url = %config.api_url,
        client_kind = %config.client_kind,
        version = env!("CARGO_PKG_VERSION"),
        "Starting PageIndex MCP bridge"
    );

    let manager = build_manager(&config).await?;
    let bridge = Arc::new(Bridge::new(manager));

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = bridge.clone().serve(stdin, stdout) => {
            result.context("Stdio transport failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            bridge.shutdown().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageindex_auth::CredentialRecord;
    use pageindex_auth::OAuthTokens;
    use std::time::Duration;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["pageindex-mcp"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_flags_override_environment() {
        let env = Config {
            api_url: "http://env.example".to_string(),
            ..Config::default()
        };
        let config = cli(&[
            "--api-url",
            "http://127.0.0.1:7000",
            "--client-kind",
            "dxt",
            "--timeout-ms",
            "1500",
            "-v",
        ])
        .apply(env)
        .unwrap();

        assert_eq!(config.api_url, "http://127.0.0.1:7000");
        assert_eq!(config.client_kind, ClientKind::Dxt);
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert!(config.debug);
    }

    #[test]
    fn test_invalid_flag_values() {
        assert!(cli(&["--timeout-ms", "0"]).apply(Config::default()).is_err());
        assert!(cli(&["--api-url", "nope"]).apply(Config::default()).is_err());
        assert!(Cli::try_parse_from(["pageindex-mcp", "--client-kind", "web"]).is_err());
    }

    #[test]
    fn test_logout_subcommand() {
        assert!(matches!(cli(&["logout"]).command, Some(Commands::Logout)));
        assert!(cli(&[]).command.is_none());
    }

    #[tokio::test]
    async fn test_logout_clears_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let store = CredentialStore::with_path(path.clone());
        store
            .save(&CredentialRecord {
                tokens: Some(OAuthTokens::bearer("at")),
                ..CredentialRecord::default()
            })
            .await
            .unwrap();

        let config = Config {
            credentials_path: Some(path),
            ..Config::default()
        };
        logout(&config).await.unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_api_key_mode_reaches_remote() {
        let remote = pageindex_test_utils::FakeRemote::builder()
            .token("pi-key")
            .start()
            .await;
        let config = Config {
            api_url: remote.base_url(),
            api_key: Some("pi-key".to_string()),
            ..Config::default()
        };

        let manager = build_manager(&config).await.unwrap();
        manager.connect().await.unwrap();
        assert_eq!(remote.initialize_count(), 1);
        assert_eq!(
            remote.last_header("authorization").as_deref(),
            Some("Bearer pi-key")
        );
        manager.close().await.unwrap();
    }
}
