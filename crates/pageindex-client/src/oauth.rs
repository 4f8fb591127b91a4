//! OAuth support for the remote endpoint.
//!
//! Implements OAuth 2.0 authorization code with PKCE, authorization server
//! metadata discovery and dynamic client registration. Tokens, the registered
//! client and the in-flight PKCE verifier are persisted through
//! [`CredentialStore`]; a failed write is logged and the in-memory copy keeps
//! working.

use crate::error::{McpError, McpResult};
use crate::identity::ClientKind;
use crate::transport::CredentialSupplier;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use pageindex_auth::{
    current_time_secs, ClientInfo, CredentialRecord, CredentialStore, InvalidateScope,
    OAuthTokens,
};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// Default OAuth redirect URL.
pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:8090/callback";

/// Scope requested from the authorization server.
pub const DEFAULT_SCOPE: &str = "mcp:access";

/// Tokens closer than this to expiry are not sent.
const EXPIRY_SKEW_SECS: u64 = 60;

/// OAuth configuration.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// Base URL of the protected remote endpoint.
    pub server_url: String,
    pub redirect_url: String,
    pub client_kind: ClientKind,
    pub scope: Option<String>,
    /// Timeout for metadata, registration and token requests.
    pub timeout: Duration,
}

impl OAuthConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
            client_kind: ClientKind::default(),
            scope: Some(DEFAULT_SCOPE.to_string()),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Authorization server endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// An authorization URL to open, and the state it carries.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Error body returned by the token or registration endpoint.
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Why a token request failed.
#[derive(Debug)]
enum TokenFailure {
    /// The provider rejected the request with an OAuth error code.
    Rejected {
        code: String,
        description: Option<String>,
    },
    Other(McpError),
}

impl TokenFailure {
    fn into_error(self, what: &str) -> McpError {
        match self {
            Self::Rejected { code, description } => match description {
                Some(d) => McpError::AuthFailed(format!("{what} failed: {code}: {d}")),
                None => McpError::AuthFailed(format!("{what} failed: {code}")),
            },
            Self::Other(e) => e,
        }
    }
}

/// OAuth provider for the remote endpoint.
pub struct OAuthProvider {
    config: OAuthConfig,
    store: Arc<CredentialStore>,
    /// In-memory mirror of the credential file.
    record: RwLock<CredentialRecord>,
    metadata: RwLock<Option<AuthServerMetadata>>,
    http: reqwest::Client,
}

impl OAuthProvider {
    /// Create a provider, loading any stored credentials.
    pub async fn new(config: OAuthConfig, store: Arc<CredentialStore>) -> McpResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| McpError::auth_failed(format!("Failed to create HTTP client: {e}")))?;
        let record = store.load().await;

        if record.tokens.is_some() {
            debug!(path = ?store.path(), "Loaded stored OAuth tokens");
        }

        Ok(Self {
            config,
            store,
            record: RwLock::new(record),
            metadata: RwLock::new(None),
            http,
        })
    }

    /// Get the redirect URL.
    pub fn redirect_url(&self) -> &str {
        &self.config.redirect_url
    }

    pub fn client_kind(&self) -> ClientKind {
        self.config.client_kind
    }

    /// Get client metadata for dynamic registration.
    pub fn client_metadata(&self) -> Value {
        let mut metadata = json!({
            "client_name": self.config.client_kind.display_name(),
            "redirect_uris": [self.config.redirect_url],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
        });
        if let Some(ref scope) = self.config.scope {
            metadata["scope"] = json!(scope);
        }
        metadata
    }

    /// Get the registered client, unless its secret has expired.
    pub async fn client_info(&self) -> Option<ClientInfo> {
        let record = self.record.read().await;
        let info = record.client_info.as_ref()?;
        if info.is_secret_expired(current_time_secs()) {
            info!("Registered client secret expired");
            return None;
        }
        Some(info.clone())
    }

    /// Get stored tokens.
    pub async fn tokens(&self) -> Option<OAuthTokens> {
        self.record.read().await.tokens.clone()
    }

    /// Check if a refresh token is stored.
    pub async fn can_refresh(&self) -> bool {
        self.record
            .read()
            .await
            .tokens
            .as_ref()
            .is_some_and(|t| t.refresh_token.is_some())
    }

    /// Discard part of the credentials, in memory and on disk.
    pub async fn invalidate(&self, scope: InvalidateScope) {
        self.record.write().await.invalidate(scope);
        if let Err(e) = self.store.invalidate(scope).await {
            warn!(scope = %scope, error = %e, "Failed to persist credential invalidation");
        }
    }

    /// Apply `mutate` to the record and persist the whole record.
    async fn update(&self, mutate: impl FnOnce(&mut CredentialRecord)) {
        let snapshot = {
            let mut record = self.record.write().await;
            mutate(&mut record);
            record.clone()
        };
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(path = ?self.store.path(), error = %e, "Failed to persist credentials; continuing in memory");
        }
    }

    async fn save_tokens(&self, tokens: OAuthTokens) -> OAuthTokens {
        let tokens = tokens.stamped(current_time_secs());
        let saved = tokens.clone();
        self.update(|r| r.tokens = Some(saved)).await;
        info!("Saved OAuth tokens");
        tokens
    }

    /// Discover authorization server endpoints, caching the result.
    pub async fn discover_metadata(&self) -> McpResult<AuthServerMetadata> {
        if let Some(ref meta) = *self.metadata.read().await {
            return Ok(meta.clone());
        }

        let server = Url::parse(&self.config.server_url).map_err(|e| {
            McpError::auth_failed(format!("Invalid server URL {}: {e}", self.config.server_url))
        })?;

        let issuer = match self
            .fetch_json::<ProtectedResourceMetadata>(well_known_url(
                &server,
                "oauth-protected-resource",
            ))
            .await
            .and_then(|m| m.authorization_servers.into_iter().next())
            .and_then(|s| Url::parse(&s).ok())
        {
            Some(issuer) => issuer,
            None => origin_of(&server),
        };

        let mut meta = None;
        for suffix in ["oauth-authorization-server", "openid-configuration"] {
            if let Some(found) = self
                .fetch_json::<AuthServerMetadata>(well_known_url(&issuer, suffix))
                .await
            {
                meta = Some(found);
                break;
            }
        }

        let meta = meta.unwrap_or_else(|| {
            let origin = origin_of(&issuer);
            let base = origin.as_str().trim_end_matches('/');
            debug!(issuer = %issuer, "No authorization server metadata, using default endpoints");
            AuthServerMetadata {
                authorization_endpoint: format!("{base}/authorize"),
                token_endpoint: format!("{base}/token"),
                registration_endpoint: Some(format!("{base}/register")),
            }
        });

        *self.metadata.write().await = Some(meta.clone());
        Ok(meta)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Option<T> {
        let response = match self.http.get(url.clone()).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(url = %url, status = %r.status(), "Metadata not available");
                return None;
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Metadata request failed");
                return None;
            }
        };
        response.json().await.ok()
    }

    /// Return the registered client, registering one if needed.
    pub async fn ensure_client(&self, meta: &AuthServerMetadata) -> McpResult<ClientInfo> {
        if let Some(info) = self.client_info().await {
            return Ok(info);
        }

        let endpoint = meta.registration_endpoint.as_deref().ok_or_else(|| {
            McpError::auth_failed("Authorization server does not support client registration")
        })?;

        info!(endpoint, "Registering OAuth client");

        let response = self
            .http
            .post(endpoint)
            .json(&self.client_metadata())
            .send()
            .await
            .map_err(|e| McpError::auth_failed(format!("Client registration failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::auth_failed(format!(
                "Client registration failed ({status}): {text}"
            )));
        }

        let info: ClientInfo = response
            .json()
            .await
            .map_err(|e| McpError::auth_failed(format!("Invalid registration response: {e}")))?;

        let saved = info.clone();
        self.update(|r| r.client_info = Some(saved)).await;
        info!(client_id = %info.client_id, "Saved dynamically registered client");
        Ok(info)
    }

    /// Generate PKCE code verifier.
    pub fn generate_code_verifier() -> String {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 32] = rng.gen();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Generate PKCE code challenge from verifier.
    pub fn generate_code_challenge(verifier: &str) -> String {
        let digest = Sha256::digest(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }

    /// Generate OAuth state parameter.
    pub fn generate_state() -> String {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 16] = rng.gen();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Prepare an authorization request and persist its PKCE verifier.
    pub async fn start_authorization(&self) -> McpResult<AuthorizationRequest> {
        let meta = self.discover_metadata().await?;
        let client = self.ensure_client(&meta).await?;

        let verifier = Self::generate_code_verifier();
        let challenge = Self::generate_code_challenge(&verifier);
        let state = Self::generate_state();

        self.update(|r| r.code_verifier = Some(verifier)).await;

        let url = build_auth_url(
            &meta.authorization_endpoint,
            &client.client_id,
            &self.config.redirect_url,
            self.config.scope.as_deref(),
            &state,
            &challenge,
        );

        Ok(AuthorizationRequest { url, state })
    }

    /// Exchange an authorization code for tokens.
    ///
    /// The verifier is cleared whatever the outcome.
    pub async fn finish_authorization(&self, code: &str) -> McpResult<OAuthTokens> {
        let verifier = self.record.read().await.code_verifier.clone();
        let result = self.exchange(code, verifier).await;
        self.invalidate(InvalidateScope::Verifier).await;

        match result {
            Ok(tokens) => Ok(self.save_tokens(tokens).await),
            Err(failure) => {
                self.handle_rejection(&failure).await;
                Err(failure.into_error("Token exchange"))
            }
        }
    }

    async fn exchange(
        &self,
        code: &str,
        verifier: Option<String>,
    ) -> Result<OAuthTokens, TokenFailure> {
        let verifier = verifier.ok_or_else(|| {
            TokenFailure::Other(McpError::auth_failed(
                "No code verifier found. Please restart the OAuth flow.",
            ))
        })?;
        let client = self.client_info().await.ok_or_else(|| {
            TokenFailure::Other(McpError::auth_failed("No registered OAuth client"))
        })?;
        let meta = self.discover_metadata().await.map_err(TokenFailure::Other)?;

        exchange_code(
            &self.http,
            &meta.token_endpoint,
            &client.client_id,
            client.client_secret.as_deref(),
            code,
            &self.config.redirect_url,
            &verifier,
        )
        .await
    }

    /// Obtain fresh tokens with the stored refresh token.
    pub async fn refresh(&self) -> McpResult<OAuthTokens> {
        let refresh_token = self
            .tokens()
            .await
            .and_then(|t| t.refresh_token)
            .ok_or_else(|| McpError::auth_failed("No refresh token available"))?;
        let client = self
            .client_info()
            .await
            .ok_or_else(|| McpError::auth_failed("No registered OAuth client"))?;
        let meta = self.discover_metadata().await?;

        debug!("Refreshing OAuth tokens");

        match refresh_tokens(
            &self.http,
            &meta.token_endpoint,
            &client.client_id,
            client.client_secret.as_deref(),
            &refresh_token,
        )
        .await
        {
            Ok(mut tokens) => {
                // Providers may omit the refresh token when it is not rotated.
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = Some(refresh_token);
                }
                Ok(self.save_tokens(tokens).await)
            }
            Err(failure) => {
                self.handle_rejection(&failure).await;
                Err(failure.into_error("Token refresh"))
            }
        }
    }

    async fn handle_rejection(&self, failure: &TokenFailure) {
        if let TokenFailure::Rejected { code, .. } = failure {
            match code.as_str() {
                "invalid_client" | "unauthorized_client" => {
                    self.invalidate(InvalidateScope::Client).await
                }
                "invalid_grant" => self.invalidate(InvalidateScope::Tokens).await,
                _ => {}
            }
        }
    }
}

#[async_trait]
impl CredentialSupplier for OAuthProvider {
    async fn access_token(&self) -> Option<String> {
        let record = self.record.read().await;
        record
            .tokens
            .as_ref()
            .filter(|t| !t.is_expired(current_time_secs(), EXPIRY_SKEW_SECS))
            .map(|t| t.access_token.clone())
    }
}

impl std::fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("server_url", &self.config.server_url)
            .field("store", &self.store)
            .finish()
    }
}

/// `{origin}/.well-known/{suffix}{path}` per RFC 8414.
fn well_known_url(base: &Url, suffix: &str) -> Url {
    let mut url = origin_of(base);
    let path = base.path().trim_end_matches('/');
    url.set_path(&format!("/.well-known/{suffix}{path}"));
    url
}

fn origin_of(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

/// Build authorization URL.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
) -> String {
    let separator = if auth_endpoint.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        separator,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );

    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }

    url
}

async fn token_request(
    http: &reqwest::Client,
    token_endpoint: &str,
    params: &[(&str, &str)],
) -> Result<OAuthTokens, TokenFailure> {
    let response = http
        .post(token_endpoint)
        .form(params)
        .send()
        .await
        .map_err(|e| TokenFailure::Other(McpError::auth_failed(format!("Token request failed: {e}"))))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(match serde_json::from_str::<OAuthErrorBody>(&text) {
            Ok(body) => TokenFailure::Rejected {
                code: body.error,
                description: body.error_description,
            },
            Err(_) => TokenFailure::Other(McpError::auth_failed(format!(
                "Token endpoint returned {status}: {text}"
            ))),
        });
    }

    response
        .json()
        .await
        .map_err(|e| TokenFailure::Other(McpError::auth_failed(format!("Invalid token response: {e}"))))
}

/// Exchange authorization code for tokens.
async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> Result<OAuthTokens, TokenFailure> {
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", code_verifier),
    ];

    if let Some(secret) = client_secret {
        params.push(("client_secret", secret));
    }

    token_request(http, token_endpoint, &params).await
}

/// Refresh tokens using refresh token.
async fn refresh_tokens(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    refresh_token: &str,
) -> Result<OAuthTokens, TokenFailure> {
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];

    if let Some(secret) = client_secret {
        params.push(("client_secret", secret));
    }

    token_request(http, token_endpoint, &params).await
}
