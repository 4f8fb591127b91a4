//! Browser authorization flow.
//!
//! Opens the authorization URL in the user's browser and runs a short-lived
//! loopback HTTP listener that captures the redirect. The listener serves a
//! single authorization attempt and is closed as soon as it resolves.

use crate::error::{McpError, McpResult};
use crate::identity::ClientKind;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Port used when the redirect URL names none.
pub const DEFAULT_CALLBACK_PORT: u16 = 8090;

/// How long to wait for the browser redirect.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Where bundle variants send the browser after a successful login.
pub const BUNDLE_RETURN_URL: &str = "claude://claude.ai/new";

/// Upper bound on a single callback request.
const MAX_REQUEST_BYTES: usize = 8192;

/// Time a connected browser gets to send its request head, capped by the
/// overall deadline.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// HTML response for successful authorization.
const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>PageIndex - Authorization Successful</title>
  <style>
    body { font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; }
    .container { text-align: center; padding: 2rem; }
    h1 { color: #16a34a; margin-bottom: 1rem; }
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Successful</h1>
    <p>You can close this tab now.</p>
  </div>
  <script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>"#;

/// HTML response for failed authorization.
fn html_error(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>PageIndex - Authorization Failed</title>
  <style>
    body {{ font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; }}
    .container {{ text-align: center; padding: 2rem; }}
    h1 {{ color: #dc2626; margin-bottom: 1rem; }}
    .error {{ font-family: monospace; margin-top: 1rem; }}
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Failed</h1>
    <div class="error">Error: {}</div>
    <p>Please try the authorization process again.</p>
    <p>You can close this tab and return to your terminal.</p>
  </div>
</body>
</html>"#,
        html_escape(error)
    )
}

/// Escape HTML special characters.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Opens URLs for the user.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> Result<(), String>;
}

/// Launches the system default browser.
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> Result<(), String> {
        open::that(url).map_err(|e| e.to_string())
    }
}

/// Port and path the redirect is expected on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub port: u16,
    pub path: String,
}

impl RedirectTarget {
    /// Parse the configured redirect URL.
    pub fn parse(redirect_url: &str) -> McpResult<Self> {
        let url = url::Url::parse(redirect_url).map_err(|e| {
            McpError::auth_failed(format!("Invalid redirect URL {redirect_url}: {e}"))
        })?;
        Ok(Self {
            port: url.port().unwrap_or(DEFAULT_CALLBACK_PORT),
            path: url.path().to_string(),
        })
    }

    fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

/// Where the flow currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AwaitingRedirect,
    CodeReceived,
    ErrorReceived,
    TimedOut,
}

/// The one authorization attempt being waited on.
#[derive(Debug)]
struct PendingAuthorization {
    path: String,
    state: String,
    deadline: Instant,
}

/// What one callback request did to the pending authorization.
enum Outcome {
    Pending,
    Code(String),
    Error(String),
}

/// Runs browser authorizations, one at a time.
pub struct AuthorizationFlow {
    target: RedirectTarget,
    client_kind: ClientKind,
    browser: Arc<dyn BrowserLauncher>,
    timeout: Duration,
    /// Held for the whole attempt; a second caller is rejected.
    active: Mutex<()>,
    state: std::sync::Mutex<FlowState>,
}

impl AuthorizationFlow {
    pub fn new(
        redirect_url: &str,
        client_kind: ClientKind,
        browser: Arc<dyn BrowserLauncher>,
    ) -> McpResult<Self> {
        Ok(Self {
            target: RedirectTarget::parse(redirect_url)?,
            client_kind,
            browser,
            timeout: CALLBACK_TIMEOUT,
            active: Mutex::new(()),
            state: std::sync::Mutex::new(FlowState::Idle),
        })
    }

    /// Set how long to wait for the redirect.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &RedirectTarget {
        &self.target
    }

    pub fn state(&self) -> FlowState {
        self.state.lock().map(|s| *s).unwrap_or(FlowState::Idle)
    }

    fn set_state(&self, state: FlowState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// Open `auth_url` and wait for the redirect carrying `expected_state`.
    ///
    /// Returns the authorization code. The listener is closed on return.
    pub async fn authorize(&self, auth_url: &str, expected_state: &str) -> McpResult<String> {
        let _guard = self
            .active
            .try_lock()
            .map_err(|_| McpError::auth_failed("authorization already in progress"))?;

        let listener = TcpListener::bind(self.target.bind_addr())
            .await
            .map_err(|e| {
                McpError::auth_failed(format!(
                    "Failed to start callback server on port {}: {e}",
                    self.target.port
                ))
            })?;

        let pending = Arc::new(PendingAuthorization {
            path: self.target.path.clone(),
            state: expected_state.to_string(),
            deadline: Instant::now() + self.timeout,
        });
        self.set_state(FlowState::AwaitingRedirect);
        info!(port = self.target.port, "Listening for OAuth callback");

        if let Err(e) = self.browser.open(auth_url) {
            self.set_state(FlowState::ErrorReceived);
            return Err(McpError::auth_failed(format!("Failed to open browser: {e}")));
        }

        let result = self.wait(&listener, pending).await;
        debug!(state = ?self.state(), "OAuth callback listener closed");
        result
    }

    /// Accept callbacks until one resolves the wait or the deadline passes.
    ///
    /// Each connection is served on its own task, so an idle socket cannot
    /// hold up the real redirect. Handlers still running are aborted on return.
    async fn wait(
        &self,
        listener: &TcpListener,
        pending: Arc<PendingAuthorization>,
    ) -> McpResult<String> {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(pending.deadline) => {
                    self.set_state(FlowState::TimedOut);
                    return Err(McpError::auth_failed(format!(
                        "OAuth callback timeout after {} seconds",
                        self.timeout.as_secs()
                    )));
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        handlers.spawn(handle_connection(stream, pending.clone(), self.client_kind));
                    }
                    Err(e) => warn!(error = %e, "Error accepting callback connection"),
                },
                Some(joined) = handlers.join_next() => match joined {
                    Ok(Ok(Outcome::Pending)) => {}
                    Ok(Ok(Outcome::Code(code))) => {
                        self.set_state(FlowState::CodeReceived);
                        return Ok(code);
                    }
                    Ok(Ok(Outcome::Error(error))) => {
                        self.set_state(FlowState::ErrorReceived);
                        return Err(McpError::AuthFailed(format!("OAuth error: {error}")));
                    }
                    Ok(Err(e)) => debug!(error = %e, "Error handling OAuth callback"),
                    Err(e) => warn!(error = %e, "OAuth callback handler failed"),
                },
            }
        }
    }
}

/// Read one request and answer it.
async fn handle_connection(
    mut stream: TcpStream,
    pending: Arc<PendingAuthorization>,
    client_kind: ClientKind,
) -> McpResult<Outcome> {
    let read_deadline = (Instant::now() + READ_TIMEOUT).min(pending.deadline);
    let request = tokio::time::timeout_at(read_deadline, read_head(&mut stream))
        .await
        .map_err(|_| McpError::Timeout)??;

    let (status, headers, body, outcome) = route(&request, &pending, client_kind);
    let response = http_response(status, &headers, &body);
    stream.write_all(response.as_bytes()).await.ok();
    stream.shutdown().await.ok();

    Ok(outcome)
}

async fn read_head(stream: &mut TcpStream) -> McpResult<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

type Reply = (u16, Vec<(&'static str, String)>, String, Outcome);

/// Decide the response to a callback request.
fn route(request: &str, pending: &PendingAuthorization, client_kind: ClientKind) -> Reply {
    let html = |status, body: String| {
        (
            status,
            vec![("Content-Type", "text/html; charset=utf-8".to_string())],
            body,
            Outcome::Pending,
        )
    };
    let not_found = (
        404,
        vec![("Content-Type", "text/plain".to_string())],
        "Not found".to_string(),
        Outcome::Pending,
    );

    let mut parts = request.lines().next().unwrap_or("").split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return (
            400,
            vec![("Content-Type", "text/plain".to_string())],
            "Bad Request".to_string(),
            Outcome::Pending,
        );
    };

    let Ok(parsed) = url::Url::parse(&format!("http://localhost{target}")) else {
        return not_found;
    };

    if method != "GET" || parsed.path() != pending.path {
        return not_found;
    }

    let params: HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    debug!(
        has_code = params.contains_key("code"),
        error = ?params.get("error"),
        "Received OAuth callback"
    );

    if params.get("state") != Some(&pending.state) {
        warn!(
            present = params.contains_key("state"),
            "OAuth callback with missing or mismatched state"
        );
        return html(400, html_error("Invalid or expired state parameter"));
    }

    if let Some(error) = params.get("error") {
        let message = match params.get("error_description") {
            Some(description) => format!("{error}: {description}"),
            None => error.clone(),
        };
        let (status, headers, body, _) = html(400, html_error(&message));
        return (status, headers, body, Outcome::Error(message));
    }

    let Some(code) = params.get("code") else {
        return html(400, html_error("No authorization code provided"));
    };

    if client_kind.is_bundle() {
        return (
            302,
            vec![("Location", BUNDLE_RETURN_URL.to_string())],
            String::new(),
            Outcome::Code(code.clone()),
        );
    }

    let (status, headers, body, _) = html(200, HTML_SUCCESS.to_string());
    (status, headers, body, Outcome::Code(code.clone()))
}

/// Build an HTTP response.
fn http_response(status: u16, headers: &[(&str, String)], body: &str) -> String {
    let status_text = match status {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Unknown",
    };

    let mut response = format!("HTTP/1.1 {status} {status_text}\r\n");
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    response
}
