//! Session management: single-flight connect, re-authorization and retries.

use crate::callback::AuthorizationFlow;
use crate::error::{McpError, McpResult};
use crate::negotiator::Connector;
use crate::oauth::OAuthProvider;
use crate::protocol::{
    ListResourceTemplatesResult, ListResourcesResult, McpTool, ReadResourceResult, ToolCallResult,
};
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::transport::TransportKind;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use pageindex_auth::InvalidateScope;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Operations the tool layer needs from the remote connection.
#[async_trait]
pub trait RemoteCaller: Send + Sync {
    async fn call(&self, name: &str, params: Value) -> McpResult<ToolCallResult>;

    async fn list_operations(&self) -> McpResult<Vec<McpTool>>;
}

/// Recovers from an authentication challenge.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Obtain new credentials without user interaction.
    ///
    /// Returns `true` when fresh credentials are in place.
    async fn try_refresh(&self) -> bool;

    /// Run the interactive authorization and persist the result.
    async fn authorize(&self) -> McpResult<()>;
}

/// OAuth refresh, then the browser flow.
pub struct OAuthAuthorizer {
    provider: Arc<OAuthProvider>,
    flow: AuthorizationFlow,
}

impl OAuthAuthorizer {
    pub fn new(provider: Arc<OAuthProvider>, flow: AuthorizationFlow) -> Self {
        Self { provider, flow }
    }
}

#[async_trait]
impl Authorizer for OAuthAuthorizer {
    async fn try_refresh(&self) -> bool {
        if !self.provider.can_refresh().await {
            return false;
        }
        match self.provider.refresh().await {
            Ok(_) => {
                info!("Refreshed OAuth tokens");
                true
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                false
            }
        }
    }

    async fn authorize(&self) -> McpResult<()> {
        let request = self.provider.start_authorization().await?;
        info!(url = %request.url, "Opening browser for authorization");

        let code = match self.flow.authorize(&request.url, &request.state).await {
            Ok(code) => code,
            Err(e) => {
                self.provider.invalidate(InvalidateScope::Verifier).await;
                return Err(e);
            }
        };

        self.provider.finish_authorization(&code).await?;
        Ok(())
    }
}

type ConnectFuture = Shared<BoxFuture<'static, McpResult<Arc<Session>>>>;

#[derive(Default)]
struct Slot {
    session: Option<Arc<Session>>,
    /// The attempt every concurrent caller awaits, tagged so a stale
    /// attempt cannot overwrite a newer one.
    in_flight: Option<(u64, ConnectFuture)>,
    generation: u64,
}

struct Inner {
    connector: Arc<dyn Connector>,
    authorizer: Option<Arc<dyn Authorizer>>,
    retry: RetryPolicy,
    slot: Mutex<Slot>,
}

impl Inner {
    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        // Slot updates never panic midway, so a poisoned lock still holds
        // consistent data.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect, allowing one re-authorization cycle.
    async fn establish(&self) -> McpResult<Session> {
        match self.connector.connect().await {
            Err(McpError::AuthRequired) => {}
            other => return other,
        }

        let Some(authorizer) = self.authorizer.as_ref() else {
            return Err(McpError::AuthRequired);
        };

        info!("Authentication required");
        if !authorizer.try_refresh().await {
            info!("Starting OAuth flow");
            authorizer.authorize().await?;
        }

        info!("Authorization completed, retrying connection");
        match self.connector.connect().await {
            Err(McpError::AuthRequired) => Err(McpError::auth_failed(
                "remote rejected the credentials obtained by re-authorization",
            )),
            other => other,
        }
    }
}

/// Owns the single session to the remote endpoint.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, authorizer: Option<Arc<dyn Authorizer>>) -> Self {
        Self::with_retry(connector, authorizer, RetryPolicy::default())
    }

    pub fn with_retry(
        connector: Arc<dyn Connector>,
        authorizer: Option<Arc<dyn Authorizer>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                authorizer,
                retry,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    /// Check if a session is established.
    pub fn is_connected(&self) -> bool {
        self.inner.slot().session.is_some()
    }

    /// Transport of the current session, if any.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.inner.slot().session.as_ref().map(|s| s.transport_kind())
    }

    /// Establish the session if there is none.
    ///
    /// Concurrent callers share one attempt and observe the same outcome.
    pub async fn connect(&self) -> McpResult<()> {
        self.session_or_connect().await.map(|_| ())
    }

    async fn session_or_connect(&self) -> McpResult<Arc<Session>> {
        let (generation, attempt) = {
            let mut slot = self.inner.slot();
            if let Some(ref session) = slot.session {
                return Ok(session.clone());
            }
            let joined = slot
                .in_flight
                .as_ref()
                .map(|(generation, attempt)| (*generation, attempt.clone()));
            match joined {
                Some(joined) => joined,
                None => {
                    slot.generation += 1;
                    let generation = slot.generation;
                    let inner = self.inner.clone();
                    let attempt = async move { inner.establish().await.map(Arc::new) }
                        .boxed()
                        .shared();
                    slot.in_flight = Some((generation, attempt.clone()));
                    debug!(generation, "Starting connection attempt");
                    (generation, attempt)
                }
            }
        };

        let result = attempt.await;

        let current = {
            let mut slot = self.inner.slot();
            if slot.in_flight.as_ref().is_some_and(|(g, _)| *g == generation) {
                slot.in_flight = None;
                if let Ok(ref session) = result {
                    slot.session = Some(session.clone());
                }
                true
            } else {
                // Stored by an earlier waiter of the same attempt.
                match (&result, &slot.session) {
                    (Ok(session), Some(stored)) => Arc::ptr_eq(session, stored),
                    _ => false,
                }
            }
        };

        match result {
            Ok(session) if !current => {
                // close() ran while this attempt was in flight.
                debug!(generation, "Discarding session from abandoned attempt");
                if let Err(e) = session.close().await {
                    debug!(error = %e, "Failed to close abandoned session");
                }
                Err(McpError::NotConnected)
            }
            other => other,
        }
    }

    fn current(&self) -> McpResult<Arc<Session>> {
        self.inner.slot().session.clone().ok_or(McpError::NotConnected)
    }

    /// Run `op` against the current session under the retry policy.
    ///
    /// A challenge mid-session drops the session, runs one re-authorization
    /// cycle through a fresh connect and re-issues `op` once.
    async fn invoke<T, F, Fut>(&self, label: &str, op: F) -> McpResult<T>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        let session = self.current()?;
        match self.inner.retry.run(label, || op(session.clone())).await {
            Err(McpError::AuthRequired) if self.inner.authorizer.is_some() => {}
            other => return other,
        }

        warn!(operation = label, "Session credentials rejected, re-authorizing");
        self.evict(&session).await;
        let session = self.session_or_connect().await?;

        match self.inner.retry.run(label, || op(session.clone())).await {
            Err(McpError::AuthRequired) => Err(McpError::auth_failed(
                "remote rejected the credentials obtained by re-authorization",
            )),
            other => other,
        }
    }

    /// Drop `stale` if it is still the current session.
    async fn evict(&self, stale: &Arc<Session>) {
        let evicted = {
            let mut slot = self.inner.slot();
            if slot.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, stale)) {
                slot.session.take()
            } else {
                None
            }
        };

        if let Some(session) = evicted {
            if let Err(e) = session.close().await {
                debug!(error = %e, "Failed to close rejected session");
            }
        }
    }

    /// Invoke a remote tool.
    pub async fn call(&self, name: &str, params: Value) -> McpResult<ToolCallResult> {
        let label = format!("tools/call {name}");
        self.invoke(&label, |session| {
            let params = params.clone();
            async move { session.call_tool(name, params).await }
        })
        .await
    }

    /// List the remote tools.
    pub async fn list_operations(&self) -> McpResult<Vec<McpTool>> {
        self.invoke("tools/list", |session| async move { session.list_tools().await })
            .await
    }

    pub async fn list_resources(&self) -> McpResult<ListResourcesResult> {
        self.invoke("resources/list", |session| async move {
            session.list_resources().await
        })
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let label = format!("resources/read {uri}");
        self.invoke(&label, |session| async move { session.read_resource(uri).await })
            .await
    }

    pub async fn list_resource_templates(&self) -> McpResult<ListResourceTemplatesResult> {
        self.invoke("resources/templates/list", |session| async move {
            session.list_resource_templates().await
        })
        .await
    }

    /// Release the session. A no-op when not connected.
    pub async fn close(&self) -> McpResult<()> {
        let session = {
            let mut slot = self.inner.slot();
            slot.in_flight = None;
            slot.session.take()
        };

        if let Some(session) = session {
            session.close().await?;
            info!("Closed remote session");
        }
        Ok(())
    }

    pub async fn reconnect(&self) -> McpResult<()> {
        self.close().await?;
        self.connect().await
    }
}

#[async_trait]
impl RemoteCaller for SessionManager {
    async fn call(&self, name: &str, params: Value) -> McpResult<ToolCallResult> {
        SessionManager::call(self, name, params).await
    }

    async fn list_operations(&self) -> McpResult<Vec<McpTool>> {
        SessionManager::list_operations(self).await
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("connected", &self.is_connected())
            .field("retry", &self.inner.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        Implementation, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    };
    use crate::transport::Transport;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Answers by method name; `tools/call` fails `call_failures` times first.
    struct FakeTransport {
        call_failures: Arc<AtomicU32>,
        challenges: Arc<AtomicU32>,
        closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
            let result = match request.method.as_str() {
                "initialize" => json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": {},
                    "serverInfo": {"name": "fake"}
                }),
                "tools/list" => json!({"tools": [{"name": "ask_document"}]}),
                "tools/call" => {
                    if self.challenges.load(Ordering::SeqCst) > 0 {
                        self.challenges.fetch_sub(1, Ordering::SeqCst);
                        return Err(McpError::AuthRequired);
                    }
                    let failures = self.call_failures.load(Ordering::SeqCst);
                    if failures > 0 {
                        self.call_failures.store(failures - 1, Ordering::SeqCst);
                        return Err(McpError::connection_failed("flaky"));
                    }
                    json!({"content": [{"type": "text", "text": "answer"}]})
                }
                "resources/list" => json!({"resources": []}),
                other => return Err(McpError::protocol_error(format!("unexpected {other}"))),
            };
            Ok(JsonRpcResponse::success(request.id, result))
        }

        async fn notify(&self, _notification: JsonRpcNotification) -> McpResult<()> {
            Ok(())
        }

        async fn close(&self) -> McpResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn kind(&self) -> TransportKind {
            TransportKind::StreamableHttp
        }
    }

    /// Plays back connect outcomes; once exhausted every attempt succeeds.
    struct FakeConnector {
        attempts: AtomicU32,
        script: Mutex<VecDeque<McpError>>,
        delay: Duration,
        call_failures: Arc<AtomicU32>,
        challenges: Arc<AtomicU32>,
        closes: Arc<AtomicU32>,
    }

    impl FakeConnector {
        fn new(failures: Vec<McpError>) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicU32::new(0),
                script: Mutex::new(failures.into()),
                delay: Duration::from_millis(50),
                call_failures: Arc::new(AtomicU32::new(0)),
                challenges: Arc::new(AtomicU32::new(0)),
                closes: Arc::new(AtomicU32::new(0)),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> McpResult<Session> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(err) = self.script.lock().unwrap().pop_front() {
                return Err(err);
            }
            let transport = FakeTransport {
                call_failures: self.call_failures.clone(),
                challenges: self.challenges.clone(),
                closes: self.closes.clone(),
            };
            Session::initialize(Box::new(transport), Implementation::new("test", "0")).await
        }
    }

    #[derive(Default)]
    struct FakeAuthorizer {
        refresh_ok: bool,
        refreshes: AtomicU32,
        authorizations: AtomicU32,
    }

    #[async_trait]
    impl Authorizer for FakeAuthorizer {
        async fn try_refresh(&self) -> bool {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.refresh_ok
        }

        async fn authorize(&self) -> McpResult<()> {
            self.authorizations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_connect_is_single_flight() {
        let connector = FakeConnector::new(vec![]);
        let manager = SessionManager::new(connector.clone(), None);

        let other = manager.clone();
        let (a, b) = tokio::join!(manager.connect(), other.connect());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(connector.attempts(), 1);

        // Connected: later calls return immediately.
        manager.connect().await.unwrap();
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failure_is_shared_then_cleared() {
        let connector = FakeConnector::new(vec![McpError::connection_failed("down")]);
        let manager = SessionManager::new(connector.clone(), None);

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        assert!(matches!(a, Err(McpError::ConnectionFailed(ref m)) if m == "down"));
        assert!(matches!(b, Err(McpError::ConnectionFailed(ref m)) if m == "down"));
        assert_eq!(connector.attempts(), 1);
        assert!(!manager.is_connected());

        manager.connect().await.unwrap();
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail_without_io() {
        let connector = FakeConnector::new(vec![]);
        let manager = SessionManager::new(connector.clone(), None);

        assert!(matches!(
            manager.call("ask_document", json!({})).await,
            Err(McpError::NotConnected)
        ));
        assert!(matches!(manager.list_operations().await, Err(McpError::NotConnected)));
        assert!(matches!(manager.list_resources().await, Err(McpError::NotConnected)));
        assert!(matches!(
            manager.read_resource("pageindex://x").await,
            Err(McpError::NotConnected)
        ));
        assert!(matches!(
            manager.list_resource_templates().await,
            Err(McpError::NotConnected)
        ));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_auth_challenge_runs_browser_flow_once() {
        let connector = FakeConnector::new(vec![McpError::AuthRequired]);
        let authorizer = Arc::new(FakeAuthorizer::default());
        let manager = SessionManager::new(connector.clone(), Some(authorizer.clone()));

        manager.connect().await.unwrap();
        assert_eq!(connector.attempts(), 2);
        assert_eq!(authorizer.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(authorizer.authorizations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_refresh_skips_browser_flow() {
        let connector = FakeConnector::new(vec![McpError::AuthRequired]);
        let authorizer = Arc::new(FakeAuthorizer {
            refresh_ok: true,
            ..Default::default()
        });
        let manager = SessionManager::new(connector.clone(), Some(authorizer.clone()));

        manager.connect().await.unwrap();
        assert_eq!(authorizer.authorizations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_consecutive_challenge_is_fatal() {
        let connector = FakeConnector::new(vec![McpError::AuthRequired, McpError::AuthRequired]);
        let authorizer = Arc::new(FakeAuthorizer::default());
        let manager = SessionManager::new(connector.clone(), Some(authorizer.clone()));

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, McpError::AuthFailed(_)));
        assert_eq!(connector.attempts(), 2);
        assert_eq!(authorizer.authorizations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_challenge_without_authorizer_is_terminal() {
        let connector = FakeConnector::new(vec![McpError::AuthRequired]);
        let manager = SessionManager::new(connector.clone(), None);

        assert!(manager.connect().await.unwrap_err().is_auth_required());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_retries_until_success() {
        let connector = FakeConnector::new(vec![]);
        connector.call_failures.store(2, Ordering::SeqCst);
        let manager = SessionManager::new(connector.clone(), None);
        manager.connect().await.unwrap();

        let result = manager.call("ask_document", json!({"q": 1})).await.unwrap();
        assert_eq!(result.joined_text(), "answer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_gives_up_after_three_attempts() {
        let connector = FakeConnector::new(vec![]);
        connector.call_failures.store(5, Ordering::SeqCst);
        let manager = SessionManager::new(connector.clone(), None);
        manager.connect().await.unwrap();

        let err = manager.call("ask_document", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::RemoteCall { attempts: 3, .. }));
        assert_eq!(connector.call_failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_and_reconnect() {
        let connector = FakeConnector::new(vec![]);
        let manager = SessionManager::new(connector.clone(), None);

        // Closing while disconnected is a no-op.
        manager.close().await.unwrap();

        manager.connect().await.unwrap();
        manager.close().await.unwrap();
        assert!(matches!(manager.list_operations().await, Err(McpError::NotConnected)));

        manager.reconnect().await.unwrap();
        assert_eq!(connector.attempts(), 2);
        let tools = manager.list_operations().await.unwrap();
        assert_eq!(tools[0].name, "ask_document");
    }

    #[tokio::test]
    async fn test_close_during_connect_discards_session() {
        let connector = FakeConnector::new(vec![]);
        let manager = SessionManager::new(connector.clone(), None);

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.close().await.unwrap();

        assert!(matches!(pending.await.unwrap(), Err(McpError::NotConnected)));
        assert!(!manager.is_connected());
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mid_session_challenge_reconnects_once() {
        let connector = FakeConnector::new(vec![]);
        let authorizer = Arc::new(FakeAuthorizer {
            refresh_ok: true,
            ..Default::default()
        });
        let manager = SessionManager::new(connector.clone(), Some(authorizer.clone()));
        manager.connect().await.unwrap();

        connector.challenges.store(1, Ordering::SeqCst);
        let result = manager.call("ask_document", json!({})).await.unwrap();
        assert_eq!(result.joined_text(), "answer");

        // The rejected session was closed and replaced.
        assert_eq!(connector.attempts(), 2);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_repeated_mid_session_challenge_is_fatal() {
        let connector = FakeConnector::new(vec![]);
        let authorizer = Arc::new(FakeAuthorizer::default());
        let manager = SessionManager::new(connector.clone(), Some(authorizer.clone()));
        manager.connect().await.unwrap();

        connector.challenges.store(2, Ordering::SeqCst);
        let err = manager.call("ask_document", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::AuthFailed(_)));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_mid_session_challenge_without_authorizer() {
        let connector = FakeConnector::new(vec![]);
        let manager = SessionManager::new(connector.clone(), None);
        manager.connect().await.unwrap();

        connector.challenges.store(1, Ordering::SeqCst);
        let err = manager.call("ask_document", json!({})).await.unwrap_err();
        assert!(err.is_auth_required());
        assert_eq!(connector.attempts(), 1);
    }
}
