//! Model transport routing
//!
//! [`ModelTransportRouter`] sends chat messages over the session path while
//! it works and demotes itself to the stateless API after the first session
//! failure. Demotion is sticky; only a successful
//! [`ModelTransportRouter::check_availability`] promotes it back.

mod api;
mod session;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

pub use api::{ApiClient, ExecuteResponse, QueryResponse, StatusResponse, TtsResponse};
pub use session::{ChatParams, SessionHandle, SessionRpcClient, resolve_space_url};

use crate::config::{ChatConfig, Config};
use crate::{Error, Result};

/// Session-oriented chat path
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Send a chat message, opening a session first if needed
    async fn chat(&self, params: &ChatParams) -> Result<String>;

    /// Low-cost call confirming the path works
    async fn probe(&self) -> Result<String>;

    /// Forget the current session
    async fn invalidate(&self);
}

/// Stateless request/response chat path
#[async_trait]
pub trait StatelessTransport: Send + Sync {
    async fn query(&self, message: &str) -> Result<String>;
}

#[async_trait]
impl SessionTransport for SessionRpcClient {
    async fn chat(&self, params: &ChatParams) -> Result<String> {
        self.call("/chat", params).await
    }

    async fn probe(&self) -> Result<String> {
        Self::probe(self).await
    }

    async fn invalidate(&self) {
        Self::invalidate(self).await;
    }
}

#[async_trait]
impl StatelessTransport for ApiClient {
    async fn query(&self, message: &str) -> Result<String> {
        Ok(Self::query(self, message).await?.response)
    }
}

/// Which path chat messages take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterMode {
    PreferSession,
    FallbackOnly,
}

/// Path a reply actually came through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Session,
    Stateless,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::Stateless => f.write_str("stateless"),
        }
    }
}

/// Per-message overrides of the configured chat defaults
///
/// Values are passed through unvalidated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub system_message: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
}

/// A model reply and the route it took
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutedReply {
    pub text: String,
    pub route: Route,
}

/// Routes chat messages between the session and stateless paths
pub struct ModelTransportRouter {
    session: Arc<dyn SessionTransport>,
    stateless: Arc<dyn StatelessTransport>,
    mode: RwLock<RouterMode>,
    defaults: ChatConfig,
}

impl ModelTransportRouter {
    /// Create a router starting in [`RouterMode::PreferSession`]
    #[must_use]
    pub fn new(
        session: Arc<dyn SessionTransport>,
        stateless: Arc<dyn StatelessTransport>,
        defaults: ChatConfig,
    ) -> Self {
        Self {
            session,
            stateless,
            mode: RwLock::new(RouterMode::PreferSession),
            defaults,
        }
    }

    /// Build the router over the configured space and API
    #[must_use]
    pub fn from_config(config: &Config, api: ApiClient) -> Self {
        let session = SessionRpcClient::new(&config.space);
        Self::new(Arc::new(session), Arc::new(api), config.chat.clone())
    }

    /// Current routing mode
    pub async fn mode(&self) -> RouterMode {
        *self.mode.read().await
    }

    fn params(&self, text: &str, options: &ChatOptions) -> ChatParams {
        let mut params = ChatParams::new(text, &self.defaults);
        if let Some(system_message) = &options.system_message {
            params.system_message.clone_from(system_message);
        }
        if let Some(temperature) = options.temperature {
            params.temperature = temperature;
        }
        if let Some(max_tokens) = options.max_tokens {
            params.max_tokens = max_tokens;
        }
        if let Some(top_p) = options.top_p {
            params.top_p = top_p;
        }
        params
    }

    /// Send a chat message and return the model's reply
    ///
    /// A session-path failure demotes the router and the message is retried
    /// once over the stateless path; the caller only sees the stateless
    /// result.
    ///
    /// # Errors
    ///
    /// Returns the stateless path's error unchanged
    pub async fn send_message(&self, text: &str, options: &ChatOptions) -> Result<RoutedReply> {
        if self.mode().await == RouterMode::PreferSession {
            match self.session.chat(&self.params(text, options)).await {
                Ok(reply) => {
                    return Ok(RoutedReply {
                        text: reply,
                        route: Route::Session,
                    });
                }
                Err(e) => self.demote(&e).await,
            }
        }

        let reply = self.stateless.query(text).await?;
        Ok(RoutedReply {
            text: reply,
            route: Route::Stateless,
        })
    }

    async fn demote(&self, cause: &Error) {
        let mut mode = self.mode.write().await;
        if *mode == RouterMode::PreferSession {
            tracing::warn!(error = %cause, "session path failed, falling back to stateless API");
        }
        *mode = RouterMode::FallbackOnly;
        drop(mode);

        self.session.invalidate().await;
    }

    /// Probe the session path and choose the mode from the result
    ///
    /// This is the only way back to [`RouterMode::PreferSession`].
    ///
    /// # Errors
    ///
    /// Returns `Error::AvailabilityCheck` if the probe fails; the router is
    /// left in [`RouterMode::FallbackOnly`]
    pub async fn check_availability(&self) -> Result<()> {
        match self.session.probe().await {
            Ok(_) => {
                *self.mode.write().await = RouterMode::PreferSession;
                tracing::info!("session path available");
                Ok(())
            }
            Err(e) => {
                *self.mode.write().await = RouterMode::FallbackOnly;
                self.session.invalidate().await;
                tracing::warn!(error = %e, "session path unavailable");
                Err(Error::AvailabilityCheck(e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for ModelTransportRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelTransportRouter")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct FakeSession {
        failing: AtomicBool,
        calls: AtomicUsize,
        probes: AtomicUsize,
        invalidations: AtomicUsize,
        last: Mutex<Option<ChatParams>>,
    }

    #[async_trait]
    impl SessionTransport for FakeSession {
        async fn chat(&self, params: &ChatParams) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(params.clone());
            if self.failing.load(Ordering::SeqCst) {
                Err(Error::RemoteCall("space asleep".to_string()))
            } else {
                Ok(format!("session: {}", params.message))
            }
        }

        async fn probe(&self) -> Result<String> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(Error::RemoteCall("space asleep".to_string()))
            } else {
                Ok("OK".to_string())
            }
        }

        async fn invalidate(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeStateless {
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatelessTransport for FakeStateless {
        async fn query(&self, message: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(Error::RemoteCall("query failed: 502 Bad Gateway".to_string()))
            } else {
                Ok(format!("stateless: {message}"))
            }
        }
    }

    fn router() -> (ModelTransportRouter, Arc<FakeSession>, Arc<FakeStateless>) {
        let session = Arc::new(FakeSession::default());
        let stateless = Arc::new(FakeStateless::default());
        let router = ModelTransportRouter::new(
            Arc::clone(&session) as Arc<dyn SessionTransport>,
            Arc::clone(&stateless) as Arc<dyn StatelessTransport>,
            ChatConfig::default(),
        );
        (router, session, stateless)
    }

    #[tokio::test]
    async fn uses_session_path_when_healthy() {
        let (router, session, stateless) = router();

        let reply = router.send_message("hi", &ChatOptions::default()).await.unwrap();
        assert_eq!(reply.text, "session: hi");
        assert_eq!(reply.route, Route::Session);
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stateless.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn session_failure_falls_back_once() {
        let (router, session, stateless) = router();
        session.failing.store(true, Ordering::SeqCst);

        let reply = router.send_message("hi", &ChatOptions::default()).await.unwrap();
        assert_eq!(reply.text, "stateless: hi");
        assert_eq!(reply.route, Route::Stateless);
        assert_eq!(stateless.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(router.mode().await, RouterMode::FallbackOnly);
    }

    #[tokio::test]
    async fn demotion_is_sticky() {
        let (router, session, stateless) = router();
        session.failing.store(true, Ordering::SeqCst);
        router.send_message("first", &ChatOptions::default()).await.unwrap();

        // Session recovers, but nothing re-checks it
        session.failing.store(false, Ordering::SeqCst);
        for i in 0..3 {
            let reply = router
                .send_message(&format!("msg {i}"), &ChatOptions::default())
                .await
                .unwrap();
            assert_eq!(reply.route, Route::Stateless);
        }

        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stateless.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn availability_check_promotes() {
        let (router, session, _stateless) = router();
        session.failing.store(true, Ordering::SeqCst);
        router.send_message("hi", &ChatOptions::default()).await.unwrap();

        session.failing.store(false, Ordering::SeqCst);
        router.check_availability().await.unwrap();
        assert_eq!(router.mode().await, RouterMode::PreferSession);

        let reply = router.send_message("again", &ChatOptions::default()).await.unwrap();
        assert_eq!(reply.route, Route::Session);
    }

    #[tokio::test]
    async fn failed_availability_check_demotes() {
        let (router, session, _stateless) = router();
        session.failing.store(true, Ordering::SeqCst);

        let err = router.check_availability().await.unwrap_err();
        assert!(matches!(err, Error::AvailabilityCheck(_)));
        assert_eq!(router.mode().await, RouterMode::FallbackOnly);
        assert_eq!(session.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stateless_failure_is_surfaced() {
        let (router, session, stateless) = router();
        session.failing.store(true, Ordering::SeqCst);
        stateless.failing.store(true, Ordering::SeqCst);

        let err = router.send_message("hi", &ChatOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::RemoteCall(msg) if msg.contains("502")));
        assert_eq!(stateless.calls.load(Ordering::SeqCst), 1);

        router.send_message("again", &ChatOptions::default()).await.unwrap_err();
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stateless.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn options_override_defaults() {
        let (router, session, _stateless) = router();

        router.send_message("plain", &ChatOptions::default()).await.unwrap();
        let params = session.last.lock().unwrap().clone().unwrap();
        assert!((params.temperature - 0.7).abs() < f64::EPSILON);
        assert_eq!(params.max_tokens, 1024);
        assert!((params.top_p - 0.95).abs() < f64::EPSILON);

        let options = ChatOptions {
            system_message: Some("Be brief.".to_string()),
            temperature: Some(3.5),
            max_tokens: Some(0),
            top_p: None,
        };
        router.send_message("custom", &options).await.unwrap();
        let params = session.last.lock().unwrap().clone().unwrap();
        assert_eq!(params.system_message, "Be brief.");
        assert!((params.temperature - 3.5).abs() < f64::EPSILON);
        assert_eq!(params.max_tokens, 0);
        assert!((params.top_p - 0.95).abs() < f64::EPSILON);
    }
}
