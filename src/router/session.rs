//! Session client for a hosted inference space
//!
//! A session is opened lazily with a handshake call and reused for every
//! named-function call after it. Dropping the handle (see
//! [`SessionRpcClient::invalidate`]) forces a fresh handshake on next use.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::ChatConfig;
use crate::{Error, Result};

/// Opaque session token issued by the space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle(String);

impl SessionHandle {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Arguments of a chat function call
#[derive(Debug, Clone, PartialEq)]
pub struct ChatParams {
    pub message: String,
    pub system_message: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl ChatParams {
    /// Build parameters from configured defaults
    #[must_use]
    pub fn new(message: impl Into<String>, defaults: &ChatConfig) -> Self {
        Self {
            message: message.into(),
            system_message: defaults.system_message.clone(),
            temperature: defaults.temperature,
            top_p: defaults.top_p,
            max_tokens: defaults.max_tokens,
        }
    }

    /// Minimal call used to check the space is answering
    #[must_use]
    pub fn probe() -> Self {
        Self {
            message: "test".to_string(),
            system_message: "This is a test message. Please respond with 'OK'.".to_string(),
            temperature: 0.1,
            top_p: 0.9,
            max_tokens: 10,
        }
    }
}

/// Resolve a space name to its base URL
///
/// `owner/name` maps to `https://owner-name.hf.space`; anything starting
/// with `http` is used as given.
#[must_use]
pub fn resolve_space_url(space: &str) -> String {
    if space.starts_with("http") {
        space.trim_end_matches('/').to_string()
    } else {
        format!("https://{}.hf.space", space.replacen('/', "-", 1))
    }
}

/// Function index a named endpoint is served at
fn function_index(function: &str) -> u32 {
    u32::from(function != "/chat")
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    fn_index: u32,
    data: serde_json::Value,
    session_hash: Option<&'a str>,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    session_hash: Option<String>,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

/// Client for named-function calls against one inference space
#[derive(Debug)]
pub struct SessionRpcClient {
    client: Client,
    predict_url: String,
    session: Mutex<Option<SessionHandle>>,
}

impl SessionRpcClient {
    /// Create a client for a space name or URL; no request is made yet
    #[must_use]
    pub fn new(space: &str) -> Self {
        Self::with_client(Client::new(), space)
    }

    #[must_use]
    pub fn with_client(client: Client, space: &str) -> Self {
        Self {
            client,
            predict_url: format!("{}/api/predict", resolve_space_url(space)),
            session: Mutex::new(None),
        }
    }

    /// Endpoint all calls are posted to
    #[must_use]
    pub fn predict_url(&self) -> &str {
        &self.predict_url
    }

    /// Whether a session is currently held
    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Return the current session, performing the handshake if there is none
    ///
    /// Concurrent callers share one handshake.
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteCall` if the handshake fails
    pub async fn ensure_session(&self) -> Result<SessionHandle> {
        let mut session = self.session.lock().await;
        if let Some(handle) = session.as_ref() {
            return Ok(handle.clone());
        }

        let handle = self.handshake().await?;
        tracing::debug!(url = %self.predict_url, "inference session established");
        *session = Some(handle.clone());
        Ok(handle)
    }

    async fn handshake(&self) -> Result<SessionHandle> {
        let body = PredictRequest {
            fn_index: 0,
            data: serde_json::Value::Array(Vec::new()),
            session_hash: None,
        };

        let response = self
            .client
            .post(&self.predict_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RemoteCall(format!("session handshake: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RemoteCall(format!(
                "session handshake failed: {status} - {body}"
            )));
        }

        let reply: HandshakeResponse = response
            .json()
            .await
            .map_err(|e| Error::RemoteCall(format!("session handshake: {e}")))?;

        reply
            .session_hash
            .filter(|hash| !hash.is_empty())
            .map(SessionHandle)
            .ok_or_else(|| Error::RemoteCall("session handshake returned no session".to_string()))
    }

    /// Invoke a named function and return the first element of its output
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteCall` if the handshake or the call fails
    pub async fn call(&self, function: &str, params: &ChatParams) -> Result<String> {
        let session = self.ensure_session().await?;

        let body = PredictRequest {
            fn_index: function_index(function),
            data: serde_json::json!([
                params.message,
                params.system_message,
                params.temperature,
                params.top_p,
                params.max_tokens,
            ]),
            session_hash: Some(session.as_str()),
        };

        tracing::debug!(function, "calling inference space");
        let response = self
            .client
            .post(&self.predict_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RemoteCall(format!("{function}: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RemoteCall(format!(
                "{function} failed: {status} - {body}"
            )));
        }

        let reply: PredictResponse = response
            .json()
            .await
            .map_err(|e| Error::RemoteCall(format!("{function}: {e}")))?;

        match reply.data.into_iter().next() {
            Some(serde_json::Value::String(text)) => Ok(text),
            Some(serde_json::Value::Null) | None => Err(Error::RemoteCall(format!(
                "{function} returned no data"
            ))),
            Some(other) => Ok(other.to_string()),
        }
    }

    /// Send the availability probe over the session path
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteCall` if the probe fails
    pub async fn probe(&self) -> Result<String> {
        self.call("/chat", &ChatParams::probe()).await
    }

    /// Drop the session so the next call performs a new handshake
    pub async fn invalidate(&self) {
        if self.session.lock().await.take().is_some() {
            tracing::debug!("inference session dropped");
        }
    }
}
