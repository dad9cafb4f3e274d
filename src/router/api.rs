//! Stateless HTTP API client
//!
//! Plain request/response calls against the assistant backend. Used as the
//! fallback chat path and for command execution, status and speech audio.

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Client for the assistant's HTTP API
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: url::Url,
}

impl ApiClient {
    /// Create a client for the API rooted at `base_url`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL does not parse
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), base_url)
    }

    /// Create a client reusing an existing HTTP client
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL does not parse
    pub fn with_client(client: Client, base_url: &str) -> Result<Self> {
        // A trailing slash makes relative joins append rather than replace
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = url::Url::parse(&normalized)
            .map_err(|e| Error::Config(format!("invalid API URL {base_url}: {e}")))?;

        Ok(Self { client, base_url })
    }

    /// Base URL requests are made against
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    fn endpoint(&self, path: &str) -> Result<url::Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("invalid endpoint {path}: {e}")))
    }

    /// Send a chat message and return the reply text
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteCall` if the request fails, the status is not a
    /// success, or the body does not decode
    pub async fn query(&self, message: &str) -> Result<QueryResponse> {
        let url = self.endpoint("query")?;
        let response = self
            .client
            .post(url)
            .json(&QueryRequest { message })
            .send()
            .await
            .map_err(remote("query"))?;

        decode(response, "query").await
    }

    /// Run an assistant command
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteCall` if the request fails, the status is not a
    /// success, or the body does not decode
    pub async fn execute(&self, command: &str, use_jarvis: bool) -> Result<ExecuteResponse> {
        let url = self.endpoint("execute")?;
        let response = self
            .client
            .post(url)
            .json(&ExecuteRequest {
                command,
                use_jarvis,
            })
            .send()
            .await
            .map_err(remote("execute"))?;

        decode(response, "execute").await
    }

    /// Fetch backend model status
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteCall` if the request fails, the status is not a
    /// success, or the body does not decode
    pub async fn status(&self) -> Result<StatusResponse> {
        let url = self.endpoint("status")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(remote("status"))?;

        decode(response, "status").await
    }

    /// Request speech audio for `text`
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteCall` if the request fails, the status is not a
    /// success, or the body does not decode
    pub async fn tts(&self, text: &str) -> Result<TtsResponse> {
        let url = self.endpoint("tts")?;
        let response = self
            .client
            .post(url)
            .json(&TtsRequest { text })
            .send()
            .await
            .map_err(remote("tts"))?;

        decode(response, "tts").await
    }

    /// Download audio referenced by a [`TtsResponse`]
    ///
    /// Relative URLs are resolved against the API base.
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteCall` if the download fails
    pub async fn fetch_audio(&self, audio_url: &str) -> Result<Vec<u8>> {
        let url = self
            .base_url
            .join(audio_url)
            .map_err(|e| Error::RemoteCall(format!("invalid audio URL {audio_url}: {e}")))?;

        tracing::debug!(%url, "downloading speech audio");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(remote("audio"))?;
        let bytes = check(response, "audio")
            .await?
            .bytes()
            .await
            .map_err(remote("audio"))?;
        Ok(bytes.to_vec())
    }
}

/// Map a non-success status to `Error::RemoteCall`
async fn check(response: Response, call: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(Error::RemoteCall(format!("{call} failed: {status} - {body}")))
}

/// Check the status and decode a JSON body
async fn decode<T: DeserializeOwned>(response: Response, call: &str) -> Result<T> {
    check(response, call)
        .await?
        .json()
        .await
        .map_err(remote(call))
}

/// Connection and body errors count as failed remote calls too
fn remote(call: &str) -> impl Fn(reqwest::Error) -> Error + '_ {
    move |e| Error::RemoteCall(format!("{call}: {e}"))
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    message: &'a str,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    command: &'a str,
    use_jarvis: bool,
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
}

/// Reply to a chat query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub response: String,
    /// Model that answered, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Outcome of a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Backend health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub online: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Location of synthesized speech
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsResponse {
    pub audio_url: String,
    /// Estimated length in seconds
    #[serde(default)]
    pub duration: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_append_to_base_path() {
        let client = ApiClient::new("http://localhost:8000/api/").unwrap();
        assert_eq!(
            client.endpoint("query").unwrap().as_str(),
            "http://localhost:8000/api/query"
        );
        assert_eq!(client.base_url(), "http://localhost:8000/api");

        let client = ApiClient::new("http://localhost:8000").unwrap();
        assert_eq!(
            client.endpoint("/status").unwrap().as_str(),
            "http://localhost:8000/status"
        );
    }

    #[test]
    fn rejects_unparseable_base() {
        assert!(matches!(ApiClient::new("not a url"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn refused_connection_is_a_remote_call_failure() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = ApiClient::new(&format!("http://127.0.0.1:{port}")).unwrap();

        match client.query("hi").await {
            Err(Error::RemoteCall(message)) => assert!(message.starts_with("query: ")),
            other => panic!("expected remote call failure, got {other:?}"),
        }
        assert!(matches!(client.status().await, Err(Error::RemoteCall(_))));
    }

    #[test]
    fn decodes_tts_reply() {
        let reply: TtsResponse =
            serde_json::from_str(r#"{"audioUrl":"/audio/1.mp3","duration":2.5}"#).unwrap();
        assert_eq!(reply.audio_url, "/audio/1.mp3");
        assert!((reply.duration - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn status_model_is_optional() {
        let status: StatusResponse =
            serde_json::from_str(r#"{"online":false,"status":"Error connecting"}"#).unwrap();
        assert!(!status.online);
        assert_eq!(status.model, None);
    }
}
