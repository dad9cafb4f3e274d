//! Shared test utilities
//!
//! A fake backend serving the stateless API, the inference space and the
//! transcription WebSocket from one local axum server.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aura_client::Config;
use aura_client::config::ReconnectConfig;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Observable state of the fake backend
#[derive(Default)]
pub struct Backend {
    /// Make every `/api/predict` call fail with 503
    pub space_down: AtomicBool,
    pub handshakes: AtomicUsize,
    /// Bodies of non-handshake `/api/predict` calls
    pub space_calls: Mutex<Vec<Value>>,
    pub queries: Mutex<Vec<String>>,
    pub executes: Mutex<Vec<Value>>,
    pub ws_connections: AtomicUsize,
    /// Sizes of binary frames received over `/ws/voice`
    pub ws_chunks: Mutex<Vec<usize>>,
    /// Close codes sent by clients
    pub ws_closes: Mutex<Vec<u16>>,
}

impl Backend {
    pub fn space_calls(&self) -> usize {
        self.space_calls.lock().unwrap().len()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

/// A running fake backend
pub struct TestServer {
    pub base_url: String,
    pub ws_base: String,
    pub backend: Arc<Backend>,
}

impl TestServer {
    pub fn ws_url(&self, path: &str) -> String {
        format!("{}{path}", self.ws_base)
    }

    /// Client config pointed at this server
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.api_base_url.clone_from(&self.base_url);
        config.space.clone_from(&self.base_url);
        config.transcription_url = self.ws_url("/ws/voice");
        config.reconnect = fast_reconnect();
        config.capture.chunk_interval = Duration::from_millis(20);
        config
    }
}

/// Reconnect settings short enough for tests
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

/// Start the fake backend on an ephemeral port
pub async fn spawn_backend() -> TestServer {
    let backend = Arc::new(Backend::default());

    let app = Router::new()
        .route("/api/predict", post(predict))
        .route("/query", post(query))
        .route("/execute", post(execute))
        .route("/status", get(status))
        .route("/tts", post(tts))
        .route("/audio/speech.mp3", get(audio))
        .route("/garbled/status", get(audio))
        .route("/ws/voice", get(ws_voice))
        .route("/ws/bogus", get(ws_bogus))
        .route("/ws/bye", get(ws_bye))
        .route("/ws/drop", get(ws_drop))
        .with_state(Arc::clone(&backend));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        ws_base: format!("ws://{addr}"),
        backend,
    }
}

async fn predict(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    if backend.space_down.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "space is sleeping").into_response();
    }

    if body["session_hash"].is_null() {
        let n = backend.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
        return Json(json!({ "session_hash": format!("sess-{n}") })).into_response();
    }

    let message = body["data"][0].as_str().unwrap_or_default().to_string();
    backend.space_calls.lock().unwrap().push(body);
    Json(json!({ "data": [format!("space: {message}")] })).into_response()
}

async fn query(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    let message = body["message"].as_str().unwrap_or_default().to_string();
    backend.queries.lock().unwrap().push(message.clone());
    Json(json!({ "response": format!("api: {message}"), "model": "fake" }))
}

async fn execute(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    let command = body["command"].as_str().unwrap_or_default().to_string();
    backend.executes.lock().unwrap().push(body);
    Json(json!({ "success": true, "message": format!("ran {command}") }))
}

async fn status() -> Json<Value> {
    Json(json!({ "online": true, "status": "API is online", "model": "fake-model" }))
}

async fn tts() -> Json<Value> {
    Json(json!({ "audioUrl": "/audio/speech.mp3", "duration": 1.5 }))
}

async fn audio() -> &'static [u8] {
    b"this is not an mp3"
}

async fn ws_voice(ws: WebSocketUpgrade, State(backend): State<Arc<Backend>>) -> Response {
    backend.ws_connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| voice_session(socket, backend))
}

/// Greets, then answers each audio frame with a transcript of its size
async fn voice_session(mut socket: WebSocket, backend: Arc<Backend>) {
    let ready = json!({ "type": "transcript", "text": "ready" });
    if socket.send(Message::Text(ready.to_string().into())).await.is_err() {
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Binary(data) => {
                backend.ws_chunks.lock().unwrap().push(data.len());
                let text = format!("heard {} bytes", data.len());
                let reply = json!({ "type": "transcript", "text": text });
                if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                    return;
                }
            }
            Message::Close(frame) => {
                let code = frame.map_or(1005, |f| f.code);
                backend.ws_closes.lock().unwrap().push(code);
                return;
            }
            _ => {}
        }
    }
}

async fn ws_bogus(ws: WebSocketUpgrade, State(backend): State<Arc<Backend>>) -> Response {
    backend.ws_connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(|mut socket| async move {
        for frame in [
            json!({ "type": "bogus" }),
            json!({ "type": "error", "message": "model overloaded" }),
            json!({ "type": "transcript", "text": "after" }),
        ] {
            let _ = socket.send(Message::Text(frame.to_string().into())).await;
        }
        // Hold the connection open until the client leaves
        while let Some(Ok(msg)) = socket.recv().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    })
}

async fn ws_bye(ws: WebSocketUpgrade, State(backend): State<Arc<Backend>>) -> Response {
    backend.ws_connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(|mut socket| async move {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "session over".into(),
            })))
            .await;
    })
}

async fn ws_drop(ws: WebSocketUpgrade, State(backend): State<Arc<Backend>>) -> Response {
    backend.ws_connections.fetch_add(1, Ordering::SeqCst);
    // Dropped without a close frame
    ws.on_upgrade(|socket| async move { drop(socket) })
}

/// Receive with a timeout so a broken test fails instead of hanging
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

/// Poll until `check` holds or five seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
