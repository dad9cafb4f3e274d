//! Transcript transport tests against a real WebSocket server

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use aura_client::Error;
use aura_client::voice::{
    ConnectionState, NORMAL_CLOSURE, TranscriptTransport, TransportEvent, WsConnector,
};
use tokio::sync::mpsc;

mod common;
use common::{eventually, fast_reconnect, recv, spawn_backend};

fn spawn(url: String) -> (TranscriptTransport, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = TranscriptTransport::spawn(url, Arc::new(WsConnector), fast_reconnect(), tx);
    (transport, rx)
}

/// Skip state changes and return the next transcript or error
async fn next_payload(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    loop {
        match recv(rx).await {
            TransportEvent::StateChanged(_) => {}
            other => return other,
        }
    }
}

async fn wait_for_state(rx: &mut mpsc::UnboundedReceiver<TransportEvent>, want: ConnectionState) {
    loop {
        if let TransportEvent::StateChanged(state) = recv(rx).await {
            if state == want {
                return;
            }
        }
    }
}

#[tokio::test]
async fn streams_audio_and_receives_transcripts() {
    let server = spawn_backend().await;
    let (transport, mut events) = spawn(server.ws_url("/ws/voice"));

    transport.connect().unwrap();
    assert!(matches!(
        recv(&mut events).await,
        TransportEvent::StateChanged(ConnectionState::Connecting)
    ));
    assert!(matches!(
        recv(&mut events).await,
        TransportEvent::StateChanged(ConnectionState::Open)
    ));
    assert!(matches!(
        next_payload(&mut events).await,
        TransportEvent::Transcript(t) if t == "ready"
    ));

    assert!(transport.send(vec![1, 2, 3]));
    assert!(matches!(
        next_payload(&mut events).await,
        TransportEvent::Transcript(t) if t == "heard 3 bytes"
    ));
    assert_eq!(transport.state(), ConnectionState::Open);

    transport.disconnect().await;
    assert_eq!(transport.state(), ConnectionState::Closed(NORMAL_CLOSURE));

    let backend = Arc::clone(&server.backend);
    eventually(|| backend.ws_closes.lock().unwrap().as_slice() == [NORMAL_CLOSURE]).await;
    assert_eq!(server.backend.ws_chunks.lock().unwrap().as_slice(), [3]);
}

#[tokio::test]
async fn malformed_frames_do_not_change_state() {
    let server = spawn_backend().await;
    let (transport, mut events) = spawn(server.ws_url("/ws/bogus"));
    transport.connect().unwrap();

    match next_payload(&mut events).await {
        TransportEvent::Error(Error::Protocol(_)) => {}
        other => panic!("expected protocol error, got {other:?}"),
    }
    match next_payload(&mut events).await {
        TransportEvent::Error(Error::Stt(message)) => assert_eq!(message, "model overloaded"),
        other => panic!("expected STT error, got {other:?}"),
    }
    assert!(matches!(
        next_payload(&mut events).await,
        TransportEvent::Transcript(t) if t == "after"
    ));
    assert_eq!(transport.state(), ConnectionState::Open);

    transport.disconnect().await;
}

#[tokio::test]
async fn server_normal_close_is_not_retried() {
    let server = spawn_backend().await;
    let (transport, mut events) = spawn(server.ws_url("/ws/bye"));
    transport.connect().unwrap();

    wait_for_state(&mut events, ConnectionState::Closed(NORMAL_CLOSURE)).await;

    // Several backoff periods pass without a reconnect
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.backend.ws_connections.load(Ordering::SeqCst), 1);
    assert_eq!(transport.state(), ConnectionState::Closed(NORMAL_CLOSURE));
    assert!(!transport.is_finished());
}

#[tokio::test]
async fn dropped_connection_reconnects() {
    let server = spawn_backend().await;
    let (transport, _events) = spawn(server.ws_url("/ws/drop"));
    transport.connect().unwrap();

    let backend = Arc::clone(&server.backend);
    eventually(|| backend.ws_connections.load(Ordering::SeqCst) >= 3).await;

    transport.disconnect().await;
    assert!(!transport.send(vec![0]));
}

#[tokio::test]
async fn unreachable_endpoint_exhausts_reconnects() {
    let server = spawn_backend().await;
    let (transport, mut events) = spawn(server.ws_url("/ws/missing"));
    transport.connect().unwrap();

    let attempts = loop {
        match recv(&mut events).await {
            TransportEvent::Error(Error::ReconnectExhausted { attempts }) => break attempts,
            TransportEvent::Error(other) => panic!("unexpected error {other:?}"),
            _ => {}
        }
    };
    assert_eq!(attempts, 2);

    eventually(|| transport.is_finished()).await;
    assert!(transport.connect().is_err());
}
