//! Duplex transcript transport
//!
//! Owns one streaming connection to the transcription service: audio chunks
//! go out, transcript/error frames come back. A single task owns the
//! connection state and the reconnect policy; the [`TranscriptTransport`]
//! handle only sends it commands.
//!
//! State machine: `Idle -> Connecting -> Open -> Closing -> Closed`. A close
//! with any code other than [`NORMAL_CLOSURE`] schedules a reconnect after a
//! backoff delay; once the policy is exhausted a single
//! `Error::ReconnectExhausted` is emitted and the transport shuts down.
//! Socket errors are only logged: the close that follows is what drives the
//! state change.

use std::ops::ControlFlow;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use super::frame::TranscriptFrame;
use super::link::{ABNORMAL_CLOSURE, Connector, Link, LinkEvent, NORMAL_CLOSURE, Outbound};
use super::reconnect::ReconnectPolicy;
use crate::config::ReconnectConfig;
use crate::{Error, Result};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    /// Closed with the given close code
    Closed(u16),
}

/// Event delivered to the transport's consumer, in arrival order
#[derive(Debug)]
pub enum TransportEvent {
    /// Recognised text
    Transcript(String),
    /// Service-reported error, malformed frame, or fatal reconnect exhaustion
    Error(Error),
    /// Connection state changed
    StateChanged(ConnectionState),
}

#[derive(Debug)]
enum Command {
    Connect,
    Send(Vec<u8>),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a running transcript transport
pub struct TranscriptTransport {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl TranscriptTransport {
    /// Spawn the transport task in the `Idle` state
    ///
    /// Nothing is dialled until [`connect`](Self::connect) is called. Must be
    /// called from within a Tokio runtime.
    pub fn spawn(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        reconnect: ReconnectConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Idle);

        let actor = Actor {
            url: url.into(),
            connector,
            policy: ReconnectPolicy::new(reconnect),
            events,
            state_tx,
            link: None,
            pending: None,
            retry_at: None,
        };
        let task = tokio::spawn(actor.run(command_rx));

        Self {
            commands,
            state,
            task,
        }
    }

    /// Start connecting
    ///
    /// No-op while already connecting, open, or waiting to reconnect.
    ///
    /// # Errors
    ///
    /// Returns `Error::TransportClosed` if the transport has shut down
    pub fn connect(&self) -> Result<()> {
        self.commands
            .send(Command::Connect)
            .map_err(|_| Error::TransportClosed)
    }

    /// Send an audio chunk
    ///
    /// Chunks are only forwarded while `Open`; anything sent in another
    /// state is dropped, not buffered. Returns whether the chunk was
    /// accepted.
    pub fn send(&self, chunk: Vec<u8>) -> bool {
        if self.state() != ConnectionState::Open {
            tracing::trace!(bytes = chunk.len(), "transport not open, dropping chunk");
            return false;
        }

        self.commands.send(Command::Send(chunk)).is_ok()
    }

    /// Close with the normal code and shut the transport down
    ///
    /// Cancels any pending reconnect. Returns once the close has been
    /// issued; a transport that already shut down returns immediately.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether the transport task has exited (disconnected or exhausted)
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl std::fmt::Debug for TranscriptTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptTransport")
            .field("state", &self.state())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

struct Actor {
    url: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    link: Option<Link>,
    pending: Option<BoxFuture<'static, Result<Link>>>,
    retry_at: Option<Instant>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let flow = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Connect) => {
                        self.connect();
                        ControlFlow::Continue(())
                    }
                    Some(Command::Send(chunk)) => {
                        self.send(chunk);
                        ControlFlow::Continue(())
                    }
                    Some(Command::Disconnect(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        ControlFlow::Break(())
                    }
                    None => {
                        self.shutdown();
                        ControlFlow::Break(())
                    }
                },
                result = next_connect(&mut self.pending), if self.pending.is_some() => {
                    self.pending = None;
                    self.on_connect_result(result)
                }
                event = next_link_event(&mut self.link), if self.link.is_some() => {
                    self.on_link_event(event)
                }
                () = retry_timer(self.retry_at), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.begin_connect();
                    ControlFlow::Continue(())
                }
            };

            if flow.is_break() {
                break;
            }
        }

        tracing::debug!(url = %self.url, "transcript transport stopped");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state() == state {
            return;
        }

        tracing::debug!(from = ?self.state(), to = ?state, "transport state change");
        self.state_tx.send_replace(state);
        self.emit(TransportEvent::StateChanged(state));
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn connect(&mut self) {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing => {}
            ConnectionState::Closed(_) if self.retry_at.is_some() => {
                tracing::debug!("reconnect already scheduled, ignoring connect");
            }
            ConnectionState::Idle | ConnectionState::Closed(_) => self.begin_connect(),
        }
    }

    fn begin_connect(&mut self) {
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        self.pending = Some(Box::pin(async move { connector.connect(&url).await }));
    }

    fn on_connect_result(&mut self, result: Result<Link>) -> ControlFlow<()> {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.policy.on_open();
                self.set_state(ConnectionState::Open);
                tracing::info!(url = %self.url, "transcription stream open");
                ControlFlow::Continue(())
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "failed to connect");
                self.on_abnormal_close(ABNORMAL_CLOSURE)
            }
        }
    }

    fn on_link_event(&mut self, event: Option<LinkEvent>) -> ControlFlow<()> {
        match event {
            Some(LinkEvent::Text(raw)) => {
                match TranscriptFrame::parse(&raw) {
                    Ok(TranscriptFrame::Transcript { text }) => {
                        self.emit(TransportEvent::Transcript(text));
                    }
                    Ok(TranscriptFrame::Error { message }) => {
                        self.emit(TransportEvent::Error(Error::Stt(message)));
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping malformed frame");
                        self.emit(TransportEvent::Error(e));
                    }
                }
                ControlFlow::Continue(())
            }
            Some(LinkEvent::Binary(data)) => {
                self.emit(TransportEvent::Error(Error::Protocol(format!(
                    "unexpected binary frame ({} bytes)",
                    data.len()
                ))));
                ControlFlow::Continue(())
            }
            Some(LinkEvent::Error(message)) => {
                tracing::warn!(error = %message, "transcription socket error");
                ControlFlow::Continue(())
            }
            Some(LinkEvent::Closed(code)) => self.on_closed(code),
            None => self.on_closed(ABNORMAL_CLOSURE),
        }
    }

    fn on_closed(&mut self, code: u16) -> ControlFlow<()> {
        self.link = None;

        if code == NORMAL_CLOSURE {
            tracing::info!(code, "transcription stream closed normally");
            self.set_state(ConnectionState::Closed(code));
            return ControlFlow::Continue(());
        }

        self.on_abnormal_close(code)
    }

    fn on_abnormal_close(&mut self, code: u16) -> ControlFlow<()> {
        self.set_state(ConnectionState::Closed(code));

        if let Some(delay) = self.policy.on_abnormal_close() {
            tracing::warn!(
                code,
                attempt = self.policy.attempt(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "transcription stream lost, reconnecting"
            );
            self.retry_at = Some(Instant::now() + delay);
            return ControlFlow::Continue(());
        }

        let attempts = self.policy.max_attempts();
        tracing::error!(code, attempts, "max reconnection attempts reached");
        self.emit(TransportEvent::Error(Error::ReconnectExhausted { attempts }));
        ControlFlow::Break(())
    }

    fn send(&self, chunk: Vec<u8>) {
        match (&self.link, self.state()) {
            (Some(link), ConnectionState::Open) => {
                tracing::trace!(bytes = chunk.len(), "sending audio chunk");
                let _ = link.outbound.send(Outbound::Audio(chunk));
            }
            _ => tracing::trace!(bytes = chunk.len(), "transport not open, dropping chunk"),
        }
    }

    fn shutdown(&mut self) {
        self.retry_at = None;
        self.pending = None;

        if let Some(link) = self.link.take() {
            self.set_state(ConnectionState::Closing);
            let _ = link.outbound.send(Outbound::Close(NORMAL_CLOSURE));
        }

        self.set_state(ConnectionState::Closed(NORMAL_CLOSURE));
    }
}

async fn next_connect(pending: &mut Option<BoxFuture<'static, Result<Link>>>) -> Result<Link> {
    match pending {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_link_event(link: &mut Option<Link>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
