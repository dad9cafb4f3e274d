//! Queued, cancellable speech synthesis
//!
//! [`SpeechQueue`] serialises speak requests onto one [`SpeechEngine`]:
//! requests play in submission order and at most one is active at a time.
//! Each request resolves on its own [`SpeechCompletion`] so callers can
//! await completion or observe failure.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::SpeechConfig;
use crate::{Error, Result};

/// Lower bound for rate and pitch
pub const MIN_RATE: f32 = 0.1;

/// Upper bound for rate and pitch
pub const MAX_RATE: f32 = 2.0;

/// Clamp a speaking rate to `[0.1, 2.0]`; non-finite input becomes 1.0
#[must_use]
pub fn clamp_rate(rate: f32) -> f32 {
    clamp_or_default(rate, MIN_RATE, MAX_RATE, 1.0)
}

/// Clamp a pitch to `[0.1, 2.0]`; non-finite input becomes 1.0
#[must_use]
pub fn clamp_pitch(pitch: f32) -> f32 {
    clamp_or_default(pitch, MIN_RATE, MAX_RATE, 1.0)
}

/// Clamp a volume to `[0.0, 1.0]`; non-finite input becomes 1.0
#[must_use]
pub fn clamp_volume(volume: f32) -> f32 {
    clamp_or_default(volume, 0.0, 1.0, 1.0)
}

fn clamp_or_default(value: f32, min: f32, max: f32, default: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        default
    }
}

/// A voice offered by an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub name: String,
    pub lang: String,
}

impl Voice {
    /// Placeholder listed when an engine reports no voices
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            name: "Default".to_string(),
            lang: "en-US".to_string(),
        }
    }
}

/// A single utterance with its own playback settings
///
/// Rate and pitch are kept within `[0.1, 2.0]` and volume within `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    id: String,
    text: String,
    voice: Option<String>,
    rate: f32,
    pitch: f32,
    volume: f32,
}

impl SpeechRequest {
    /// Create a request with default settings
    #[must_use]
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            voice: None,
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
        }
    }

    /// Create a request using configured defaults and a fresh id
    #[must_use]
    pub fn from_config(text: impl Into<String>, config: &SpeechConfig) -> Self {
        let request = Self::new(uuid::Uuid::new_v4().to_string(), text)
            .with_rate(config.rate)
            .with_pitch(config.pitch)
            .with_volume(config.volume);

        match &config.voice {
            Some(voice) => request.with_voice(voice.clone()),
            None => request,
        }
    }

    #[must_use]
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    #[must_use]
    pub fn with_rate(mut self, rate: f32) -> Self {
        self.rate = clamp_rate(rate);
        self
    }

    #[must_use]
    pub fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = clamp_pitch(pitch);
        self
    }

    #[must_use]
    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = clamp_volume(volume);
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn voice(&self) -> Option<&str> {
        self.voice.as_deref()
    }

    #[must_use]
    pub const fn rate(&self) -> f32 {
        self.rate
    }

    #[must_use]
    pub const fn pitch(&self) -> f32 {
        self.pitch
    }

    #[must_use]
    pub const fn volume(&self) -> f32 {
        self.volume
    }
}

/// How a request ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    Completed,
    /// Stopped by cancel, clear, or a toggle re-submission
    Cancelled,
}

/// Playback notification for observers such as a speaking indicator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    Started { id: String },
    Finished { id: String, outcome: SpeechOutcome },
    Failed { id: String, error: String },
}

/// A speech synthesis backend
///
/// The engine is a shared resource injected into the queue; the queue
/// guarantees it is asked to speak at most one utterance at a time.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Whether synthesis is available at all
    fn is_supported(&self) -> bool {
        true
    }

    /// Voices the engine can use
    fn voices(&self) -> Vec<Voice>;

    /// Speak an utterance, returning when it has finished
    ///
    /// Dropping the returned future must stop playback.
    ///
    /// # Errors
    ///
    /// Returns `Error::Synthesis` if the utterance could not be spoken
    async fn speak(&self, request: &SpeechRequest) -> Result<()>;

    /// Stop the current utterance immediately
    fn stop(&self);
}

/// Snapshot of queue contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Id of the request currently playing
    pub active: Option<String>,
    /// Ids waiting to play, in order
    pub queued: Vec<String>,
}

/// Resolves when a submitted request finishes, fails or is cancelled
#[derive(Debug)]
#[must_use = "dropping the completion does not cancel the request"]
pub struct SpeechCompletion {
    rx: oneshot::Receiver<Result<SpeechOutcome>>,
}

impl Future for SpeechCompletion {
    type Output = Result<SpeechOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(Error::Synthesis("speech queue closed".to_string()))))
    }
}

enum Command {
    Speak(SpeechRequest, oneshot::Sender<Result<SpeechOutcome>>),
    CancelCurrent(oneshot::Sender<bool>),
    Clear(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<QueueSnapshot>),
}

/// Handle to the speech queue task
#[derive(Clone)]
pub struct SpeechQueue {
    commands: mpsc::UnboundedSender<Command>,
    engine: Arc<dyn SpeechEngine>,
}

impl SpeechQueue {
    /// Spawn a queue over an engine
    ///
    /// Must be called from within a Tokio runtime. The task ends when the
    /// last handle is dropped, stopping any active playback.
    #[must_use]
    pub fn spawn(engine: Arc<dyn SpeechEngine>) -> Self {
        Self::spawn_inner(engine, None)
    }

    /// Spawn a queue that also reports playback events
    #[must_use]
    pub fn with_events(
        engine: Arc<dyn SpeechEngine>,
        events: mpsc::UnboundedSender<SpeechEvent>,
    ) -> Self {
        Self::spawn_inner(engine, Some(events))
    }

    fn spawn_inner(
        engine: Arc<dyn SpeechEngine>,
        events: Option<mpsc::UnboundedSender<SpeechEvent>>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            engine: Arc::clone(&engine),
            queue: VecDeque::new(),
            active: None,
            playback: None,
            events,
        };
        tokio::spawn(actor.run(rx));

        Self { commands, engine }
    }

    /// Submit a request
    ///
    /// If `request` has the id of the request currently playing, this acts
    /// as a toggle: playback stops, the queue is cleared, and nothing new
    /// is enqueued.
    pub fn speak(&self, request: SpeechRequest) -> SpeechCompletion {
        let (tx, rx) = oneshot::channel();
        // On failure the sender is dropped and the completion reports it
        let _ = self.commands.send(Command::Speak(request, tx));
        SpeechCompletion { rx }
    }

    /// Stop the active utterance and move on to the next one
    ///
    /// Returns whether anything was playing. Playback has been stopped by
    /// the time this returns.
    pub async fn cancel_current(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::CancelCurrent(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Drop all queued requests and stop active playback
    pub async fn clear(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Clear(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Current queue contents
    pub async fn snapshot(&self) -> QueueSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(tx)).is_err() {
            return QueueSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Voices offered by the engine, never empty
    #[must_use]
    pub fn voices(&self) -> Vec<Voice> {
        let voices = self.engine.voices();
        if voices.is_empty() {
            vec![Voice::fallback()]
        } else {
            voices
        }
    }
}

impl std::fmt::Debug for SpeechQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechQueue").finish_non_exhaustive()
    }
}

struct Pending {
    request: SpeechRequest,
    reply: oneshot::Sender<Result<SpeechOutcome>>,
}

struct Actor {
    engine: Arc<dyn SpeechEngine>,
    queue: VecDeque<Pending>,
    active: Option<Pending>,
    playback: Option<BoxFuture<'static, Result<()>>>,
    events: Option<mpsc::UnboundedSender<SpeechEvent>>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Speak(request, reply)) => self.submit(request, reply),
                    Some(Command::CancelCurrent(ack)) => {
                        let cancelled = self.stop_active();
                        self.advance();
                        let _ = ack.send(cancelled);
                    }
                    Some(Command::Clear(ack)) => {
                        self.clear();
                        let _ = ack.send(());
                    }
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    None => break,
                },
                result = next_playback(&mut self.playback), if self.playback.is_some() => {
                    self.playback = None;
                    self.finish(result);
                    self.advance();
                }
            }
        }

        self.clear();
    }

    fn emit(&self, event: SpeechEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn submit(&mut self, request: SpeechRequest, reply: oneshot::Sender<Result<SpeechOutcome>>) {
        if !self.engine.is_supported() {
            let _ = reply.send(Err(Error::SynthesisUnsupported));
            return;
        }

        let is_active = self
            .active
            .as_ref()
            .is_some_and(|active| active.request.id == request.id);
        if is_active {
            tracing::debug!(id = %request.id, "re-submitted active request, stopping speech");
            self.clear();
            let _ = reply.send(Ok(SpeechOutcome::Cancelled));
            return;
        }

        tracing::debug!(id = %request.id, queued = self.queue.len(), "speech request queued");
        self.queue.push_back(Pending { request, reply });
        self.advance();
    }

    fn advance(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(mut next) = self.queue.pop_front() else {
            return;
        };

        if let Some(name) = next.request.voice.as_deref() {
            if !self.engine.voices().iter().any(|v| v.name == name) {
                tracing::debug!(voice = name, "voice not available, using engine default");
                next.request.voice = None;
            }
        }

        let engine = Arc::clone(&self.engine);
        let request = next.request.clone();
        self.playback = Some(Box::pin(async move { engine.speak(&request).await }));

        tracing::debug!(id = %next.request.id, "speech started");
        self.emit(SpeechEvent::Started {
            id: next.request.id.clone(),
        });
        self.active = Some(next);
    }

    fn finish(&mut self, result: Result<()>) {
        let Some(active) = self.active.take() else {
            return;
        };
        let id = active.request.id;

        match result {
            Ok(()) => {
                tracing::debug!(%id, "speech completed");
                self.emit(SpeechEvent::Finished {
                    id,
                    outcome: SpeechOutcome::Completed,
                });
                let _ = active.reply.send(Ok(SpeechOutcome::Completed));
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "speech synthesis failed");
                self.emit(SpeechEvent::Failed {
                    id,
                    error: e.to_string(),
                });
                let _ = active.reply.send(Err(e));
            }
        }
    }

    /// Stop the active request without starting the next
    fn stop_active(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };

        self.playback = None;
        self.engine.stop();

        let id = active.request.id;
        tracing::debug!(%id, "speech cancelled");
        self.emit(SpeechEvent::Finished {
            id,
            outcome: SpeechOutcome::Cancelled,
        });
        let _ = active.reply.send(Ok(SpeechOutcome::Cancelled));
        true
    }

    fn clear(&mut self) {
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Ok(SpeechOutcome::Cancelled));
        }
        self.stop_active();
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            active: self.active.as_ref().map(|p| p.request.id.clone()),
            queued: self.queue.iter().map(|p| p.request.id.clone()).collect(),
        }
    }
}

async fn next_playback(playback: &mut Option<BoxFuture<'static, Result<()>>>) -> Result<()> {
    match playback {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}
