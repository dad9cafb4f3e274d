//! Voice assistant client
//!
//! [`VoiceClient`] wires capture, the transcript transport, the model router
//! and the speech queue together. Everything it observes is reported on a
//! single [`AssistantEvent`] channel handed out at construction.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::router::{
    ApiClient, ChatOptions, ExecuteResponse, ModelTransportRouter, RoutedReply, StatusResponse,
};
use crate::voice::{
    AudioCapture, CaptureStatus, ConnectionState, Connector, CpalMicrophone, Microphone,
    RemoteSpeechEngine, SpeechCompletion, SpeechEngine, SpeechEvent, SpeechQueue, SpeechRequest,
    TranscriptTransport, TransportEvent, WsConnector,
};
use crate::{Error, Result};

/// Capacity of the chunk channel between capture and transport
const CHUNK_BUFFER: usize = 32;

/// Something the client wants the caller to know about
#[derive(Debug)]
pub enum AssistantEvent {
    /// Recognised speech from the transcription service
    Transcript(String),
    /// A surfaced error; `Error::is_fatal` marks ones that ended listening
    Error(Error),
    /// Transcription connection state changed
    Connection(ConnectionState),
    /// Speech playback progress
    Speech(SpeechEvent),
}

/// Builder for [`VoiceClient`]
///
/// Unset resources default to the real devices and network clients.
#[must_use]
pub struct VoiceClientBuilder {
    config: Config,
    microphone: Option<Arc<dyn Microphone>>,
    connector: Option<Arc<dyn Connector>>,
    speech_engine: Option<Arc<dyn SpeechEngine>>,
    router: Option<ModelTransportRouter>,
}

impl VoiceClientBuilder {
    pub fn microphone(mut self, microphone: Arc<dyn Microphone>) -> Self {
        self.microphone = Some(microphone);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn speech_engine(mut self, engine: Arc<dyn SpeechEngine>) -> Self {
        self.speech_engine = Some(engine);
        self
    }

    pub fn router(mut self, router: ModelTransportRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Build the client and its event stream
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configured API URL is invalid
    pub fn build(self) -> Result<(VoiceClient, mpsc::UnboundedReceiver<AssistantEvent>)> {
        let api = ApiClient::new(&self.config.api_base_url)?;
        let (events, events_rx) = mpsc::unbounded_channel();

        let microphone = self
            .microphone
            .unwrap_or_else(|| Arc::new(CpalMicrophone));
        let connector = self.connector.unwrap_or_else(|| Arc::new(WsConnector));
        let engine = self
            .speech_engine
            .unwrap_or_else(|| Arc::new(RemoteSpeechEngine::new(api.clone())));
        let router = match self.router {
            Some(router) => router,
            None => ModelTransportRouter::from_config(&self.config, api.clone()),
        };

        let (speech_tx, speech_rx) = mpsc::unbounded_channel();
        let speech = SpeechQueue::with_events(engine, speech_tx);
        tokio::spawn(forward(speech_rx, events.clone(), AssistantEvent::Speech));

        let client = VoiceClient {
            capture: AudioCapture::new(microphone, self.config.capture),
            config: self.config,
            connector,
            transport: None,
            pump: None,
            router,
            api,
            speech,
            events,
        };

        Ok((client, events_rx))
    }
}

/// The assembled voice assistant client
pub struct VoiceClient {
    config: Config,
    capture: AudioCapture,
    connector: Arc<dyn Connector>,
    transport: Option<Arc<TranscriptTransport>>,
    pump: Option<JoinHandle<()>>,
    router: ModelTransportRouter,
    api: ApiClient,
    speech: SpeechQueue,
    events: mpsc::UnboundedSender<AssistantEvent>,
}

impl VoiceClient {
    pub fn builder(config: Config) -> VoiceClientBuilder {
        VoiceClientBuilder {
            config,
            microphone: None,
            connector: None,
            speech_engine: None,
            router: None,
        }
    }

    /// Open the transcription connection and start streaming microphone audio
    ///
    /// The transport is created on first use and again after it has shut
    /// down. A second call while listening is a no-op.
    ///
    /// Capture keeps running after the transport gives up reconnecting
    /// (`Error::ReconnectExhausted` on the event channel): the microphone stays
    /// held and its audio is discarded, and this returns
    /// `CaptureStatus::AlreadyActive` until [`VoiceClient::stop_listening`]
    /// releases the device. Call `stop_listening` then `start_listening` to
    /// reconnect.
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` or `Error::DeviceUnavailable` if the
    /// microphone cannot be acquired; the connection is closed again
    pub async fn start_listening(&mut self) -> Result<CaptureStatus> {
        if self.capture.is_capturing() {
            return Ok(CaptureStatus::AlreadyActive);
        }

        let transport = self.transport();
        transport.connect()?;

        let (sink, mut chunks) = mpsc::channel(CHUNK_BUFFER);
        if let Err(e) = self.capture.start(sink) {
            tracing::warn!(error = %e, "microphone unavailable, closing transcription");
            self.close_transport().await;
            return Err(e);
        }

        let forward_to = Arc::clone(&transport);
        self.pump = Some(tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                forward_to.send(chunk.data);
            }
        }));

        tracing::info!(url = %self.config.transcription_url, "listening");
        Ok(CaptureStatus::Started)
    }

    fn transport(&mut self) -> Arc<TranscriptTransport> {
        if let Some(transport) = self.transport.as_ref().filter(|t| !t.is_finished()) {
            return Arc::clone(transport);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(TranscriptTransport::spawn(
            self.config.transcription_url.clone(),
            Arc::clone(&self.connector),
            self.config.reconnect,
            tx,
        ));
        tokio::spawn(forward(rx, self.events.clone(), |event| match event {
            TransportEvent::Transcript(text) => AssistantEvent::Transcript(text),
            TransportEvent::Error(e) => AssistantEvent::Error(e),
            TransportEvent::StateChanged(state) => AssistantEvent::Connection(state),
        }));

        self.transport = Some(Arc::clone(&transport));
        transport
    }

    /// Stop capturing and close the transcription connection normally
    ///
    /// The last partial chunk is sent before the connection closes.
    pub async fn stop_listening(&mut self) {
        self.capture.stop();
        if let Some(pump) = self.pump.take() {
            // Ends once the flushed chunk has been forwarded
            let _ = pump.await;
        }
        self.close_transport().await;
    }

    async fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
            tracing::info!("stopped listening");
        }
    }

    /// Whether the microphone is being captured
    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.capture.is_capturing()
    }

    /// Transcription connection state; `Idle` before the first listen
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.transport
            .as_ref()
            .map_or(ConnectionState::Idle, |t| t.state())
    }

    /// Send a chat message, optionally speaking the reply
    ///
    /// # Errors
    ///
    /// Returns the router's error if no path produced a reply
    pub async fn send_message(
        &self,
        text: &str,
        options: &ChatOptions,
        speak: bool,
    ) -> Result<RoutedReply> {
        let reply = self.router.send_message(text, options).await?;
        tracing::debug!(route = %reply.route, chars = reply.text.len(), "reply received");

        if speak {
            // Progress and failures arrive as speech events
            drop(self.speak(&reply.text));
        }
        Ok(reply)
    }

    /// Queue text for speech with the configured voice settings
    pub fn speak(&self, text: &str) -> SpeechCompletion {
        self.speech
            .speak(SpeechRequest::from_config(text, &self.config.speech))
    }

    /// Queue a fully specified speech request
    pub fn speak_request(&self, request: SpeechRequest) -> SpeechCompletion {
        self.speech.speak(request)
    }

    /// Stop speaking and drop anything queued
    pub async fn stop_speaking(&self) {
        self.speech.clear().await;
    }

    /// Probe the session path, re-enabling it on success
    ///
    /// # Errors
    ///
    /// Returns `Error::AvailabilityCheck` if the probe fails
    pub async fn check_availability(&self) -> Result<()> {
        self.router.check_availability().await
    }

    /// Backend status
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteCall` or an HTTP error
    pub async fn status(&self) -> Result<StatusResponse> {
        self.api.status().await
    }

    /// Run an assistant command on the backend
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteCall` or an HTTP error
    pub async fn execute(&self, command: &str, use_jarvis: bool) -> Result<ExecuteResponse> {
        self.api.execute(command, use_jarvis).await
    }

    #[must_use]
    pub const fn router(&self) -> &ModelTransportRouter {
        &self.router
    }

    #[must_use]
    pub const fn speech(&self) -> &SpeechQueue {
        &self.speech
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }
}

impl std::fmt::Debug for VoiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceClient")
            .field("capture", &self.capture)
            .field("transport", &self.transport)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

/// Relay one event source into the client channel, preserving order
async fn forward<T>(
    mut source: mpsc::UnboundedReceiver<T>,
    sink: mpsc::UnboundedSender<AssistantEvent>,
    wrap: impl Fn(T) -> AssistantEvent,
) {
    while let Some(event) = source.recv().await {
        if sink.send(wrap(event)).is_err() {
            break;
        }
    }
}
