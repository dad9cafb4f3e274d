//! Aura Client - realtime voice and model transport for the Aura assistant
//!
//! This library provides the client-side plumbing of the assistant:
//! - Microphone capture in fixed-cadence chunks
//! - A reconnecting duplex transport to the transcription service
//! - Queued, cancellable speech synthesis
//! - Chat routing between a hosted inference session and a stateless API
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   chunks   ┌─────────────────────┐  frames  ┌────────────┐
//! │ AudioCapture ├───────────►│ TranscriptTransport ├─────────►│  events    │
//! └──────────────┘            └─────────────────────┘          └────────────┘
//!
//! ┌──────────────┐            ┌─────────────────────┐          ┌────────────┐
//! │  send text   ├───────────►│ ModelTransportRouter├─────────►│ SpeechQueue│
//! └──────────────┘            │  session | stateless│  reply   └────────────┘
//!                             └─────────────────────┘
//! ```
//!
//! [`VoiceClient`] assembles all of these and reports everything on one
//! [`AssistantEvent`] channel.

pub mod client;
pub mod config;
pub mod error;
pub mod router;
pub mod voice;

pub use client::{AssistantEvent, VoiceClient, VoiceClientBuilder};
pub use config::Config;
pub use error::{Error, Result};
pub use router::{
    ApiClient, ChatOptions, ChatParams, ModelTransportRouter, Route, RoutedReply, RouterMode,
    SessionRpcClient,
};
pub use voice::{
    AudioCapture, ConnectionState, SpeechQueue, SpeechRequest, TranscriptTransport,
    TransportEvent,
};
