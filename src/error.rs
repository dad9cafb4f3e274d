//! Error types for the Aura client

use thiserror::Error;

/// Result type alias for Aura client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Aura client
///
/// The core only classifies and reports; rendering a notification for a
/// surfaced error is left to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone access was refused
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable audio device
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Malformed or unrecognised transcript frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transcription service reported an error frame
    #[error("STT error: {0}")]
    Stt(String),

    /// Reconnect attempts used up; the transport stays closed
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted {
        /// Number of reconnects attempted before giving up
        attempts: u32,
    },

    /// Socket-level transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Command sent to a transport or queue that has shut down
    #[error("transport closed")]
    TransportClosed,

    /// No speech engine is available
    #[error("speech synthesis not supported")]
    SynthesisUnsupported,

    /// Speech engine failed to speak an utterance
    #[error("speech synthesis error: {0}")]
    Synthesis(String),

    /// Session or stateless remote call failed
    #[error("remote call failed: {0}")]
    RemoteCall(String),

    /// Session path probe failed
    #[error("availability check failed: {0}")]
    AvailabilityCheck(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the error ends the operation it came from for good
    ///
    /// Device and permission errors end the current capture attempt, and
    /// reconnect exhaustion ends the transport.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::DeviceUnavailable(_) | Self::ReconnectExhausted { .. }
        )
    }
}
