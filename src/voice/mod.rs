//! Voice processing module
//!
//! Capture, the streaming transcription transport, and queued speech
//! synthesis.

mod capture;
mod device;
mod frame;
mod link;
mod playback;
mod reconnect;
mod speech;
mod transport;

pub use capture::{
    AudioCapture, AudioChunk, CaptureConstraints, CaptureStatus, Microphone, MicrophoneStream,
};
pub use device::{CpalMicrophone, samples_to_wav};
pub use frame::TranscriptFrame;
pub use link::{
    ABNORMAL_CLOSURE, Connector, Link, LinkEvent, NO_STATUS, NORMAL_CLOSURE, Outbound, WsConnector,
};
pub use playback::{DecodedAudio, RemoteSpeechEngine, decode_mp3, play_blocking};
pub use reconnect::ReconnectPolicy;
pub use speech::{
    QueueSnapshot, SpeechCompletion, SpeechEngine, SpeechEvent, SpeechOutcome, SpeechQueue,
    SpeechRequest, Voice, clamp_pitch, clamp_rate, clamp_volume,
};
pub use transport::{ConnectionState, TranscriptTransport, TransportEvent};
