//! Inbound transcript frame decoding

use serde::Deserialize;

use crate::{Error, Result};

/// Tagged frame sent by the transcription service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptFrame {
    /// Recognised text
    Transcript { text: String },
    /// Service-side failure
    Error { message: String },
}

impl TranscriptFrame {
    /// Decode a text frame
    ///
    /// Unknown tags, missing fields and non-JSON payloads are all
    /// reported as `Error::Protocol`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the payload is not a valid frame
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Protocol(format!("malformed frame: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transcript() {
        let frame = TranscriptFrame::parse(r#"{"type":"transcript","text":"hello"}"#).unwrap();
        assert_eq!(
            frame,
            TranscriptFrame::Transcript {
                text: "hello".to_string()
            }
        );
    }

    #[test]
    fn parses_error() {
        let frame = TranscriptFrame::parse(r#"{"type":"error","message":"model busy"}"#).unwrap();
        assert_eq!(
            frame,
            TranscriptFrame::Error {
                message: "model busy".to_string()
            }
        );
    }

    #[test]
    fn ignores_extra_fields() {
        let frame =
            TranscriptFrame::parse(r#"{"type":"transcript","text":"hi","final":true}"#).unwrap();
        assert!(matches!(frame, TranscriptFrame::Transcript { .. }));
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let err = TranscriptFrame::parse(r#"{"type":"bogus"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn missing_text_is_protocol_error() {
        let err = TranscriptFrame::parse(r#"{"type":"transcript"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn non_json_is_protocol_error() {
        assert!(matches!(
            TranscriptFrame::parse("not json"),
            Err(Error::Protocol(_))
        ));
    }
}
