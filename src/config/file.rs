//! TOML configuration file loading
//!
//! Supports `~/.config/aura/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct AuraConfigFile {
    /// Remote endpoints
    #[serde(default)]
    pub endpoints: EndpointsFileConfig,

    /// Transcription reconnect policy
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,

    /// Microphone capture
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Chat defaults sent with every message
    #[serde(default)]
    pub chat: ChatFileConfig,

    /// Speech synthesis defaults
    #[serde(default)]
    pub speech: SpeechFileConfig,
}

/// Endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct EndpointsFileConfig {
    /// Stateless API base URL (e.g. "http://localhost:8000")
    pub api_base_url: Option<String>,

    /// Transcription WebSocket URL (e.g. "ws://localhost:8000/ws/voice")
    pub transcription_url: Option<String>,

    /// Hosted inference space ("owner/name" or a full URL)
    pub space: Option<String>,
}

/// Reconnect policy overrides
#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Capture overrides
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Milliseconds between emitted chunks
    pub chunk_interval_ms: Option<u64>,
    pub sample_rate: Option<u32>,
}

/// Chat defaults
#[derive(Debug, Default, Deserialize)]
pub struct ChatFileConfig {
    pub system_message: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
}

/// Speech defaults
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// Voice name; unknown names fall back to the engine default
    pub voice: Option<String>,
    pub rate: Option<f32>,
    pub pitch: Option<f32>,
    pub volume: Option<f32>,
}

/// Load the TOML config file from the standard path
///
/// Returns `AuraConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> AuraConfigFile {
    let Some(path) = config_file_path() else {
        return AuraConfigFile::default();
    };

    if !path.exists() {
        return AuraConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            AuraConfigFile::default()
        }
    }
}

/// Read and parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<AuraConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path
///
/// `AURA_CONFIG` wins; otherwise `~/.config/aura/config.toml` on Linux
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("AURA_CONFIG") {
        return Some(PathBuf::from(path));
    }

    directories::ProjectDirs::from("dev", "aura", "aura").map(|d| d.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let file: AuraConfigFile = toml::from_str(
            r#"
            [endpoints]
            space = "owner/space"

            [reconnect]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(file.endpoints.space.as_deref(), Some("owner/space"));
        assert!(file.endpoints.api_base_url.is_none());
        assert_eq!(file.reconnect.max_attempts, Some(3));
        assert!(file.chat.temperature.is_none());
    }

    #[test]
    fn empty_file_is_default() {
        let file: AuraConfigFile = toml::from_str("").unwrap();
        assert!(file.speech.voice.is_none());
        assert!(file.capture.chunk_interval_ms.is_none());
    }

    #[test]
    fn read_config_file_reports_bad_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[endpoints\nspace = 1").unwrap();

        assert!(matches!(read_config_file(&path), Err(crate::Error::Toml(_))));
    }
}
