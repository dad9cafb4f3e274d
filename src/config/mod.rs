//! Configuration management for the Aura client
//!
//! Values come from three layers, later ones winning: built-in defaults,
//! the TOML file (see [`file`]), then environment variables.

pub mod file;

use std::time::Duration;

use url::Url;

use crate::{Error, Result};
use file::AuraConfigFile;

/// Default stateless API base URL
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";

/// Default transcription WebSocket endpoint
pub const DEFAULT_TRANSCRIPTION_URL: &str = "ws://localhost:8000/ws/voice";

/// Default hosted inference space
pub const DEFAULT_SPACE: &str = "sreevarshan/aura-api";

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Default completion token limit
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Default nucleus sampling threshold
pub const DEFAULT_TOP_P: f64 = 0.95;

/// Aura client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Stateless API base URL (`/query`, `/execute`, `/status`, `/tts`)
    pub api_base_url: String,

    /// Transcription WebSocket endpoint
    pub transcription_url: String,

    /// Hosted inference space ("owner/name" or full URL)
    pub space: String,

    /// Transcription reconnect policy
    pub reconnect: ReconnectConfig,

    /// Microphone capture settings
    pub capture: CaptureConfig,

    /// Chat defaults
    pub chat: ChatConfig,

    /// Speech synthesis defaults
    pub speech: SpeechConfig,
}

/// Reconnect policy settings for the transcription transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Reconnects allowed before the failure becomes fatal
    pub max_attempts: u32,

    /// Delay unit doubled per attempt
    pub base_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

/// Microphone capture settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Cadence at which captured audio is emitted as a chunk
    pub chunk_interval: Duration,

    /// Requested device sample rate
    pub sample_rate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_interval: Duration::from_secs(1),
            sample_rate: 16_000,
        }
    }
}

/// Defaults applied to outgoing chat messages
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub system_message: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_message: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: DEFAULT_TOP_P,
        }
    }
}

/// Defaults applied to speech requests built by the client
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechConfig {
    pub voice: Option<String>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            voice: None,
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            transcription_url: DEFAULT_TRANSCRIPTION_URL.to_string(),
            space: DEFAULT_SPACE.to_string(),
            reconnect: ReconnectConfig::default(),
            capture: CaptureConfig::default(),
            chat: ChatConfig::default(),
            speech: SpeechConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a resulting value is invalid
    pub fn load() -> Result<Self> {
        Self::load_with(|_| {})
    }

    /// Load configuration, letting the caller override values before they
    /// are validated
    ///
    /// # Errors
    ///
    /// Returns error if a resulting value is invalid
    pub fn load_with(overrides: impl FnOnce(&mut Self)) -> Result<Self> {
        Self::from_sources_with(
            file::load_config_file(),
            |key| std::env::var(key).ok(),
            overrides,
        )
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a URL is malformed or a numeric override doesn't parse
    pub fn from_sources(
        file: AuraConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        Self::from_sources_with(file, env, |_| {})
    }

    /// Like [`Config::from_sources`], applying `overrides` last
    ///
    /// # Errors
    ///
    /// Returns error if a URL is malformed or a numeric override doesn't parse
    pub fn from_sources_with(
        file: AuraConfigFile,
        env: impl Fn(&str) -> Option<String>,
        overrides: impl FnOnce(&mut Self),
    ) -> Result<Self> {
        let defaults = Self::default();

        let api_base_url = env("AURA_API_URL")
            .or(file.endpoints.api_base_url)
            .unwrap_or(defaults.api_base_url);
        let transcription_url = env("AURA_WS_URL")
            .or(file.endpoints.transcription_url)
            .unwrap_or(defaults.transcription_url);
        let space = env("AURA_GRADIO_SPACE")
            .or(file.endpoints.space)
            .unwrap_or(defaults.space);

        let reconnect = ReconnectConfig {
            max_attempts: parse_env(&env, "AURA_RECONNECT_MAX_ATTEMPTS")?
                .or(file.reconnect.max_attempts)
                .unwrap_or(defaults.reconnect.max_attempts),
            base_delay: parse_env(&env, "AURA_RECONNECT_BASE_DELAY_MS")?
                .or(file.reconnect.base_delay_ms)
                .map_or(defaults.reconnect.base_delay, Duration::from_millis),
            max_delay: file
                .reconnect
                .max_delay_ms
                .map_or(defaults.reconnect.max_delay, Duration::from_millis),
        };

        let capture = CaptureConfig {
            chunk_interval: parse_env(&env, "AURA_CHUNK_INTERVAL_MS")?
                .or(file.capture.chunk_interval_ms)
                .map_or(defaults.capture.chunk_interval, Duration::from_millis),
            sample_rate: file
                .capture
                .sample_rate
                .unwrap_or(defaults.capture.sample_rate),
        };

        let chat = ChatConfig {
            system_message: env("AURA_SYSTEM_MESSAGE")
                .or(file.chat.system_message)
                .unwrap_or(defaults.chat.system_message),
            temperature: file.chat.temperature.unwrap_or(defaults.chat.temperature),
            max_tokens: file.chat.max_tokens.unwrap_or(defaults.chat.max_tokens),
            top_p: file.chat.top_p.unwrap_or(defaults.chat.top_p),
        };

        let speech = SpeechConfig {
            voice: env("AURA_TTS_VOICE").or(file.speech.voice),
            rate: file.speech.rate.unwrap_or(defaults.speech.rate),
            pitch: file.speech.pitch.unwrap_or(defaults.speech.pitch),
            volume: file.speech.volume.unwrap_or(defaults.speech.volume),
        };

        let mut config = Self {
            api_base_url,
            transcription_url,
            space,
            reconnect,
            capture,
            chat,
            speech,
        };
        overrides(&mut config);
        config.api_base_url = config.api_base_url.trim_end_matches('/').to_string();
        config.validate()?;

        Ok(config)
    }

    /// Check URL schemes and intervals
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        check_scheme("api_base_url", &self.api_base_url, &["http", "https"])?;
        check_scheme("transcription_url", &self.transcription_url, &["ws", "wss"])?;

        if self.space.trim().is_empty() {
            return Err(Error::Config("space must not be empty".to_string()));
        }

        if self.capture.chunk_interval.is_zero() {
            return Err(Error::Config(
                "capture chunk interval must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_scheme(field: &str, value: &str, schemes: &[&str]) -> Result<()> {
    let url = Url::parse(value).map_err(|e| Error::Config(format!("{field}: {e}")))?;

    if !schemes.contains(&url.scheme()) {
        return Err(Error::Config(format!(
            "{field}: unsupported scheme '{}' (expected {})",
            url.scheme(),
            schemes.join(" or ")
        )));
    }

    Ok(())
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key}: invalid value '{raw}'")))
        })
        .transpose()
}
