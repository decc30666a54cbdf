//! Configuration management
//!
//! Precedence: environment > TOML file > defaults.

pub mod file;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

pub use file::{ConfigFile, config_file_path, load_config_file, parse_config};

/// Default streaming chat endpoint
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3000/api/chat-stream";

/// Assistant turn appended when a reply cannot be produced
pub const DEFAULT_APOLOGY: &str = "Sorry, I encountered an issue. Please try again.";

/// Speech-to-text provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    #[default]
    Whisper,
    Deepgram,
}

impl fmt::Display for SttProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Whisper => f.write_str("whisper"),
            Self::Deepgram => f.write_str("deepgram"),
        }
    }
}

impl FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// Text-to-speech provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    ElevenLabs,
}

impl fmt::Display for TtsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAi => f.write_str("openai"),
            Self::ElevenLabs => f.write_str("elevenlabs"),
        }
    }
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub voice: VoiceConfig,
    pub capture: CaptureConfig,
    pub session: SessionConfig,
    pub api_keys: ApiKeys,
}

/// Generation backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub page_context: Option<String>,
    /// Bound on the wait for response headers
    pub request_timeout: Duration,
}

/// Speech providers
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub stt_provider: SttProvider,
    pub stt_model: String,
    pub tts_provider: TtsProvider,
    pub tts_model: String,
    pub tts_voice: String,
    /// Speed multiplier, 0.25 to 4.0 (OpenAI only)
    pub tts_speed: f32,
    pub language: String,
}

/// Microphone capture
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub no_speech_timeout: Duration,
    pub volume_smoothing: f32,
}

/// Conversation session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Begin the next voice turn automatically after each reply
    pub continuous: bool,
    pub max_session: Duration,
    pub apology_message: String,
    pub page_context: Option<String>,
    pub model: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            continuous: false,
            max_session: Duration::from_secs(60 * 60),
            apology_message: DEFAULT_APOLOGY.to_string(),
            page_context: None,
            model: None,
        }
    }
}

/// Provider API keys
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

impl Config {
    /// Load from the process environment and the config file
    ///
    /// `path` overrides the standard config file location.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if an environment override is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = load_config_file(path);
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with an environment lookup
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if an environment override is invalid
    pub fn from_sources<F>(fc: ConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let page_context = fc.backend.page_context;
        let model = env("VOICELOOP_MODEL").or(fc.backend.model);

        let backend = BackendConfig {
            url: env("VOICELOOP_BACKEND_URL")
                .or(fc.backend.url)
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            api_key: env("VOICELOOP_BACKEND_KEY").or(fc.backend.api_key),
            model: model.clone(),
            page_context: page_context.clone(),
            request_timeout: Duration::from_secs(positive(
                "backend.request_timeout_secs",
                fc.backend.request_timeout_secs.unwrap_or(30),
            )?),
        };

        let stt_provider = match env("VOICELOOP_STT_PROVIDER") {
            Some(value) => value.parse()?,
            None => fc.voice.stt_provider.unwrap_or_default(),
        };
        let tts_provider = match env("VOICELOOP_TTS_PROVIDER") {
            Some(value) => value.parse()?,
            None => fc.voice.tts_provider.unwrap_or_default(),
        };

        let voice = VoiceConfig {
            stt_provider,
            stt_model: env("VOICELOOP_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| default_stt_model(stt_provider).to_string()),
            tts_provider,
            tts_model: env("VOICELOOP_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| default_tts_model(tts_provider).to_string()),
            tts_voice: fc.voice.tts_voice.unwrap_or_else(|| "alloy".to_string()),
            tts_speed: fc.voice.tts_speed.unwrap_or(1.0).clamp(0.25, 4.0),
            language: fc.voice.language.unwrap_or_else(|| "en-GB".to_string()),
        };

        let capture = CaptureConfig {
            no_speech_timeout: Duration::from_millis(
                fc.capture.no_speech_timeout_ms.unwrap_or(8000),
            ),
            volume_smoothing: fc.capture.volume_smoothing.unwrap_or(0.8).clamp(0.0, 1.0),
        };

        let continuous = match env("VOICELOOP_CONTINUOUS") {
            Some(value) => parse_bool(&value)?,
            None => fc.session.continuous.unwrap_or(false),
        };

        let max_session_minutes = positive(
            "session.max_session_minutes",
            fc.session.max_session_minutes.unwrap_or(60),
        )?;

        let session = SessionConfig {
            continuous,
            max_session: Duration::from_secs(max_session_minutes.saturating_mul(60)),
            apology_message: fc
                .session
                .apology_message
                .unwrap_or_else(|| DEFAULT_APOLOGY.to_string()),
            page_context,
            model,
        };

        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai),
            deepgram: env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
            elevenlabs: env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
        };

        Ok(Self {
            backend,
            voice,
            capture,
            session,
            api_keys,
        })
    }

    /// Key for the selected STT provider
    #[must_use]
    pub fn stt_key(&self) -> Option<&str> {
        match self.voice.stt_provider {
            SttProvider::Whisper => self.api_keys.openai.as_deref(),
            SttProvider::Deepgram => self.api_keys.deepgram.as_deref(),
        }
    }

    /// Key for the selected TTS provider
    #[must_use]
    pub fn tts_key(&self) -> Option<&str> {
        match self.voice.tts_provider {
            TtsProvider::OpenAi => self.api_keys.openai.as_deref(),
            TtsProvider::ElevenLabs => self.api_keys.elevenlabs.as_deref(),
        }
    }

    /// Check that the selected speech providers have keys
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first provider without a key
    pub fn validate_voice(&self) -> Result<()> {
        if self.stt_key().is_none_or(str::is_empty) {
            return Err(Error::Config(format!(
                "no API key for STT provider {}",
                self.voice.stt_provider
            )));
        }
        if self.tts_key().is_none_or(str::is_empty) {
            return Err(Error::Config(format!(
                "no API key for TTS provider {}",
                self.voice.tts_provider
            )));
        }
        Ok(())
    }
}

const fn default_stt_model(provider: SttProvider) -> &'static str {
    match provider {
        SttProvider::Whisper => "whisper-1",
        SttProvider::Deepgram => "nova-2",
    }
}

const fn default_tts_model(provider: TtsProvider) -> &'static str {
    match provider {
        TtsProvider::OpenAi => "tts-1",
        TtsProvider::ElevenLabs => "eleven_monolingual_v1",
    }
}

/// Reject zero for settings where it would end work before it starts
fn positive(key: &str, value: u64) -> Result<u64> {
    if value == 0 {
        return Err(Error::Config(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Config(format!("invalid boolean: {other}"))),
    }
}
