//! TOML configuration file loading
//!
//! Reads `~/.config/voiceloop/config.toml` as a persistent config source.
//! Every field is optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{SttProvider, TtsProvider};
use crate::Result;

/// Top-level TOML schema
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub backend: BackendFileConfig,
    pub voice: VoiceFileConfig,
    pub capture: CaptureFileConfig,
    pub session: SessionFileConfig,
    pub api_keys: ApiKeysFileConfig,
}

/// Generation backend
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackendFileConfig {
    /// Streaming chat endpoint
    pub url: Option<String>,
    /// Bearer token for the endpoint
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Context string forwarded as `pageContext`
    pub page_context: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

/// Speech providers
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VoiceFileConfig {
    pub stt_provider: Option<SttProvider>,
    /// e.g. "whisper-1", "nova-2"
    pub stt_model: Option<String>,
    pub tts_provider: Option<TtsProvider>,
    /// e.g. "tts-1", "eleven_monolingual_v1"
    pub tts_model: Option<String>,
    /// Voice name (OpenAI) or voice id (ElevenLabs)
    pub tts_voice: Option<String>,
    pub tts_speed: Option<f32>,
    /// BCP-47 recognition language
    pub language: Option<String>,
}

/// Microphone capture
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CaptureFileConfig {
    pub no_speech_timeout_ms: Option<u64>,
    pub volume_smoothing: Option<f32>,
}

/// Conversation session behavior
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SessionFileConfig {
    /// Start listening again after each reply
    pub continuous: Option<bool>,
    pub max_session_minutes: Option<u64>,
    pub apology_message: Option<String>,
}

/// Provider API keys
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Parse config file contents
///
/// # Errors
///
/// Returns `Error::Toml` if the contents are not valid for the schema
pub fn parse_config(content: &str) -> Result<ConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the config file from `path`, or the standard location
///
/// Returns `ConfigFile::default()` if the file is missing or unreadable.
#[must_use]
pub fn load_config_file(path: Option<&Path>) -> ConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return ConfigFile::default();
    };

    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file");
        return ConfigFile::default();
    }

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read config file");
            return ConfigFile::default();
        }
    };

    match parse_config(&content) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to parse config file, using defaults"
            );
            ConfigFile::default()
        }
    }
}

/// Standard config path: `~/.config/voiceloop/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voiceloop").join("config.toml"))
}
