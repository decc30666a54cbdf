//! Error types for voiceloop

use thiserror::Error;

use crate::capture::CaptureErrorKind;

/// Result type alias for voiceloop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Capture service error
    #[error("capture error: {0}")]
    Capture(CaptureErrorKind),

    /// No speech recognition engine is available on this platform
    #[error("speech recognition is not supported on this platform")]
    NotSupported,

    /// Generation backend failure (non-2xx, broken stream, missing sentinel)
    #[error("network error: {0}")]
    Network(String),

    /// One or more sentence units failed to play
    #[error("playback error: {0}")]
    Playback(String),

    /// Operation was cancelled (barge-in or explicit stop)
    #[error("cancelled")]
    Cancelled,

    /// The conversation session has ended
    #[error("session closed")]
    SessionClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Human-readable message for the caller-facing error event
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NotSupported => {
                "Speech recognition is not supported on this device.".to_string()
            }
            Self::Capture(kind) => kind.user_message().to_string(),
            Self::Network(_) | Self::Http(_) => {
                "Network error. Please check your connection.".to_string()
            }
            Self::Playback(_) | Self::Tts(_) | Self::Audio(_) => {
                "Failed to play the audio response.".to_string()
            }
            Self::Stt(_) => "Failed to transcribe your speech. Please try again.".to_string(),
            Self::SessionClosed => "The voice session has ended.".to_string(),
            other => format!("Something went wrong: {other}"),
        }
    }

    /// Whether the error came from the network transport
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http(_))
    }
}
