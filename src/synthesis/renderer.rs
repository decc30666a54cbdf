//! TTS-backed renderer: HTTP synthesis, MP3 decode, cpal playback

use std::sync::Arc;

use async_trait::async_trait;

use super::SpeechRenderer;
use crate::voice::{AudioPlayback, TextToSpeech};
use crate::{Error, Result};

/// Speaks sentences through a TTS provider and the default speakers
pub struct TtsRenderer {
    tts: TextToSpeech,
    playback: Arc<AudioPlayback>,
}

impl TtsRenderer {
    #[must_use]
    pub fn new(tts: TextToSpeech, playback: AudioPlayback) -> Self {
        Self {
            tts,
            playback: Arc::new(playback),
        }
    }
}

#[async_trait]
impl SpeechRenderer for TtsRenderer {
    async fn speak(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        // Taken before synthesis so a stop during the request or decode cancels
        let started = self.playback.snapshot();
        let mp3 = self.tts.synthesize(text).await?;
        if self.playback.is_stopped(started) {
            tracing::debug!("sentence stopped before playback");
            return Ok(());
        }

        let playback = Arc::clone(&self.playback);
        tokio::task::spawn_blocking(move || playback.play_mp3_blocking(&mp3, started))
            .await
            .map_err(|e| Error::Playback(e.to_string()))?
    }

    fn stop(&self) {
        self.playback.stop();
    }
}
