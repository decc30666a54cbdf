//! Text-to-speech over HTTP

use serde::Serialize;

use crate::config::TtsProvider;
use crate::{Error, Result};

/// Synthesizes a sentence into MP3 bytes
pub struct TextToSpeech {
    client: reqwest::Client,
    provider: TtsProvider,
    api_key: String,
    model: String,
    voice: String,
    speed: f32,
}

impl TextToSpeech {
    /// Create a synthesizer for `provider`
    ///
    /// For ElevenLabs, `voice` is the voice id and `speed` is ignored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the API key is empty
    pub fn new(
        provider: TtsProvider,
        api_key: String,
        model: String,
        voice: String,
        speed: f32,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(format!("{provider} API key required for TTS")));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            provider,
            api_key,
            model,
            voice,
            speed,
        })
    }

    /// Synthesize `text`, returning MP3 audio
    ///
    /// # Errors
    ///
    /// Returns `Error::Tts` on a non-2xx response, or `Error::Http` if the
    /// request fails
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let request = match self.provider {
            TtsProvider::OpenAi => {
                #[derive(Serialize)]
                struct Body<'a> {
                    model: &'a str,
                    input: &'a str,
                    voice: &'a str,
                    speed: f32,
                    response_format: &'static str,
                }

                self.client
                    .post("https://api.openai.com/v1/audio/speech")
                    .bearer_auth(&self.api_key)
                    .json(&Body {
                        model: &self.model,
                        input: text,
                        voice: &self.voice,
                        speed: self.speed,
                        response_format: "mp3",
                    })
            }
            TtsProvider::ElevenLabs => {
                #[derive(Serialize)]
                struct Body<'a> {
                    text: &'a str,
                    model_id: &'a str,
                }

                self.client
                    .post(format!(
                        "https://api.elevenlabs.io/v1/text-to-speech/{}",
                        self.voice
                    ))
                    .header("xi-api-key", &self.api_key)
                    .header("Accept", "audio/mpeg")
                    .json(&Body {
                        text,
                        model_id: &self.model,
                    })
            }
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("{} TTS error {status}: {body}", self.provider)));
        }

        let audio = response.bytes().await?;
        tracing::debug!(chars = text.len(), bytes = audio.len(), "synthesized sentence");
        Ok(audio.to_vec())
    }
}
