//! Speech-to-text over HTTP

use serde::Deserialize;

use crate::config::SttProvider;
use crate::{Error, Result};

#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
}

#[derive(Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Transcribes WAV utterances
pub struct SpeechToText {
    client: reqwest::Client,
    provider: SttProvider,
    api_key: String,
    model: String,
    language: String,
}

impl SpeechToText {
    /// Create a transcriber for `provider`
    ///
    /// `language` is a BCP-47 tag such as `en-GB`; Whisper only receives the
    /// primary subtag.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the API key is empty
    pub fn new(
        provider: SttProvider,
        api_key: String,
        model: String,
        language: String,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(format!("{provider} API key required for STT")));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            provider,
            api_key,
            model,
            language,
        })
    }

    /// Transcribe WAV bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::Stt` on a non-2xx response, or `Error::Http` if the
    /// request fails
    pub async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(provider = %self.provider, bytes = wav.len(), "transcribing utterance");

        let transcript = match self.provider {
            SttProvider::Whisper => self.whisper(wav).await?,
            SttProvider::Deepgram => self.deepgram(wav).await?,
        };

        tracing::debug!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }

    async fn whisper(&self, wav: &[u8]) -> Result<String> {
        let file = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Stt(e.to_string()))?;

        let primary = self.language.split('-').next().unwrap_or_default();
        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.model.clone());
        if !primary.is_empty() {
            form = form.text("language", primary.to_lowercase());
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let parsed: WhisperResponse = response.json().await?;
        Ok(parsed.text)
    }

    async fn deepgram(&self, wav: &[u8]) -> Result<String> {
        let response = self
            .client
            .post("https://api.deepgram.com/v1/listen")
            .query(&[
                ("model", self.model.as_str()),
                ("language", self.language.as_str()),
                ("punctuate", "true"),
            ])
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(wav.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let parsed: DeepgramResponse = response.json().await?;
        Ok(parsed
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default())
    }
}
