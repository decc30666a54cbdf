//! Generation backend client
//!
//! Sends the conversation history to a streaming chat endpoint and yields the
//! reply as it arrives, one [`StreamChunk`] per server-sent frame.

mod sse;

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Serialize;

pub use sse::SseDecoder;

use crate::transcript::{ConversationTurn, Role};
use crate::{Error, Result};

/// One decoded piece of the streamed reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub delta: String,
}

/// Message in the request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&ConversationTurn> for ChatMessage {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

/// Body of a streaming generation request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    /// Asks the backend for short, speakable replies
    pub voice: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl GenerationRequest {
    /// Voice-mode request carrying the full history
    #[must_use]
    pub fn voice(history: &[ConversationTurn]) -> Self {
        Self {
            messages: history.iter().map(ChatMessage::from).collect(),
            voice: true,
            page_context: None,
            model: None,
        }
    }
}

/// Stream of reply chunks; ends after the last chunk or with an error
pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// A language-generation service that streams its reply
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Open a reply stream for `request`
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or is rejected
    async fn open_stream(&self, request: GenerationRequest) -> Result<ChunkStream>;
}

/// HTTP + server-sent events backend
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpBackend {
    /// Create a backend posting to `url`
    ///
    /// `timeout` bounds the wait for response headers, not the stream.
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            timeout,
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn open_stream(&self, request: GenerationRequest) -> Result<ChunkStream> {
        tracing::debug!(
            url = %self.url,
            messages = request.messages.len(),
            "opening reply stream"
        );

        let mut builder = self
            .client
            .post(&self.url)
            .header("Accept", "text/event-stream")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| {
                Error::Network(format!(
                    "no response within {}s",
                    self.timeout.as_secs_f32()
                ))
            })??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "generation backend rejected request");
            return Err(Error::Network(format!("backend returned {status}")));
        }

        Ok(decode_body(response.bytes_stream()))
    }
}

/// Turn a raw byte stream into reply chunks
///
/// The stream yields an error if the body fails mid-way or ends without the
/// completion marker.
pub fn decode_body<S, B, E>(body: S) -> ChunkStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    struct State<S> {
        body: S,
        decoder: SseDecoder,
        ready: std::collections::VecDeque<Result<StreamChunk>>,
        finished: bool,
    }

    let state = State {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        ready: std::collections::VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }

            match st.body.next().await {
                Some(Ok(bytes)) => {
                    st.ready
                        .extend(st.decoder.push(bytes.as_ref()).into_iter().map(Ok));
                    if st.decoder.is_done() {
                        st.finished = true;
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.ready
                        .push_back(Err(Error::Network(format!("reply stream failed: {e}"))));
                }
                None => {
                    st.finished = true;
                    match st.decoder.finish() {
                        Ok(tail) => st.ready.extend(tail.into_iter().map(Ok)),
                        Err(e) => st.ready.push_back(Err(e)),
                    }
                }
            }
        }
    })
    .boxed()
}
