//! Server-sent event decoding for the reply stream

use serde::Deserialize;

use super::StreamChunk;
use crate::{Error, Result};

/// End-of-stream sentinel payload
const DONE: &str = "[DONE]";

/// Either the plain `{"delta": ".."}` frame or an OpenAI-style chunk
#[derive(Deserialize)]
#[serde(untagged)]
enum Frame {
    Plain { delta: String },
    Choices { choices: Vec<Choice> },
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    delta: ChoiceDelta,
}

#[derive(Default, Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    content: Option<String>,
}

impl Frame {
    fn into_delta(self) -> Option<String> {
        match self {
            Self::Plain { delta } => Some(delta),
            Self::Choices { choices } => choices.into_iter().next()?.delta.content,
        }
    }
}

/// Incremental decoder for a `text/event-stream` body
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel has been seen
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw body bytes, returning the chunks completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        if self.done {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(chunk) = self.decode_line(&line) {
                chunks.push(chunk);
            }
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        chunks
    }

    /// Signal end of body, decoding any unterminated final line
    ///
    /// # Errors
    ///
    /// Returns `Error::Network` if the body ended without `[DONE]`
    pub fn finish(&mut self) -> Result<Vec<StreamChunk>> {
        let rest = std::mem::take(&mut self.buffer);
        let chunks = if self.done || rest.is_empty() {
            Vec::new()
        } else {
            self.decode_line(&rest).into_iter().collect()
        };

        if self.done {
            Ok(chunks)
        } else {
            Err(Error::Network(
                "reply stream ended without completion marker".to_string(),
            ))
        }
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<StreamChunk> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);

        let payload = line.strip_prefix("data:")?.trim_start();
        if payload == DONE {
            tracing::debug!("reply stream complete");
            self.done = true;
            return None;
        }
        if payload.is_empty() {
            return None;
        }

        match serde_json::from_str::<Frame>(payload) {
            Ok(frame) => frame
                .into_delta()
                .filter(|delta| !delta.is_empty())
                .map(|delta| StreamChunk { delta }),
            Err(e) => {
                tracing::warn!(frame = %payload, error = %e, "skipping malformed stream frame");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deltas(chunks: Vec<StreamChunk>) -> Vec<String> {
        chunks.into_iter().map(|c| c.delta).collect()
    }

    #[test]
    fn decodes_plain_and_choice_frames() {
        let mut decoder = SseDecoder::new();
        let body = concat!(
            "data: {\"delta\":\"The \"}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"postal rule\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        assert_eq!(deltas(decoder.push(body.as_bytes())), vec!["The ", "postal rule"]);
        assert!(decoder.is_done());
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn frames_split_across_pushes() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"del").is_empty());
        assert_eq!(deltas(decoder.push(b"ta\":\"hi\"}\r\n")), vec!["hi"]);
    }

    #[test]
    fn utf8_split_inside_character() {
        let mut decoder = SseDecoder::new();
        let line = "data: {\"delta\":\"café\"}\n".as_bytes();
        let cut = line.len() - 4;
        assert!(decoder.push(&line[..cut]).is_empty());
        assert_eq!(deltas(decoder.push(&line[cut..])), vec!["café"]);
    }

    #[test]
    fn malformed_and_non_data_lines_are_skipped() {
        let mut decoder = SseDecoder::new();
        let body = concat!(
            ": keep-alive\n",
            "event: message\n",
            "data: {not json\n",
            "data: {\"choices\":[{\"delta\":{}}]}\n",
            "data: {\"delta\":\"ok\"}\n",
        );
        assert_eq!(deltas(decoder.push(body.as_bytes())), vec!["ok"]);
    }

    #[test]
    fn missing_sentinel_is_a_network_error() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: {\"delta\":\"partial\"}\n");
        assert!(matches!(decoder.finish(), Err(Error::Network(_))));
    }

    #[test]
    fn unterminated_sentinel_is_accepted_at_finish() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: {\"delta\":\"x\"}\ndata: [DONE]");
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn data_after_sentinel_is_ignored() {
        let mut decoder = SseDecoder::new();
        let chunks = decoder.push(b"data: [DONE]\ndata: {\"delta\":\"late\"}\n");
        assert!(chunks.is_empty());
        assert!(decoder.push(b"data: {\"delta\":\"later\"}\n").is_empty());
    }
}
