//! Session state and caller-facing events

use crate::transcript::{ConversationTurn, Transcript};

/// Where the conversation is; exactly one is active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    /// Capture is live
    Listening,
    /// Request sent, nothing spoken yet
    Processing,
    /// At least one sentence handed to synthesis
    Speaking,
}

impl SessionState {
    /// Whether a reply is being fetched or spoken
    #[must_use]
    pub const fn is_replying(self) -> bool {
        matches!(self, Self::Processing | Self::Speaking)
    }
}

/// Events published to the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Latest provisional transcript; empty when cleared
    InterimText(String),
    TurnAppended(ConversationTurn),
    /// Human-readable error
    Error(String),
    /// Microphone level, 0..=100
    Volume(u8),
    /// Emitted once when a non-empty session ends
    TranscriptReady(Transcript),
}
