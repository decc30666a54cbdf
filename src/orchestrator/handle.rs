//! Caller handle for a running session

use tokio::sync::{mpsc, oneshot, watch};

use super::events::SessionState;
use crate::transcript::{ConversationTurn, Transcript};
use crate::{Error, Result};

pub(super) enum Command {
    BeginTurn(oneshot::Sender<Result<()>>),
    SubmitText(String, oneshot::Sender<Result<()>>),
    EndSession(oneshot::Sender<Transcript>),
    History(oneshot::Sender<Vec<ConversationTurn>>),
}

/// Handle to a session loop; cheap to clone
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub(super) const fn new(
        commands: mpsc::UnboundedSender<Command>,
        state: watch::Receiver<SessionState>,
    ) -> Self {
        Self { commands, state }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Start a voice turn, interrupting any reply in progress
    ///
    /// # Errors
    ///
    /// Returns `Error::NotSupported` without a recognition engine, a capture
    /// error if the engine fails to start, or `Error::SessionClosed`
    pub async fn begin_turn(&self) -> Result<()> {
        self.request(Command::BeginTurn).await?
    }

    /// Send typed text as the user's turn, bypassing capture
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the session has ended
    pub async fn submit_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|tx| Command::SubmitText(text, tx)).await?
    }

    /// Stop everything and end the session
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the session already ended
    pub async fn end_session(&self) -> Result<Transcript> {
        self.request(Command::EndSession).await
    }

    /// Snapshot of the conversation so far
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the session has ended
    pub async fn history(&self) -> Result<Vec<ConversationTurn>> {
        self.request(Command::History).await
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the session ends first
    pub async fn wait_for(&self, target: SessionState) -> Result<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| Error::SessionClosed)
    }

    /// Whether the session loop has exited
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
