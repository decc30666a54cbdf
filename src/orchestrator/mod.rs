//! Conversation orchestrator
//!
//! One task per session owns every piece of mutable conversation state: the
//! state machine, the history, the reply being assembled, and the handles to
//! capture and synthesis. Caller commands, capture events, and reader/drain
//! notifications are all serialized through its `select!` loop.
//!
//! Barge-in: when the user starts a new turn while a reply is in flight, the
//! request token is cancelled, synthesis is stopped, and the partial reply is
//! thrown away before capture starts.

mod events;
mod handle;

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub use events::{SessionEvent, SessionState};
pub use handle::SessionHandle;

use self::handle::Command;
use crate::backend::{GenerationBackend, GenerationRequest};
use crate::capture::{CaptureErrorKind, CaptureEvent, CaptureService, RecognitionEngine};
use crate::config::SessionConfig;
use crate::segment::{finish_segment, segment_completed_sentences, tidy_sentence};
use crate::synthesis::{SpeechRenderer, SynthesisQueue};
use crate::transcript::{ConversationTurn, Transcript};
use crate::{Error, Result};

/// Notifications from tasks spawned by the session loop, tagged by turn
enum Internal {
    Chunk { turn: u64, delta: String },
    Completed { turn: u64 },
    Failed { turn: u64, error: Error },
    Drained { turn: u64 },
}

/// Whether the loop keeps running after handling an input
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Session loop state
pub struct Orchestrator {
    config: SessionConfig,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    capture: CaptureService,
    synthesis: SynthesisQueue,
    backend: Arc<dyn GenerationBackend>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    history: Vec<ConversationTurn>,
    interim: String,
    /// Full text of the reply in flight
    reply: String,
    /// Tail of `reply` not yet segmented
    pending: String,
    request: Option<CancellationToken>,
    active_turn: Option<u64>,
    next_turn: u64,
    unsupported_reported: bool,
}

impl Orchestrator {
    /// Start a session loop on the current runtime
    ///
    /// Returns the caller handle and the event stream for the UI layer.
    #[must_use]
    pub fn spawn(
        config: SessionConfig,
        engine: Box<dyn RecognitionEngine>,
        renderer: Arc<dyn SpeechRenderer>,
        backend: Arc<dyn GenerationBackend>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (capture, capture_rx) = CaptureService::new(engine);

        let orchestrator = Self {
            config,
            state: SessionState::Idle,
            state_tx,
            events: events_tx,
            capture,
            synthesis: SynthesisQueue::new(renderer),
            backend,
            internal_tx,
            history: Vec::new(),
            interim: String::new(),
            reply: String::new(),
            pending: String::new(),
            request: None,
            active_turn: None,
            next_turn: 0,
            unsupported_reported: false,
        };

        tokio::spawn(orchestrator.run(command_rx, capture_rx, internal_rx));

        (SessionHandle::new(command_tx, state_rx), events_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        tracing::debug!(
            continuous = self.config.continuous,
            max_minutes = self.config.max_session.as_secs() / 60,
            "session started"
        );

        let expiry = tokio::time::sleep(self.config.max_session);
        tokio::pin!(expiry);

        loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        tracing::debug!("all session handles dropped");
                        self.shutdown();
                        Flow::Exit
                    }
                },
                Some(event) = capture_rx.recv() => {
                    self.on_capture(event);
                    Flow::Continue
                }
                Some(event) = internal_rx.recv() => {
                    self.on_internal(event);
                    Flow::Continue
                }
                () = &mut expiry => {
                    let minutes = self.config.max_session.as_secs() / 60;
                    tracing::info!(minutes, "session time limit reached");
                    self.emit(SessionEvent::Error(format!(
                        "Session ended after {minutes} minutes"
                    )));
                    self.finish_session();
                    Flow::Exit
                }
            };

            if flow == Flow::Exit {
                break;
            }
        }

        tracing::debug!(turns = self.history.len(), "session loop exited");
    }

    fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::BeginTurn(reply) => {
                let _ = reply.send(self.begin_turn());
                Flow::Continue
            }
            Command::SubmitText(text, reply) => {
                let _ = reply.send(self.submit_text(&text));
                Flow::Continue
            }
            Command::History(reply) => {
                let _ = reply.send(self.history.clone());
                Flow::Continue
            }
            Command::EndSession(reply) => {
                let transcript = self.finish_session();
                let _ = reply.send(transcript);
                Flow::Exit
            }
        }
    }

    // Commands

    fn begin_turn(&mut self) -> Result<()> {
        match self.state {
            SessionState::Listening => return Ok(()),
            SessionState::Processing | SessionState::Speaking => {
                tracing::info!(state = ?self.state, "interrupting reply for new turn");
                self.halt_turn();
                self.set_state(SessionState::Idle);
            }
            SessionState::Idle => {}
        }

        if !self.capture.is_supported() {
            return Err(self.report_unsupported());
        }

        match self.capture.start() {
            Ok(()) | Err(Error::Capture(CaptureErrorKind::AlreadyRunning)) => Ok(()),
            Err(Error::Capture(CaptureErrorKind::UnsupportedCapability)) => {
                Err(self.report_unsupported())
            }
            Err(e) => {
                self.emit(SessionEvent::Error(e.user_message()));
                Err(e)
            }
        }
    }

    /// Surface the missing capability once per session
    fn report_unsupported(&mut self) -> Error {
        if !self.unsupported_reported {
            self.unsupported_reported = true;
            self.emit(SessionEvent::Error(Error::NotSupported.user_message()));
        }
        Error::NotSupported
    }

    fn submit_text(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        if self.state.is_replying() {
            self.halt_turn();
        }
        self.capture.abort();
        self.clear_interim();
        self.send_user_turn(text.to_string());
        Ok(())
    }

    /// Stop everything, publish the transcript, and return it
    fn finish_session(&mut self) -> Transcript {
        self.halt_turn();
        self.capture.abort();
        self.clear_interim();
        self.set_state(SessionState::Idle);

        let transcript = Transcript::new(self.history.clone());
        if !transcript.is_empty() {
            self.emit(SessionEvent::TranscriptReady(transcript.clone()));
        }
        tracing::info!(turns = transcript.turns.len(), "session ended");
        transcript
    }

    fn shutdown(&mut self) {
        self.halt_turn();
        self.capture.abort();
        self.set_state(SessionState::Idle);
    }

    // Capture

    fn on_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Start => {
                self.clear_interim();
                match self.state {
                    SessionState::Idle => self.set_state(SessionState::Listening),
                    SessionState::Processing | SessionState::Speaking => {
                        tracing::info!(state = ?self.state, "barge-in");
                        self.halt_turn();
                        self.set_state(SessionState::Listening);
                    }
                    SessionState::Listening => {}
                }
            }
            CaptureEvent::Interim(text) => {
                if self.state == SessionState::Listening {
                    self.interim.clone_from(&text);
                    self.emit(SessionEvent::InterimText(text));
                }
            }
            CaptureEvent::Final(text) => {
                if self.state == SessionState::Listening && !text.trim().is_empty() {
                    self.clear_interim();
                    self.capture.stop();
                    self.send_user_turn(text);
                } else {
                    tracing::debug!(state = ?self.state, "ignoring final transcript");
                }
            }
            CaptureEvent::Volume(level) => {
                if self.state == SessionState::Listening {
                    self.emit(SessionEvent::Volume(level));
                }
            }
            CaptureEvent::Error(kind) => {
                if self.state.is_replying() {
                    tracing::debug!(%kind, "ignoring capture error during reply");
                    return;
                }
                if !kind.is_benign() {
                    self.emit(SessionEvent::Error(kind.user_message().to_string()));
                }
                if self.state == SessionState::Listening {
                    self.clear_interim();
                    self.set_state(SessionState::Idle);
                }
            }
            CaptureEvent::End => {
                if self.state == SessionState::Listening {
                    self.clear_interim();
                    self.set_state(SessionState::Idle);
                }
            }
        }
    }

    // Reply

    fn send_user_turn(&mut self, text: String) {
        self.append_turn(ConversationTurn::user(text));

        self.next_turn += 1;
        let turn = self.next_turn;
        let token = CancellationToken::new();
        self.active_turn = Some(turn);
        self.request = Some(token.clone());
        self.reply.clear();
        self.pending.clear();

        let mut request = GenerationRequest::voice(&self.history);
        request.page_context.clone_from(&self.config.page_context);
        request.model.clone_from(&self.config.model);

        tokio::spawn(read_reply(
            Arc::clone(&self.backend),
            request,
            token,
            turn,
            self.internal_tx.clone(),
        ));

        self.set_state(SessionState::Processing);
    }

    fn on_internal(&mut self, event: Internal) {
        let turn = match &event {
            Internal::Chunk { turn, .. }
            | Internal::Completed { turn }
            | Internal::Failed { turn, .. }
            | Internal::Drained { turn } => *turn,
        };
        if self.active_turn != Some(turn) {
            tracing::trace!(turn, "dropping event from stale turn");
            return;
        }

        match event {
            Internal::Chunk { delta, .. } => self.on_chunk(&delta),
            Internal::Completed { .. } => self.on_completed(turn),
            Internal::Failed { error, .. } => self.fail_turn(&error),
            Internal::Drained { .. } => self.on_drained(),
        }
    }

    fn on_chunk(&mut self, delta: &str) {
        self.reply.push_str(delta);
        self.pending.push_str(delta);

        let (units, rest) = segment_completed_sentences(&self.pending);
        self.pending = rest;
        for unit in units {
            self.forward(&unit);
        }
    }

    fn forward(&mut self, unit: &str) {
        let unit = tidy_sentence(unit);
        if unit.trim().is_empty() {
            return;
        }
        self.synthesis.enqueue(unit);
        if self.state == SessionState::Processing {
            self.set_state(SessionState::Speaking);
        }
    }

    fn on_completed(&mut self, turn: u64) {
        self.request = None;
        let tail = std::mem::take(&mut self.pending);
        if let Some(unit) = finish_segment(&tail) {
            self.forward(&unit);
        }

        if self.reply.trim().is_empty() {
            tracing::warn!(turn, "backend returned an empty reply");
            self.fail_turn(&Error::Network("empty reply".to_string()));
            return;
        }

        tracing::debug!(turn, chars = self.reply.len(), "reply stream complete");
        let queue = self.synthesis.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            queue.wait_idle().await;
            let _ = tx.send(Internal::Drained { turn });
        });
    }

    fn on_drained(&mut self) {
        let content = std::mem::take(&mut self.reply).trim().to_string();
        self.active_turn = None;
        self.append_turn(ConversationTurn::assistant(content));
        self.set_state(SessionState::Idle);

        if self.config.continuous {
            tracing::debug!("continuous mode, listening again");
            let _ = self.begin_turn();
        }
    }

    fn fail_turn(&mut self, error: &Error) {
        if error.is_network() {
            tracing::warn!(error = %error, "reply failed, backend unreachable");
        } else {
            tracing::error!(error = %error, "reply failed");
        }
        self.halt_turn();
        self.append_turn(ConversationTurn::assistant(self.config.apology_message.clone()));
        self.emit(SessionEvent::Error(error.user_message()));
        self.set_state(SessionState::Idle);
    }

    /// Cancel the request, stop synthesis, and discard the partial reply
    fn halt_turn(&mut self) {
        if let Some(token) = self.request.take() {
            token.cancel();
        }
        self.synthesis.stop_all();
        self.reply.clear();
        self.pending.clear();
        self.active_turn = None;
    }

    // Helpers

    fn append_turn(&mut self, turn: ConversationTurn) {
        tracing::debug!(role = %turn.role, chars = turn.content.len(), "turn appended");
        self.history.push(turn.clone());
        self.emit(SessionEvent::TurnAppended(turn));
    }

    fn clear_interim(&mut self) {
        if !self.interim.is_empty() {
            self.interim.clear();
            self.emit(SessionEvent::InterimText(String::new()));
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Stream one reply into the session loop until done, failed, or cancelled
async fn read_reply(
    backend: Arc<dyn GenerationBackend>,
    request: GenerationRequest,
    token: CancellationToken,
    turn: u64,
    tx: mpsc::UnboundedSender<Internal>,
) {
    let opened = tokio::select! {
        () = token.cancelled() => return,
        opened = backend.open_stream(request) => opened,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(error) => {
            let _ = tx.send(Internal::Failed { turn, error });
            return;
        }
    };

    loop {
        let item = tokio::select! {
            () = token.cancelled() => {
                tracing::debug!(turn, "reply stream cancelled");
                return;
            }
            item = stream.next() => item,
        };

        let event = match item {
            Some(Ok(chunk)) => Internal::Chunk {
                turn,
                delta: chunk.delta,
            },
            Some(Err(error)) => Internal::Failed { turn, error },
            None => Internal::Completed { turn },
        };
        let last = !matches!(event, Internal::Chunk { .. });
        if tx.send(event).is_err() || last {
            return;
        }
    }
}
