//! Synthesis queue
//!
//! Plays sentence units one at a time, in the order they were handed over,
//! through a [`SpeechRenderer`]. `stop_all` drops everything queued and cuts
//! the unit that is playing.
//!
//! Each hand-off is tagged with the queue's current cancellation token.
//! `stop_all` cancels that token and installs a fresh one, so units queued
//! before the stop are skipped by the worker while later units play normally.

mod renderer;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

pub use renderer::TtsRenderer;

use crate::{Error, Result};

/// Renders one sentence to audio
#[async_trait]
pub trait SpeechRenderer: Send + Sync {
    /// Speak `text`, resolving when playback finishes
    ///
    /// # Errors
    ///
    /// Returns an error if synthesis or playback fails
    async fn speak(&self, text: &str) -> Result<()>;

    /// Halt current audio immediately
    fn stop(&self);
}

/// Outcome of one queued unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Played,
    Failed,
    Skipped,
}

struct Queued {
    unit: String,
    token: CancellationToken,
    done: Option<oneshot::Sender<UnitOutcome>>,
}

struct QueueState {
    pending: usize,
    token: CancellationToken,
}

struct Shared {
    state: Mutex<QueueState>,
    pending_tx: watch::Sender<usize>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark one unit finished, unless a stop already zeroed the count for it
    fn finish(&self, token: &CancellationToken) {
        let mut state = self.lock();
        if !token.is_cancelled() && state.pending > 0 {
            state.pending -= 1;
            self.pending_tx.send_replace(state.pending);
        }
    }
}

/// Ordered, cancellable playback queue
#[derive(Clone)]
pub struct SynthesisQueue {
    tx: mpsc::UnboundedSender<Queued>,
    shared: Arc<Shared>,
    renderer: Arc<dyn SpeechRenderer>,
}

impl SynthesisQueue {
    /// Create a queue and spawn its worker on the current runtime
    #[must_use]
    pub fn new(renderer: Arc<dyn SpeechRenderer>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending_tx, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: 0,
                token: CancellationToken::new(),
            }),
            pending_tx,
        });

        tokio::spawn(worker(rx, Arc::clone(&shared), Arc::clone(&renderer)));

        Self {
            tx,
            shared,
            renderer,
        }
    }

    fn push(&self, unit: String, done: Option<oneshot::Sender<UnitOutcome>>) {
        let mut state = self.shared.lock();
        let token = state.token.clone();

        let queued = Queued { unit, token, done };
        if self.tx.send(queued).is_err() {
            tracing::warn!("synthesis worker gone, dropping unit");
            return;
        }
        state.pending += 1;
        self.shared.pending_tx.send_replace(state.pending);
    }

    /// Hand one unit to the queue without waiting for it to play
    pub fn enqueue(&self, unit: impl Into<String>) {
        let unit = unit.into();
        tracing::trace!(unit = %unit, "enqueue sentence");
        self.push(unit, None);
    }

    /// Queue `units` and resolve once all of them have finished
    ///
    /// A failing unit does not stop the ones after it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if `stop_all` interrupted the batch, or
    /// `Error::Playback` if any unit failed to play
    pub async fn enqueue_and_speak<I, S>(&self, units: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let receivers: Vec<_> = units
            .into_iter()
            .map(|unit| {
                let (done_tx, done_rx) = oneshot::channel();
                self.push(unit.into(), Some(done_tx));
                done_rx
            })
            .collect();

        let mut failed = 0usize;
        let mut cancelled = false;
        for rx in receivers {
            match rx.await {
                Ok(UnitOutcome::Played) => {}
                Ok(UnitOutcome::Failed) => failed += 1,
                Ok(UnitOutcome::Skipped) | Err(_) => cancelled = true,
            }
        }

        if cancelled {
            Err(Error::Cancelled)
        } else if failed > 0 {
            Err(Error::Playback(format!("{failed} sentence(s) failed to play")))
        } else {
            Ok(())
        }
    }

    /// Cancel the playing unit and drop everything queued
    ///
    /// Idempotent. `is_speaking()` is false once this returns.
    pub fn stop_all(&self) {
        let mut state = self.shared.lock();
        self.renderer.stop();
        if state.pending == 0 {
            return;
        }

        state.token.cancel();
        state.token = CancellationToken::new();
        state.pending = 0;
        self.shared.pending_tx.send_replace(0);
        tracing::debug!("synthesis stopped");
    }

    /// Whether any unit is queued or playing
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.shared.lock().pending > 0
    }

    /// Resolve once nothing is queued or playing
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.pending_tx.subscribe();
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    shared: Arc<Shared>,
    renderer: Arc<dyn SpeechRenderer>,
) {
    while let Some(Queued { unit, token, done }) = rx.recv().await {
        let outcome = if token.is_cancelled() {
            UnitOutcome::Skipped
        } else {
            tokio::select! {
                () = token.cancelled() => UnitOutcome::Skipped,
                result = renderer.speak(&unit) => match result {
                    Ok(()) => UnitOutcome::Played,
                    Err(e) => {
                        tracing::warn!(error = %e, unit = %unit, "sentence failed to play");
                        UnitOutcome::Failed
                    }
                },
            }
        };

        shared.finish(&token);
        if let Some(done) = done {
            let _ = done.send(outcome);
        }
    }
    tracing::debug!("synthesis worker exiting");
}
