//! Capture service
//!
//! Wraps a speech recognition engine behind one event contract:
//! `Start`, `Interim`, `Final`, `Volume`, `End`, `Error`. The service owns
//! exactly one engine for its lifetime; a new conversation session builds a
//! new service instead of reusing engine state.
//!
//! `End` is the single release point for capture-side resources, whether the
//! run ended gracefully, was aborted, or failed.

mod transcript;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;

pub use transcript::normalize_transcript;

use crate::{Error, Result};

/// Error kinds reported by a recognition engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureErrorKind {
    /// Microphone permission denied
    NotAllowed,
    /// Timed out without hearing any speech
    NoSpeech,
    /// Result of our own `abort()`
    Aborted,
    /// Recognition engine could not reach its service
    NetworkError,
    /// Engine failed to start
    StartFailed,
    /// No recognition engine on this platform
    UnsupportedCapability,
    /// `start()` while a capture session is already live
    AlreadyRunning,
}

impl CaptureErrorKind {
    /// Benign kinds are absorbed silently and never shown to the user
    #[must_use]
    pub const fn is_benign(self) -> bool {
        matches!(self, Self::NoSpeech | Self::Aborted)
    }

    /// Human-readable message for the caller-facing error event
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::NotAllowed => {
                "Microphone access was denied. Please allow microphone access."
            }
            Self::NoSpeech => "No speech was detected.",
            Self::Aborted => "Listening was cancelled.",
            Self::NetworkError => "Network error. Please check your connection.",
            Self::StartFailed => "Failed to start speech recognition. Please try again.",
            Self::UnsupportedCapability => {
                "Speech recognition is not supported on this device."
            }
            Self::AlreadyRunning => "Already listening.",
        }
    }
}

impl fmt::Display for CaptureErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotAllowed => "not-allowed",
            Self::NoSpeech => "no-speech",
            Self::Aborted => "aborted",
            Self::NetworkError => "network",
            Self::StartFailed => "start-failed",
            Self::UnsupportedCapability => "not-supported",
            Self::AlreadyRunning => "already-running",
        };
        f.write_str(name)
    }
}

/// Events emitted by the capture service
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Engine began capturing
    Start,
    /// Provisional transcript, superseded by the next interim or final
    Interim(String),
    /// Settled, normalized transcript for one utterance
    Final(String),
    /// Input level, 0..=100
    Volume(u8),
    /// Capture ended and resources were released
    End,
    /// Engine error
    Error(CaptureErrorKind),
}

/// Speech recognition engine behind the capture service
///
/// Implementations report through the [`CaptureSink`] handed to `start`.
/// They must release their audio resources before calling
/// [`CaptureSink::ended`], and must call it exactly once per run.
pub trait RecognitionEngine: Send {
    /// Whether the engine can run on this platform
    fn is_available(&self) -> bool;

    /// Begin a capture run
    ///
    /// # Errors
    ///
    /// Returns the error kind if the run cannot be started
    fn start(&mut self, sink: CaptureSink) -> std::result::Result<(), CaptureErrorKind>;

    /// Finish the current utterance, then end the run
    fn stop(&mut self);

    /// End the run immediately, discarding pending audio. Must not block.
    fn abort(&mut self);
}

/// Engine for platforms (or modes) without speech recognition
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableEngine;

impl RecognitionEngine for UnavailableEngine {
    fn is_available(&self) -> bool {
        false
    }

    fn start(&mut self, _sink: CaptureSink) -> std::result::Result<(), CaptureErrorKind> {
        Err(CaptureErrorKind::UnsupportedCapability)
    }

    fn stop(&mut self) {}

    fn abort(&mut self) {}
}

/// Shared capture state between the service and its sinks
#[derive(Debug, Default)]
struct CaptureShared {
    /// Current run generation; sinks from older runs are muted
    generation: AtomicU64,
    /// Accepting audio: set by `start`, cleared by `stop`/`abort`/`End`
    live: AtomicBool,
    /// Engine run not yet ended
    running: AtomicBool,
}

/// Handle an engine uses to report events for one capture run
#[derive(Clone)]
pub struct CaptureSink {
    generation: u64,
    ended: Arc<AtomicBool>,
    shared: Arc<CaptureShared>,
    tx: mpsc::UnboundedSender<CaptureEvent>,
}

impl CaptureSink {
    fn is_current(&self) -> bool {
        self.shared.generation.load(Ordering::Acquire) == self.generation
    }

    fn emit(&self, event: CaptureEvent) {
        if !self.is_current() || self.ended.load(Ordering::Acquire) {
            tracing::trace!(?event, generation = self.generation, "dropping stale capture event");
            return;
        }
        let _ = self.tx.send(event);
    }

    /// Engine began capturing
    pub fn started(&self) {
        tracing::debug!(generation = self.generation, "capture started");
        self.emit(CaptureEvent::Start);
    }

    /// Provisional transcript
    pub fn interim(&self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            self.emit(CaptureEvent::Interim(text.to_string()));
        }
    }

    /// Settled transcript; normalized, and dropped if nothing remains
    pub fn final_text(&self, text: &str) {
        let cleaned = normalize_transcript(text);
        if cleaned.is_empty() {
            tracing::debug!(raw = text, "final transcript empty after normalization");
            return;
        }
        tracing::info!(transcript = %cleaned, "final transcript");
        self.emit(CaptureEvent::Final(cleaned));
    }

    /// Input level, clamped to 0..=100
    pub fn volume(&self, level: u8) {
        self.emit(CaptureEvent::Volume(level.min(100)));
    }

    /// Engine error
    pub fn error(&self, kind: CaptureErrorKind) {
        if kind.is_benign() {
            tracing::debug!(%kind, "capture ended without result");
        } else {
            tracing::warn!(%kind, "capture error");
        }
        self.emit(CaptureEvent::Error(kind));
    }

    /// Run finished; engine resources are already released
    ///
    /// Only the first call per run has an effect.
    pub fn ended(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.is_current() {
            return;
        }
        self.shared.live.store(false, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        tracing::debug!(generation = self.generation, "capture ended");
        let _ = self.tx.send(CaptureEvent::End);
    }
}

/// Owns one recognition engine and exposes start/stop/abort
pub struct CaptureService {
    engine: Box<dyn RecognitionEngine>,
    available: bool,
    shared: Arc<CaptureShared>,
    tx: mpsc::UnboundedSender<CaptureEvent>,
}

impl CaptureService {
    /// Create a capture service around `engine`
    ///
    /// Engine availability is queried once, here.
    #[must_use]
    pub fn new(
        engine: Box<dyn RecognitionEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let available = engine.is_available();
        tracing::debug!(available, "capture service created");

        let service = Self {
            engine,
            available,
            shared: Arc::new(CaptureShared::default()),
            tx,
        };
        (service, rx)
    }

    /// Whether a recognition engine is available
    #[must_use]
    pub const fn is_supported(&self) -> bool {
        self.available
    }

    /// Whether capture is live (started and not asked to terminate)
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Begin capturing
    ///
    /// # Errors
    ///
    /// Returns `Capture(UnsupportedCapability)` without an engine,
    /// `Capture(AlreadyRunning)` if capture is live, or the engine's error
    /// kind if it fails to start
    pub fn start(&mut self) -> Result<()> {
        if !self.available {
            return Err(Error::Capture(CaptureErrorKind::UnsupportedCapability));
        }
        if self.is_active() {
            return Err(Error::Capture(CaptureErrorKind::AlreadyRunning));
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let sink = CaptureSink {
            generation,
            ended: Arc::new(AtomicBool::new(false)),
            shared: Arc::clone(&self.shared),
            tx: self.tx.clone(),
        };

        self.shared.live.store(true, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        if let Err(kind) = self.engine.start(sink) {
            self.shared.live.store(false, Ordering::Release);
            self.shared.running.store(false, Ordering::Release);
            tracing::warn!(%kind, "capture engine failed to start");
            return Err(Error::Capture(kind));
        }

        tracing::debug!(generation, "capture start requested");
        Ok(())
    }

    /// Ask the engine to finalize and end. No-op if not running.
    pub fn stop(&mut self) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.shared.live.store(false, Ordering::Release);
        tracing::debug!("capture stop requested");
        self.engine.stop();
    }

    /// Terminate immediately, discarding pending audio. No-op if not running.
    pub fn abort(&mut self) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.shared.live.store(false, Ordering::Release);
        tracing::debug!("capture abort requested");
        self.engine.abort();
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Engine that records calls and hands its sink back to the test
    #[derive(Default)]
    struct ManualEngine {
        available: bool,
        sink: Arc<std::sync::Mutex<Option<CaptureSink>>>,
        stops: Arc<std::sync::atomic::AtomicUsize>,
        aborts: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl RecognitionEngine for ManualEngine {
        fn is_available(&self) -> bool {
            self.available
        }

        fn start(&mut self, sink: CaptureSink) -> std::result::Result<(), CaptureErrorKind> {
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn abort(&mut self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn start_without_engine_is_unsupported() {
        let (mut service, _rx) = CaptureService::new(Box::new(ManualEngine::default()));
        assert!(!service.is_supported());
        assert!(matches!(
            service.start(),
            Err(Error::Capture(CaptureErrorKind::UnsupportedCapability))
        ));
        assert!(!service.is_active());
    }

    #[test]
    fn second_start_is_rejected() {
        let engine = ManualEngine {
            available: true,
            ..ManualEngine::default()
        };
        let (mut service, _rx) = CaptureService::new(Box::new(engine));
        service.start().unwrap();
        assert!(service.is_active());
        assert!(matches!(
            service.start(),
            Err(Error::Capture(CaptureErrorKind::AlreadyRunning))
        ));
    }

    #[test]
    fn stop_and_abort_when_idle_are_noops() {
        let engine = ManualEngine {
            available: true,
            ..ManualEngine::default()
        };
        let stops = Arc::clone(&engine.stops);
        let aborts = Arc::clone(&engine.aborts);
        let (mut service, _rx) = CaptureService::new(Box::new(engine));

        service.stop();
        service.abort();
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        assert_eq!(aborts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn end_is_emitted_once_and_clears_active() {
        let engine = ManualEngine {
            available: true,
            ..ManualEngine::default()
        };
        let slot = Arc::clone(&engine.sink);
        let (mut service, mut rx) = CaptureService::new(Box::new(engine));
        service.start().unwrap();

        let sink = slot.lock().unwrap().clone().unwrap();
        sink.started();
        sink.final_text("  um so   what is uh consideration ");
        sink.ended();
        sink.ended();
        sink.volume(42);

        assert_eq!(rx.try_recv().unwrap(), CaptureEvent::Start);
        assert_eq!(
            rx.try_recv().unwrap(),
            CaptureEvent::Final("so what is consideration".to_string())
        );
        assert_eq!(rx.try_recv().unwrap(), CaptureEvent::End);
        assert!(rx.try_recv().is_err());
        assert!(!service.is_active());
    }

    #[test]
    fn stale_run_events_are_dropped() {
        let engine = ManualEngine {
            available: true,
            ..ManualEngine::default()
        };
        let slot = Arc::clone(&engine.sink);
        let (mut service, mut rx) = CaptureService::new(Box::new(engine));

        service.start().unwrap();
        let first = slot.lock().unwrap().clone().unwrap();
        service.abort();
        service.start().unwrap();

        first.final_text("late result");
        first.ended();
        assert!(rx.try_recv().is_err());
        assert!(service.is_active());
    }

    #[test]
    fn benign_kinds() {
        assert!(CaptureErrorKind::NoSpeech.is_benign());
        assert!(CaptureErrorKind::Aborted.is_benign());
        assert!(!CaptureErrorKind::NotAllowed.is_benign());
        assert!(!CaptureErrorKind::NetworkError.is_benign());
    }
}
