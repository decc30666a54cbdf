//! Shared test doubles for the three pipeline seams

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use voiceloop::backend::ChunkStream;
use voiceloop::capture::CaptureSink;
use voiceloop::{
    CaptureErrorKind, Error, GenerationBackend, GenerationRequest, RecognitionEngine, Result,
    SessionEvent, SpeechRenderer, StreamChunk,
};

/// Upper bound for any single wait in a test
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// Recognition engine

#[derive(Default)]
struct EngineShared {
    sink: Mutex<Option<CaptureSink>>,
    live: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    aborts: AtomicUsize,
}

/// Engine whose transcripts are pushed by the test through [`EngineControl`]
///
/// `start` reports `Start` immediately. `stop` and `abort` end the run the
/// way a platform engine would.
pub struct ScriptedEngine {
    shared: Arc<EngineShared>,
}

/// Test-side handle to a [`ScriptedEngine`]
#[derive(Clone)]
pub struct EngineControl {
    shared: Arc<EngineShared>,
}

impl ScriptedEngine {
    #[must_use]
    pub fn new() -> (Self, EngineControl) {
        let shared = Arc::new(EngineShared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            EngineControl { shared },
        )
    }
}

impl RecognitionEngine for ScriptedEngine {
    fn is_available(&self) -> bool {
        true
    }

    fn start(&mut self, sink: CaptureSink) -> std::result::Result<(), CaptureErrorKind> {
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        self.shared.live.store(true, Ordering::SeqCst);
        sink.started();
        *self.shared.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.stops.fetch_add(1, Ordering::SeqCst);
        self.finish(None);
    }

    fn abort(&mut self) {
        self.shared.aborts.fetch_add(1, Ordering::SeqCst);
        self.finish(Some(CaptureErrorKind::Aborted));
    }
}

impl ScriptedEngine {
    fn finish(&self, error: Option<CaptureErrorKind>) {
        self.shared.live.store(false, Ordering::SeqCst);
        if let Some(sink) = self.shared.sink.lock().unwrap().take() {
            if let Some(kind) = error {
                sink.error(kind);
            }
            sink.ended();
        }
    }
}

impl EngineControl {
    fn sink(&self) -> CaptureSink {
        self.shared
            .sink
            .lock()
            .unwrap()
            .clone()
            .expect("engine not started")
    }

    pub fn interim(&self, text: &str) {
        self.sink().interim(text);
    }

    pub fn final_text(&self, text: &str) {
        self.sink().final_text(text);
    }

    pub fn volume(&self, level: u8) {
        self.sink().volume(level);
    }

    /// Engine-side failure followed by the end of the run
    pub fn fail(&self, kind: CaptureErrorKind) {
        self.shared.live.store(false, Ordering::SeqCst);
        if let Some(sink) = self.shared.sink.lock().unwrap().take() {
            sink.error(kind);
            sink.ended();
        }
    }

    /// Engine ends the run on its own, without a result
    pub fn end(&self) {
        self.shared.live.store(false, Ordering::SeqCst);
        if let Some(sink) = self.shared.sink.lock().unwrap().take() {
            sink.ended();
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_flag(&self) -> Arc<dyn Fn() -> bool + Send + Sync> {
        let shared = Arc::clone(&self.shared);
        Arc::new(move || shared.live.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn starts(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stops(&self) -> usize {
        self.shared.stops.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn aborts(&self) -> usize {
        self.shared.aborts.load(Ordering::SeqCst)
    }
}

// Renderer

/// Renderer that records what it was asked to speak
#[derive(Clone, Default)]
pub struct RecordingRenderer {
    delay: Duration,
    fail_marker: Option<String>,
    started: Arc<Mutex<Vec<String>>>,
    completed: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    overlaps_capture: Arc<AtomicBool>,
    capture_live: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl RecordingRenderer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Each unit takes `delay` to "play"
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Units containing `marker` fail
    #[must_use]
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    /// Record a violation if speech starts while capture is live
    #[must_use]
    pub fn watching_capture(mut self, control: &EngineControl) -> Self {
        self.capture_live = Some(control.live_flag());
        self
    }

    #[must_use]
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    #[must_use]
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    #[must_use]
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn overlapped_capture(&self) -> bool {
        self.overlaps_capture.load(Ordering::SeqCst)
    }
}

/// Decrements the active count even when the speak future is dropped
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechRenderer for RecordingRenderer {
    async fn speak(&self, text: &str) -> Result<()> {
        if self.capture_live.as_ref().is_some_and(|live| live()) {
            self.overlaps_capture.store(true, Ordering::SeqCst);
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(Arc::clone(&self.active));

        self.started.lock().unwrap().push(text.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self
            .fail_marker
            .as_deref()
            .is_some_and(|marker| text.contains(marker))
        {
            return Err(Error::Tts(format!("cannot speak {text:?}")));
        }

        self.completed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// Backend

/// One step of a scripted reply stream
#[derive(Debug, Clone)]
pub enum Step {
    Chunk(&'static str),
    Delay(Duration),
    /// Mid-stream transport failure
    Fail,
    /// Never yields again
    Hang,
}

/// How a scripted request behaves
#[derive(Debug, Clone)]
pub enum Reply {
    Stream(Vec<Step>),
    /// `open_stream` itself fails
    Reject,
}

#[derive(Default)]
struct BackendShared {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GenerationRequest>>,
    dropped: AtomicUsize,
    polled_after_cancel: AtomicBool,
}

/// Backend that plays back queued scripts, one per request
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    shared: Arc<BackendShared>,
}

/// Counts dropped streams
struct DropFlag(Arc<BackendShared>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScriptedBackend {
    #[must_use]
    pub fn new(replies: Vec<Reply>) -> Self {
        let backend = Self::default();
        backend.shared.replies.lock().unwrap().extend(replies);
        backend
    }

    /// Shorthand for a reply that streams `chunks` and completes
    #[must_use]
    pub fn chunks(chunks: &[&'static str]) -> Reply {
        Reply::Stream(chunks.iter().copied().map(Step::Chunk).collect())
    }

    pub fn push(&self, reply: Reply) {
        self.shared.replies.lock().unwrap().push_back(reply);
    }

    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.shared.requests.lock().unwrap().clone()
    }

    /// Streams dropped so far (completed or cancelled)
    #[must_use]
    pub fn dropped_streams(&self) -> usize {
        self.shared.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn open_stream(&self, request: GenerationRequest) -> Result<ChunkStream> {
        self.shared.requests.lock().unwrap().push(request);
        let reply = self
            .shared
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Stream(Vec::new()));

        let steps = match reply {
            Reply::Reject => return Err(Error::Network("backend returned 503".to_string())),
            Reply::Stream(steps) => steps,
        };

        let flag = DropFlag(Arc::clone(&self.shared));
        let stream = futures::stream::unfold(
            (VecDeque::from(steps), flag),
            |(mut steps, flag)| async move {
                loop {
                    match steps.pop_front()? {
                        Step::Chunk(delta) => {
                            let chunk = StreamChunk {
                                delta: delta.to_string(),
                            };
                            return Some((Ok(chunk), (steps, flag)));
                        }
                        Step::Delay(d) => tokio::time::sleep(d).await,
                        Step::Fail => {
                            steps.clear();
                            let err = Error::Network("connection reset".to_string());
                            return Some((Err(err), (steps, flag)));
                        }
                        Step::Hang => futures::future::pending::<()>().await,
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

// Events

/// Receive events until one matches, returning everything seen
///
/// # Panics
///
/// Panics if no matching event arrives within [`TEST_TIMEOUT`]
pub async fn events_until(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut done: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let wait = async {
        while let Some(event) = rx.recv().await {
            let matched = done(&event);
            seen.push(event);
            if matched {
                return;
            }
        }
        panic!("event stream closed before the expected event");
    };
    let outcome = tokio::time::timeout(TEST_TIMEOUT, wait).await;
    assert!(outcome.is_ok(), "timed out; events so far: {seen:#?}");
    seen
}

/// Drain whatever is already queued
pub fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Poll `condition` until it holds or the test timeout expires
///
/// # Panics
///
/// Panics on timeout
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(TEST_TIMEOUT, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
