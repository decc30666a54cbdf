//! Microphone-backed recognition engine
//!
//! A dedicated thread owns the cpal input stream for one capture run. It
//! meters volume, waits for an utterance to close on trailing silence, then
//! transcribes it through the HTTP STT client.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::HostTrait;
use tokio::runtime::Handle;

use super::detector::UtteranceDetector;
use super::microphone::{Microphone, SAMPLE_RATE, samples_to_wav};
use super::stt::SpeechToText;
use super::volume::VolumeMeter;
use crate::capture::{CaptureErrorKind, CaptureSink, RecognitionEngine};

/// How often the capture thread drains the input buffer
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on waiting for the previous run to let go of the device
const RELEASE_WAIT: Duration = Duration::from_secs(1);

const RUN: u8 = 0;
const STOP: u8 = 1;
const ABORT: u8 = 2;

/// Recognition engine over the default microphone and an HTTP STT provider
pub struct MicrophoneEngine {
    stt: Arc<SpeechToText>,
    runtime: Handle,
    no_speech_timeout: Duration,
    smoothing: f32,
    control: Option<Arc<AtomicU8>>,
    released: Option<Arc<Released>>,
}

impl MicrophoneEngine {
    /// Build an engine; STT requests run on `runtime`
    #[must_use]
    pub fn new(
        stt: SpeechToText,
        runtime: Handle,
        no_speech_timeout: Duration,
        smoothing: f32,
    ) -> Self {
        Self {
            stt: Arc::new(stt),
            runtime,
            no_speech_timeout,
            smoothing,
            control: None,
            released: None,
        }
    }

    fn signal(&self, value: u8) {
        if let Some(control) = &self.control {
            // Abort wins over a pending stop
            let _ = control.fetch_max(value, Ordering::AcqRel);
        }
    }
}

impl RecognitionEngine for MicrophoneEngine {
    fn is_available(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn start(&mut self, sink: CaptureSink) -> Result<(), CaptureErrorKind> {
        let control = Arc::new(AtomicU8::new(RUN));
        let released = Arc::new(Released::default());
        let run = CaptureRun {
            sink,
            control: Arc::clone(&control),
            previous: self.released.clone(),
            released: Arc::clone(&released),
            stt: Arc::clone(&self.stt),
            runtime: self.runtime.clone(),
            no_speech_timeout: self.no_speech_timeout,
            smoothing: self.smoothing,
        };

        thread::Builder::new()
            .name("voiceloop-capture".to_string())
            .spawn(move || run.execute())
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn capture thread");
                CaptureErrorKind::StartFailed
            })?;

        self.control = Some(control);
        self.released = Some(released);
        Ok(())
    }

    fn stop(&mut self) {
        self.signal(STOP);
    }

    fn abort(&mut self) {
        self.signal(ABORT);
    }
}

impl Drop for MicrophoneEngine {
    fn drop(&mut self) {
        self.signal(ABORT);
    }
}

/// Set once a run has closed its input device
///
/// A new run waits on the previous run's flag before opening the
/// microphone, since an aborted run only notices on its next poll.
#[derive(Default)]
struct Released {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Released {
    fn signal(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.cv.notify_all();
    }

    /// Returns false if `timeout` passed without a signal
    fn wait(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        let (done, _) = self
            .cv
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }
}

/// Audio resources held by one run, released analyser first
struct CaptureResources {
    meter: Option<VolumeMeter>,
    microphone: Option<Microphone>,
}

impl CaptureResources {
    /// Idempotent
    fn release(&mut self) {
        if let Some(mut meter) = self.meter.take() {
            meter.reset();
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.close();
        }
    }
}

/// How a capture run ended
enum Outcome {
    Utterance(Vec<f32>),
    Stopped,
    Aborted,
    NoSpeech,
}

/// State moved onto the capture thread
struct CaptureRun {
    sink: CaptureSink,
    control: Arc<AtomicU8>,
    previous: Option<Arc<Released>>,
    released: Arc<Released>,
    stt: Arc<SpeechToText>,
    runtime: Handle,
    no_speech_timeout: Duration,
    smoothing: f32,
}

impl CaptureRun {
    fn execute(self) {
        if let Some(previous) = &self.previous
            && !previous.wait(RELEASE_WAIT)
        {
            tracing::warn!("previous capture still holds the microphone");
        }

        let microphone = match Microphone::open() {
            Ok(m) => m,
            Err(e) => {
                let kind = classify_open_error(&e.to_string());
                tracing::warn!(error = %e, %kind, "microphone unavailable");
                self.sink.error(kind);
                self.sink.ended();
                return;
            }
        };

        let mut resources = CaptureResources {
            meter: Some(VolumeMeter::new(self.smoothing)),
            microphone: Some(microphone),
        };

        self.sink.started();
        let outcome = self.listen(&mut resources);
        resources.release();
        self.released.signal();

        match outcome {
            Outcome::Utterance(samples) => self.transcribe(&samples),
            Outcome::Stopped => {}
            Outcome::Aborted => self.sink.error(CaptureErrorKind::Aborted),
            Outcome::NoSpeech => self.sink.error(CaptureErrorKind::NoSpeech),
        }
        self.sink.ended();
    }

    fn listen(&self, resources: &mut CaptureResources) -> Outcome {
        let mut detector = UtteranceDetector::new();
        let started = Instant::now();

        loop {
            thread::sleep(POLL_INTERVAL);

            match self.control.load(Ordering::Acquire) {
                ABORT => return Outcome::Aborted,
                STOP if !detector.heard_speech() => return Outcome::Stopped,
                STOP => return Outcome::Utterance(detector.take_utterance()),
                _ => {}
            }

            let (Some(microphone), Some(meter)) =
                (resources.microphone.as_ref(), resources.meter.as_mut())
            else {
                return Outcome::Aborted;
            };

            let samples = microphone.take_samples();
            self.sink.volume(meter.process(&samples));

            if detector.process(&samples) {
                return Outcome::Utterance(detector.take_utterance());
            }

            if !detector.heard_speech() && started.elapsed() >= self.no_speech_timeout {
                tracing::debug!(
                    timeout_ms = self.no_speech_timeout.as_millis(),
                    "no speech before timeout"
                );
                return Outcome::NoSpeech;
            }
        }
    }

    fn transcribe(&self, samples: &[f32]) {
        let wav = match samples_to_wav(samples, SAMPLE_RATE) {
            Ok(wav) => wav,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode utterance");
                self.sink.error(CaptureErrorKind::StartFailed);
                return;
            }
        };

        let result = self.runtime.block_on(self.stt.transcribe(&wav));

        if self.control.load(Ordering::Acquire) == ABORT {
            self.sink.error(CaptureErrorKind::Aborted);
            return;
        }

        match result {
            Ok(text) => self.sink.final_text(&text),
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed");
                self.sink.error(CaptureErrorKind::NetworkError);
            }
        }
    }
}

impl Drop for CaptureRun {
    // Covers the open-failure return and panics on the capture thread
    fn drop(&mut self) {
        self.released.signal();
    }
}

/// Map a device-open failure onto a capture error kind
fn classify_open_error(message: &str) -> CaptureErrorKind {
    let lower = message.to_lowercase();
    if ["permission", "denied", "not allowed", "not authorized"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        CaptureErrorKind::NotAllowed
    } else {
        CaptureErrorKind::StartFailed
    }
}
