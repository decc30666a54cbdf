//! Audio hardware and speech provider adapters
//!
//! Concrete implementations behind the pipeline's seams: a cpal microphone
//! engine for capture, and HTTP TTS plus cpal playback for synthesis.

mod detector;
mod engine;
mod microphone;
mod playback;
mod stt;
mod tts;
mod volume;

pub use detector::{DetectorState, UtteranceDetector};
pub use engine::MicrophoneEngine;
pub use microphone::{Microphone, SAMPLE_RATE, rms, samples_to_wav};
pub use playback::{AudioPlayback, PLAYBACK_SAMPLE_RATE, decode_mp3, tone};
pub use stt::SpeechToText;
pub use tts::TextToSpeech;
pub use volume::{FFT_SIZE, VolumeMeter};
