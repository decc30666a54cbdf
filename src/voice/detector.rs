//! End-of-utterance detection
//!
//! Energy gate over the 16kHz input: speech opens an utterance, and enough
//! trailing silence after enough speech closes it.

use super::microphone::rms;

/// Minimum RMS level to count as speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum utterance length, in samples (0.3s)
const MIN_SPEECH_SAMPLES: usize = 4800;

/// Trailing silence that closes an utterance, in samples (0.5s)
const SILENCE_SAMPLES: usize = 8000;

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Idle,
    /// Speech heard, accumulating
    Speaking,
    /// Utterance closed by trailing silence
    Complete,
}

/// Splits an input stream into utterances
pub struct UtteranceDetector {
    state: DetectorState,
    utterance: Vec<f32>,
    silence: usize,
}

impl Default for UtteranceDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl UtteranceDetector {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: DetectorState::Idle,
            utterance: Vec::new(),
            silence: 0,
        }
    }

    /// Feed a block of samples; returns true once an utterance is complete
    pub fn process(&mut self, samples: &[f32]) -> bool {
        if samples.is_empty() {
            return self.state == DetectorState::Complete;
        }

        let level = rms(samples);
        let is_speech = level > ENERGY_THRESHOLD;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Speaking;
                    self.utterance.clear();
                    self.utterance.extend_from_slice(samples);
                    self.silence = 0;
                    tracing::trace!(level, "speech onset");
                }
            }
            DetectorState::Speaking => {
                self.utterance.extend_from_slice(samples);
                if is_speech {
                    self.silence = 0;
                } else {
                    self.silence += samples.len();
                }

                if self.silence > SILENCE_SAMPLES {
                    if self.utterance.len() > MIN_SPEECH_SAMPLES + self.silence {
                        tracing::debug!(samples = self.utterance.len(), "utterance complete");
                        self.state = DetectorState::Complete;
                    } else {
                        // A click or cough, not speech
                        tracing::trace!("discarding short burst");
                        self.reset();
                    }
                }
            }
            DetectorState::Complete => {}
        }

        self.state == DetectorState::Complete
    }

    /// Whether any speech has been heard since the last reset
    #[must_use]
    pub fn heard_speech(&self) -> bool {
        self.state != DetectorState::Idle
    }

    /// Take the completed utterance and return to idle
    pub fn take_utterance(&mut self) -> Vec<f32> {
        let utterance = std::mem::take(&mut self.utterance);
        self.reset();
        utterance
    }

    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.utterance.clear();
        self.silence = 0;
    }

    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_keeps_detector_idle() {
        let mut detector = UtteranceDetector::new();
        assert!(!detector.process(&[0.0; 1600]));
        assert_eq!(detector.state(), DetectorState::Idle);
        assert!(!detector.heard_speech());
    }

    #[test]
    fn short_burst_is_discarded() {
        let mut detector = UtteranceDetector::new();
        detector.process(&[0.5; 1600]);
        assert_eq!(detector.state(), DetectorState::Speaking);
        for _ in 0..6 {
            detector.process(&[0.0; 1600]);
        }
        assert_eq!(detector.state(), DetectorState::Idle);
    }
}
