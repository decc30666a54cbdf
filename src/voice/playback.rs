//! Speaker output via cpal

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Output sample rate (matches the TTS providers' MP3 output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// How often a blocking play checks for completion or stop
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Stop counter shared by a player and its in-flight plays
///
/// A play takes a snapshot before any work starts; every later `stop()`
/// invalidates it, including stops that land while audio is still being
/// synthesized or decoded.
#[derive(Debug, Clone, Default)]
pub struct StopEpoch(Arc<AtomicU64>);

impl StopEpoch {
    #[must_use]
    pub fn snapshot(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether `stop()` was called since `snapshot` was taken
    #[must_use]
    pub fn is_stopped(&self, snapshot: u64) -> bool {
        self.snapshot() != snapshot
    }
}

/// Read position over one play's samples, driven by the output callback
struct PlayCursor {
    samples: Vec<f32>,
    position: AtomicUsize,
    epoch: StopEpoch,
    started: u64,
}

impl PlayCursor {
    fn new(samples: Vec<f32>, epoch: StopEpoch, started: u64) -> Self {
        Self {
            samples,
            position: AtomicUsize::new(0),
            epoch,
            started,
        }
    }

    /// Fill an interleaved output buffer, repeating each sample per channel
    ///
    /// Once stopped, writes silence and stops advancing.
    fn fill(&self, data: &mut [f32], channels: usize) {
        if self.epoch.is_stopped(self.started) {
            data.fill(0.0);
            return;
        }

        let mut pos = self.position.load(Ordering::Relaxed);
        for frame in data.chunks_mut(channels.max(1)) {
            frame.fill(self.samples.get(pos).copied().unwrap_or(0.0));
            if pos < self.samples.len() {
                pos += 1;
            }
        }
        self.position.store(pos, Ordering::Relaxed);
    }

    fn is_finished(&self) -> bool {
        self.position.load(Ordering::Relaxed) >= self.samples.len()
    }
}

/// Plays decoded audio to the default output device
///
/// Holds only the negotiated config, so it is `Send`; the cpal stream is
/// built and dropped inside each blocking call.
pub struct AudioPlayback {
    config: StreamConfig,
    epoch: StopEpoch,
}

impl AudioPlayback {
    /// Negotiate a 24kHz output config, mono if possible, stereo otherwise
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if no device or suitable config is found
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        };

        let range = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports(c, 2))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = range
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            config,
            epoch: StopEpoch::default(),
        })
    }

    /// Snapshot to pass to a later play; taken before synthesis begins
    #[must_use]
    pub fn snapshot(&self) -> u64 {
        self.epoch.snapshot()
    }

    /// Whether `stop()` ran since `started`
    #[must_use]
    pub fn is_stopped(&self, started: u64) -> bool {
        self.epoch.is_stopped(started)
    }

    /// Cut any playback in progress, and any play whose snapshot predates this
    pub fn stop(&self) {
        self.epoch.stop();
    }

    /// Decode MP3 bytes and play them, blocking until done or stopped
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if decoding or the output stream fails
    pub fn play_mp3_blocking(&self, mp3: &[u8], started: u64) -> Result<()> {
        if self.is_stopped(started) {
            return Ok(());
        }
        let samples = decode_mp3(mp3)?;
        self.play_blocking(samples, started)
    }

    /// Play mono samples at [`PLAYBACK_SAMPLE_RATE`], blocking until done or
    /// stopped
    ///
    /// Nothing is played if `stop()` ran after `started` was taken.
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the output stream fails
    pub fn play_blocking(&self, samples: Vec<f32>, started: u64) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        if self.is_stopped(started) {
            tracing::debug!("play cancelled before it began");
            return Ok(());
        }

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device".to_string()))?;

        let channels = usize::from(self.config.channels);
        let total = samples.len();
        let cursor = Arc::new(PlayCursor::new(samples, self.epoch.clone(), started));

        let stream = {
            let cursor = Arc::clone(&cursor);
            device
                .build_output_stream(
                    &self.config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        cursor.fill(data, channels);
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (total as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
        let deadline = Instant::now() + Duration::from_millis(duration_ms + 500);

        while !cursor.is_finished() {
            if self.is_stopped(started) {
                tracing::debug!("playback stopped early");
                break;
            }
            if Instant::now() > deadline {
                tracing::warn!("playback timed out");
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        // Let the device drain its last buffer
        if !self.is_stopped(started) {
            std::thread::sleep(Duration::from_millis(100));
        }

        drop(stream);
        tracing::trace!(samples = total, "playback finished");
        Ok(())
    }
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns `Error::Audio` on a corrupt frame
pub fn decode_mp3(mp3: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) if frame.channels == 2 => {
                samples.extend(frame.data.chunks(2).map(|pair| {
                    let left = f32::from(pair[0]) / 32768.0;
                    let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32768.0;
                    f32::midpoint(left, right)
                }));
            }
            Ok(frame) => {
                samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(samples)
}

/// A sine tone at `freq` Hz for speaker checks
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn tone(freq: f32, seconds: f32, amplitude: f32) -> Vec<f32> {
    let rate = PLAYBACK_SAMPLE_RATE as f32;
    let len = (rate * seconds) as usize;
    (0..len)
        .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mp3_decodes_to_nothing() {
        assert!(decode_mp3(&[]).unwrap().is_empty());
    }

    #[test]
    fn cursor_plays_samples_on_every_channel() {
        let epoch = StopEpoch::default();
        let cursor = PlayCursor::new(vec![0.1, 0.2], epoch.clone(), epoch.snapshot());

        let mut out = [9.0; 6];
        cursor.fill(&mut out, 2);

        assert_eq!(out, [0.1, 0.1, 0.2, 0.2, 0.0, 0.0]);
        assert!(cursor.is_finished());
    }

    #[test]
    fn stop_before_play_begins_plays_nothing() {
        let epoch = StopEpoch::default();
        let started = epoch.snapshot();

        // Stop lands while the unit is still being synthesized or decoded
        epoch.stop();

        let cursor = PlayCursor::new(vec![0.5; 4], epoch.clone(), started);
        let mut out = [9.0; 4];
        cursor.fill(&mut out, 1);

        assert!(out.iter().all(|&s| s == 0.0));
        assert!(!cursor.is_finished());
        assert!(epoch.is_stopped(started));
    }

    #[test]
    fn stop_mid_play_silences_the_rest() {
        let epoch = StopEpoch::default();
        let cursor = PlayCursor::new(vec![0.5; 4], epoch.clone(), epoch.snapshot());

        let mut first = [0.0; 2];
        cursor.fill(&mut first, 1);
        assert_eq!(first, [0.5, 0.5]);

        epoch.stop();
        let mut rest = [9.0; 2];
        cursor.fill(&mut rest, 1);
        assert_eq!(rest, [0.0, 0.0]);
    }

    #[test]
    fn later_snapshot_is_not_stopped() {
        let epoch = StopEpoch::default();
        epoch.stop();
        let fresh = epoch.snapshot();
        assert!(!epoch.is_stopped(fresh));
    }

    #[test]
    fn tone_has_expected_length() {
        let samples = tone(440.0, 0.5, 0.3);
        assert_eq!(samples.len(), 12000);
        assert!(samples.iter().all(|s| s.abs() <= 0.3 + f32::EPSILON));
    }
}
