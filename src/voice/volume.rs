//! Input level metering
//!
//! Mirrors the browser analyser node the level display was tuned against:
//! Blackman-windowed magnitude spectrum, per-bin exponential smoothing,
//! decibels mapped onto a byte range, then the average of all bins.

use std::f32::consts::PI;

/// Analysis window length in samples
pub const FFT_SIZE: usize = 1024;

/// Decibel floor mapped to 0
const MIN_DECIBELS: f32 = -100.0;

/// Decibel ceiling mapped to 255
const MAX_DECIBELS: f32 = -30.0;

/// Frequency-domain volume meter
pub struct VolumeMeter {
    smoothing: f32,
    window: Vec<f32>,
    cos_table: Vec<f32>,
    sin_table: Vec<f32>,
    smoothed: Vec<f32>,
    history: Vec<f32>,
}

impl VolumeMeter {
    /// Create a meter with the given smoothing constant (clamped to 0..=1)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(smoothing: f32) -> Self {
        let n = FFT_SIZE as f32;
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / n;
                0.08f32.mul_add(
                    (4.0 * PI * x).cos(),
                    0.5f32.mul_add(-(2.0 * PI * x).cos(), 0.42),
                )
            })
            .collect();
        let cos_table = (0..FFT_SIZE)
            .map(|i| (2.0 * PI * i as f32 / n).cos())
            .collect();
        let sin_table = (0..FFT_SIZE)
            .map(|i| (2.0 * PI * i as f32 / n).sin())
            .collect();

        Self {
            smoothing: smoothing.clamp(0.0, 1.0),
            window,
            cos_table,
            sin_table,
            smoothed: vec![0.0; FFT_SIZE / 2],
            history: Vec::with_capacity(FFT_SIZE),
        }
    }

    /// Feed new samples and return the current level, 0..=100
    ///
    /// Only the most recent [`FFT_SIZE`] samples are analysed; a short
    /// history is zero-padded at the front.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn process(&mut self, samples: &[f32]) -> u8 {
        self.history.extend_from_slice(samples);
        if self.history.len() > FFT_SIZE {
            let excess = self.history.len() - FFT_SIZE;
            self.history.drain(..excess);
        }

        let pad = FFT_SIZE - self.history.len();
        let frame: Vec<f32> = std::iter::repeat_n(0.0, pad)
            .chain(self.history.iter().copied())
            .zip(&self.window)
            .map(|(s, w)| s * w)
            .collect();

        let n = FFT_SIZE as f32;
        let mut total = 0.0f32;
        for k in 0..FFT_SIZE / 2 {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (i, &x) in frame.iter().enumerate() {
                let idx = (k * i) % FFT_SIZE;
                re += x * self.cos_table[idx];
                im -= x * self.sin_table[idx];
            }
            let magnitude = re.hypot(im) / n;

            let bin = &mut self.smoothed[k];
            *bin = self.smoothing.mul_add(*bin, (1.0 - self.smoothing) * magnitude);

            total += to_byte(*bin);
        }

        let average = total / (FFT_SIZE / 2) as f32;
        (average * 100.0 / 255.0).round().clamp(0.0, 100.0) as u8
    }

    /// Forget smoothing state and sample history
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|b| *b = 0.0);
        self.history.clear();
    }
}

/// Map a linear magnitude onto 0..=255 across the decibel range
fn to_byte(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 / (MAX_DECIBELS - MIN_DECIBELS) * (db - MIN_DECIBELS);
    scaled.floor().clamp(0.0, 255.0)
}
