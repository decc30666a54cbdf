//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;

use voiceloop::voice::{
    DetectorState, FFT_SIZE, PLAYBACK_SAMPLE_RATE, SAMPLE_RATE, UtteranceDetector, VolumeMeter,
    decode_mp3, rms, samples_to_wav, tone,
};

/// Samples in one 100ms capture poll
const BLOCK: usize = SAMPLE_RATE as usize / 10;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

/// Feed `samples` in capture-sized blocks, returning whether any block completed
fn feed(detector: &mut UtteranceDetector, samples: &[f32]) -> bool {
    samples
        .chunks(BLOCK)
        .fold(false, |done, block| detector.process(block) || done)
}

#[test]
fn test_detector_starts_idle() {
    let detector = UtteranceDetector::new();
    assert_eq!(detector.state(), DetectorState::Idle);
    assert!(!detector.heard_speech());
}

#[test]
fn test_speech_then_silence_completes_utterance() {
    let mut detector = UtteranceDetector::new();

    assert!(!feed(&mut detector, &generate_silence(0.3)));
    assert_eq!(detector.state(), DetectorState::Idle);

    let speech = generate_sine_samples(300.0, 0.8, 0.3);
    assert!(!feed(&mut detector, &speech));
    assert_eq!(detector.state(), DetectorState::Speaking);
    assert!(detector.heard_speech());

    // Under half a second of silence keeps the utterance open
    assert!(!feed(&mut detector, &generate_silence(0.3)));
    assert_eq!(detector.state(), DetectorState::Speaking);

    assert!(feed(&mut detector, &generate_silence(0.4)));
    assert_eq!(detector.state(), DetectorState::Complete);

    let utterance = detector.take_utterance();
    assert!(utterance.len() >= speech.len());
    assert_eq!(detector.state(), DetectorState::Idle);
}

#[test]
fn test_pause_mid_sentence_does_not_split() {
    let mut detector = UtteranceDetector::new();

    feed(&mut detector, &generate_sine_samples(300.0, 0.5, 0.3));
    feed(&mut detector, &generate_silence(0.3));
    feed(&mut detector, &generate_sine_samples(300.0, 0.5, 0.3));
    assert_eq!(detector.state(), DetectorState::Speaking);

    assert!(feed(&mut detector, &generate_silence(0.7)));
    let utterance = detector.take_utterance();
    assert!(utterance.len() > 2 * SAMPLE_RATE as usize / 2);
}

#[test]
fn test_click_is_not_an_utterance() {
    let mut detector = UtteranceDetector::new();

    feed(&mut detector, &generate_sine_samples(300.0, 0.1, 0.5));
    assert!(!feed(&mut detector, &generate_silence(0.7)));
    assert_eq!(detector.state(), DetectorState::Idle);
    assert!(!detector.heard_speech());
}

#[test]
fn test_quiet_hum_stays_idle() {
    let mut detector = UtteranceDetector::new();
    let hum = generate_sine_samples(50.0, 1.0, 0.01);
    assert!(rms(&hum) < 0.03);
    assert!(!feed(&mut detector, &hum));
    assert_eq!(detector.state(), DetectorState::Idle);
}

#[test]
fn test_detector_reset() {
    let mut detector = UtteranceDetector::new();
    feed(&mut detector, &generate_sine_samples(300.0, 0.5, 0.3));
    assert!(detector.heard_speech());

    detector.reset();
    assert_eq!(detector.state(), DetectorState::Idle);
    assert!(detector.take_utterance().is_empty());
}

#[test]
fn test_samples_to_wav() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav_data = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");

    // 16-bit mono: two bytes per sample after the 44-byte header
    assert_eq!(wav_data.len(), 44 + samples.len() * 2);
}

#[test]
fn test_wav_preserves_format_and_clamps() {
    let original_samples: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 2.0];
    let wav_data = samples_to_wav(&original_samples, SAMPLE_RATE).unwrap();

    let mut reader = hound::WavReader::new(Cursor::new(wav_data)).unwrap();

    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);

    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), original_samples.len());
    assert_eq!(read_samples[0], 0);
    assert_eq!(read_samples[3], i16::MAX);
    assert_eq!(read_samples[5], i16::MAX);
}

#[test]
fn test_volume_meter_tracks_level() {
    let mut meter = VolumeMeter::new(0.0);
    assert_eq!(meter.process(&[0.0; FFT_SIZE]), 0);

    // Speech-band content spread over many bins
    let voice: Vec<f32> = (1..=8u8)
        .map(|h| generate_sine_samples(150.0 * f32::from(h), 0.1, 0.1))
        .fold(vec![0.0; BLOCK], |acc, part| {
            acc.iter().zip(&part).map(|(a, b)| a + b).collect()
        });
    let level = meter.process(&voice);
    assert!(level > 0);
    assert!(level <= 100);
}

#[test]
fn test_volume_meter_accepts_short_blocks() {
    let mut meter = VolumeMeter::new(0.8);
    let level = meter.process(&generate_sine_samples(440.0, 0.01, 0.5));
    assert!(level <= 100);
}

#[test]
fn test_tone_for_speaker_check() {
    let samples = tone(440.0, 1.0, 0.3);
    assert_eq!(samples.len(), PLAYBACK_SAMPLE_RATE as usize);
    assert!((rms(&samples) - 0.3 / std::f32::consts::SQRT_2).abs() < 0.01);
}

#[test]
fn test_garbage_mp3_yields_no_audio_or_error() {
    // minimp3 skips bytes it cannot sync to; either outcome is acceptable,
    // but it must not produce audio from noise
    let garbage = vec![0x42u8; 512];
    if let Ok(samples) = decode_mp3(&garbage) {
        assert!(samples.is_empty());
    }
}
