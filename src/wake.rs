//! Wake word detection.
//!
//! The built-in spotter compares MFCC features of a sliding ~1 s audio
//! window against reference recordings of the keyword using dynamic time
//! warping. DTW distance is mapped to a 0-1 score via `1 / (1 + d)` and
//! compared against the configured threshold.
//!
//! Reference recordings are 16 kHz mono WAVs living next to the keywords
//! file; the first keyword in that file names the emitted event.

use crate::audio::wav;
use crate::config::AssistantConfig;
use crate::error::{AssistantError, Result};
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Emitted once per detected keyword occurrence.
#[derive(Debug, Clone)]
pub struct WakeEvent {
    /// The keyword that was spotted.
    pub keyword: String,
    /// When the detection fired.
    pub at: Instant,
}

/// Streaming keyword spotter consuming 16-bit mono PCM at 16 kHz.
///
/// `process_audio` must be cheap and non-blocking; it is called from the
/// orchestrator's frame-routing loop.
pub trait WakeWordDetector: Send {
    /// Feed a PCM frame; returns an event when the keyword is spotted.
    /// The detector self-resets after emitting.
    fn process_audio(&mut self, pcm: &[u8]) -> Option<WakeEvent>;

    /// Drop any buffered audio.
    fn reset(&mut self);
}

/// Analysis window: 25 ms at 16 kHz.
const FRAME_SIZE: usize = 400;
/// Hop: 10 ms at 16 kHz.
const HOP_SIZE: usize = 160;
/// Mel filter bank size.
const NUM_MEL_FILTERS: usize = 26;
/// Cepstral coefficients kept per frame.
const NUM_MFCC: usize = 13;
/// Detection window length in samples (~1 s; references are 0.3-0.8 s).
const WINDOW_SAMPLES: usize = 16_000;

/// MFCC+DTW template spotter.
pub struct MfccWakeDetector {
    keyword: String,
    references: Vec<Vec<Vec<f32>>>,
    threshold: f32,
    hann: Vec<f32>,
    filterbank: Vec<Vec<f32>>,
    window: Vec<f32>,
}

impl MfccWakeDetector {
    /// Load the keyword label and reference recordings named by the config.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the keywords file is unreadable, names no
    /// keyword, or no usable reference recording is found.
    pub fn from_config(config: &AssistantConfig) -> Result<Self> {
        let keywords_path = Path::new(&config.wakeword_keywords_file);
        let keyword = read_keyword(keywords_path)?;
        let references_dir = match keywords_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let hann = hann_window(FRAME_SIZE);
        let filterbank = mel_filterbank(NUM_MEL_FILTERS, FRAME_SIZE, wav::PIPELINE_SAMPLE_RATE);

        let mut references = Vec::new();
        for entry in std::fs::read_dir(references_dir)
            .map_err(|e| AssistantError::Config(format!("cannot read wake reference dir: {e}")))?
        {
            let entry =
                entry.map_err(|e| AssistantError::Config(format!("cannot read dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wav") {
                continue;
            }
            match load_reference(&path, &hann, &filterbank) {
                Ok(frames) if !frames.is_empty() => {
                    info!("loaded wake reference: {}", path.display());
                    references.push(frames);
                }
                Ok(_) => warn!("wake reference too short, skipping: {}", path.display()),
                Err(e) => warn!("skipping wake reference {}: {e}", path.display()),
            }
        }

        if references.is_empty() {
            return Err(AssistantError::Config(format!(
                "no wake word reference recordings in {}",
                references_dir.display()
            )));
        }

        info!(
            "wake detector ready: keyword '{}', {} references, threshold {}",
            keyword,
            references.len(),
            config.wake_threshold
        );

        Ok(Self {
            keyword,
            references,
            threshold: config.wake_threshold,
            hann,
            filterbank,
            window: Vec::with_capacity(WINDOW_SAMPLES + FRAME_SIZE),
        })
    }

    fn best_score(&self, features: &[Vec<f32>]) -> f32 {
        self.references
            .iter()
            .map(|reference| 1.0 / (1.0 + dtw_distance(features, reference)))
            .fold(0.0, f32::max)
    }
}

impl WakeWordDetector for MfccWakeDetector {
    fn process_audio(&mut self, pcm: &[u8]) -> Option<WakeEvent> {
        self.window.extend(wav::pcm_to_f32(pcm));
        if self.window.len() < WINDOW_SAMPLES {
            return None;
        }

        let start = self.window.len() - WINDOW_SAMPLES;
        let features = extract_mfccs(&self.window[start..], &self.hann, &self.filterbank);

        let detected = !features.is_empty() && self.best_score(&features) >= self.threshold;

        if detected {
            // Self-reset so the same keyword can fire again later.
            self.window.clear();
            return Some(WakeEvent {
                keyword: self.keyword.clone(),
                at: Instant::now(),
            });
        }

        // Slide forward by half a window so evaluations overlap.
        self.window.drain(..WINDOW_SAMPLES / 2);
        None
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

/// First non-comment, non-empty line of the keywords file.
fn read_keyword(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        AssistantError::Config(format!("cannot read keywords file {}: {e}", path.display()))
    })?;
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .ok_or_else(|| {
            AssistantError::Config(format!("no keyword listed in {}", path.display()))
        })
}

fn load_reference(path: &Path, hann: &[f32], filterbank: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
    let bytes = std::fs::read(path)?;
    let (pcm, rate) = wav::wav_to_pcm(&bytes)?;
    if rate != wav::PIPELINE_SAMPLE_RATE {
        return Err(AssistantError::Config(format!(
            "reference must be {}Hz, got {rate}Hz",
            wav::PIPELINE_SAMPLE_RATE
        )));
    }
    Ok(extract_mfccs(&wav::pcm_to_f32(&pcm), hann, filterbank))
}

// ── feature extraction ──────────────────────────────────────────────

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|n| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * n as f32 / (size - 1) as f32).cos())
        })
        .collect()
}

/// MFCC frames for an audio buffer, one vector per 10 ms hop.
fn extract_mfccs(samples: &[f32], hann: &[f32], filterbank: &[Vec<f32>]) -> Vec<Vec<f32>> {
    if samples.len() < FRAME_SIZE {
        return Vec::new();
    }

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FRAME_SIZE);
    let power_len = FRAME_SIZE / 2 + 1;
    let mut frames = Vec::with_capacity((samples.len() - FRAME_SIZE) / HOP_SIZE + 1);
    let mut spectrum = vec![Complex::new(0.0f32, 0.0f32); FRAME_SIZE];

    let mut start = 0;
    while start + FRAME_SIZE <= samples.len() {
        for (slot, (&s, &w)) in spectrum
            .iter_mut()
            .zip(samples[start..start + FRAME_SIZE].iter().zip(hann.iter()))
        {
            *slot = Complex::new(s * w, 0.0);
        }
        fft.process(&mut spectrum);

        let mel_energies: Vec<f32> = filterbank
            .iter()
            .map(|filter| {
                let energy: f32 = filter
                    .iter()
                    .zip(spectrum[..power_len].iter())
                    .map(|(&f, c)| f * (c.re * c.re + c.im * c.im) / FRAME_SIZE as f32)
                    .sum();
                energy.max(1e-10).ln()
            })
            .collect();

        frames.push(dct_ii(&mel_energies, NUM_MFCC));
        start += HOP_SIZE;
    }

    frames
}

/// Mel-spaced triangular filter bank over the power spectrum bins.
fn mel_filterbank(num_filters: usize, fft_size: usize, sample_rate: u32) -> Vec<Vec<f32>> {
    let power_len = fft_size / 2 + 1;
    let max_mel = hz_to_mel(sample_rate as f32 / 2.0);

    let bin_of = |mel: f32| -> usize {
        ((fft_size as f32 + 1.0) * mel_to_hz(mel) / sample_rate as f32).floor() as usize
    };
    let points: Vec<usize> = (0..num_filters + 2)
        .map(|i| bin_of(max_mel * i as f32 / (num_filters + 1) as f32))
        .collect();

    (0..num_filters)
        .map(|m| {
            let (left, center, right) = (points[m], points[m + 1], points[m + 2]);
            let mut filter = vec![0.0f32; power_len];
            for (i, value) in filter.iter_mut().enumerate() {
                if i > left && i <= center && center > left {
                    *value = (i - left) as f32 / (center - left) as f32;
                } else if i > center && i <= right && right > center {
                    *value = (right - i) as f32 / (right - center) as f32;
                }
            }
            filter
        })
        .collect()
}

fn dct_ii(input: &[f32], num_coeffs: usize) -> Vec<f32> {
    let n = input.len();
    (0..num_coeffs)
        .map(|k| {
            input
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    v * (std::f32::consts::PI * k as f32 * (2 * i + 1) as f32 / (2 * n) as f32)
                        .cos()
                })
                .sum()
        })
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

// ── dynamic time warping ────────────────────────────────────────────

/// Path-length-normalized DTW distance between two MFCC sequences, using a
/// rolling two-row cost table.
fn dtw_distance(input: &[Vec<f32>], reference: &[Vec<f32>]) -> f32 {
    let (n, m) = (input.len(), reference.len());
    if n == 0 || m == 0 {
        return f32::INFINITY;
    }

    let mut prev = vec![f32::INFINITY; m + 1];
    let mut curr = vec![f32::INFINITY; m + 1];
    prev[0] = 0.0;

    for row in input {
        curr[0] = f32::INFINITY;
        for j in 1..=m {
            let d = euclidean(row, &reference[j - 1]);
            let best = prev[j].min(curr[j - 1]).min(prev[j - 1]);
            curr[j] = d + best;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[m] / (n + m) as f32
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn mel_scale_round_trip() {
        let hz = 1000.0;
        let back = mel_to_hz(hz_to_mel(hz));
        assert!((hz - back).abs() < 0.1);
    }

    #[test]
    fn filterbank_shape_and_sign() {
        let fb = mel_filterbank(NUM_MEL_FILTERS, FRAME_SIZE, 16_000);
        assert_eq!(fb.len(), NUM_MEL_FILTERS);
        for filter in &fb {
            assert_eq!(filter.len(), FRAME_SIZE / 2 + 1);
            assert!(filter.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn dct_dc_coefficient_is_sum() {
        let input = vec![1.0, 2.0, 3.0, 4.0];
        let out = dct_ii(&input, 3);
        assert_eq!(out.len(), 3);
        assert!((out[0] - 10.0).abs() < 0.01);
    }

    #[test]
    fn mfcc_frame_counts() {
        let hann = hann_window(FRAME_SIZE);
        let fb = mel_filterbank(NUM_MEL_FILTERS, FRAME_SIZE, 16_000);
        assert!(extract_mfccs(&[], &hann, &fb).is_empty());
        assert!(extract_mfccs(&vec![0.0; FRAME_SIZE - 1], &hann, &fb).is_empty());
        let one = extract_mfccs(&vec![0.0; FRAME_SIZE], &hann, &fb);
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].len(), NUM_MFCC);
        // (8000 - 400) / 160 + 1 frames for half a second.
        let many = extract_mfccs(&vec![0.0; 8_000], &hann, &fb);
        assert_eq!(many.len(), 48);
    }

    #[test]
    fn dtw_identical_is_zero() {
        let seq = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        assert!(dtw_distance(&seq, &seq) < 0.001);
    }

    #[test]
    fn dtw_disjoint_is_large() {
        let a = vec![vec![0.0, 0.0]; 2];
        let b = vec![vec![10.0, 10.0]; 2];
        assert!(dtw_distance(&a, &b) > 1.0);
    }

    #[test]
    fn dtw_empty_is_infinite() {
        let empty: Vec<Vec<f32>> = Vec::new();
        let one = vec![vec![1.0]];
        assert!(dtw_distance(&empty, &one).is_infinite());
        assert!(dtw_distance(&one, &empty).is_infinite());
    }

    #[test]
    fn dtw_handles_repeated_pattern() {
        let short = vec![vec![1.0, 2.0]];
        let long = vec![vec![1.0, 2.0]; 3];
        assert!(dtw_distance(&long, &short) < 0.001);
    }

    fn tone_samples(seconds: f32, freq: f32) -> Vec<f32> {
        let n = (seconds * 16_000.0) as usize;
        (0..n)
            .map(|i| 0.4 * (2.0 * std::f32::consts::PI * freq * i as f32 / 16_000.0).sin())
            .collect()
    }

    fn detector_with_reference(samples: &[f32], threshold: f32) -> MfccWakeDetector {
        let dir = tempfile::tempdir().unwrap();
        let keywords = dir.path().join("keywords.txt");
        std::fs::write(&keywords, "# comment\nlyra\n").unwrap();
        let wav_bytes =
            wav::pcm_to_wav(&wav::f32_to_pcm(samples), wav::PIPELINE_SAMPLE_RATE).unwrap();
        std::fs::write(dir.path().join("ref0.wav"), wav_bytes).unwrap();

        let config = AssistantConfig {
            wakeword_keywords_file: keywords.to_string_lossy().into_owned(),
            wake_threshold: threshold,
            ..AssistantConfig::default()
        };
        let detector = MfccWakeDetector::from_config(&config).unwrap();
        // tempdir can drop; references are loaded eagerly.
        drop(dir);
        detector
    }

    #[test]
    fn keyword_read_from_file() {
        let detector = detector_with_reference(&tone_samples(0.5, 440.0), 0.99);
        assert_eq!(detector.keyword, "lyra");
    }

    #[test]
    fn detects_matching_audio_and_self_resets() {
        let reference = tone_samples(0.5, 440.0);
        let mut detector = detector_with_reference(&reference, 0.6);

        // Feed a full window of the same tone; DTW distance is ~0.
        let window = tone_samples(1.0, 440.0);
        let pcm = wav::f32_to_pcm(&window);
        let event = detector.process_audio(&pcm);
        let event = event.expect("matching audio should trigger detection");
        assert_eq!(event.keyword, "lyra");
        assert!(detector.window.is_empty(), "detector must self-reset");
    }

    #[test]
    fn ignores_mismatched_audio() {
        let mut detector = detector_with_reference(&tone_samples(0.5, 440.0), 0.95);
        let noise: Vec<f32> = (0..16_000)
            .map(|i| if i % 2 == 0 { 0.9 } else { -0.9 })
            .collect();
        assert!(detector.process_audio(&wav::f32_to_pcm(&noise)).is_none());
    }

    #[test]
    fn missing_keyword_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let keywords = dir.path().join("keywords.txt");
        std::fs::write(&keywords, "# only comments\n").unwrap();
        let config = AssistantConfig {
            wakeword_keywords_file: keywords.to_string_lossy().into_owned(),
            ..AssistantConfig::default()
        };
        assert!(matches!(
            MfccWakeDetector::from_config(&config),
            Err(AssistantError::Config(_))
        ));
    }
}
