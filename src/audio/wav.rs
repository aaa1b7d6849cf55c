//! In-memory WAV wrapping and PCM sample conversion.
//!
//! Everything on the wire between components is 16-bit signed little-endian
//! mono PCM at 16 kHz. WAV containers use the canonical 44-byte
//! RIFF/WAVE/PCM header.

use crate::error::{AssistantError, Result};
use std::io::Cursor;

/// Sample rate used on the wire between all components.
pub const PIPELINE_SAMPLE_RATE: u32 = 16_000;

/// Wrap raw 16-bit mono PCM in a WAV container.
///
/// # Errors
///
/// Returns an error if encoding fails (out-of-memory writes only; the input
/// is accepted as-is, with a trailing odd byte dropped).
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + pcm.len()));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| AssistantError::Audio(format!("WAV write error: {e}")))?;
        for sample in pcm.chunks_exact(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            writer
                .write_sample(value)
                .map_err(|e| AssistantError::Audio(format!("WAV write error: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| AssistantError::Audio(format!("WAV finalize error: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Parse a 16-bit PCM WAV, returning the raw sample bytes and sample rate.
///
/// Multi-channel files are mixed down to mono.
///
/// # Errors
///
/// Returns an error if the container is malformed or not 16-bit integer PCM.
pub fn wav_to_pcm(bytes: &[u8]) -> Result<(Vec<u8>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| AssistantError::Audio(format!("WAV parse error: {e}")))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(AssistantError::Audio(format!(
            "expected 16-bit integer PCM, got {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let samples: Vec<i16> = reader
        .samples::<i16>()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| AssistantError::Audio(format!("WAV read error: {e}")))?;

    let mono: Vec<i16> = if spec.channels > 1 {
        let ch = spec.channels as usize;
        samples
            .chunks(ch)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                (sum / ch as i32) as i16
            })
            .collect()
    } else {
        samples
    };

    let mut pcm = Vec::with_capacity(mono.len() * 2);
    for s in mono {
        pcm.extend_from_slice(&s.to_le_bytes());
    }
    Ok((pcm, spec.sample_rate))
}

/// Convert 16-bit LE PCM bytes to normalized f32 samples in `[-1, 1]`.
pub fn pcm_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0)
        .collect()
}

/// Convert f32 samples in `[-1, 1]` to 16-bit LE PCM bytes (clamp, round).
pub fn f32_to_pcm(samples: &[f32]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let value = (s.clamp(-1.0, 1.0) * 32_767.0).round() as i16;
        pcm.extend_from_slice(&value.to_le_bytes());
    }
    pcm
}

/// RMS energy of 16-bit PCM, over samples normalized to `[-1, 1]`.
pub fn rms(pcm: &[u8]) -> f32 {
    let n = pcm.len() / 2;
    if n == 0 {
        return 0.0;
    }
    let sum_sq: f32 = pcm
        .chunks_exact(2)
        .map(|b| {
            let s = f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0;
            s * s
        })
        .sum();
    (sum_sq / n as f32).sqrt()
}

/// Duration of a 16-bit mono PCM buffer in milliseconds.
pub fn duration_ms(pcm_len: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    (pcm_len as u64 / 2) * 1_000 / u64::from(sample_rate)
}
