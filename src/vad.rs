//! Voice activity detection using RMS energy thresholding.
//!
//! Speech is declared the moment a frame's energy crosses the threshold.
//! Silence requires a contiguous sub-threshold run lasting the configured
//! hangover duration in wall time.

use crate::audio::wav;
use std::time::{Duration, Instant};
use tracing::debug;

/// Detector state; also the event payload emitted on transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech in progress.
    Silence,
    /// Speech in progress.
    Speech,
}

/// Energy-based voice activity detector.
pub struct Vad {
    state: VadState,
    silence_started_at: Option<Instant>,
    threshold: f32,
    hangover: Duration,
}

impl Vad {
    /// Create a detector with the given RMS threshold and hangover duration.
    pub fn new(threshold: f32, hangover: Duration) -> Self {
        Self {
            state: VadState::Silence,
            silence_started_at: None,
            threshold,
            hangover,
        }
    }

    /// Process one PCM frame; returns the new state if a transition occurred.
    pub fn process(&mut self, pcm: &[u8]) -> Option<VadState> {
        self.process_at(pcm, Instant::now())
    }

    /// Like [`Vad::process`] with an explicit clock, so the hangover is
    /// deterministic under test.
    pub fn process_at(&mut self, pcm: &[u8], now: Instant) -> Option<VadState> {
        let rms = wav::rms(pcm);

        if rms > self.threshold {
            self.silence_started_at = None;
            if self.state == VadState::Silence {
                self.state = VadState::Speech;
                debug!("speech started (rms={rms:.4})");
                return Some(VadState::Speech);
            }
            return None;
        }

        if self.state == VadState::Speech {
            let started = *self.silence_started_at.get_or_insert(now);
            if now.duration_since(started) >= self.hangover {
                self.state = VadState::Silence;
                self.silence_started_at = None;
                debug!("speech ended");
                return Some(VadState::Silence);
            }
        }
        None
    }

    /// Current state.
    pub fn state(&self) -> VadState {
        self.state
    }

    /// Return to `Silence` and clear the hangover timer.
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.silence_started_at = None;
    }
}
