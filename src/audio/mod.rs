//! Audio I/O seams: microphone source, playback sink, WAV plumbing.

pub mod capture;
pub mod playback;
pub mod wav;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// A continuous source of 16-bit LE mono PCM frames at 16 kHz.
///
/// Frame sizes are arbitrary; consumers must not assume a fixed length.
/// Subscribers get an independent bounded queue, so a slow consumer lags
/// and skips rather than stalling capture.
#[async_trait]
pub trait AudioSource: Send {
    /// Begin capturing.
    async fn start(&mut self) -> Result<()>;

    /// Stop capturing and return all PCM accumulated since `start`.
    async fn stop(&mut self) -> Result<Vec<u8>>;

    /// Subscribe to the stream of PCM chunks.
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;
}

/// Plays PCM buffers and supports preemptive cancellation.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play a 16-bit mono PCM buffer at the given sample rate.
    ///
    /// Resolves only after the audio has audibly finished, so callers can
    /// sequence inter-sentence pauses.
    async fn play(&self, pcm: &[u8], sample_rate: u32) -> Result<()>;

    /// Preempt any in-flight playback. A concurrent `play` call is
    /// terminated and resolves without error.
    async fn stop(&self) -> Result<()>;

    /// Whether a `play` call is currently in flight.
    fn is_playing(&self) -> bool;
}
