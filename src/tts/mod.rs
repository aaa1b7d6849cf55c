//! Text-to-speech synthesis behind a dedicated worker thread.
//!
//! Native TTS engines are single-threaded; running one on its own OS
//! thread with a request/reply channel lets synthesis overlap playback
//! without ever blocking the orchestrator. `synthesize` enqueues a request
//! and returns a [`PendingSynthesis`] immediately; the streaming pipeline
//! queues these futures and awaits them in playback order.

use crate::audio::wav;
use crate::error::{AssistantError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Synthesized audio: f32 samples in `[-1, 1]` at the engine's sample rate.
#[derive(Debug, Clone)]
pub struct TtsResult {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl TtsResult {
    /// Convert to 16-bit LE PCM (clamp, round).
    pub fn to_pcm16(&self) -> Vec<u8> {
        wav::f32_to_pcm(&self.samples)
    }

    /// Wrap in a canonical WAV container.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        wav::pcm_to_wav(&self.to_pcm16(), self.sample_rate)
    }

    /// Playback duration of the buffer.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// The seam through which a native TTS engine is consumed.
///
/// Implementations are blocking and need not be thread-safe; the worker
/// serializes all calls on one thread. The sample rate is fixed by the
/// loaded model.
pub trait SynthesisEngine: Send {
    /// Synthesize one sentence.
    fn synthesize(&mut self, text: &str) -> Result<TtsResult>;

    /// Output sample rate of the loaded model.
    fn sample_rate(&self) -> u32;
}

struct SynthRequest {
    text: String,
    reply: oneshot::Sender<Result<TtsResult>>,
}

enum WorkerMsg {
    Synthesize(SynthRequest),
    Shutdown,
}

/// Cloneable handle for submitting synthesis requests.
#[derive(Clone)]
pub struct TtsHandle {
    tx: crossbeam_channel::Sender<WorkerMsg>,
    sample_rate: u32,
    disposed: Arc<AtomicBool>,
}

impl TtsHandle {
    /// Enqueue a synthesis request, returning its pending result without
    /// waiting. Requests complete in submission order.
    pub fn synthesize(&self, text: &str) -> PendingSynthesis {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.disposed.load(Ordering::Acquire) {
            let _ = reply_tx.send(Err(AssistantError::Disposed("TTS worker".into())));
        } else if self
            .tx
            .send(WorkerMsg::Synthesize(SynthRequest {
                text: text.to_owned(),
                reply: reply_tx,
            }))
            .is_err()
        {
            // Worker thread is gone; surface it as a disposal.
            return PendingSynthesis { rx: None };
        }
        PendingSynthesis { rx: Some(reply_rx) }
    }

    /// The engine's output sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// A synthesis result that has been requested but not yet produced.
pub struct PendingSynthesis {
    rx: Option<oneshot::Receiver<Result<TtsResult>>>,
}

impl PendingSynthesis {
    /// Wait for the worker to produce the result.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` if the worker was torn down before replying.
    pub async fn wait(self) -> Result<TtsResult> {
        match self.rx {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(AssistantError::Disposed("TTS worker".into()))),
            None => Err(AssistantError::Disposed("TTS worker".into())),
        }
    }
}

/// Owns the engine thread. Dropping or disposing the worker refuses new
/// requests and lets in-flight ones finish.
pub struct TtsWorker {
    handle: TtsHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TtsWorker {
    /// Move the engine onto a dedicated thread and start serving requests.
    ///
    /// # Errors
    ///
    /// Returns `InitializationFailed` if the worker thread cannot be spawned.
    pub fn spawn(mut engine: Box<dyn SynthesisEngine>) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<WorkerMsg>();
        let sample_rate = engine.sample_rate();

        let thread = std::thread::Builder::new()
            .name("tts-worker".to_owned())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    let request = match msg {
                        WorkerMsg::Synthesize(request) => request,
                        WorkerMsg::Shutdown => break,
                    };
                    let started = Instant::now();
                    let result = engine.synthesize(&request.text);
                    if let Ok(ref audio) = result {
                        info!(
                            "synthesized {} samples ({:.1}s audio) in {:.0}ms",
                            audio.samples.len(),
                            audio.duration().as_secs_f32(),
                            started.elapsed().as_millis()
                        );
                    }
                    // Receiver may have been dropped on barge-in; discard.
                    let _ = request.reply.send(result);
                }
            })
            .map_err(|e| {
                AssistantError::InitializationFailed(format!("TTS worker thread: {e}"))
            })?;

        Ok(Self {
            handle: TtsHandle {
                tx,
                sample_rate,
                disposed: Arc::new(AtomicBool::new(false)),
            },
            thread: Some(thread),
        })
    }

    /// A cloneable submission handle.
    pub fn handle(&self) -> TtsHandle {
        self.handle.clone()
    }

    /// Refuse further requests and join the engine thread once queued work
    /// drains.
    pub fn dispose(&mut self) {
        self.handle.disposed.store(true, Ordering::Release);
        // Requests already queued are still served; the sentinel ends the
        // loop regardless of how many handle clones stay alive.
        let _ = self.handle.tx.send(WorkerMsg::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("TTS worker thread panicked during dispose");
        }
    }
}

impl Drop for TtsWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.dispose();
        }
    }
}
