//! Microphone capture via cpal.
//!
//! Captures at the device's native sample rate and downsamples to 16 kHz
//! mono 16-bit PCM for the pipeline. The cpal stream lives on a dedicated
//! thread; chunks are fanned out over a broadcast channel so the routing
//! loop is never blocked on capture I/O.

use crate::audio::AudioSource;
use crate::audio::wav::{self, PIPELINE_SAMPLE_RATE};
use crate::error::{AssistantError, Result};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Broadcast capacity per subscriber, in chunks.
const CHUNK_QUEUE_SIZE: usize = 64;

/// Frames per emitted chunk at the pipeline sample rate (32 ms at 16 kHz).
const CHUNK_FRAMES: usize = 512;

/// Microphone [`AudioSource`] backed by cpal.
pub struct CpalSource {
    input_device: Option<String>,
    tx: broadcast::Sender<Vec<u8>>,
    accumulated: Arc<Mutex<Vec<u8>>>,
    worker: Option<CaptureWorker>,
}

struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

impl CpalSource {
    /// Create a capture source. `input_device` selects a device by name;
    /// `None` uses the system default.
    pub fn new(input_device: Option<String>) -> Self {
        let (tx, _) = broadcast::channel(CHUNK_QUEUE_SIZE);
        Self {
            input_device,
            tx,
            accumulated: Arc::new(Mutex::new(Vec::new())),
            worker: None,
        }
    }
}

#[async_trait]
impl AudioSource for CpalSource {
    async fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(AssistantError::NotReady("capture already started".into()));
        }

        let device_name = self.input_device.clone();
        let tx = self.tx.clone();
        let accumulated = Arc::clone(&self.accumulated);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        // cpal streams are not Send; keep the stream on its own thread and
        // hold it alive until stop() signals.
        let thread = std::thread::spawn(move || {
            let stream = match build_capture_stream(device_name, tx, accumulated) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AssistantError::Audio(format!(
                    "failed to start input stream: {e}"
                ))));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            let _ = stop_rx.recv();
            drop(stream);
        });

        let ready = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .map_err(|e| AssistantError::Channel(format!("capture startup join: {e}")))?
            .map_err(|_| AssistantError::Audio("capture thread exited during startup".into()))?;
        ready?;

        self.worker = Some(CaptureWorker { stop_tx, thread });
        info!("audio capture started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<Vec<u8>> {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let _ = tokio::task::spawn_blocking(move || worker.thread.join()).await;
            info!("audio capture stopped");
        }
        let mut acc = self
            .accumulated
            .lock()
            .map_err(|_| AssistantError::Audio("capture accumulator poisoned".into()))?;
        Ok(std::mem::take(&mut *acc))
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.tx.subscribe()
    }
}

/// Build the cpal input stream: native rate/channels in, 16 kHz mono
/// 16-bit PCM chunks out.
fn build_capture_stream(
    device_name: Option<String>,
    tx: broadcast::Sender<Vec<u8>>,
    accumulated: Arc<Mutex<Vec<u8>>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = device_name {
        let requested = host
            .input_devices()
            .map_err(|e| AssistantError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| match d.description() {
                Ok(desc) => desc.name() == name,
                Err(_) => false,
            });
        match requested {
            Some(device) => device,
            None => {
                warn!("input device '{name}' not found, falling back to default");
                host.default_input_device()
                    .ok_or_else(|| AssistantError::Audio("no default input device".into()))?
            }
        }
    } else {
        host.default_input_device()
            .ok_or_else(|| AssistantError::Audio("no default input device".into()))?
    };

    let device_label = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {device_label}");

    let default_config = device
        .default_input_config()
        .map_err(|e| AssistantError::Audio(format!("no default input config: {e}")))?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        "native input config: {}Hz, {} channels -> {}Hz mono",
        native_rate, native_channels, PIPELINE_SAMPLE_RATE
    );

    let mut pending: Vec<f32> = Vec::with_capacity(CHUNK_FRAMES * 4);

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };
                let samples = if native_rate != PIPELINE_SAMPLE_RATE {
                    downsample(&mono, native_rate, PIPELINE_SAMPLE_RATE)
                } else {
                    mono
                };
                pending.extend_from_slice(&samples);

                while pending.len() >= CHUNK_FRAMES {
                    let chunk: Vec<f32> = pending.drain(..CHUNK_FRAMES).collect();
                    let pcm = wav::f32_to_pcm(&chunk);
                    if let Ok(mut acc) = accumulated.lock() {
                        acc.extend_from_slice(&pcm);
                    }
                    // broadcast::send never blocks; lagging subscribers skip.
                    let _ = tx.send(pcm);
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| AssistantError::Audio(format!("failed to build input stream: {e}")))?;

    Ok(stream)
}

/// Average interleaved channels down to mono.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation downsampler. Speech energy sits below 8 kHz, so no
/// anti-alias filter is needed for 48 kHz -> 16 kHz.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;
        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        output.push(sample as f32);
    }

    output
}
