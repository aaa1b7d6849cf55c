//! Whisper server mode: a persistent child process answering multipart
//! HTTP on a loopback port.
//!
//! Startup probes the port with short exponential backoff until the server
//! answers or the readiness deadline passes. Each transcription POSTs a
//! WAV-wrapped utterance and parses a `{"text": ...}` reply.

use crate::audio::wav;
use crate::config::AssistantConfig;
use crate::error::{AssistantError, Result};
use crate::stt::SpeechToText;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Transcription endpoint path.
const TRANSCRIBE_PATH: &str = "/v1/audio/transcriptions";

/// Initial readiness-probe delay; grows by 1.5x per attempt.
const PROBE_INITIAL_DELAY: Duration = Duration::from_millis(150);

/// Probe delay ceiling.
const PROBE_MAX_DELAY: Duration = Duration::from_secs(2);

/// How long a dying server child gets before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// HTTP client half of server mode, separable from process management so
/// the protocol is testable against a mock server.
pub struct WhisperServerClient {
    http: reqwest::Client,
    base_url: String,
}

impl WhisperServerClient {
    /// Client for a server rooted at `base_url` (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Poll until the server answers on its socket.
    ///
    /// Any HTTP response counts as ready; only connection failures retry.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the deadline passes without an answer.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = PROBE_INITIAL_DELAY;

        loop {
            if self.http.get(&self.base_url).send().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() + delay >= deadline {
                return Err(AssistantError::Timeout(format!(
                    "STT server at {} not ready after {timeout:?}",
                    self.base_url
                )));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 3 / 2).min(PROBE_MAX_DELAY);
        }
    }

    /// POST a WAV buffer and return the transcribed text.
    ///
    /// # Errors
    ///
    /// Returns `EngineFailed` on transport errors, non-success statuses, or
    /// malformed reply bodies.
    pub async fn transcribe_wav(&self, wav_bytes: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(wav_bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| AssistantError::EngineFailed(format!("multipart build: {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}{TRANSCRIBE_PATH}", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| AssistantError::EngineFailed(format!("STT request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AssistantError::EngineFailed(format!(
                "STT server returned {}",
                response.status()
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| AssistantError::EngineFailed(format!("STT reply parse: {e}")))?;
        Ok(parsed.text.trim().to_owned())
    }
}

/// Persistent whisper server child plus its client.
pub struct WhisperServer {
    child: Option<Child>,
    client: WhisperServerClient,
}

impl WhisperServer {
    /// Spawn the server binary and wait for readiness.
    ///
    /// # Errors
    ///
    /// Returns `InitializationFailed` if the binary cannot be spawned or
    /// does not become ready in time (the child is killed in that case).
    pub async fn start(config: &AssistantConfig) -> Result<Self> {
        let executable = config.whisper_server_executable.as_ref().ok_or_else(|| {
            AssistantError::Config("whisper_server_executable is not set".into())
        })?;
        let port = config.whisper_server_port;

        info!("starting STT server {executable} on port {port}");
        let mut child = Command::new(executable)
            .args([
                "-m",
                &config.whisper_model_path,
                "--host",
                "127.0.0.1",
                "--port",
                &port.to_string(),
            ])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AssistantError::InitializationFailed(format!("spawn {executable}: {e}"))
            })?;

        let client = WhisperServerClient::new(format!("http://127.0.0.1:{port}"));
        if let Err(e) = client.wait_ready(config.server_ready_timeout()).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(AssistantError::InitializationFailed(format!(
                "STT server readiness: {e}"
            )));
        }

        info!("STT server ready");
        Ok(Self {
            child: Some(child),
            client,
        })
    }
}

#[async_trait]
impl SpeechToText for WhisperServer {
    async fn transcribe(&mut self, pcm: &[u8]) -> Result<String> {
        if pcm.is_empty() {
            return Ok(String::new());
        }
        let wav_bytes = wav::pcm_to_wav(pcm, wav::PIPELINE_SAMPLE_RATE)?;
        self.client.transcribe_wav(wav_bytes).await
    }

    async fn dispose(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!("STT server exited: {status}"),
                Ok(Err(e)) => warn!("STT server wait failed: {e}"),
                Err(_) => warn!("STT server did not exit within grace period"),
            }
        }
        Ok(())
    }
}
