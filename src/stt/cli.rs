//! Whisper one-shot mode: spawn the CLI binary per utterance.
//!
//! The utterance is written to a temp WAV; the binary runs with timestamps
//! and progress prints disabled, and its stdout is filtered down to the
//! transcript lines.

use crate::audio::wav;
use crate::config::AssistantConfig;
use crate::error::{AssistantError, Result};
use crate::stt::SpeechToText;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Stdout line prefixes that are engine chatter, not transcript.
const INFO_PREFIXES: &[&str] = &[
    "whisper_",
    "ggml_",
    "main:",
    "system_info",
    "model_",
    "error:",
];

/// One-shot whisper CLI transcriber.
pub struct WhisperCli {
    executable: PathBuf,
    model_path: PathBuf,
}

impl WhisperCli {
    /// Build from config paths. Nothing is spawned until `transcribe`.
    pub fn new(config: &AssistantConfig) -> Self {
        Self {
            executable: PathBuf::from(&config.whisper_executable),
            model_path: PathBuf::from(&config.whisper_model_path),
        }
    }
}

#[async_trait]
impl SpeechToText for WhisperCli {
    async fn transcribe(&mut self, pcm: &[u8]) -> Result<String> {
        if pcm.is_empty() {
            return Ok(String::new());
        }

        let wav_bytes = wav::pcm_to_wav(pcm, wav::PIPELINE_SAMPLE_RATE)?;
        let tmp = tempfile::Builder::new()
            .prefix("lyra-stt-")
            .suffix(".wav")
            .tempfile()?;
        std::fs::write(tmp.path(), &wav_bytes)?;

        let output = Command::new(&self.executable)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg(tmp.path())
            .arg("-nt")
            .arg("-np")
            .output()
            .await
            .map_err(|e| {
                AssistantError::EngineFailed(format!(
                    "spawn {}: {e}",
                    self.executable.display()
                ))
            })?;

        if !output.status.success() {
            return Err(AssistantError::EngineFailed(format!(
                "STT binary exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = parse_transcript(&stdout);
        debug!("one-shot transcription: \"{text}\"");
        Ok(text)
    }
}

/// Keep transcript lines, dropping engine info output and timing markers.
fn parse_transcript(stdout: &str) -> String {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !INFO_PREFIXES.iter().any(|p| line.starts_with(p)))
        .filter(|line| !line.contains("-->") && !line.contains("load time"))
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_owned()
}
