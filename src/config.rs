//! Configuration for the assistant core.
//!
//! The config is consumed frozen at construction; loading it from YAML or
//! the environment is the caller's concern. Every duration is stored as an
//! integer millisecond field with a typed accessor.

use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Frozen configuration consumed by [`crate::orchestrator::Orchestrator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Path to the whisper model file.
    pub whisper_model_path: String,
    /// Path to the one-shot whisper binary.
    pub whisper_executable: String,
    /// Path to the whisper server binary. When set, server mode is used.
    pub whisper_server_executable: Option<String>,
    /// Loopback port the STT server listens on.
    pub whisper_server_port: u16,
    /// How long to wait for the STT server readiness probe.
    pub server_ready_timeout_ms: u64,

    /// Model handle passed to the LLM binary.
    pub llama_model_repo: String,
    /// Path to the LLM binary (interactive conversation mode).
    pub llama_executable: String,
    /// Cap on tokens per reply passed to the LLM binary.
    pub llama_max_reply_tokens: u32,
    /// How long to wait for the initial LLM prompt marker.
    pub llm_ready_timeout_ms: u64,
    /// How long to wait for the closing prompt marker of one reply.
    pub llm_reply_timeout_ms: u64,

    /// Wake model encoder path.
    pub wakeword_encoder_path: String,
    /// Wake model decoder path.
    pub wakeword_decoder_path: String,
    /// Wake model joiner path.
    pub wakeword_joiner_path: String,
    /// Wake model tokens path.
    pub wakeword_tokens_path: String,
    /// Keywords file; one keyword per line, `#` comments. Reference
    /// recordings are resolved relative to this file's directory.
    pub wakeword_keywords_file: String,
    /// Detection score threshold for the wake word spotter.
    pub wake_threshold: f32,

    /// TTS model path.
    pub tts_model_path: String,
    /// TTS tokens path.
    pub tts_tokens_path: String,
    /// TTS data directory (espeak-ng data or similar).
    pub tts_data_dir: String,
    /// Path to the native TTS library.
    pub sherpa_lib_path: String,
    /// Speech speed multiplier.
    pub tts_speed: f32,
    /// Speaker id for multi-speaker models.
    pub tts_speaker_id: u32,

    /// Initial system message for the conversation context.
    pub system_prompt: Option<String>,

    /// RMS energy threshold above which a frame counts as speech.
    pub silence_threshold: f32,
    /// Contiguous sub-threshold wall time required to declare end of speech.
    pub silence_duration_ms: u64,

    /// Conversation history FIFO bound. `0` means unbounded.
    pub max_history_length: usize,

    /// Pause between spoken sentences.
    pub sentence_pause_ms: u64,

    /// Whether the assistant keeps listening after replying.
    pub enable_follow_up: bool,
    /// Follow-up window after a reply ending in a question.
    pub follow_up_timeout_ms: u64,
    /// Follow-up window after a statement reply.
    pub statement_follow_up_timeout_ms: u64,

    /// Whether wake words during `Speaking`/`Prompting` preempt the reply.
    pub enable_barge_in: bool,

    /// Directory of wake acknowledgment cue WAVs.
    pub acknowledgment_dir: Option<String>,
    /// Directory of barge-in acknowledgment cue WAVs.
    pub barge_in_dir: Option<String>,

    /// Whether session recording is enabled.
    pub recording_enabled: bool,
    /// Root directory for per-session recording directories.
    pub session_dir: String,

    /// Playback backend name (`aplay`, `ffplay`, ...). Auto-probed when unset.
    pub audio_player: Option<String>,
    /// Explicit path to the playback binary, overriding the probe.
    pub audio_player_path: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            whisper_model_path: String::new(),
            whisper_executable: String::new(),
            whisper_server_executable: None,
            whisper_server_port: 8178,
            server_ready_timeout_ms: 30_000,
            llama_model_repo: String::new(),
            llama_executable: String::new(),
            llama_max_reply_tokens: 512,
            llm_ready_timeout_ms: 30_000,
            llm_reply_timeout_ms: 120_000,
            wakeword_encoder_path: String::new(),
            wakeword_decoder_path: String::new(),
            wakeword_joiner_path: String::new(),
            wakeword_tokens_path: String::new(),
            wakeword_keywords_file: String::new(),
            wake_threshold: 0.55,
            tts_model_path: String::new(),
            tts_tokens_path: String::new(),
            tts_data_dir: String::new(),
            sherpa_lib_path: String::new(),
            tts_speed: 1.0,
            tts_speaker_id: 0,
            system_prompt: None,
            silence_threshold: 0.01,
            silence_duration_ms: 800,
            max_history_length: 10,
            sentence_pause_ms: 300,
            enable_follow_up: true,
            follow_up_timeout_ms: 4_000,
            statement_follow_up_timeout_ms: 4_000,
            enable_barge_in: true,
            acknowledgment_dir: None,
            barge_in_dir: None,
            recording_enabled: false,
            session_dir: "./sessions".to_owned(),
            audio_player: None,
            audio_player_path: None,
        }
    }
}

impl AssistantConfig {
    /// VAD hangover duration.
    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }

    /// Inter-sentence pause during `Speaking`.
    pub fn sentence_pause(&self) -> Duration {
        Duration::from_millis(self.sentence_pause_ms)
    }

    /// Follow-up window after a question.
    pub fn follow_up_timeout(&self) -> Duration {
        Duration::from_millis(self.follow_up_timeout_ms)
    }

    /// Follow-up window after a statement.
    pub fn statement_follow_up_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_follow_up_timeout_ms)
    }

    /// STT server readiness deadline.
    pub fn server_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.server_ready_timeout_ms)
    }

    /// LLM startup readiness deadline.
    pub fn llm_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_ready_timeout_ms)
    }

    /// Deadline for one LLM reply.
    pub fn llm_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_reply_timeout_ms)
    }

    /// Check that the fields required to bring up the external engines are
    /// present, before any process is spawned.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        if self.whisper_model_path.is_empty() {
            return Err(AssistantError::Config("whisper_model_path is empty".into()));
        }
        if self.whisper_server_executable.is_none() && self.whisper_executable.is_empty() {
            return Err(AssistantError::Config(
                "neither whisper_server_executable nor whisper_executable is set".into(),
            ));
        }
        if self.llama_executable.is_empty() {
            return Err(AssistantError::Config("llama_executable is empty".into()));
        }
        if self.llama_model_repo.is_empty() {
            return Err(AssistantError::Config("llama_model_repo is empty".into()));
        }
        if self.wakeword_keywords_file.is_empty() {
            return Err(AssistantError::Config(
                "wakeword_keywords_file is empty".into(),
            ));
        }
        if self.silence_threshold <= 0.0 {
            return Err(AssistantError::Config(
                "silence_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}
