//! Session recording: structured timeline events plus user audio.
//!
//! Each session gets its own directory holding a `session.jsonl` log (one
//! JSON object per line, each stamped with `type` and an ISO-8601
//! `timestamp`) and `audio/NNN_user.wav` files for user utterances.
//! Recording is optional; [`NullRecorder`] swallows everything.

use crate::audio::wav;
use crate::error::{AssistantError, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

/// One entry in the session timeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStart {
        config: serde_json::Value,
    },
    WakeWord {
        keyword: String,
    },
    UserAudio {
        file: String,
        duration_ms: u64,
        size_bytes: u64,
    },
    Transcription {
        text: String,
        audio_ref: Option<String>,
    },
    Response {
        text: String,
        sentence_count: usize,
    },
    BargeIn {
        sentence_index: usize,
        sentences_total: usize,
        partial_text: String,
    },
    SessionEnd {
        total_utterances: u64,
        session_duration_ms: u64,
    },
}

/// Sink for session timeline events and user audio.
///
/// Failures here must never stall orchestration; callers log and swallow.
pub trait Recorder: Send + Sync {
    /// Append a timeline event.
    fn record(&self, event: SessionEvent) -> Result<()>;

    /// Persist a user utterance, returning a reference usable in
    /// [`SessionEvent::Transcription::audio_ref`]. `None` when audio
    /// persistence is disabled.
    fn save_user_audio(&self, pcm: &[u8], sample_rate: u32) -> Result<Option<String>>;
}

/// Recorder used when recording is disabled.
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn record(&self, _event: SessionEvent) -> Result<()> {
        Ok(())
    }

    fn save_user_audio(&self, _pcm: &[u8], _sample_rate: u32) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Filesystem-backed recorder writing one directory per session.
pub struct SessionRecorder {
    session_dir: PathBuf,
    log: Mutex<File>,
    audio_counter: AtomicU32,
}

impl SessionRecorder {
    /// Create `root/session_<timestamp>/` with its `audio/` subdirectory
    /// and an empty `session.jsonl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories or log file cannot be created.
    pub fn create(root: &Path) -> Result<Self> {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
        let session_dir = root.join(format!("session_{stamp}"));
        std::fs::create_dir_all(session_dir.join("audio"))?;
        let log = File::create(session_dir.join("session.jsonl"))?;
        info!("recording session to {}", session_dir.display());
        Ok(Self {
            session_dir,
            log: Mutex::new(log),
            audio_counter: AtomicU32::new(0),
        })
    }

    /// The directory this session writes into.
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }
}

impl Recorder for SessionRecorder {
    fn record(&self, event: SessionEvent) -> Result<()> {
        let mut value = serde_json::to_value(&event)
            .map_err(|e| AssistantError::Channel(format!("event encode: {e}")))?;
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "timestamp".to_owned(),
                serde_json::Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        let mut log = self
            .log
            .lock()
            .map_err(|_| AssistantError::Channel("session log lock poisoned".into()))?;
        writeln!(log, "{value}")?;
        Ok(())
    }

    fn save_user_audio(&self, pcm: &[u8], sample_rate: u32) -> Result<Option<String>> {
        let index = self.audio_counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("audio/{index:03}_user.wav");
        let bytes = wav::pcm_to_wav(pcm, sample_rate)?;
        std::fs::write(self.session_dir.join(&name), bytes)?;
        Ok(Some(name))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn read_log_lines(recorder: &SessionRecorder) -> Vec<serde_json::Value> {
        let contents =
            std::fs::read_to_string(recorder.session_dir().join("session.jsonl")).unwrap();
        contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn events_are_tagged_and_timestamped() {
        let root = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::create(root.path()).unwrap();

        recorder
            .record(SessionEvent::WakeWord {
                keyword: "lyra".to_owned(),
            })
            .unwrap();
        recorder
            .record(SessionEvent::Response {
                text: "Four.".to_owned(),
                sentence_count: 1,
            })
            .unwrap();

        let lines = read_log_lines(&recorder);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "wake_word");
        assert_eq!(lines[0]["keyword"], "lyra");
        assert!(lines[0]["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(lines[1]["type"], "response");
        assert_eq!(lines[1]["sentence_count"], 1);
    }

    #[test]
    fn user_audio_counter_is_zero_padded() {
        let root = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::create(root.path()).unwrap();

        let first = recorder.save_user_audio(&[0u8; 320], 16_000).unwrap();
        let second = recorder.save_user_audio(&[0u8; 320], 16_000).unwrap();
        assert_eq!(first.as_deref(), Some("audio/000_user.wav"));
        assert_eq!(second.as_deref(), Some("audio/001_user.wav"));

        let path = recorder.session_dir().join("audio/000_user.wav");
        let (pcm, rate) = wav::wav_to_pcm(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(pcm.len(), 320);
        assert_eq!(rate, 16_000);
    }

    #[test]
    fn barge_in_event_shape() {
        let root = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::create(root.path()).unwrap();
        recorder
            .record(SessionEvent::BargeIn {
                sentence_index: 1,
                sentences_total: 2,
                partial_text: "Four. That is it.".to_owned(),
            })
            .unwrap();
        let lines = read_log_lines(&recorder);
        assert_eq!(lines[0]["type"], "barge_in");
        assert_eq!(lines[0]["sentence_index"], 1);
        assert_eq!(lines[0]["sentences_total"], 2);
    }

    #[test]
    fn null_recorder_swallows_everything() {
        let recorder = NullRecorder;
        recorder
            .record(SessionEvent::SessionEnd {
                total_utterances: 3,
                session_duration_ms: 1000,
            })
            .unwrap();
        assert_eq!(recorder.save_user_audio(&[0u8; 2], 16_000).unwrap(), None);
    }
}
