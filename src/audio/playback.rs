//! PCM playback through a command-line player subprocess.
//!
//! The sink writes the buffer to a temp WAV and hands it to a platform
//! player (`aplay`, `paplay`, `afplay`, ...). `stop()` preempts by killing
//! the child; signal-terminated exits are expected cancellations, not
//! errors.

use crate::audio::{AudioSink, wav};
use crate::config::AssistantConfig;
use crate::error::{AssistantError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Probe order for playback binaries when none is configured.
const PLAYER_PROBE: &[&str] = &["aplay", "paplay", "pw-play", "play", "afplay", "ffplay"];

/// How long `stop()` waits for the child to die.
const STOP_DEADLINE: Duration = Duration::from_millis(500);

/// [`AudioSink`] backed by a command-line player subprocess.
pub struct CommandSink {
    player: PathBuf,
    kind: PlayerKind,
    playing: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    /// Bumped by every `stop`; closes the race where a stop lands between
    /// child spawn and waiter registration.
    stop_epoch: AtomicU64,
    /// Serializes `play` calls; `stop` never takes it.
    play_slot: tokio::sync::Mutex<()>,
}

/// Known player flavors, for argument shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayerKind {
    Aplay,
    Paplay,
    PwPlay,
    SoxPlay,
    Afplay,
    Ffplay,
    /// Unknown binary: pass just the file path.
    Generic,
}

impl PlayerKind {
    fn from_binary(path: &Path) -> Self {
        match path.file_stem().and_then(|s| s.to_str()).unwrap_or("") {
            "aplay" => Self::Aplay,
            "paplay" => Self::Paplay,
            "pw-play" => Self::PwPlay,
            "play" => Self::SoxPlay,
            "afplay" => Self::Afplay,
            "ffplay" => Self::Ffplay,
            _ => Self::Generic,
        }
    }

    fn args(self, wav_path: &Path) -> Vec<String> {
        let file = wav_path.to_string_lossy().into_owned();
        match self {
            Self::Aplay | Self::SoxPlay => vec!["-q".to_owned(), file],
            Self::Ffplay => vec![
                "-nodisp".to_owned(),
                "-autoexit".to_owned(),
                "-loglevel".to_owned(),
                "quiet".to_owned(),
                file,
            ],
            Self::Paplay | Self::PwPlay | Self::Afplay | Self::Generic => vec![file],
        }
    }
}

impl CommandSink {
    /// Resolve the playback binary and build the sink.
    ///
    /// Resolution order: explicit `audio_player_path`, then `audio_player`
    /// by name on `PATH`, then the probe list.
    ///
    /// # Errors
    ///
    /// Returns `InitializationFailed` if no player binary can be found.
    pub fn new(config: &AssistantConfig) -> Result<Self> {
        let player = resolve_player(config)?;
        let kind = PlayerKind::from_binary(&player);
        info!("audio playback via {} ({kind:?})", player.display());
        Ok(Self {
            player,
            kind,
            playing: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            stop_epoch: AtomicU64::new(0),
            play_slot: tokio::sync::Mutex::new(()),
        })
    }
}

fn resolve_player(config: &AssistantConfig) -> Result<PathBuf> {
    if let Some(ref path) = config.audio_player_path {
        return Ok(PathBuf::from(path));
    }
    if let Some(ref name) = config.audio_player {
        return which::which(name).map_err(|e| {
            AssistantError::InitializationFailed(format!("audio player '{name}' not found: {e}"))
        });
    }
    for candidate in PLAYER_PROBE {
        if let Ok(path) = which::which(candidate) {
            return Ok(path);
        }
    }
    Err(AssistantError::InitializationFailed(format!(
        "no audio player found (tried {})",
        PLAYER_PROBE.join(", ")
    )))
}

#[async_trait]
impl AudioSink for CommandSink {
    async fn play(&self, pcm: &[u8], sample_rate: u32) -> Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        let _slot = self.play_slot.lock().await;
        let epoch = self.stop_epoch.load(Ordering::Acquire);

        let wav_bytes = wav::pcm_to_wav(pcm, sample_rate)?;
        let tmp = tempfile::Builder::new()
            .prefix("lyra-play-")
            .suffix(".wav")
            .tempfile()?;
        std::fs::write(tmp.path(), &wav_bytes)?;

        let mut child = Command::new(&self.player)
            .args(self.kind.args(tmp.path()))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AssistantError::EngineFailed(format!(
                    "failed to spawn {}: {e}",
                    self.player.display()
                ))
            })?;

        self.playing.store(true, Ordering::Release);

        // A stop issued while the child was spawning preempts right away.
        if self.stop_epoch.load(Ordering::Acquire) != epoch {
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.playing.store(false, Ordering::Release);
            return Ok(());
        }

        let stopped = self.stop_signal.notified();
        tokio::pin!(stopped);

        let result = tokio::select! {
            status = child.wait() => {
                match status {
                    // Signal-terminated (no code) counts as an expected stop.
                    Ok(status) if status.success() || status.code().is_none() => Ok(()),
                    Ok(status) => Err(AssistantError::EngineFailed(format!(
                        "audio player exited with {status}"
                    ))),
                    Err(e) => Err(AssistantError::EngineFailed(format!(
                        "audio player wait failed: {e}"
                    ))),
                }
            }
            () = &mut stopped => {
                debug!("playback preempted");
                let _ = child.start_kill();
                let _ = child.wait().await;
                Ok(())
            }
        };

        self.playing.store(false, Ordering::Release);
        result
    }

    async fn stop(&self) -> Result<()> {
        self.stop_epoch.fetch_add(1, Ordering::AcqRel);
        if !self.playing.load(Ordering::Acquire) {
            return Ok(());
        }
        self.stop_signal.notify_waiters();

        let deadline = tokio::time::Instant::now() + STOP_DEADLINE;
        while self.playing.load(Ordering::Acquire) {
            if tokio::time::Instant::now() >= deadline {
                return Err(AssistantError::Timeout(
                    "playback did not stop in time".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }
}
