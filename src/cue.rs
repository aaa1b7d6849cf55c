//! Pre-recorded acknowledgment cues.
//!
//! Short WAVs played when the wake word is spotted or a barge-in is
//! accepted. All files in the configured directory are parsed at startup;
//! playback picks one uniformly at random. An empty player is a no-op.

use crate::audio::{AudioSink, wav};
use crate::error::Result;
use rand::Rng;
use std::path::Path;
use tracing::{info, warn};

/// A set of cue recordings loaded from one directory.
pub struct CuePlayer {
    cues: Vec<Cue>,
}

struct Cue {
    pcm: Vec<u8>,
    sample_rate: u32,
}

impl CuePlayer {
    /// Load all parseable WAVs from `dir`. `None` or a missing directory
    /// yields an empty player.
    pub fn load(dir: Option<&Path>) -> Self {
        let mut cues = Vec::new();
        let Some(dir) = dir else {
            return Self { cues };
        };

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cue directory {} unreadable: {e}", dir.display());
                return Self { cues };
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wav") {
                continue;
            }
            match std::fs::read(&path).map_err(Into::into).and_then(|bytes| wav::wav_to_pcm(&bytes)) {
                Ok((pcm, sample_rate)) => {
                    cues.push(Cue { pcm, sample_rate });
                }
                Err(e) => warn!("skipping cue {}: {e}", path.display()),
            }
        }

        info!("loaded {} cues from {}", cues.len(), dir.display());
        Self { cues }
    }

    /// Whether any cues were loaded.
    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    /// Play one cue chosen uniformly at random. A successful no-op when no
    /// cues are loaded.
    ///
    /// # Errors
    ///
    /// Returns the sink's error if playback fails.
    pub async fn play_random(&self, sink: &dyn AudioSink) -> Result<()> {
        if self.cues.is_empty() {
            return Ok(());
        }
        let index = rand::thread_rng().gen_range(0..self.cues.len());
        let cue = &self.cues[index];
        sink.play(&cue.pcm, cue.sample_rate).await
    }
}
