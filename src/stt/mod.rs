//! Speech-to-text engines.
//!
//! Two modes wrap the whisper family of binaries: a persistent loopback
//! HTTP server ([`server::WhisperServer`]) and a one-shot CLI invocation
//! per utterance ([`cli::WhisperCli`]). Both consume 16-bit mono PCM at
//! 16 kHz and return plain transcribed text.

pub mod cli;
pub mod server;

use crate::error::Result;
use async_trait::async_trait;

pub use cli::WhisperCli;
pub use server::{WhisperServer, WhisperServerClient};

/// Converts a finalized PCM utterance to text.
#[async_trait]
pub trait SpeechToText: Send {
    /// Transcribe an utterance. An empty buffer yields an empty string
    /// without contacting the engine.
    async fn transcribe(&mut self, pcm: &[u8]) -> Result<String>;

    /// Tear down any backing process. Default: nothing to do.
    async fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}
