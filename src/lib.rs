//! Lyra: always-on local voice assistant core.
//!
//! A cascaded pipeline turns a continuous microphone stream into spoken
//! conversational replies:
//! Microphone -> wake word -> VAD -> STT -> LLM -> TTS -> Speaker
//!
//! # Architecture
//!
//! Leaf components are owned by a single [`orchestrator::Orchestrator`]
//! that routes each PCM frame to a state-dependent subset of consumers and
//! drives the reverse path from LLM tokens back to the speaker:
//! - **Audio capture**: cpal microphone source, 16 kHz mono 16-bit PCM
//! - **Wake word**: MFCC+DTW keyword spotter over a sliding window
//! - **VAD**: RMS energy thresholding with a wall-time hangover
//! - **STT**: whisper server (loopback HTTP) or one-shot CLI
//! - **LLM**: persistent conversation-mode child process, streamed replies
//! - **Segmentation**: markdown cleaning + sentence cutting for TTS
//! - **TTS**: native engine on a dedicated worker thread
//! - **Playback**: command-line player subprocess with preemptive stop
//!
//! Replies stream: tokens become sentences as they arrive, sentence *i+1*
//! synthesizes while sentence *i* plays, and a wake word during playback
//! preempts everything (barge-in).

pub mod audio;
pub mod config;
pub mod context;
pub mod cue;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod recorder;
pub mod segment;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod wake;

pub use config::AssistantConfig;
pub use error::{AssistantError, Result};
pub use orchestrator::{AssistantState, Components, Orchestrator, SpeakingBookkeeping};
