//! Assistant state machine types.

use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::info;

/// The seven conversational states plus the error recovery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantState {
    /// Constructed but not started.
    Idle,
    /// Passive: only the wake detector sees audio.
    ListeningForWakeWord,
    /// Actively capturing an utterance (VAD + utterance buffer).
    Listening,
    /// Utterance submitted to STT; audio is not routed.
    Processing,
    /// Streaming a reply through TTS and the sink.
    Speaking,
    /// Listening for a follow-up without requiring the wake word.
    AwaitingFollowUp,
    /// Re-speaking a trailing question after a silent follow-up window.
    Prompting,
    /// Recovering from an unhandled failure.
    Error,
}

/// Bookkeeping shared by the producer/consumer pair while the assistant
/// speaks (or prompts).
#[derive(Debug, Clone, Default)]
pub struct SpeakingBookkeeping {
    /// Sentences submitted to TTS so far, in order.
    pub sentences: Vec<String>,
    /// Index of the last sentence whose playback has started.
    pub current_sentence_index: usize,
    /// Concatenation of all LLM tokens received so far.
    pub full_response: String,
}

/// Current state plus a broadcast of transitions.
///
/// Pipeline tasks read the state as their liveness guard; only the
/// orchestrator writes it.
pub(crate) struct StateCell {
    current: Mutex<AssistantState>,
    tx: broadcast::Sender<AssistantState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            current: Mutex::new(AssistantState::Idle),
            tx,
        }
    }

    pub(crate) fn get(&self) -> AssistantState {
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the state, publishing and logging on change. Returns the
    /// previous state.
    pub(crate) fn set(&self, next: AssistantState) -> AssistantState {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let prev = *current;
        *current = next;
        drop(current);

        if prev != next {
            info!("state: {prev:?} -> {next:?}");
            let _ = self.tx.send(next);
        }
        prev
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<AssistantState> {
        self.tx.subscribe()
    }
}
