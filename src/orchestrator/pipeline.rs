//! The token -> sentence -> synthesis -> playback pipeline.
//!
//! Two cooperating tasks run while the assistant is `Speaking`: the
//! producer drains the LLM token stream, cuts sentences, and enqueues
//! synthesis requests; the consumer awaits each synthesis in order and
//! plays it. Synthesis of sentence *i+1* is therefore in flight no later
//! than the moment sentence *i* starts playing. Both tasks use the shared
//! state as their liveness guard, so a barge-in (state leaving `Speaking`)
//! drains everything without another handshake.

use crate::audio::AudioSink;
use crate::llm::TokenStream;
use crate::orchestrator::state::{AssistantState, SpeakingBookkeeping, StateCell};
use crate::segment;
use crate::tts::{PendingSynthesis, TtsHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Cooperative yield while the consumer waits for the producer.
const CONSUMER_IDLE: Duration = Duration::from_millis(10);

/// How a speaking pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpeechOutcome {
    /// Token stream drained and every synthesized sentence played.
    Completed,
    /// The state left `Speaking` (barge-in or shutdown).
    Interrupted,
    /// The token stream died without its prompt marker.
    Failed,
}

/// Completion notifications from spawned speech tasks to the orchestrator.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PipelineEvent {
    SpeechFinished { outcome: SpeechOutcome },
    PromptFinished { interrupted: bool },
}

/// Everything a speaking run needs, captured at `Speaking` entry.
pub(crate) struct SpeakPipeline {
    pub tokens: TokenStream,
    pub tts: TtsHandle,
    pub sink: Arc<dyn AudioSink>,
    pub state: Arc<StateCell>,
    pub bookkeeping: Arc<Mutex<SpeakingBookkeeping>>,
    pub sentence_pause: Duration,
    pub events: mpsc::UnboundedSender<PipelineEvent>,
}

impl SpeakPipeline {
    /// Spawn the producer/consumer pair; the completion event arrives on
    /// `events` once both halves exit.
    pub(crate) fn spawn(self) {
        let Self {
            tokens,
            tts,
            sink,
            state,
            bookkeeping,
            sentence_pause,
            events,
        } = self;

        tokio::spawn(async move {
            let (queue_tx, queue_rx) = mpsc::unbounded_channel::<PendingSynthesis>();
            let producer_done = Arc::new(AtomicBool::new(false));

            let producer = tokio::spawn(run_producer(
                tokens,
                tts,
                queue_tx,
                Arc::clone(&state),
                Arc::clone(&bookkeeping),
                Arc::clone(&producer_done),
            ));
            let consumer = tokio::spawn(run_consumer(
                queue_rx,
                sink,
                Arc::clone(&state),
                Arc::clone(&bookkeeping),
                sentence_pause,
                producer_done,
            ));

            let (produced, _) = tokio::join!(producer, consumer);
            let stream_failed = produced.unwrap_or(true);

            let outcome = if state.get() != AssistantState::Speaking {
                SpeechOutcome::Interrupted
            } else if stream_failed {
                SpeechOutcome::Failed
            } else {
                SpeechOutcome::Completed
            };
            let _ = events.send(PipelineEvent::SpeechFinished { outcome });
        });
    }
}

fn lock<'a>(
    bookkeeping: &'a Mutex<SpeakingBookkeeping>,
) -> std::sync::MutexGuard<'a, SpeakingBookkeeping> {
    bookkeeping.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drain the token stream, cut sentences, enqueue synthesis.
///
/// Returns `true` if the stream died without completing cleanly.
async fn run_producer(
    mut tokens: TokenStream,
    tts: TtsHandle,
    queue_tx: mpsc::UnboundedSender<PendingSynthesis>,
    state: Arc<StateCell>,
    bookkeeping: Arc<Mutex<SpeakingBookkeeping>>,
    producer_done: Arc<AtomicBool>,
) -> bool {
    let mut buffer = String::new();
    let mut cancelled = false;

    while let Some(token) = tokens.next().await {
        if state.get() != AssistantState::Speaking {
            tokens.cancel();
            cancelled = true;
            break;
        }

        buffer.push_str(&token);
        lock(&bookkeeping).full_response.push_str(&token);

        loop {
            let (sentence, rest) = segment::extract_complete_sentence(&buffer);
            buffer = rest;
            match sentence {
                Some(sentence) => enqueue(&sentence, &tts, &queue_tx, &bookkeeping),
                None => break,
            }
        }
    }

    let failed = !cancelled && !tokens.ended_cleanly() && state.get() == AssistantState::Speaking;

    // Flush the cleaned residue as a final sentence.
    if !failed && state.get() == AssistantState::Speaking {
        let residue = segment::clean(&buffer);
        if !residue.is_empty() {
            enqueue(&residue, &tts, &queue_tx, &bookkeeping);
        }
    }

    producer_done.store(true, Ordering::Release);
    failed
}

fn enqueue(
    sentence: &str,
    tts: &TtsHandle,
    queue_tx: &mpsc::UnboundedSender<PendingSynthesis>,
    bookkeeping: &Mutex<SpeakingBookkeeping>,
) {
    debug!("sentence ready: \"{sentence}\"");
    lock(bookkeeping).sentences.push(sentence.to_owned());
    let _ = queue_tx.send(tts.synthesize(sentence));
}

/// Await synthesized sentences in order and play them.
async fn run_consumer(
    mut queue_rx: mpsc::UnboundedReceiver<PendingSynthesis>,
    sink: Arc<dyn AudioSink>,
    state: Arc<StateCell>,
    bookkeeping: Arc<Mutex<SpeakingBookkeeping>>,
    sentence_pause: Duration,
    producer_done: Arc<AtomicBool>,
) {
    let mut playback_index: usize = 0;

    loop {
        if state.get() != AssistantState::Speaking {
            break;
        }

        match queue_rx.try_recv() {
            Ok(pending) => {
                let result = pending.wait().await;
                // Re-check: barge-in may have landed during synthesis.
                if state.get() != AssistantState::Speaking {
                    break;
                }
                match result {
                    Ok(audio) => {
                        lock(&bookkeeping).current_sentence_index = playback_index;
                        if let Err(e) = sink.play(&audio.to_pcm16(), audio.sample_rate).await {
                            warn!("sentence playback failed: {e}");
                        }
                    }
                    Err(e) => warn!("sentence synthesis failed: {e}"),
                }
                playback_index += 1;

                let more_coming = !queue_rx.is_empty() || !producer_done.load(Ordering::Acquire);
                if more_coming
                    && !sentence_pause.is_zero()
                    && state.get() == AssistantState::Speaking
                {
                    tokio::time::sleep(sentence_pause).await;
                }
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                if producer_done.load(Ordering::Acquire) {
                    break;
                }
                tokio::time::sleep(CONSUMER_IDLE).await;
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }
    }
}
