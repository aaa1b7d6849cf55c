//! The assistant state machine and frame-routing loop.
//!
//! The orchestrator exclusively owns every component. Audio frames arrive
//! over the source's broadcast channel and are routed to a state-dependent
//! subset of consumers; spoken replies run as spawned pipeline tasks
//! guarded by the shared state cell. Components never call back into the
//! orchestrator; everything flows through owned channels.

mod pipeline;
mod state;

pub use state::{AssistantState, SpeakingBookkeeping};

use crate::audio::capture::CpalSource;
use crate::audio::playback::CommandSink;
use crate::audio::wav;
use crate::audio::{AudioSink, AudioSource};
use crate::config::AssistantConfig;
use crate::context::ConversationContext;
use crate::cue::CuePlayer;
use crate::error::{AssistantError, Result};
use crate::llm::{LanguageModel, LlamaChat};
use crate::recorder::{NullRecorder, Recorder, SessionEvent, SessionRecorder};
use crate::segment;
use crate::stt::{SpeechToText, WhisperCli, WhisperServer};
use crate::tts::{SynthesisEngine, TtsHandle, TtsWorker};
use crate::vad::{Vad, VadState};
use crate::wake::{MfccWakeDetector, WakeEvent, WakeWordDetector};
use pipeline::{PipelineEvent, SpeakPipeline, SpeechOutcome};
use state::StateCell;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wake events closer together than this are duplicates of one detection.
const WAKE_COOLDOWN: Duration = Duration::from_secs(2);

/// Speech within this window after entering `AwaitingFollowUp` is treated
/// as sink-tail artifacts, not the user. Empirically chosen.
const FOLLOW_UP_GRACE: Duration = Duration::from_millis(500);

/// Cool-off before recovering from the `Error` state.
const ERROR_RECOVERY_DELAY: Duration = Duration::from_secs(1);

/// Mic watchdog: RMS floor that counts as real audio.
const MIC_RMS_FLOOR: f32 = 0.000_01;

/// Mic watchdog: how long silence may last before a warning.
const MIC_WATCHDOG: Duration = Duration::from_secs(5);

/// Capacity of the advisory broadcast streams.
const EVENT_STREAM_SIZE: usize = 32;

/// Duplicate-wake suppression.
struct WakeCooldown {
    last_accepted: Option<Instant>,
}

impl WakeCooldown {
    fn new() -> Self {
        Self {
            last_accepted: None,
        }
    }

    /// Accept the event iff it is at least [`WAKE_COOLDOWN`] after the
    /// previously accepted one.
    fn accept(&mut self, at: Instant) -> bool {
        if let Some(prev) = self.last_accepted
            && at.duration_since(prev) < WAKE_COOLDOWN
        {
            return false;
        }
        self.last_accepted = Some(at);
        true
    }
}

/// The pluggable components consumed by [`Orchestrator::new`].
pub struct Components {
    pub source: Box<dyn AudioSource>,
    pub sink: Arc<dyn AudioSink>,
    pub wake: Box<dyn WakeWordDetector>,
    pub stt: Box<dyn SpeechToText>,
    pub llm: Box<dyn LanguageModel>,
    pub tts: Box<dyn SynthesisEngine>,
    pub recorder: Arc<dyn Recorder>,
}

/// The assistant core: state machine, routing loop, and speak pipeline.
pub struct Orchestrator {
    config: AssistantConfig,
    source: Box<dyn AudioSource>,
    sink: Arc<dyn AudioSink>,
    wake: Box<dyn WakeWordDetector>,
    vad: Vad,
    stt: Box<dyn SpeechToText>,
    llm: Box<dyn LanguageModel>,
    tts: TtsHandle,
    tts_worker: TtsWorker,
    wake_cue: CuePlayer,
    barge_cue: CuePlayer,
    recorder: Arc<dyn Recorder>,
    context: ConversationContext,

    state: Arc<StateCell>,
    transcription_tx: broadcast::Sender<String>,
    response_tx: broadcast::Sender<String>,
    cancel: CancellationToken,

    pipeline_tx: mpsc::UnboundedSender<PipelineEvent>,
    pipeline_rx: Option<mpsc::UnboundedReceiver<PipelineEvent>>,
    bookkeeping: Arc<Mutex<SpeakingBookkeeping>>,

    utterance: Vec<u8>,
    wake_cooldown: WakeCooldown,
    follow_up_deadline: Option<tokio::time::Instant>,
    follow_up_entered_at: Option<Instant>,
    prompt_count: u32,
    pending_question: Option<String>,
    utterance_count: u64,
}

impl Orchestrator {
    /// Assemble the core from already-constructed components.
    ///
    /// # Errors
    ///
    /// Returns an error if the TTS worker thread cannot be spawned.
    pub fn new(config: AssistantConfig, components: Components) -> Result<Self> {
        let tts_worker = TtsWorker::spawn(components.tts)?;
        let tts = tts_worker.handle();
        let wake_cue = CuePlayer::load(config.acknowledgment_dir.as_deref().map(Path::new));
        let barge_cue = CuePlayer::load(config.barge_in_dir.as_deref().map(Path::new));
        let vad = Vad::new(config.silence_threshold, config.silence_duration());
        let context =
            ConversationContext::new(config.system_prompt.clone(), config.max_history_length);
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        let (transcription_tx, _) = broadcast::channel(EVENT_STREAM_SIZE);
        let (response_tx, _) = broadcast::channel(EVENT_STREAM_SIZE);

        Ok(Self {
            config,
            source: components.source,
            sink: components.sink,
            wake: components.wake,
            vad,
            stt: components.stt,
            llm: components.llm,
            tts,
            tts_worker,
            wake_cue,
            barge_cue,
            recorder: components.recorder,
            context,
            state: Arc::new(StateCell::new()),
            transcription_tx,
            response_tx,
            cancel: CancellationToken::new(),
            pipeline_tx,
            pipeline_rx: Some(pipeline_rx),
            bookkeeping: Arc::new(Mutex::new(SpeakingBookkeeping::default())),
            utterance: Vec::new(),
            wake_cooldown: WakeCooldown::new(),
            follow_up_deadline: None,
            follow_up_entered_at: None,
            prompt_count: 0,
            pending_question: None,
            utterance_count: 0,
        })
    }

    /// Bring up the real engines described by the config and assemble the
    /// core. The native TTS engine is injected through its trait seam.
    ///
    /// On failure every partially initialized engine is torn down and
    /// `InitializationFailed` is returned.
    ///
    /// # Errors
    ///
    /// Returns `Config` errors for invalid configuration and
    /// `InitializationFailed` for engine startup failures.
    pub async fn initialize(
        config: AssistantConfig,
        tts: Box<dyn SynthesisEngine>,
    ) -> Result<Self> {
        config.validate()?;

        let mut stt: Box<dyn SpeechToText> = if config.whisper_server_executable.is_some() {
            Box::new(WhisperServer::start(&config).await?)
        } else {
            Box::new(WhisperCli::new(&config))
        };

        let mut llm = match LlamaChat::initialize(&config).await {
            Ok(llm) => llm,
            Err(e) => {
                let _ = stt.dispose().await;
                return Err(e);
            }
        };

        let assembled: Result<(Box<dyn WakeWordDetector>, Arc<dyn AudioSink>)> = (|| {
            let wake: Box<dyn WakeWordDetector> = Box::new(MfccWakeDetector::from_config(&config)?);
            let sink: Arc<dyn AudioSink> = Arc::new(CommandSink::new(&config)?);
            Ok((wake, sink))
        })();
        let (wake, sink) = match assembled {
            Ok(parts) => parts,
            Err(e) => {
                let _ = llm.dispose().await;
                let _ = stt.dispose().await;
                return Err(AssistantError::InitializationFailed(e.to_string()));
            }
        };

        let recorder: Arc<dyn Recorder> = if config.recording_enabled {
            match SessionRecorder::create(Path::new(&config.session_dir)) {
                Ok(recorder) => Arc::new(recorder),
                Err(e) => {
                    warn!("session recording unavailable: {e}");
                    Arc::new(NullRecorder)
                }
            }
        } else {
            Arc::new(NullRecorder)
        };

        let source = Box::new(CpalSource::new(None));

        Self::new(
            config,
            Components {
                source,
                sink,
                wake,
                stt,
                llm: Box::new(llm),
                tts,
                recorder,
            },
        )
    }

    /// Current state.
    pub fn state(&self) -> AssistantState {
        self.state.get()
    }

    /// Advisory stream of state transitions.
    pub fn states(&self) -> broadcast::Receiver<AssistantState> {
        self.state.subscribe()
    }

    /// Advisory stream of user transcriptions.
    pub fn transcriptions(&self) -> broadcast::Receiver<String> {
        self.transcription_tx.subscribe()
    }

    /// Advisory stream of assistant responses.
    pub fn responses(&self) -> broadcast::Receiver<String> {
        self.response_tx.subscribe()
    }

    /// Token that stops [`Orchestrator::run`] when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Start capture and run the routing loop until cancelled, then tear
    /// everything down in order.
    ///
    /// # Errors
    ///
    /// Returns an error if capture cannot start or the loop was already
    /// consumed.
    pub async fn run(mut self) -> Result<()> {
        let mut pipeline_rx = self
            .pipeline_rx
            .take()
            .ok_or_else(|| AssistantError::NotReady("run() already called".into()))?;

        let mut frames = self.source.subscribe();
        self.source.start().await?;
        let session_started = Instant::now();

        let config_snapshot = serde_json::to_value(&self.config).unwrap_or_default();
        self.record(SessionEvent::SessionStart {
            config: config_snapshot,
        });
        self.state.set(AssistantState::ListeningForWakeWord);

        let mut mic_confirmed = false;
        let mut mic_warned = false;
        let cancel = self.cancel.clone();

        loop {
            // A far-future deadline keeps the disabled branch inert.
            let follow_up_at = self.follow_up_deadline.unwrap_or_else(|| {
                tokio::time::Instant::now() + Duration::from_secs(3600)
            });

            tokio::select! {
                () = cancel.cancelled() => break,

                event = pipeline_rx.recv() => {
                    if let Some(event) = event {
                        self.on_pipeline_event(event).await;
                    }
                }

                frame = frames.recv() => {
                    match frame {
                        Ok(frame) => {
                            if !mic_confirmed {
                                if wav::rms(&frame) > MIC_RMS_FLOOR {
                                    info!("mic audio confirmed");
                                    mic_confirmed = true;
                                } else if !mic_warned
                                    && session_started.elapsed() > MIC_WATCHDOG
                                {
                                    warn!(
                                        "mic watchdog: no audio above noise floor after {}s",
                                        MIC_WATCHDOG.as_secs()
                                    );
                                    mic_warned = true;
                                }
                            }
                            self.route_frame(frame).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("routing loop lagged, skipped {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                () = tokio::time::sleep_until(follow_up_at),
                    if self.follow_up_deadline.is_some() =>
                {
                    self.on_follow_up_timeout().await;
                }
            }
        }

        self.dispose(session_started).await
    }

    // ── frame routing ───────────────────────────────────────────────

    async fn route_frame(&mut self, frame: Vec<u8>) {
        match self.state.get() {
            AssistantState::ListeningForWakeWord => {
                if let Some(event) = self.wake.process_audio(&frame) {
                    if self.wake_cooldown.accept(event.at) {
                        self.on_wake(event).await;
                    } else {
                        debug!("wake event inside cooldown, ignored");
                    }
                }
            }
            AssistantState::Listening => {
                self.utterance.extend_from_slice(&frame);
                if self.vad.process(&frame) == Some(VadState::Silence) {
                    self.finish_utterance().await;
                }
            }
            AssistantState::AwaitingFollowUp => {
                self.utterance.extend_from_slice(&frame);
                if self.vad.process(&frame) == Some(VadState::Speech) {
                    let since_entry = self
                        .follow_up_entered_at
                        .map(|t| t.elapsed())
                        .unwrap_or_default();
                    if since_entry >= FOLLOW_UP_GRACE {
                        // Keep the VAD state and the buffer: the first
                        // speech frames are already captured.
                        self.follow_up_deadline = None;
                        self.prompt_count = 0;
                        self.pending_question = None;
                        self.state.set(AssistantState::Listening);
                    } else {
                        debug!("speech inside follow-up grace window, ignored");
                    }
                }
            }
            AssistantState::Speaking | AssistantState::Prompting => {
                if self.config.enable_barge_in
                    && let Some(event) = self.wake.process_audio(&frame)
                {
                    if self.wake_cooldown.accept(event.at) {
                        self.on_barge_in(event).await;
                    } else {
                        debug!("barge-in wake event inside cooldown, ignored");
                    }
                }
            }
            AssistantState::Idle | AssistantState::Processing | AssistantState::Error => {}
        }
    }

    // ── transitions ─────────────────────────────────────────────────

    async fn on_wake(&mut self, event: WakeEvent) {
        info!("wake word '{}' detected", event.keyword);
        if let Err(e) = self.wake_cue.play_random(self.sink.as_ref()).await {
            warn!("wake cue playback failed: {e}");
        }
        self.utterance.clear();
        self.vad.reset();
        self.record(SessionEvent::WakeWord {
            keyword: event.keyword,
        });
        self.state.set(AssistantState::Listening);
    }

    async fn finish_utterance(&mut self) {
        self.state.set(AssistantState::Processing);
        let pcm = std::mem::take(&mut self.utterance);
        debug!(
            "utterance complete: {}ms of audio",
            wav::duration_ms(pcm.len(), wav::PIPELINE_SAMPLE_RATE)
        );

        let audio_ref = match self
            .recorder
            .save_user_audio(&pcm, wav::PIPELINE_SAMPLE_RATE)
        {
            Ok(audio_ref) => audio_ref,
            Err(e) => {
                warn!("failed to persist user audio: {e}");
                None
            }
        };
        if let Some(ref file) = audio_ref {
            self.record(SessionEvent::UserAudio {
                file: file.clone(),
                duration_ms: wav::duration_ms(pcm.len(), wav::PIPELINE_SAMPLE_RATE),
                size_bytes: pcm.len() as u64,
            });
        }

        let text = match self.stt.transcribe(&pcm).await {
            Ok(text) => text,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };
        self.record(SessionEvent::Transcription {
            text: text.clone(),
            audio_ref,
        });

        if text.trim().is_empty() {
            debug!("empty transcription, returning to wake listening");
            self.state.set(AssistantState::ListeningForWakeWord);
            return;
        }

        info!("user said: \"{text}\"");
        let _ = self.transcription_tx.send(text.clone());
        self.utterance_count += 1;
        self.context.add_user(text.clone());

        let tokens = match self.llm.chat_stream(&text).await {
            Ok(tokens) => tokens,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };

        *self.lock_bookkeeping() = SpeakingBookkeeping::default();
        self.state.set(AssistantState::Speaking);
        SpeakPipeline {
            tokens,
            tts: self.tts.clone(),
            sink: Arc::clone(&self.sink),
            state: Arc::clone(&self.state),
            bookkeeping: Arc::clone(&self.bookkeeping),
            sentence_pause: self.config.sentence_pause(),
            events: self.pipeline_tx.clone(),
        }
        .spawn();
    }

    async fn on_barge_in(&mut self, event: WakeEvent) {
        info!("barge-in: wake word '{}' during playback", event.keyword);
        // Leaving the speaking guard first makes the pipeline tasks wind
        // down before any further play call.
        self.state.set(AssistantState::Listening);
        self.llm.cancel_stream();
        if let Err(e) = self.sink.stop().await {
            warn!("sink stop on barge-in failed: {e}");
        }
        if let Err(e) = self.barge_cue.play_random(self.sink.as_ref()).await {
            warn!("barge-in cue playback failed: {e}");
        }
        self.utterance.clear();
        self.vad.reset();
        self.follow_up_deadline = None;
        self.prompt_count = 0;
        self.pending_question = None;

        let bookkeeping = self.lock_bookkeeping().clone();
        self.record(SessionEvent::BargeIn {
            sentence_index: bookkeeping.current_sentence_index,
            sentences_total: bookkeeping.sentences.len(),
            partial_text: bookkeeping.full_response.trim().to_owned(),
        });
    }

    async fn on_pipeline_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::SpeechFinished { outcome } => match outcome {
                SpeechOutcome::Interrupted => {}
                SpeechOutcome::Failed => {
                    if self.state.get() == AssistantState::Speaking {
                        self.fail(AssistantError::EngineFailed(
                            "LLM stream ended without prompt marker".into(),
                        ))
                        .await;
                    }
                }
                SpeechOutcome::Completed => {
                    if self.state.get() != AssistantState::Speaking {
                        return;
                    }
                    let bookkeeping = self.lock_bookkeeping().clone();
                    let response = bookkeeping.full_response.trim().to_owned();
                    self.record(SessionEvent::Response {
                        text: response.clone(),
                        sentence_count: bookkeeping.sentences.len(),
                    });
                    let _ = self.response_tx.send(response.clone());
                    self.context.add_assistant(response.clone());

                    if self.config.enable_follow_up {
                        self.pending_question =
                            segment::extract_last_question(&bookkeeping.sentences);
                        self.prompt_count = 0;
                        let window = if segment::ends_with_question(&response) {
                            self.config.follow_up_timeout()
                        } else {
                            self.config.statement_follow_up_timeout()
                        };
                        self.enter_follow_up(window);
                    } else {
                        self.state.set(AssistantState::ListeningForWakeWord);
                    }
                }
            },
            PipelineEvent::PromptFinished { interrupted } => {
                if !interrupted && self.state.get() == AssistantState::Prompting {
                    self.enter_follow_up(self.config.follow_up_timeout());
                }
            }
        }
    }

    fn enter_follow_up(&mut self, window: Duration) {
        self.vad.reset();
        self.utterance.clear();
        self.follow_up_entered_at = Some(Instant::now());
        self.follow_up_deadline = Some(tokio::time::Instant::now() + window);
        self.state.set(AssistantState::AwaitingFollowUp);
    }

    async fn on_follow_up_timeout(&mut self) {
        self.follow_up_deadline = None;
        if self.state.get() != AssistantState::AwaitingFollowUp {
            return;
        }

        if self.prompt_count == 0
            && let Some(question) = self.pending_question.clone()
        {
            self.prompt_count = 1;
            info!("follow-up window elapsed, re-asking: \"{question}\"");
            self.state.set(AssistantState::Prompting);

            let tts = self.tts.clone();
            let sink = Arc::clone(&self.sink);
            let state = Arc::clone(&self.state);
            let events = self.pipeline_tx.clone();
            tokio::spawn(async move {
                let pending = tts.synthesize(&question);
                match pending.wait().await {
                    Ok(audio) if state.get() == AssistantState::Prompting => {
                        if let Err(e) = sink.play(&audio.to_pcm16(), audio.sample_rate).await {
                            warn!("prompt playback failed: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("prompt synthesis failed: {e}"),
                }
                let _ = events.send(PipelineEvent::PromptFinished {
                    interrupted: state.get() != AssistantState::Prompting,
                });
            });
        } else {
            info!("follow-up window elapsed, returning to wake listening");
            self.prompt_count = 0;
            self.pending_question = None;
            self.state.set(AssistantState::ListeningForWakeWord);
        }
    }

    /// Unrecoverable turn failure: publish `Error`, cool off, recover.
    async fn fail(&mut self, error: AssistantError) {
        error!("turn failed: {error}");
        self.llm.cancel_stream();
        if let Err(e) = self.sink.stop().await {
            warn!("sink stop during recovery failed: {e}");
        }
        self.state.set(AssistantState::Error);
        tokio::time::sleep(ERROR_RECOVERY_DELAY).await;
        self.state.set(AssistantState::ListeningForWakeWord);
    }

    // ── teardown ────────────────────────────────────────────────────

    async fn dispose(&mut self, session_started: Instant) -> Result<()> {
        info!("disposing assistant core");
        if let Err(e) = self.source.stop().await {
            warn!("capture stop failed: {e}");
        }
        self.follow_up_deadline = None;
        self.llm.cancel_stream();
        if let Err(e) = self.sink.stop().await {
            warn!("sink stop failed: {e}");
        }
        if let Err(e) = self.llm.dispose().await {
            warn!("LLM dispose failed: {e}");
        }
        self.tts_worker.dispose();
        if let Err(e) = self.stt.dispose().await {
            warn!("STT dispose failed: {e}");
        }
        self.wake.reset();

        self.record(SessionEvent::SessionEnd {
            total_utterances: self.utterance_count,
            session_duration_ms: session_started.elapsed().as_millis() as u64,
        });
        self.state.set(AssistantState::Idle);
        info!("assistant core disposed");
        Ok(())
    }

    // ── helpers ─────────────────────────────────────────────────────

    fn lock_bookkeeping(&self) -> std::sync::MutexGuard<'_, SpeakingBookkeeping> {
        self.bookkeeping
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Recorder failures must never stall orchestration.
    fn record(&self, event: SessionEvent) {
        if let Err(e) = self.recorder.record(event) {
            warn!("recorder write failed: {e}");
        }
    }
}
