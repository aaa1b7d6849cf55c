//! End-to-end orchestration scenarios with stub components.
//!
//! Each test wires the orchestrator to scripted stand-ins for the audio,
//! STT, LLM, and TTS engines, then drives the conversation by feeding PCM
//! frames and watching the advisory streams.

use async_trait::async_trait;
use lyra::audio::{AudioSink, AudioSource, wav};
use lyra::config::AssistantConfig;
use lyra::error::Result;
use lyra::llm::{LanguageModel, TokenStream};
use lyra::orchestrator::{AssistantState, Components, Orchestrator};
use lyra::recorder::{Recorder, SessionEvent};
use lyra::stt::SpeechToText;
use lyra::tts::{SynthesisEngine, TtsResult};
use lyra::wake::{WakeEvent, WakeWordDetector};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

// ── stub components ─────────────────────────────────────────────────

struct StubSource {
    tx: broadcast::Sender<Vec<u8>>,
}

#[async_trait]
impl AudioSource for StubSource {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.tx.subscribe()
    }
}

#[derive(Clone, Default)]
struct SinkProbe {
    play_started: Arc<AtomicUsize>,
    play_completed: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

struct StubSink {
    probe: SinkProbe,
    playing: AtomicBool,
    stop_signal: Notify,
}

impl StubSink {
    fn new(probe: SinkProbe) -> Self {
        Self {
            probe,
            playing: AtomicBool::new(false),
            stop_signal: Notify::new(),
        }
    }
}

#[async_trait]
impl AudioSink for StubSink {
    async fn play(&self, pcm: &[u8], sample_rate: u32) -> Result<()> {
        self.probe.play_started.fetch_add(1, Ordering::SeqCst);
        self.playing.store(true, Ordering::SeqCst);

        let audio_time =
            Duration::from_millis(wav::duration_ms(pcm.len(), sample_rate));
        let stopped = self.stop_signal.notified();
        tokio::pin!(stopped);

        tokio::select! {
            () = tokio::time::sleep(audio_time) => {
                self.probe.play_completed.fetch_add(1, Ordering::SeqCst);
            }
            () = &mut stopped => {}
        }
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

struct StubWake {
    trigger: Arc<AtomicBool>,
}

impl WakeWordDetector for StubWake {
    fn process_audio(&mut self, _pcm: &[u8]) -> Option<WakeEvent> {
        if self.trigger.swap(false, Ordering::SeqCst) {
            Some(WakeEvent {
                keyword: "lyra".to_owned(),
                at: Instant::now(),
            })
        } else {
            None
        }
    }

    fn reset(&mut self) {}
}

struct StubStt {
    reply: String,
    calls: Arc<AtomicUsize>,
    received_bytes: Arc<AtomicUsize>,
}

#[async_trait]
impl SpeechToText for StubStt {
    async fn transcribe(&mut self, pcm: &[u8]) -> Result<String> {
        if pcm.is_empty() {
            return Ok(String::new());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received_bytes.store(pcm.len(), Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

struct StubLlm {
    tokens: Vec<String>,
    token_delay: Duration,
    chats: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
    active: Option<CancellationToken>,
}

#[async_trait]
impl LanguageModel for StubLlm {
    async fn chat(&mut self, _message: &str) -> Result<String> {
        Ok(self.tokens.concat())
    }

    async fn chat_stream(&mut self, _message: &str) -> Result<TokenStream> {
        self.chats.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        self.active = Some(cancel.clone());

        let (sender, stream) = TokenStream::channel(cancel.clone());
        let tokens = self.tokens.clone();
        let delay = self.token_delay;
        tokio::spawn(async move {
            for token in tokens {
                if cancel.is_cancelled() || !sender.send(token) {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
            sender.finish();
        });
        Ok(stream)
    }

    fn cancel_stream(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(active) = self.active.take() {
            active.cancel();
        }
    }

    async fn clear_context(&mut self) -> Result<()> {
        Ok(())
    }
}

struct StubTts {
    audio_ms: u64,
}

impl SynthesisEngine for StubTts {
    fn synthesize(&mut self, _text: &str) -> Result<TtsResult> {
        let samples = (self.audio_ms * 16) as usize;
        Ok(TtsResult {
            samples: vec![0.1; samples],
            sample_rate: 16_000,
        })
    }

    fn sample_rate(&self) -> u32 {
        16_000
    }
}

struct VecRecorder {
    events: Arc<Mutex<Vec<SessionEvent>>>,
    audio_counter: AtomicUsize,
}

impl Recorder for VecRecorder {
    fn record(&self, event: SessionEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn save_user_audio(&self, _pcm: &[u8], _sample_rate: u32) -> Result<Option<String>> {
        let index = self.audio_counter.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("audio/{index:03}_user.wav")))
    }
}

// ── harness ─────────────────────────────────────────────────────────

struct Harness {
    frames: broadcast::Sender<Vec<u8>>,
    _frames_keepalive: broadcast::Receiver<Vec<u8>>,
    wake_trigger: Arc<AtomicBool>,
    sink: SinkProbe,
    stt_calls: Arc<AtomicUsize>,
    stt_received_bytes: Arc<AtomicUsize>,
    llm_chats: Arc<AtomicUsize>,
    llm_cancelled: Arc<AtomicBool>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
    states: broadcast::Receiver<AssistantState>,
    transcriptions: broadcast::Receiver<String>,
    responses: broadcast::Receiver<String>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<()>>,
}

struct Script {
    stt_reply: &'static str,
    llm_tokens: &'static [&'static str],
    token_delay_ms: u64,
    tts_audio_ms: u64,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn start(config: AssistantConfig, script: Script) -> Harness {
    init_logging();
    let (frames, frames_keepalive) = broadcast::channel(256);
    let wake_trigger = Arc::new(AtomicBool::new(false));
    let sink = SinkProbe::default();
    let stt_calls = Arc::new(AtomicUsize::new(0));
    let stt_received_bytes = Arc::new(AtomicUsize::new(0));
    let llm_chats = Arc::new(AtomicUsize::new(0));
    let llm_cancelled = Arc::new(AtomicBool::new(false));
    let events = Arc::new(Mutex::new(Vec::new()));

    let components = Components {
        source: Box::new(StubSource { tx: frames.clone() }),
        sink: Arc::new(StubSink::new(sink.clone())),
        wake: Box::new(StubWake {
            trigger: Arc::clone(&wake_trigger),
        }),
        stt: Box::new(StubStt {
            reply: script.stt_reply.to_owned(),
            calls: Arc::clone(&stt_calls),
            received_bytes: Arc::clone(&stt_received_bytes),
        }),
        llm: Box::new(StubLlm {
            tokens: script.llm_tokens.iter().map(|t| (*t).to_owned()).collect(),
            token_delay: Duration::from_millis(script.token_delay_ms),
            chats: Arc::clone(&llm_chats),
            cancelled: Arc::clone(&llm_cancelled),
            active: None,
        }),
        tts: Box::new(StubTts {
            audio_ms: script.tts_audio_ms,
        }),
        recorder: Arc::new(VecRecorder {
            events: Arc::clone(&events),
            audio_counter: AtomicUsize::new(0),
        }),
    };

    let orchestrator = Orchestrator::new(config, components).unwrap();
    let states = orchestrator.states();
    let transcriptions = orchestrator.transcriptions();
    let responses = orchestrator.responses();
    let cancel = orchestrator.cancel_token();
    let task = tokio::spawn(orchestrator.run());

    Harness {
        frames,
        _frames_keepalive: frames_keepalive,
        wake_trigger,
        sink,
        stt_calls,
        stt_received_bytes,
        llm_chats,
        llm_cancelled,
        events,
        states,
        transcriptions,
        responses,
        cancel,
        task,
    }
}

impl Harness {
    fn loud_frame() -> Vec<u8> {
        wav::f32_to_pcm(&vec![0.5; 512])
    }

    fn quiet_frame() -> Vec<u8> {
        vec![0u8; 1024]
    }

    fn send(&self, frame: Vec<u8>) {
        let _ = self.frames.send(frame);
    }

    /// Fire the wake detector on the next routed frame.
    async fn trigger_wake(&self) {
        self.wake_trigger.store(true, Ordering::SeqCst);
        self.send(Self::quiet_frame());
    }

    /// Feed loud audio for roughly the given wall time.
    async fn speak_for(&self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        while tokio::time::Instant::now() < deadline {
            self.send(Self::loud_frame());
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Feed quiet audio until the given state is observed.
    async fn go_quiet_until(
        &mut self,
        state: AssistantState,
        timeout: Duration,
    ) -> Vec<AssistantState> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            self.send(Self::quiet_frame());
            match tokio::time::timeout(Duration::from_millis(30), self.states.recv()).await {
                Ok(Ok(s)) => {
                    seen.push(s);
                    if s == state {
                        return seen;
                    }
                }
                Ok(Err(_)) | Err(_) => {}
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "state {state:?} not reached; saw {seen:?}"
            );
        }
    }

    async fn wait_for_state(&mut self, state: AssistantState, timeout: Duration) -> Vec<AssistantState> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_else(|| panic!("state {state:?} not reached; saw {seen:?}"));
            match tokio::time::timeout(remaining, self.states.recv()).await {
                Ok(Ok(s)) => {
                    seen.push(s);
                    if s == state {
                        return seen;
                    }
                }
                Ok(Err(_)) => {}
                Err(_) => panic!("state {state:?} not reached; saw {seen:?}"),
            }
        }
    }

    fn event_types(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| match e {
                SessionEvent::SessionStart { .. } => "session_start",
                SessionEvent::WakeWord { .. } => "wake_word",
                SessionEvent::UserAudio { .. } => "user_audio",
                SessionEvent::Transcription { .. } => "transcription",
                SessionEvent::Response { .. } => "response",
                SessionEvent::BargeIn { .. } => "barge_in",
                SessionEvent::SessionEnd { .. } => "session_end",
            })
            .collect()
    }

    async fn finish(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

fn test_config() -> AssistantConfig {
    AssistantConfig {
        silence_threshold: 0.01,
        silence_duration_ms: 150,
        sentence_pause_ms: 40,
        enable_follow_up: true,
        follow_up_timeout_ms: 400,
        statement_follow_up_timeout_ms: 400,
        enable_barge_in: true,
        ..AssistantConfig::default()
    }
}

// ── scenarios ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_question_to_spoken_reply() -> anyhow::Result<()> {
    let mut harness = start(
        test_config(),
        Script {
            stt_reply: "what is two plus two",
            llm_tokens: &["Four. ", "That is it."],
            token_delay_ms: 20,
            tts_audio_ms: 200,
        },
    );

    harness
        .wait_for_state(AssistantState::ListeningForWakeWord, Duration::from_secs(2))
        .await;

    harness.trigger_wake().await;
    harness
        .wait_for_state(AssistantState::Listening, Duration::from_secs(2))
        .await;

    harness.speak_for(Duration::from_millis(300)).await;
    let seen = harness
        .go_quiet_until(AssistantState::Speaking, Duration::from_secs(3))
        .await;
    assert!(
        seen.contains(&AssistantState::Processing),
        "expected Processing before Speaking, saw {seen:?}"
    );

    harness
        .wait_for_state(AssistantState::AwaitingFollowUp, Duration::from_secs(5))
        .await;

    let transcription = harness.transcriptions.recv().await?;
    assert_eq!(transcription, "what is two plus two");
    let response = harness.responses.recv().await?;
    assert_eq!(response, "Four. That is it.");

    assert_eq!(harness.sink.play_completed.load(Ordering::SeqCst), 2);
    assert_eq!(harness.llm_chats.load(Ordering::SeqCst), 1);

    let types = harness.event_types();
    let order: Vec<usize> = ["wake_word", "user_audio", "transcription", "response"]
        .iter()
        .map(|wanted| {
            types
                .iter()
                .position(|t| t == wanted)
                .unwrap_or_else(|| panic!("missing {wanted} in {types:?}"))
        })
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "order: {types:?}");

    {
        let events = harness.events.lock().unwrap();
        let response_event = events
            .iter()
            .find(|e| matches!(e, SessionEvent::Response { .. }))
            .unwrap();
        if let SessionEvent::Response { sentence_count, .. } = response_event {
            assert_eq!(*sentence_count, 2);
        }
    }

    harness.finish().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn barge_in_preempts_playback_and_generation() {
    let mut harness = start(
        test_config(),
        Script {
            stt_reply: "tell me something",
            llm_tokens: &["Four. ", "That is it."],
            token_delay_ms: 20,
            tts_audio_ms: 600,
        },
    );

    harness
        .wait_for_state(AssistantState::ListeningForWakeWord, Duration::from_secs(2))
        .await;
    harness.trigger_wake().await;
    harness
        .wait_for_state(AssistantState::Listening, Duration::from_secs(2))
        .await;

    // Sit out the wake cooldown so the barge-in wake event is accepted.
    tokio::time::sleep(Duration::from_millis(2_100)).await;

    harness.speak_for(Duration::from_millis(300)).await;
    harness
        .go_quiet_until(AssistantState::Speaking, Duration::from_secs(3))
        .await;

    // Wait until the second sentence's playback has started.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while harness.sink.play_started.load(Ordering::SeqCst) < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "second sentence never started"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    harness.trigger_wake().await;
    harness
        .wait_for_state(AssistantState::Listening, Duration::from_secs(2))
        .await;

    assert!(harness.llm_cancelled.load(Ordering::SeqCst));
    assert!(harness.sink.stops.load(Ordering::SeqCst) >= 1);
    // The second play was preempted, not completed.
    assert!(harness.sink.play_completed.load(Ordering::SeqCst) < 2);

    {
        let events = harness.events.lock().unwrap();
        let barge_in = events
            .iter()
            .find(|e| matches!(e, SessionEvent::BargeIn { .. }))
            .expect("barge_in event missing");
        if let SessionEvent::BargeIn {
            sentence_index,
            sentences_total,
            partial_text,
        } = barge_in
        {
            assert_eq!(*sentence_index, 1);
            assert_eq!(*sentences_total, 2);
            assert_eq!(partial_text, "Four. That is it.");
        }
        assert!(
            !events.iter().any(|e| matches!(e, SessionEvent::Response { .. })),
            "no response event after barge-in"
        );
    }

    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_follow_up_prompts_once_then_gives_up() {
    let mut harness = start(
        test_config(),
        Script {
            stt_reply: "set a reminder",
            llm_tokens: &["Sure. ", "What time?"],
            token_delay_ms: 20,
            tts_audio_ms: 150,
        },
    );

    harness
        .wait_for_state(AssistantState::ListeningForWakeWord, Duration::from_secs(2))
        .await;
    harness.trigger_wake().await;
    harness
        .wait_for_state(AssistantState::Listening, Duration::from_secs(2))
        .await;
    harness.speak_for(Duration::from_millis(300)).await;
    harness
        .go_quiet_until(AssistantState::Speaking, Duration::from_secs(3))
        .await;

    // Reply ends in a question: silence leads to one re-prompt, then back
    // to wake listening.
    harness
        .wait_for_state(AssistantState::AwaitingFollowUp, Duration::from_secs(5))
        .await;
    harness
        .wait_for_state(AssistantState::Prompting, Duration::from_secs(2))
        .await;
    harness
        .wait_for_state(AssistantState::AwaitingFollowUp, Duration::from_secs(2))
        .await;
    harness
        .wait_for_state(AssistantState::ListeningForWakeWord, Duration::from_secs(2))
        .await;

    // Two reply sentences plus the re-spoken question.
    assert_eq!(harness.sink.play_completed.load(Ordering::SeqCst), 3);
    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn follow_up_speech_reuses_buffered_audio_without_wake_word() {
    let config = AssistantConfig {
        follow_up_timeout_ms: 3_000,
        statement_follow_up_timeout_ms: 3_000,
        ..test_config()
    };
    let mut harness = start(
        config,
        Script {
            stt_reply: "first question",
            llm_tokens: &["Done."],
            token_delay_ms: 10,
            tts_audio_ms: 100,
        },
    );

    harness
        .wait_for_state(AssistantState::ListeningForWakeWord, Duration::from_secs(2))
        .await;
    harness.trigger_wake().await;
    harness
        .wait_for_state(AssistantState::Listening, Duration::from_secs(2))
        .await;
    harness.speak_for(Duration::from_millis(300)).await;
    harness
        .go_quiet_until(AssistantState::AwaitingFollowUp, Duration::from_secs(5))
        .await;

    // Wait out the speech grace window, then speak without a wake word.
    tokio::time::sleep(Duration::from_millis(600)).await;
    harness.speak_for(Duration::from_millis(300)).await;
    harness
        .wait_for_state(AssistantState::Listening, Duration::from_secs(2))
        .await;
    harness
        .go_quiet_until(AssistantState::Speaking, Duration::from_secs(3))
        .await;

    assert_eq!(harness.stt_calls.load(Ordering::SeqCst), 2);
    // The follow-up utterance audio was captured from the buffered frames.
    assert!(harness.stt_received_bytes.load(Ordering::SeqCst) > 0);
    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_transcription_returns_to_wake_listening() {
    let mut harness = start(
        test_config(),
        Script {
            stt_reply: "",
            llm_tokens: &["never spoken"],
            token_delay_ms: 10,
            tts_audio_ms: 100,
        },
    );

    harness
        .wait_for_state(AssistantState::ListeningForWakeWord, Duration::from_secs(2))
        .await;
    harness.trigger_wake().await;
    harness
        .wait_for_state(AssistantState::Listening, Duration::from_secs(2))
        .await;
    harness.speak_for(Duration::from_millis(200)).await;
    let seen = harness
        .go_quiet_until(AssistantState::ListeningForWakeWord, Duration::from_secs(3))
        .await;
    assert!(seen.contains(&AssistantState::Processing));
    assert!(!seen.contains(&AssistantState::Speaking));

    assert_eq!(harness.llm_chats.load(Ordering::SeqCst), 0);
    assert!(
        !harness
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SessionEvent::Response { .. }))
    );
    harness.finish().await;
}
