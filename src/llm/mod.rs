//! Language model access through a persistent interactive child process.
//!
//! The model binary runs in conversation mode with line-oriented I/O:
//! requests are written to stdin, replies stream on stdout and end with the
//! literal prompt marker `"\n> "`. The process keeps its own conversation
//! memory, so callers never replay history.
//!
//! Exactly one request may be outstanding. Cancelling a stream closes the
//! consumer-visible side immediately; the child finishes its in-flight
//! generation and the trailing prompt marker is consumed to restore
//! readiness before any subsequent call.

use crate::config::AssistantConfig;
use crate::error::{AssistantError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Prompt marker terminating each reply on stdout.
const PROMPT_MARKER: &[u8] = b"\n> ";

/// Directive that resets the child's conversation memory.
const CLEAR_DIRECTIVE: &str = "/clear";

/// Directive that asks the child to exit.
const EXIT_DIRECTIVE: &str = "/exit";

/// How long a dying child gets after `/exit` before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A cancellable stream of cleaned reply fragments.
pub struct TokenStream {
    rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    clean_end: Arc<AtomicBool>,
}

/// Producer half of a [`TokenStream`], for alternate [`LanguageModel`]
/// implementations and tests.
pub struct TokenSender {
    tx: mpsc::UnboundedSender<String>,
    clean_end: Arc<AtomicBool>,
}

impl TokenSender {
    /// Send one fragment. Returns `false` if the consumer hung up.
    pub fn send(&self, token: impl Into<String>) -> bool {
        self.tx.send(token.into()).is_ok()
    }

    /// Mark the reply complete and close the stream. Dropping the sender
    /// without calling this reads as an abnormal end (process death).
    pub fn finish(self) {
        self.clean_end.store(true, Ordering::Release);
    }
}

impl TokenStream {
    /// Build a stream plus the sender feeding it.
    pub fn channel(cancel: CancellationToken) -> (TokenSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let clean_end = Arc::new(AtomicBool::new(false));
        (
            TokenSender {
                tx,
                clean_end: Arc::clone(&clean_end),
            },
            Self {
                rx,
                cancel,
                clean_end,
            },
        )
    }

    /// Next fragment, or `None` once the reply ends or the stream is
    /// cancelled.
    pub async fn next(&mut self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            () = self.cancel.cancelled() => None,
            token = self.rx.recv() => token,
        }
    }

    /// Close the consumer-visible stream immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the stream ended because the reply completed (prompt marker
    /// observed), as opposed to the producer dying mid-reply. Meaningful
    /// once `next` has returned `None` without cancellation.
    pub fn ended_cleanly(&self) -> bool {
        self.clean_end.load(Ordering::Acquire)
    }

    /// Adapt into a [`tokio_stream::Stream`] of fragments.
    pub fn into_stream(self) -> tokio_stream::wrappers::UnboundedReceiverStream<String> {
        tokio_stream::wrappers::UnboundedReceiverStream::new(self.rx)
    }
}

/// Streaming conversational model.
#[async_trait]
pub trait LanguageModel: Send {
    /// Send a user message and wait for the complete cleaned reply.
    async fn chat(&mut self, message: &str) -> Result<String>;

    /// Send a user message and stream cleaned reply fragments.
    async fn chat_stream(&mut self, message: &str) -> Result<TokenStream>;

    /// Cancel the in-flight stream, if any. Idempotent.
    fn cancel_stream(&mut self);

    /// Reset the model's conversation memory.
    async fn clear_context(&mut self) -> Result<()>;

    /// Tear down any backing process. Default: nothing to do.
    async fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The request currently awaiting its prompt marker.
#[derive(Debug)]
struct ActiveRequest {
    /// Consumer-visible fragment sender; `None` after cancellation (or for
    /// marker-only requests like `/clear` and the startup handshake).
    chunk_tx: Option<mpsc::UnboundedSender<String>>,
    /// Clean-end flag of the consumer's [`TokenStream`], set on marker.
    clean_end: Option<Arc<AtomicBool>>,
    cancel: CancellationToken,
    /// Resolved when the prompt marker is observed.
    done_tx: Option<oneshot::Sender<()>>,
    /// Cross-chunk cleaning state: whether the next byte starts a line.
    at_line_start: bool,
}

#[derive(Debug)]
struct Shared {
    active: Option<ActiveRequest>,
    disposed: bool,
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Persistent conversation-mode LLM child process.
#[derive(Debug)]
pub struct LlamaChat {
    child: Child,
    stdin: Option<ChildStdin>,
    shared: Arc<Mutex<Shared>>,
    reader: Option<tokio::task::JoinHandle<()>>,
    reply_timeout: Duration,
}

impl LlamaChat {
    /// Spawn the configured binary in conversation mode and wait for the
    /// initial prompt.
    ///
    /// # Errors
    ///
    /// Returns `InitializationFailed` if the process cannot be spawned or
    /// the prompt does not appear within `llm_ready_timeout`.
    pub async fn initialize(config: &AssistantConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.llama_executable);
        cmd.args([
            "-hf",
            &config.llama_model_repo,
            "-cnv",
            "--no-display-prompt",
            "--log-disable",
            "-n",
            &config.llama_max_reply_tokens.to_string(),
        ]);
        info!("starting LLM process {}", config.llama_executable);
        Self::spawn_command(cmd, config.llm_ready_timeout(), config.llm_reply_timeout()).await
    }

    /// Spawn an arbitrary command speaking the prompt-marker protocol.
    ///
    /// # Errors
    ///
    /// Returns `InitializationFailed` on spawn failure or a missed startup
    /// prompt.
    pub async fn spawn_command(
        mut cmd: Command,
        ready_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<Self> {
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| AssistantError::InitializationFailed(format!("spawn LLM: {e}")))?;
        let stdin = child.stdin.take().ok_or_else(|| {
            AssistantError::InitializationFailed("LLM stdin not captured".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AssistantError::InitializationFailed("LLM stdout not captured".into())
        })?;

        let shared = Arc::new(Mutex::new(Shared {
            active: None,
            disposed: false,
        }));

        // Install the startup handshake before the reader can consume the
        // initial prompt.
        let (done_tx, done_rx) = oneshot::channel();
        lock_shared(&shared).active = Some(ActiveRequest {
            chunk_tx: None,
            clean_end: None,
            cancel: CancellationToken::new(),
            done_tx: Some(done_tx),
            at_line_start: true,
        });

        let reader = tokio::spawn(reader_loop(stdout, Arc::clone(&shared)));

        let mut this = Self {
            child,
            stdin: Some(stdin),
            shared,
            reader: Some(reader),
            reply_timeout,
        };

        match tokio::time::timeout(ready_timeout, done_rx).await {
            Ok(Ok(())) => {
                info!("LLM process ready");
                Ok(this)
            }
            Ok(Err(_)) => {
                let _ = this.dispose().await;
                Err(AssistantError::InitializationFailed(
                    "LLM process exited during startup".into(),
                ))
            }
            Err(_) => {
                let _ = this.dispose().await;
                Err(AssistantError::InitializationFailed(format!(
                    "no LLM prompt within {ready_timeout:?}"
                )))
            }
        }
    }

    /// Whether the process is idle and able to accept a request.
    pub fn is_ready(&self) -> bool {
        let shared = lock_shared(&self.shared);
        !shared.disposed && shared.active.is_none()
    }

    fn begin_request(
        &self,
        chunk_tx: Option<mpsc::UnboundedSender<String>>,
        clean_end: Option<Arc<AtomicBool>>,
        cancel: CancellationToken,
        done_tx: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let mut shared = lock_shared(&self.shared);
        if shared.disposed {
            return Err(AssistantError::Disposed("LLM process".into()));
        }
        if shared.active.is_some() {
            return Err(AssistantError::NotReady(
                "LLM request already in flight".into(),
            ));
        }
        shared.active = Some(ActiveRequest {
            chunk_tx,
            clean_end,
            cancel,
            done_tx,
            at_line_start: true,
        });
        Ok(())
    }

    fn abort_request(&self) {
        lock_shared(&self.shared).active = None;
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        // Line-oriented protocol: flatten embedded newlines.
        let flat = line.replace(['\r', '\n'], " ");
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AssistantError::Disposed("LLM stdin closed".into()))?;
        let write = async {
            stdin.write_all(flat.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            self.abort_request();
            return Err(AssistantError::EngineFailed(format!("LLM write: {e}")));
        }
        Ok(())
    }
}

#[async_trait]
impl LanguageModel for LlamaChat {
    async fn chat(&mut self, message: &str) -> Result<String> {
        let (done_tx, done_rx) = oneshot::channel();
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        self.begin_request(Some(chunk_tx), None, CancellationToken::new(), Some(done_tx))?;
        self.write_line(message).await?;

        let collect = async {
            let mut out = String::new();
            while let Some(chunk) = chunk_rx.recv().await {
                out.push_str(&chunk);
            }
            out
        };

        let text = tokio::time::timeout(self.reply_timeout, collect)
            .await
            .map_err(|_| {
                AssistantError::Timeout(format!(
                    "no LLM prompt marker within {:?}",
                    self.reply_timeout
                ))
            })?;

        match done_rx.await {
            Ok(()) => Ok(text.trim().to_owned()),
            Err(_) => Err(AssistantError::EngineFailed(
                "LLM process exited mid-reply".into(),
            )),
        }
    }

    async fn chat_stream(&mut self, message: &str) -> Result<TokenStream> {
        let cancel = CancellationToken::new();
        let (sender, stream) = TokenStream::channel(cancel.clone());
        let TokenSender { tx, clean_end } = sender;
        self.begin_request(Some(tx), Some(clean_end), cancel, None)?;
        self.write_line(message).await?;
        Ok(stream)
    }

    fn cancel_stream(&mut self) {
        let mut shared = lock_shared(&self.shared);
        if let Some(active) = shared.active.as_mut() {
            debug!("cancelling in-flight LLM stream");
            active.cancel.cancel();
            // Close the visible stream now; the reader keeps consuming
            // until the prompt marker restores readiness.
            active.chunk_tx = None;
        }
    }

    async fn clear_context(&mut self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.begin_request(None, None, CancellationToken::new(), Some(done_tx))?;
        self.write_line(CLEAR_DIRECTIVE).await?;

        match tokio::time::timeout(self.reply_timeout, done_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AssistantError::EngineFailed(
                "LLM process exited during /clear".into(),
            )),
            Err(_) => Err(AssistantError::Timeout(
                "no prompt marker after /clear".into(),
            )),
        }
    }

    async fn dispose(&mut self) -> Result<()> {
        {
            let mut shared = lock_shared(&self.shared);
            if shared.disposed {
                return Ok(());
            }
            shared.disposed = true;
            // Drop any pending completer and stream.
            shared.active = None;
        }

        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(EXIT_DIRECTIVE.as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
            let _ = stdin.flush().await;
            // Dropping stdin closes the pipe.
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => info!("LLM process exited: {status}"),
            Ok(Err(e)) => warn!("LLM process wait failed: {e}"),
            Err(_) => {
                warn!("LLM process ignored {EXIT_DIRECTIVE}, killing");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        Ok(())
    }
}

// ── stdout reader ───────────────────────────────────────────────────

/// Read stdout, clean and forward reply fragments, and complete the active
/// request whenever the prompt marker appears.
async fn reader_loop(mut stdout: ChildStdout, shared: Arc<Mutex<Shared>>) {
    // Prime with a newline so the very first `"> "` matches the marker.
    let mut buf: Vec<u8> = b"\n".to_vec();
    let mut read_buf = [0u8; 4096];

    loop {
        let n = match stdout.read(&mut read_buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("LLM stdout read error: {e}");
                break;
            }
        };
        buf.extend_from_slice(&read_buf[..n]);
        drain_buffer(&mut buf, &shared);
    }

    // Process gone: fail whatever was pending by dropping its channels.
    lock_shared(&shared).active = None;
    debug!("LLM stdout closed");
}

fn drain_buffer(buf: &mut Vec<u8>, shared: &Mutex<Shared>) {
    loop {
        if let Some(pos) = find_subslice(buf, PROMPT_MARKER) {
            let body: Vec<u8> = buf.drain(..pos + PROMPT_MARKER.len()).collect();
            let body = &body[..pos];
            let mut guard = lock_shared(shared);
            if let Some(mut active) = guard.active.take() {
                forward_fragment(&mut active, body);
                if let Some(ref flag) = active.clean_end {
                    flag.store(true, Ordering::Release);
                }
                if let Some(done) = active.done_tx.take() {
                    let _ = done.send(());
                }
                // Dropping `active` closes the fragment stream.
            }
            continue;
        }

        // No full marker: emit everything except a possible marker prefix
        // held back at the tail.
        let holdback = marker_prefix_len(buf);
        let safe = buf.len() - holdback;
        if safe == 0 {
            return;
        }
        let body: Vec<u8> = buf.drain(..safe).collect();
        let mut guard = lock_shared(shared);
        if let Some(active) = guard.active.as_mut() {
            forward_fragment(active, &body);
        }
        return;
    }
}

fn forward_fragment(active: &mut ActiveRequest, bytes: &[u8]) {
    if bytes.is_empty() || active.cancel.is_cancelled() {
        return;
    }
    let cleaned = clean_fragment(bytes, &mut active.at_line_start);
    if cleaned.is_empty() {
        return;
    }
    if let Some(ref tx) = active.chunk_tx
        && tx.send(cleaned).is_err()
    {
        // Consumer hung up; stop forwarding but keep consuming to marker.
        active.chunk_tx = None;
    }
}

/// Strip `"| "` line prefixes and drop backspace/control bytes.
fn clean_fragment(bytes: &[u8], at_line_start: &mut bool) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if *at_line_start && c == '|' && chars.peek() == Some(&' ') {
            let _ = chars.next();
            *at_line_start = false;
            continue;
        }
        if c == '\n' {
            out.push('\n');
            *at_line_start = true;
            continue;
        }
        *at_line_start = false;
        if c.is_control() && c != '\t' {
            continue;
        }
        out.push(c);
    }
    out
}

/// Longest suffix of `buf` that is a proper prefix of the prompt marker.
fn marker_prefix_len(buf: &[u8]) -> usize {
    for len in (1..PROMPT_MARKER.len()).rev() {
        if buf.ends_with(&PROMPT_MARKER[..len]) {
            return len;
        }
    }
    0
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
