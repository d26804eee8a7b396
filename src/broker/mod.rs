//! C4 — Embedding Broker: the hardest component. A supervisor + multiplexer
//! presenting `embed(text) -> vector` / `embed_batch(texts) -> vectors` to the
//! rest of the system while hiding a worker process that can crash, hang,
//! warm slowly, or backpressure.
//!
//! Structurally grounded on the reference daemon's `EmbedderPool` (semaphore-
//! bounded admission, round-robin-ish dispatch, `Arc`-shared handle) and its
//! `CircuitBreaker` (`Closed`/`Open`/`HalfOpen`) for the READY/DEGRADED/FAILED
//! transitions; the wire topology itself (external process over a socket) is
//! new. The newline framer lives in `wire.rs`.

pub mod wire;

use crate::governor::ResourceGate;
use crate::models::Priority;
use crate::project::Project;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, RwLock};

use wire::{
    read_until_terminal, write_request, FramingError, WorkerMessage, WorkerRequest,
    BATCH_RESPONSE_CAP_BYTES, SINGLE_RESPONSE_CAP_BYTES,
};

#[derive(Debug, thiserror::Error, Clone)]
pub enum BrokerError {
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding worker socket missing")]
    SocketMissing,
    #[error("embedding worker socket closed")]
    SocketClosed,
    #[error("embedding worker protocol error: {0}")]
    ProtocolError(String),
    #[error("embedding worker returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("embedding worker overloaded")]
    WorkerOverload,
    #[error("embedding worker unavailable")]
    WorkerUnavailable,
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("admission deferred: resource governor denied non-critical request")]
    ResourceExhausted,
}

impl From<FramingError> for BrokerError {
    fn from(e: FramingError) -> Self {
        match e {
            FramingError::SocketClosed => BrokerError::SocketClosed,
            FramingError::BufferOverflow(_) => BrokerError::ProtocolError("response buffer overflow".into()),
            FramingError::MalformedJson(e) => BrokerError::InvalidResponse(e.to_string()),
            FramingError::Io(e) => BrokerError::ProtocolError(e.to_string()),
        }
    }
}

/// `DOWN → STARTING → READY ⇄ DEGRADED → FAILED → DOWN`, with a
/// `SHUTTING_DOWN` branch out of any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Down,
    Starting,
    Ready,
    Degraded,
    Failed,
    ShuttingDown,
}

const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const MAX_HEARTBEATS: usize = 30;
const SINGLE_DEADLINE: Duration = Duration::from_secs(90);
const BATCH_DEADLINE_FLOOR: Duration = Duration::from_secs(60);
const RETRY_BACKOFFS_MS: [u64; 3] = [100, 200, 400];
const OVERLOAD_BACKOFF_MULTIPLIER: u64 = 5;

/// How to launch the worker process; the worker itself is out of scope (§1) —
/// the broker only knows a command line and the socket path it must bind.
#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
}

impl WorkerSpawnConfig {
    pub fn from_env() -> Option<Self> {
        let command = std::env::var("SPECMEM_EMBEDDING_WORKER_CMD").ok()?;
        let args = std::env::var("SPECMEM_EMBEDDING_WORKER_ARGS")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Some(Self {
            command: PathBuf::from(command),
            args,
        })
    }
}

/// In-memory admission queue bounding simultaneous connections to the worker
/// (§4.4: "a small number, e.g. 1-4"). Higher-priority waiters are admitted
/// ahead of lower-priority ones whenever more than one is queued; within a
/// single priority level admission is strict FIFO.
struct PriorityGate {
    max: usize,
    inner: std::sync::Mutex<PriorityGateInner>,
}

struct PriorityGateInner {
    in_use: usize,
    // Indexed by `Priority as usize` (Idle=0 .. Critical=4).
    queues: [VecDeque<Arc<Notify>>; 5],
}

impl PriorityGate {
    fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            inner: std::sync::Mutex::new(PriorityGateInner {
                in_use: 0,
                queues: std::array::from_fn(|_| VecDeque::new()),
            }),
        }
    }

    async fn acquire(self: &Arc<Self>, priority: Priority) -> PriorityPermit {
        let notify = Arc::new(Notify::new());
        {
            let mut inner = self.inner.lock().unwrap();
            inner.queues[priority as usize].push_back(notify.clone());
            self.dispatch(&mut inner);
        }
        notify.notified().await;
        PriorityPermit { gate: self.clone() }
    }

    /// Admits as many queued waiters as current capacity allows, always
    /// draining the highest non-empty priority queue first.
    fn dispatch(&self, inner: &mut PriorityGateInner) {
        while inner.in_use < self.max {
            match inner.queues.iter_mut().rev().find(|q| !q.is_empty()) {
                Some(q) => {
                    let waiter = q.pop_front().expect("queue checked non-empty");
                    inner.in_use += 1;
                    waiter.notify_one();
                }
                None => break,
            }
        }
    }

    fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use = inner.in_use.saturating_sub(1);
        self.dispatch(&mut inner);
    }
}

struct PriorityPermit {
    gate: Arc<PriorityGate>,
}

impl Drop for PriorityPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

pub struct EmbeddingBroker {
    project: Arc<Project>,
    spawn_config: WorkerSpawnConfig,
    state: RwLock<BrokerState>,
    dimension: RwLock<Option<usize>>,
    consecutive_failures: AtomicU32,
    child: Mutex<Option<Child>>,
    connection_gate: Arc<PriorityGate>,
    governor: Arc<dyn ResourceGate>,
}

impl EmbeddingBroker {
    pub fn new(
        project: Arc<Project>,
        spawn_config: WorkerSpawnConfig,
        governor: Arc<dyn ResourceGate>,
        max_connections: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            project,
            spawn_config,
            state: RwLock::new(BrokerState::Down),
            dimension: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
            child: Mutex::new(None),
            connection_gate: Arc::new(PriorityGate::new(max_connections)),
            governor,
        })
    }

    pub async fn state(&self) -> BrokerState {
        *self.state.read().await
    }

    pub async fn dimension(&self) -> Option<usize> {
        *self.dimension.read().await
    }

    /// `DOWN -> STARTING -> READY`: remove any stale socket, spawn the
    /// worker, poll for the socket up to 60s, then issue one warmup `embed`
    /// with a 60s deadline to learn the advertised dimensionality.
    pub async fn start(&self) -> Result<(), BrokerError> {
        *self.state.write().await = BrokerState::Starting;

        let socket_path = self.project.embedding_socket();
        if socket_path.exists() {
            let tmp = socket_path.with_extension("stale");
            let _ = tokio::fs::rename(&socket_path, &tmp).await;
            let _ = tokio::fs::remove_file(&tmp).await;
        }

        let mut command = Command::new(&self.spawn_config.command);
        command
            .args(&self.spawn_config.args)
            .env("SPECMEM_WORKER_SOCKET", &socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut process = command.spawn().map_err(|e| {
            BrokerError::ProtocolError(format!("failed to spawn embedding worker: {e}"))
        })?;

        redirect_to_log(&mut process, self.project.service_log_path());
        *self.child.lock().await = Some(process);

        if !wait_for_socket(&socket_path, Duration::from_secs(60)).await {
            *self.state.write().await = BrokerState::Failed;
            return Err(BrokerError::SocketMissing);
        }

        match self.send_request(WorkerRequest::Health, Duration::from_secs(60)).await {
            Ok((WorkerMessage::Health { status }, _)) if status != "error" => {
                // Warmup embed to learn dimensionality.
                match self
                    .send_request(
                        WorkerRequest::Embed {
                            text: "specmem warmup probe".to_string(),
                        },
                        Duration::from_secs(60),
                    )
                    .await
                {
                    Ok((WorkerMessage::Ready { embedding }, _)) => {
                        *self.dimension.write().await = Some(embedding.len());
                        *self.state.write().await = BrokerState::Ready;
                        self.consecutive_failures.store(0, Ordering::SeqCst);
                        Ok(())
                    }
                    _ => {
                        *self.state.write().await = BrokerState::Failed;
                        Err(BrokerError::WorkerUnavailable)
                    }
                }
            }
            _ => {
                *self.state.write().await = BrokerState::Failed;
                Err(BrokerError::WorkerUnavailable)
            }
        }
    }

    pub async fn embed(&self, text: String, priority: Priority) -> Result<Vec<f32>, BrokerError> {
        self.admit(priority).await?;
        let deadline = SINGLE_DEADLINE;
        let (msg, heartbeats) = self
            .with_retries(priority, |broker| {
                let text = text.clone();
                Box::pin(async move {
                    broker
                        .send_request_capped(
                            WorkerRequest::Embed { text },
                            deadline,
                            SINGLE_RESPONSE_CAP_BYTES,
                            priority,
                        )
                        .await
                })
            })
            .await?;

        if heartbeats > MAX_HEARTBEATS {
            self.note_failure().await;
            return Err(BrokerError::WorkerOverload);
        }

        match msg {
            WorkerMessage::Ready { embedding } => {
                self.check_dimension(embedding.len()).await?;
                self.note_success().await;
                Ok(embedding)
            }
            WorkerMessage::Error { error } => {
                self.note_failure().await;
                Err(BrokerError::InvalidResponse(error))
            }
            other => {
                self.note_failure().await;
                Err(BrokerError::ProtocolError(format!("unexpected reply: {other:?}")))
            }
        }
    }

    pub async fn embed_batch(
        &self,
        texts: Vec<String>,
        priority: Priority,
    ) -> Result<Vec<Option<Vec<f32>>>, BrokerError> {
        self.admit(priority).await?;
        let scaled = Duration::from_secs((texts.len() as u64).max(1) * 2).max(BATCH_DEADLINE_FLOOR);
        let requested_len = texts.len();

        let (msg, heartbeats) = self
            .with_retries(priority, |broker| {
                let texts = texts.clone();
                Box::pin(async move {
                    broker
                        .send_request_capped(
                            WorkerRequest::BatchEmbed { texts },
                            scaled,
                            BATCH_RESPONSE_CAP_BYTES,
                            priority,
                        )
                        .await
                })
            })
            .await?;

        if heartbeats > MAX_HEARTBEATS {
            self.note_failure().await;
            return Err(BrokerError::WorkerOverload);
        }

        match msg {
            WorkerMessage::ReadyBatch { mut embeddings } => {
                if let Some(first) = embeddings.iter().flatten().next() {
                    self.check_dimension(first.len()).await?;
                }
                // Batch semantics: pad-with-null / truncate, each logged.
                if embeddings.len() < requested_len {
                    tracing::warn!(
                        "worker returned {} vectors for {} inputs; padding with null",
                        embeddings.len(),
                        requested_len
                    );
                    embeddings.resize(requested_len, None);
                } else if embeddings.len() > requested_len {
                    tracing::warn!(
                        "worker returned {} vectors for {} inputs; truncating",
                        embeddings.len(),
                        requested_len
                    );
                    embeddings.truncate(requested_len);
                }
                self.note_success().await;
                Ok(embeddings)
            }
            WorkerMessage::Error { error } => {
                self.note_failure().await;
                Err(BrokerError::InvalidResponse(error))
            }
            other => {
                self.note_failure().await;
                Err(BrokerError::ProtocolError(format!("unexpected reply: {other:?}")))
            }
        }
    }

    async fn admit(&self, priority: Priority) -> Result<(), BrokerError> {
        if priority == Priority::Critical {
            return Ok(());
        }
        let admitted = self
            .governor
            .wait_until_admissible(priority, Duration::from_secs(5))
            .await;
        if !admitted && priority == Priority::Idle {
            return Err(BrokerError::ResourceExhausted);
        }
        Ok(())
    }

    async fn check_dimension(&self, got: usize) -> Result<(), BrokerError> {
        if !(32..=4096).contains(&got) {
            return Err(BrokerError::DimensionMismatch { expected: 0, got });
        }
        let mut dim = self.dimension.write().await;
        match *dim {
            None => {
                *dim = Some(got);
                Ok(())
            }
            Some(expected) if expected == got => Ok(()),
            Some(expected) => Err(BrokerError::DimensionMismatch { expected, got }),
        }
    }

    async fn note_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures > MAX_CONSECUTIVE_FAILURES {
            let mut state = self.state.write().await;
            if *state == BrokerState::Ready {
                *state = BrokerState::Degraded;
                tracing::warn!("embedding broker entering DEGRADED after {failures} consecutive failures");
            }
        }
    }

    async fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let mut state = self.state.write().await;
        if *state == BrokerState::Degraded {
            *state = BrokerState::Ready;
        }
    }

    /// Revalidate a `DEGRADED` worker: connect, send `health`, expect a
    /// non-processing reply within 2s. Success -> READY, failure -> FAILED.
    pub async fn revalidate(&self) -> bool {
        match self
            .send_request(WorkerRequest::Health, Duration::from_secs(2))
            .await
        {
            Ok((msg, _)) if msg.is_healthy() => {
                *self.state.write().await = BrokerState::Ready;
                self.consecutive_failures.store(0, Ordering::SeqCst);
                true
            }
            _ => {
                *self.state.write().await = BrokerState::Failed;
                false
            }
        }
    }

    /// `FAILED -> DOWN`: kill the worker, remove the socket.
    pub async fn stop(&self) {
        *self.state.write().await = BrokerState::ShuttingDown;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }
        let socket_path = self.project.embedding_socket();
        let _ = tokio::fs::remove_file(&socket_path).await;
        *self.state.write().await = BrokerState::Down;
    }

    async fn with_retries<F>(
        &self,
        priority: Priority,
        attempt: F,
    ) -> Result<(WorkerMessage, usize), BrokerError>
    where
        F: for<'a> Fn(
            &'a Self,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<(WorkerMessage, usize), BrokerError>> + Send + 'a>,
        >,
    {
        let _ = priority;
        let mut last_err = BrokerError::WorkerUnavailable;
        for (i, base_ms) in RETRY_BACKOFFS_MS.iter().enumerate() {
            match attempt(self).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_err = e.clone();
                    let is_overload = matches!(e, BrokerError::WorkerOverload);
                    let failures = self.consecutive_failures.load(Ordering::SeqCst);
                    if failures > MAX_CONSECUTIVE_FAILURES {
                        self.revalidate().await;
                    }
                    let delay_ms = if is_overload {
                        base_ms * OVERLOAD_BACKOFF_MULTIPLIER
                    } else {
                        *base_ms
                    };
                    if i + 1 < RETRY_BACKOFFS_MS.len() {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }
        self.note_failure().await;
        Err(last_err)
    }

    /// Used for broker-internal health/warmup probes, which are never
    /// subject to priority queueing.
    async fn send_request(
        &self,
        request: WorkerRequest,
        deadline: Duration,
    ) -> Result<(WorkerMessage, usize), BrokerError> {
        self.send_request_capped(request, deadline, SINGLE_RESPONSE_CAP_BYTES, Priority::Critical)
            .await
    }

    async fn send_request_capped(
        &self,
        request: WorkerRequest,
        deadline: Duration,
        cap_bytes: usize,
        priority: Priority,
    ) -> Result<(WorkerMessage, usize), BrokerError> {
        let _permit = self.connection_gate.acquire(priority).await;

        let socket_path = self.project.embedding_socket();
        if !socket_path.exists() {
            return Err(BrokerError::SocketMissing);
        }

        tokio::time::timeout(deadline, async move {
            let stream = UnixStream::connect(&socket_path)
                .await
                .map_err(|_| BrokerError::SocketMissing)?;
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            write_request(&mut write_half, &request)
                .await
                .map_err(BrokerError::from)?;

            read_until_terminal(&mut reader, cap_bytes, MAX_HEARTBEATS)
                .await
                .map_err(BrokerError::from)
        })
        .await
        .map_err(|_| BrokerError::Timeout)?
    }
}

async fn wait_for_socket(path: &std::path::Path, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    path.exists()
}

/// Capture worker stdout/stderr into the project's log file, never onto the
/// tool-protocol channel.
fn redirect_to_log(child: &mut Child, log_path: PathBuf) {
    if let Some(stdout) = child.stdout.take() {
        spawn_log_drain(stdout, log_path.clone(), "stdout");
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_log_drain(stderr, log_path, "stderr");
    }
}

fn spawn_log_drain<R>(pipe: R, log_path: PathBuf, stream_name: &'static str)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("cannot open {:?} for worker log redirection: {e}", log_path);
                return;
            }
        };
        while let Ok(Some(line)) = lines.next_line().await {
            use tokio::io::AsyncWriteExt;
            let entry = format!("[embedding-worker:{stream_name}] {line}\n");
            if let Err(e) = file.write_all(entry.as_bytes()).await {
                tracing::warn!("failed writing worker log line: {e}");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_dimension_mismatch_roundtrips() {
        let e = BrokerError::DimensionMismatch {
            expected: 384,
            got: 768,
        };
        assert!(e.to_string().contains("384"));
        assert!(e.to_string().contains("768"));
    }
}
