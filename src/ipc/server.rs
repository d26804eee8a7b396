//! Unix socket instance server — accepts connections and routes JSON-RPC requests
//! against the tool surface (`saveMemory`, `findMemory`, `getMemory`,
//! `findCodePointers`, `checkSync`) plus the lifecycle surface the Startup
//! Coordinator's health probe and the CLI rely on (`health`, `ping`, `stats`,
//! `shutdown`). Connection handling (bounded concurrency, idle timeout,
//! per-connection rate limiting, batch-array support) is carried over from
//! the reference codebase's `handle_connection()`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixListener;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{DaemonRequest, DaemonResponse};
use crate::broker::EmbeddingBroker;
use crate::error::SpecmemError;
use crate::governor::ResourceGate;
use crate::memory::{MemoryStore, SaveMemoryInput};
use crate::models::{Importance, MemoryKind, Priority, SyncProgress};
use crate::pipeline::Pipeline;
use crate::project::Project;
use crate::storage::PostgresStorage;

const MAX_CONNECTIONS: usize = 256;
const RATE_LIMIT_PER_SEC: u32 = 100;
const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// Shared state reachable from every connection handler.
pub struct InstanceState {
    pub project: Arc<Project>,
    pub storage: Arc<PostgresStorage>,
    pub broker: Arc<EmbeddingBroker>,
    pub memory: Arc<MemoryStore>,
    pub pipeline: Arc<Pipeline>,
    pub governor: Arc<dyn ResourceGate>,
    pub progress_rx: watch::Receiver<SyncProgress>,
    pub shutdown_token: CancellationToken,
    pub started_at: Instant,
    pub last_batch_at: Mutex<Option<DateTime<Utc>>>,
    connection_semaphore: Semaphore,
    active_connections: AtomicU32,
}

impl InstanceState {
    pub fn new(
        project: Arc<Project>,
        storage: Arc<PostgresStorage>,
        broker: Arc<EmbeddingBroker>,
        memory: Arc<MemoryStore>,
        pipeline: Arc<Pipeline>,
        governor: Arc<dyn ResourceGate>,
        progress_rx: watch::Receiver<SyncProgress>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            project,
            storage,
            broker,
            memory,
            pipeline,
            governor,
            progress_rx,
            shutdown_token,
            started_at: Instant::now(),
            last_batch_at: Mutex::new(None),
            connection_semaphore: Semaphore::new(MAX_CONNECTIONS),
            active_connections: AtomicU32::new(0),
        }
    }

    pub fn record_batch_completed(&self) {
        if let Ok(mut guard) = self.last_batch_at.try_lock() {
            *guard = Some(Utc::now());
        }
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Runs the accept loop against a listener already bound by the Startup
/// Coordinator (C2), until the shutdown token is cancelled. Hands the
/// listener back so the caller can tear it down (C2's `teardown`).
pub async fn run(listener: UnixListener, state: Arc<InstanceState>) -> Result<UnixListener> {
    tracing::info!("instance socket listening on {:?}", state.project.instance_socket());
    let token = state.shutdown_token.clone();

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _addr) = result?;
                let state = state.clone();

                let permit = match state.connection_semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("max connections ({MAX_CONNECTIONS}) reached, rejecting connection");
                        continue;
                    }
                };

                state.active_connections.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    let conn_start = Instant::now();
                    if let Err(e) = handle_connection(stream, state.clone()).await {
                        tracing::error!("connection error: {e}");
                    }
                    tracing::debug!("connection closed after {:?}", conn_start.elapsed());
                    state.active_connections.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                });
            }
            _ = token.cancelled() => {
                tracing::info!("shutdown token triggered, stopping accept loop");
                break;
            }
        }
    }

    Ok(listener)
}

async fn handle_connection(stream: tokio::net::UnixStream, state: Arc<InstanceState>) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = BufWriter::new(writer);
    let mut line = String::new();

    let (write_tx, mut write_rx) = tokio::sync::mpsc::channel::<String>(64);

    let writer_handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(msg) = write_rx.recv().await {
            if let Err(e) = async {
                writer.write_all(msg.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
                Ok::<(), std::io::Error>(())
            }
            .await
            {
                tracing::error!("write error: {e}");
                break;
            }
        }
    });

    let mut window_start = Instant::now();
    let mut window_count: u32 = 0;

    loop {
        line.clear();
        let read_result = tokio::time::timeout(IDLE_TIMEOUT, reader.read_line(&mut line)).await;

        let n = match read_result {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::debug!("connection idle for {:?}, closing", IDLE_TIMEOUT);
                break;
            }
        };
        if n == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let now = Instant::now();
        if now.duration_since(window_start).as_secs() >= 1 {
            window_start = now;
            window_count = 0;
        }
        window_count += 1;
        if window_count > RATE_LIMIT_PER_SEC {
            let resp = DaemonResponse::error(
                Value::Null,
                -32000,
                format!("rate limit exceeded ({RATE_LIMIT_PER_SEC} req/s per connection)"),
            );
            let _ = write_tx.send(serde_json::to_string(&resp)?).await;
            continue;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(batch)) if !batch.is_empty() => {
                let handles: Vec<_> = batch
                    .into_iter()
                    .map(|v| {
                        let st = state.clone();
                        tokio::spawn(async move {
                            match serde_json::from_value::<DaemonRequest>(v) {
                                Ok(req) => handle_request(req, &st).await,
                                Err(e) => {
                                    let (code, msg) = SpecmemError::ParseError(e.to_string()).into_rpc();
                                    DaemonResponse::error(Value::Null, code, msg)
                                }
                            }
                        })
                    })
                    .collect();

                let mut responses = Vec::with_capacity(handles.len());
                for handle in handles {
                    if let Ok(resp) = handle.await {
                        responses.push(resp);
                    }
                }
                let _ = write_tx.send(serde_json::to_string(&responses)?).await;
            }
            _ => {
                let response = match serde_json::from_str::<DaemonRequest>(trimmed) {
                    Ok(req) => handle_request(req, &state).await,
                    Err(e) => {
                        let (code, msg) = SpecmemError::ParseError(e.to_string()).into_rpc();
                        DaemonResponse::error(Value::Null, code, msg)
                    }
                };
                let _ = write_tx.send(serde_json::to_string(&response)?).await;
            }
        }
    }

    drop(write_tx);
    let _ = writer_handle.await;
    Ok(())
}

async fn handle_request(req: DaemonRequest, state: &Arc<InstanceState>) -> DaemonResponse {
    let id = req.id.clone().unwrap_or(Value::Null);

    match req.method.as_str() {
        "ping" => DaemonResponse::success(id, json!({})),
        "health" => handle_health(id, state).await,
        "stats" => handle_stats(id, state).await,
        "shutdown" => handle_shutdown(id, state).await,
        "saveMemory" => handle_save_memory(id, &req.params, state).await,
        "findMemory" => handle_find_memory(id, &req.params, state).await,
        "getMemory" => handle_get_memory(id, &req.params, state).await,
        "findCodePointers" => handle_find_code_pointers(id, &req.params, state).await,
        "checkSync" => handle_check_sync(id, state).await,
        "reindex" => handle_reindex(id, &req.params, state).await,
        _ => {
            let (code, msg) = SpecmemError::MethodNotFound(req.method.clone()).into_rpc();
            DaemonResponse::error(id, code, msg)
        }
    }
}

async fn handle_health(id: Value, state: &Arc<InstanceState>) -> DaemonResponse {
    let broker_state = state.broker.state().await;
    let status = if matches!(broker_state, crate::broker::BrokerState::Failed) {
        "degraded"
    } else {
        "ok"
    };
    DaemonResponse::success(
        id,
        json!({
            "status": status,
            "brokerState": format!("{broker_state:?}"),
            "pid": std::process::id(),
            "uptimeSeconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

async fn handle_stats(id: Value, state: &Arc<InstanceState>) -> DaemonResponse {
    let progress = state.progress_rx.borrow().clone();
    let sample = state.governor.current_sample();
    DaemonResponse::success(
        id,
        json!({
            "uptimeSeconds": state.started_at.elapsed().as_secs(),
            "projectHash": state.project.hash,
            "progress": progress,
            "resourceSample": sample,
        }),
    )
}

async fn handle_shutdown(id: Value, state: &Arc<InstanceState>) -> DaemonResponse {
    tracing::info!("shutdown requested via IPC");
    state.shutdown_token.cancel();
    DaemonResponse::success(id, json!({ "message": "shutting down" }))
}

fn param_err(id: Value, msg: &str) -> DaemonResponse {
    let (code, message) = SpecmemError::InvalidParams(msg.to_string()).into_rpc();
    DaemonResponse::error(id, code, message)
}

async fn handle_save_memory(id: Value, params: &Value, state: &Arc<InstanceState>) -> DaemonResponse {
    let Some(content) = params.get("content").and_then(|v| v.as_str()) else {
        return param_err(id, "content is required");
    };
    let kind = parse_memory_kind(params.get("kind"));
    let importance = parse_importance(params.get("importance"));
    let tags: HashSet<String> = params
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let metadata: HashMap<String, Value> = params
        .get("metadata")
        .and_then(|v| v.as_object())
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let input = SaveMemoryInput {
        content: content.to_string(),
        kind,
        importance,
        tags,
        metadata,
    };

    match state.memory.save_memory(input).await {
        Ok(mem_id) => DaemonResponse::success(id, json!({ "id": mem_id })),
        Err(e) => {
            let (code, msg) = e.into_rpc();
            DaemonResponse::error(id, code, msg)
        }
    }
}

async fn handle_find_memory(id: Value, params: &Value, state: &Arc<InstanceState>) -> DaemonResponse {
    let Some(query) = params.get("query").and_then(|v| v.as_str()) else {
        return param_err(id, "query is required");
    };
    let k = params.get("k").and_then(|v| v.as_i64());
    let threshold = params.get("threshold").and_then(|v| v.as_f64()).map(|f| f as f32);
    let kind_filter = params.get("kindFilter").map(parse_memory_kind_value);
    let tags_any: Vec<String> = params
        .get("tagsAny")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
        .unwrap_or_default();

    match state
        .memory
        .find_memory(query, k, threshold, kind_filter, &tags_any)
        .await
    {
        Ok(results) => DaemonResponse::success(id, json!(results)),
        Err(e) => {
            let (code, msg) = e.into_rpc();
            DaemonResponse::error(id, code, msg)
        }
    }
}

async fn handle_get_memory(id: Value, params: &Value, state: &Arc<InstanceState>) -> DaemonResponse {
    let Some(mem_id) = params.get("id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok())
    else {
        return param_err(id, "id must be a valid UUID");
    };

    match state.memory.get_memory(mem_id).await {
        Ok(record) => DaemonResponse::success(id, json!(record)),
        Err(e) => {
            let (code, msg) = e.into_rpc();
            DaemonResponse::error(id, code, msg)
        }
    }
}

async fn handle_find_code_pointers(id: Value, params: &Value, state: &Arc<InstanceState>) -> DaemonResponse {
    let Some(query) = params.get("query").and_then(|v| v.as_str()) else {
        return param_err(id, "query is required");
    };
    let k = params.get("k").and_then(|v| v.as_i64());

    match state.memory.find_code_pointers(query, k).await {
        Ok(results) => DaemonResponse::success(id, json!(results)),
        Err(e) => {
            let (code, msg) = e.into_rpc();
            DaemonResponse::error(id, code, msg)
        }
    }
}

async fn handle_check_sync(id: Value, state: &Arc<InstanceState>) -> DaemonResponse {
    match state.memory.check_sync().await {
        Ok((files_total, indexed, pending_embeddings)) => {
            let last_batch_at = *state.last_batch_at.lock().await;
            DaemonResponse::success(
                id,
                json!({
                    "filesTotal": files_total,
                    "indexed": indexed,
                    "pendingEmbeddings": pending_embeddings,
                    "lastBatchAt": last_batch_at,
                }),
            )
        }
        Err(e) => {
            let (code, msg) = e.into_rpc();
            DaemonResponse::error(id, code, msg)
        }
    }
}

async fn handle_reindex(id: Value, params: &Value, state: &Arc<InstanceState>) -> DaemonResponse {
    let force = params.get("force").and_then(|v| v.as_bool()).unwrap_or(false);
    let extra_ignores: Vec<String> = params
        .get("ignore")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
        .unwrap_or_default();

    if force {
        tracing::info!("force reindex requested, clearing project schema tables");
        if let Err(e) = state.storage.clear_code_index().await {
            return DaemonResponse::error(id, -32000, format!("failed to clear index: {e}"));
        }
    }

    match state.pipeline.run_once(&extra_ignores, Priority::High).await {
        Ok(()) => {
            state.record_batch_completed();
            DaemonResponse::success(id, json!({ "message": "reindex complete" }))
        }
        Err(e) => DaemonResponse::error(id, -32000, format!("reindex failed: {e}")),
    }
}

fn parse_memory_kind(value: Option<&Value>) -> MemoryKind {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_value(json!(s)).ok())
        .unwrap_or(MemoryKind::Episodic)
}

fn parse_memory_kind_value(value: &Value) -> MemoryKind {
    serde_json::from_value(value.clone()).unwrap_or(MemoryKind::Episodic)
}

fn parse_importance(value: Option<&Value>) -> Importance {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_value(json!(s)).ok())
        .unwrap_or_default()
}
