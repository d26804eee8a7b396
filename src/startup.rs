//! C2 — Startup Coordinator: ensures at most one live instance per project.
//!
//! Grounded on the reference daemon's daemon-liveness checking
//! (`ensure_daemon_running()`/`DaemonClient::is_alive` in `main.rs`/
//! `ipc/client.rs`) generalized from "one global daemon" to "one instance per
//! project", and on its graceful-shutdown signal wiring for the `running` ->
//! `stopping` transition.

use crate::error::{Result, SpecmemError};
use crate::ipc::client::SpecmemClient;
use crate::models::{InstanceRecord, InstanceStatus};
use crate::project::Project;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

const STARTUP_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const STARTUP_LOCK_MIN_AGE: Duration = Duration::from_secs(5);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const STARTUP_RETRY_BUDGET: u32 = 10;

pub enum StartupOutcome {
    /// This process is now the sole owner of the project and should continue
    /// into `running`.
    Primary { listener: UnixListener },
    /// Another instance is already authoritative; this process should exit 0.
    DeferToExisting,
}

/// Steps 2-4 of §4.2: acquire the startup lock, clean up a stale instance
/// lock if present, then bind the instance lock socket.
pub async fn coordinate_startup(project: &Project) -> Result<StartupOutcome> {
    acquire_startup_lock(project).await?;

    let cleanup_result = cleanup_stale(project).await;
    if let CleanupOutcome::LiveInstanceFound = cleanup_result {
        release_startup_lock(project).await;
        return Ok(StartupOutcome::DeferToExisting);
    }

    let listener = match acquire_instance_lock(project).await {
        Ok(listener) => listener,
        Err(e) => {
            release_startup_lock(project).await;
            return Err(e);
        }
    };

    write_instance_record(project, InstanceStatus::Starting).await?;
    release_startup_lock(project).await;

    Ok(StartupOutcome::Primary { listener })
}

async fn acquire_startup_lock(project: &Project) -> Result<()> {
    let lock_path = project.startup_lock_path();

    for attempt in 0..STARTUP_RETRY_BUDGET {
        let contents = json!({ "pid": std::process::id(), "startedAt": Utc::now() }).to_string();
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(contents.as_bytes()).await?;
                return Ok(());
            }
            Err(_) => {
                if is_stale_or_dead(&lock_path).await {
                    let stale = lock_path.with_extension("stale");
                    let _ = tokio::fs::rename(&lock_path, &stale).await;
                    let _ = tokio::fs::remove_file(&stale).await;
                    continue;
                }
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(5)));
                tokio::time::sleep(backoff).await;
            }
        }
    }

    Err(SpecmemError::ConcurrentStartup)
}

async fn is_stale_or_dead(lock_path: &std::path::Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(lock_path).await else {
        return true;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    let age = modified.elapsed().unwrap_or_default();
    if age < STARTUP_LOCK_MIN_AGE {
        return false; // never delete locks younger than 5s
    }
    if age > STARTUP_LOCK_TIMEOUT {
        return true;
    }

    let Ok(raw) = tokio::fs::read_to_string(lock_path).await else {
        return true;
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return true;
    };
    let Some(pid) = parsed.get("pid").and_then(|v| v.as_u64()) else {
        return true;
    };
    !process_is_alive(pid as u32)
}

fn process_is_alive(pid: u32) -> bool {
    // Signal 0: existence check without actually signaling, the standard
    // POSIX liveness probe.
    unsafe { libc_kill(pid as i32, 0) == 0 }
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) -> i32 {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    kill(pid, sig)
}

async fn release_startup_lock(project: &Project) {
    let _ = tokio::fs::remove_file(project.startup_lock_path()).await;
}

enum CleanupOutcome {
    NoStaleLock,
    LiveInstanceFound,
    StaleLockRemoved,
}

/// If an instance-lock socket exists, probe it with a `health` request; if it
/// answers within 500ms, another instance is authoritative. Otherwise the
/// socket is stale and is rename-then-unlinked.
async fn cleanup_stale(project: &Project) -> CleanupOutcome {
    let socket_path = project.instance_socket();
    if !socket_path.exists() {
        return CleanupOutcome::NoStaleLock;
    }

    let probe = tokio::time::timeout(HEALTH_PROBE_TIMEOUT, async {
        let mut client = SpecmemClient::connect(&socket_path).await.ok()?;
        client.call("health", json!({})).await.ok()
    })
    .await;

    if matches!(probe, Ok(Some(_))) {
        return CleanupOutcome::LiveInstanceFound;
    }

    let stale = socket_path.with_extension("stale");
    let _ = tokio::fs::rename(&socket_path, &stale).await;
    let _ = tokio::fs::remove_file(&stale).await;
    CleanupOutcome::StaleLockRemoved
}

/// Bind the instance-lock socket; binding is atomic (either we own it or we
/// don't — a racing bind on the same path fails cleanly).
async fn acquire_instance_lock(project: &Project) -> Result<UnixListener> {
    let socket_path = project.instance_socket();
    UnixListener::bind(&socket_path).map_err(|e| {
        tracing::warn!("failed to bind instance socket {:?}: {e}", socket_path);
        SpecmemError::ConcurrentStartup
    })
}

async fn write_instance_record(project: &Project, status: InstanceStatus) -> Result<()> {
    let record = InstanceRecord {
        pid: std::process::id(),
        project_hash: project.hash.clone(),
        start_time: Utc::now(),
        status,
        dashboard_port: None,
        coordination_port: None,
    };
    let raw = serde_json::to_string_pretty(&record).expect("InstanceRecord is always serializable");
    tokio::fs::write(project.instance_record_path(), raw).await?;
    Ok(())
}

pub async fn update_instance_status(project: &Project, status: InstanceStatus) -> Result<()> {
    write_instance_record(project, status).await
}

/// Registers graceful-shutdown handlers and an orphan check (parent PID
/// becomes the init process, i.e. 1). Returns a token cancelled when the
/// process should begin the `stopping` teardown.
pub fn spawn_shutdown_watch() -> CancellationToken {
    let token = CancellationToken::new();
    let shutdown_token = token.clone();
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        loop {
            tokio::select! {
                _ = sigterm.recv() => break,
                _ = sigint.recv() => break,
                _ = tokio::time::sleep(Duration::from_secs(2)) => {
                    if parent_is_init() {
                        tracing::info!("parent process became init (pid 1); treating as orphaned");
                        break;
                    }
                }
            }
        }
        shutdown_token.cancel();
    });
    token
}

fn parent_is_init() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/self/stat")
            .ok()
            .and_then(|stat| stat.split_whitespace().nth(3).map(|s| s.to_string()))
            .and_then(|ppid| ppid.parse::<u32>().ok())
            .map(|ppid| ppid == 1)
            .unwrap_or(false)
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Reverse-order teardown for `stopping`: release the instance lock (dropping
/// the listener unlinks on most platforms, but we remove explicitly for
/// determinism) and mark the instance record `stopped`.
pub async fn teardown(project: &Arc<Project>, listener: UnixListener) {
    drop(listener);
    let _ = tokio::fs::remove_file(project.instance_socket()).await;
    let _ = update_instance_status(project, InstanceStatus::Stopped).await;
}
