//! Minimal HTTP server for Prometheus `/metrics` scraping.
//! Uses raw `TcpListener` — no external HTTP server dependency.

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::ipc::server::InstanceState;

/// Start a tiny HTTP server on `addr` (e.g. "127.0.0.1:9091") that serves
/// Prometheus text metrics at any path. Stops when the cancel token fires.
pub async fn serve_metrics(addr: &str, state: Arc<InstanceState>, cancel: CancellationToken) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!("metrics HTTP: failed to bind {addr}: {e}");
            return;
        }
    };

    tracing::info!("metrics HTTP: listening on http://{addr}/metrics");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("metrics HTTP: shutting down");
                break;
            }
            accept = listener.accept() => {
                let (mut stream, _) = match accept {
                    Ok(s) => s,
                    Err(_) => continue,
                };

                let body = render_prometheus(&state).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\n\
                     Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\
                     \r\n\
                     {}",
                    body.len(),
                    body
                );

                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        }
    }
}

async fn render_prometheus(state: &InstanceState) -> String {
    let broker_state = state.broker.state().await;
    let broker_state_value = match broker_state {
        crate::broker::BrokerState::Down => 0,
        crate::broker::BrokerState::Starting => 1,
        crate::broker::BrokerState::Ready => 2,
        crate::broker::BrokerState::Degraded => 3,
        crate::broker::BrokerState::Failed => 4,
        crate::broker::BrokerState::ShuttingDown => 5,
    };

    let progress = state.progress_rx.borrow().clone();
    let sample = state.governor.current_sample();
    let active_connections = state.active_connections();

    format!(
        "# HELP specmem_broker_state Embedding broker state (0=down,1=starting,2=ready,3=degraded,4=failed,5=shutting_down).\n\
         # TYPE specmem_broker_state gauge\n\
         specmem_broker_state {broker_state_value}\n\
         # HELP specmem_active_connections Active instance-socket connections.\n\
         # TYPE specmem_active_connections gauge\n\
         specmem_active_connections {active_connections}\n\
         # HELP specmem_index_files_total Files discovered in the current or last indexing pass.\n\
         # TYPE specmem_index_files_total gauge\n\
         specmem_index_files_total {}\n\
         # HELP specmem_index_files_done Files completed in the current or last indexing pass.\n\
         # TYPE specmem_index_files_done gauge\n\
         specmem_index_files_done {}\n\
         # HELP specmem_embeddings_ok_total Embeddings produced successfully.\n\
         # TYPE specmem_embeddings_ok_total counter\n\
         specmem_embeddings_ok_total {}\n\
         # HELP specmem_embeddings_failed_total Embeddings that failed or were deferred.\n\
         # TYPE specmem_embeddings_failed_total counter\n\
         specmem_embeddings_failed_total {}\n\
         # HELP specmem_governor_cpu_percent Last sampled CPU usage percent.\n\
         # TYPE specmem_governor_cpu_percent gauge\n\
         specmem_governor_cpu_percent {}\n\
         # HELP specmem_governor_ram_percent Last sampled RAM usage percent.\n\
         # TYPE specmem_governor_ram_percent gauge\n\
         specmem_governor_ram_percent {}\n\
         # HELP specmem_uptime_seconds Seconds since the instance started serving.\n\
         # TYPE specmem_uptime_seconds counter\n\
         specmem_uptime_seconds {}\n",
        progress.files_total,
        progress.files_done,
        progress.embeddings_ok,
        progress.embeddings_failed,
        sample.cpu_percent,
        sample.ram_percent,
        state.started_at.elapsed().as_secs(),
    )
}
