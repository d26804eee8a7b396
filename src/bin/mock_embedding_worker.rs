//! Test-only stand-in for the external embedding worker process, speaking
//! the same newline-delimited wire protocol as the real thing (embed/
//! batch_embed/health). Deterministic: the same input text always produces
//! the same vector, so integration tests can assert on embedding stability
//! without a real model. Socket path comes from `SPECMEM_WORKER_SOCKET`,
//! exactly like the broker configures the real worker.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

const DIMENSION: usize = 16;

#[tokio::main]
async fn main() {
    let socket_path = std::env::var("SPECMEM_WORKER_SOCKET")
        .expect("SPECMEM_WORKER_SOCKET must be set by the broker that spawned this process");

    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).expect("failed to bind mock worker socket");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        tokio::spawn(handle_connection(stream));
    }
}

async fn handle_connection(stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let response = match request.get("type").and_then(Value::as_str) {
            Some("health") => json!({ "status": "ok" }),
            Some("embed") => {
                let text = request.get("text").and_then(Value::as_str).unwrap_or("");
                json!({ "embedding": fake_embedding(text) })
            }
            Some("batch_embed") => {
                let texts = request
                    .get("texts")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let embeddings: Vec<Value> = texts
                    .iter()
                    .map(|t| json!(fake_embedding(t.as_str().unwrap_or(""))))
                    .collect();
                json!({ "embeddings": embeddings })
            }
            _ => json!({ "error": "unknown request type" }),
        };

        let mut line = serde_json::to_string(&response).expect("response is always serializable");
        line.push('\n');
        if write_half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// A deterministic unit-ish vector derived from the input bytes, standing in
/// for a real embedding model's output.
fn fake_embedding(text: &str) -> Vec<f32> {
    let mut state: u64 = 0xcbf29ce484222325;
    for byte in text.bytes() {
        state ^= byte as u64;
        state = state.wrapping_mul(0x100000001b3);
    }
    (0..DIMENSION)
        .map(|i| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let shifted = (state >> (i % 48)) as u32;
            (shifted as f32 / u32::MAX as f32) * 2.0 - 1.0
        })
        .collect()
}
