//! C9 — Session Ingest: parses prior assistant session transcript files into
//! `episodic` memories, deduplicated by `sha256(sessionId + timestamp)`.
//! Restartable and idempotent, per §4.9. Transcript location resolution uses
//! `dirs`, matching the reference daemon's existing use of that crate for
//! home-relative paths; parsing is a small JSONL reader, following the same
//! `BufReader`/`read_line` shape used by the IPC layer.

use crate::memory::{content_dedup_hash, MemoryStore, SaveMemoryInput};
use crate::models::{Importance, MemoryKind};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

/// One line of a transcript JSONL file. Tool-only frames (no `text`) are
/// skipped; only user prompts and assistant text responses are ingested.
#[derive(Debug, Deserialize)]
struct TranscriptLine {
    role: String,
    #[serde(default)]
    text: Option<String>,
    timestamp: String,
}

pub fn default_transcripts_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("projects"))
}

/// Walk `transcripts_dir` for `*.jsonl` files, ingest every user/assistant
/// text line as an `episodic` memory tagged with the session id and role.
/// Returns the number of memories inserted (duplicates are no-ops, not
/// errors, per `saveMemory`'s `metadata.hash` idempotent-conflict semantics).
pub async fn ingest_sessions(store: &MemoryStore, transcripts_dir: &Path) -> anyhow::Result<usize> {
    if !transcripts_dir.is_dir() {
        return Ok(0);
    }

    let mut inserted = 0;
    let mut entries = tokio::fs::read_dir(transcripts_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let session_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown-session".to_string());
        inserted += ingest_transcript_file(store, &path, &session_id).await?;
    }
    Ok(inserted)
}

/// Parses every ingestible line of `path` into a `SaveMemoryInput`, then
/// embeds and persists them as one batch (§4.9: "in the same batched manner
/// as §4.6"), rather than one broker round-trip per line.
async fn ingest_transcript_file(
    store: &MemoryStore,
    path: &Path,
    session_id: &str,
) -> anyhow::Result<usize> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file).lines();
    let mut inputs = Vec::new();

    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<TranscriptLine>(&line) else {
            continue;
        };
        let Some(text) = entry.text.filter(|t| !t.trim().is_empty()) else {
            continue; // tool-only frame
        };

        let dedup_hash = content_dedup_hash(&[session_id, &entry.timestamp]);
        let mut tags: HashSet<String> = HashSet::new();
        tags.insert(format!("session:{session_id}"));
        tags.insert(format!("role:{}", entry.role));

        let mut metadata: HashMap<String, serde_json::Value> = HashMap::new();
        metadata.insert("hash".to_string(), serde_json::Value::String(dedup_hash));
        metadata.insert(
            "session_id".to_string(),
            serde_json::Value::String(session_id.to_string()),
        );
        metadata.insert("role".to_string(), serde_json::Value::String(entry.role.clone()));

        inputs.push(SaveMemoryInput {
            content: text,
            kind: MemoryKind::Episodic,
            importance: Importance::Low,
            tags,
            metadata,
        });
    }

    if inputs.is_empty() {
        return Ok(0);
    }
    let inserted = inputs.len();
    store.save_memories_batch(inputs).await?;
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_hash_is_stable_per_session_and_timestamp() {
        let a = content_dedup_hash(&["session-1", "2026-01-01T00:00:00Z"]);
        let b = content_dedup_hash(&["session-1", "2026-01-01T00:00:00Z"]);
        let c = content_dedup_hash(&["session-2", "2026-01-01T00:00:00Z"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
