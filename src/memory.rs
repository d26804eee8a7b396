//! C7 — Memory Store & Search: the read/write surface backing `saveMemory`,
//! `findMemory`, `getMemory`, and `findCodePointers`. SQL access is delegated
//! to `storage::PostgresStorage`; this module owns the embed-then-persist
//! orchestration against the broker (C4), matching the reference daemon's
//! separation between its SQL layer and its tool-handler layer
//! (`daemon/handlers/*` calling into `storage::sqlite`).

use crate::broker::EmbeddingBroker;
use crate::error::{Result, SpecmemError};
use crate::models::{Importance, MemoryKind, Priority};
use crate::storage::postgres::CodePointer;
use crate::storage::PostgresStorage;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.25;
pub const DEFAULT_K: i64 = 5;

pub struct MemoryStore {
    storage: Arc<PostgresStorage>,
    broker: Arc<EmbeddingBroker>,
    project_path: String,
}

pub struct SaveMemoryInput {
    pub content: String,
    pub kind: MemoryKind,
    pub importance: Importance,
    pub tags: HashSet<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, serde::Serialize)]
pub struct FindMemoryResult {
    pub id: Uuid,
    pub content: String,
    pub score: f32,
    pub kind: MemoryKind,
    pub tags: HashSet<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl MemoryStore {
    pub fn new(storage: Arc<PostgresStorage>, broker: Arc<EmbeddingBroker>, project_path: String) -> Self {
        Self {
            storage,
            broker,
            project_path,
        }
    }

    /// `saveMemory`: embed via C4, then insert. A transient broker failure
    /// still writes the memory without a vector and flags it for backfill —
    /// never an outright failure for this operation (§7 partial-failure
    /// philosophy).
    pub async fn save_memory(&self, input: SaveMemoryInput) -> Result<Uuid> {
        let metadata_hash = input
            .metadata
            .get("hash")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let embedding = match self.broker.embed(input.content.clone(), Priority::Medium).await {
            Ok(vec) => Some(vec),
            Err(e) => {
                tracing::warn!("embedding deferred for new memory: {e}");
                None
            }
        };

        let id = self
            .storage
            .insert_memory(
                &input.content,
                input.kind,
                input.importance,
                &input.tags,
                &input.metadata,
                embedding,
                &self.project_path,
                metadata_hash.as_deref(),
            )
            .await
            .map_err(|e| SpecmemError::StorageUnavailable(e.to_string()))?;

        Ok(id)
    }

    /// Embeds and persists a batch of memories in one broker round-trip per
    /// `EMBEDDING_SUB_BATCH`-sized chunk, the same batched shape the indexing
    /// pipeline uses for code (§4.6/§4.9). Used by bulk ingest paths (Session
    /// Ingest, C9) where per-item `save_memory` would serialize one broker
    /// call per row.
    pub async fn save_memories_batch(&self, inputs: Vec<SaveMemoryInput>) -> Result<Vec<Uuid>> {
        let mut ids = Vec::with_capacity(inputs.len());
        for sub_batch in inputs.chunks(crate::pipeline::EMBEDDING_SUB_BATCH) {
            let texts: Vec<String> = sub_batch.iter().map(|i| i.content.clone()).collect();
            let embeddings = match self.broker.embed_batch(texts, Priority::Medium).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("batch embedding deferred for {} memories: {e}", sub_batch.len());
                    vec![None; sub_batch.len()]
                }
            };

            for (input, embedding) in sub_batch.iter().zip(embeddings.into_iter()) {
                let metadata_hash = input
                    .metadata
                    .get("hash")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let id = self
                    .storage
                    .insert_memory(
                        &input.content,
                        input.kind,
                        input.importance,
                        &input.tags,
                        &input.metadata,
                        embedding,
                        &self.project_path,
                        metadata_hash.as_deref(),
                    )
                    .await
                    .map_err(|e| SpecmemError::StorageUnavailable(e.to_string()))?;
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Re-embeds memories that were written without a vector, in the same
    /// batched fashion as the indexing pipeline.
    pub async fn backfill_pending(&self, limit: i64) -> Result<usize> {
        let pending = self
            .storage
            .memories_pending_embedding(&self.project_path, limit)
            .await
            .map_err(|e| SpecmemError::StorageUnavailable(e.to_string()))?;

        let mut backfilled = 0;
        for id in pending {
            let record = self.storage.get_memory(id, &self.project_path).await;
            let Ok(record) = record else { continue };
            match self.broker.embed(record.content, Priority::Low).await {
                Ok(vec) => {
                    if self.storage.backfill_memory_embedding(id, vec).await.is_ok() {
                        backfilled += 1;
                    }
                }
                Err(e) => tracing::debug!("backfill deferred again for {id}: {e}"),
            }
        }
        Ok(backfilled)
    }

    pub async fn get_memory(&self, id: Uuid) -> Result<crate::models::MemoryRecord> {
        self.storage
            .get_memory(id, &self.project_path)
            .await
            .map_err(|e| match e {
                crate::storage::StorageError::NotFound(what) => SpecmemError::NotFound(what),
                other => SpecmemError::StorageUnavailable(other.to_string()),
            })
    }

    /// `findMemory`: embed the query, k-NN within the project schema,
    /// threshold + tag/kind filters, tiebreak by recency then importance.
    pub async fn find_memory(
        &self,
        query: &str,
        k: Option<i64>,
        threshold: Option<f32>,
        kind_filter: Option<MemoryKind>,
        tags_any: &[String],
    ) -> Result<Vec<FindMemoryResult>> {
        let embedding = self
            .broker
            .embed(query.to_string(), Priority::High)
            .await
            .map_err(|e| SpecmemError::Internal(anyhow::anyhow!("embedding unavailable: {e}")))?;

        let rows = self
            .storage
            .find_memory(
                &embedding,
                &self.project_path,
                k.unwrap_or(DEFAULT_K),
                threshold.unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
                kind_filter,
                tags_any,
            )
            .await
            .map_err(|e| SpecmemError::StorageUnavailable(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(record, score)| FindMemoryResult {
                id: record.id,
                content: record.content,
                score,
                kind: record.kind,
                tags: record.tags,
                created_at: record.created_at,
            })
            .collect())
    }

    /// `findCodePointers`: searches both code-file and code-definition
    /// vectors (delegated to the definitions query, which already joins
    /// the owning file).
    pub async fn find_code_pointers(&self, query: &str, k: Option<i64>) -> Result<Vec<CodePointer>> {
        let embedding = self
            .broker
            .embed(query.to_string(), Priority::High)
            .await
            .map_err(|e| SpecmemError::Internal(anyhow::anyhow!("embedding unavailable: {e}")))?;

        self.storage
            .find_code_pointers(&embedding, &self.project_path, k.unwrap_or(DEFAULT_K))
            .await
            .map_err(|e| SpecmemError::StorageUnavailable(e.to_string()))
    }

    pub async fn check_sync(&self) -> Result<(i64, i64, i64)> {
        self.storage
            .checksync_counts(&self.project_path)
            .await
            .map_err(|e| SpecmemError::StorageUnavailable(e.to_string()))
    }
}

/// `sha256(sessionId + timestamp)` — shared with Session Ingest (C9) for
/// dedup, and usable directly as a memory's `metadata.hash` for idempotent
/// ingest of the same logical event.
pub fn content_dedup_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    use std::fmt::Write;
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
