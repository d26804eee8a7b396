//! C6 — Indexing Pipeline: a five-phase, hash-gated batch pipeline executed
//! over file-batches. Grounded on the shape (bounded channels, a constants
//! block for batch/parallelism sizing, `tracing`-instrumented stage functions)
//! of the reference daemon's `indexer/pipeline.rs` SEDA pipeline, but run as a
//! finite `run_once` driver rather than a permanently-running actor mesh,
//! since the design note in SPEC_FULL.md replaces event-driven watching with
//! periodic batched reconciliation.

use crate::broker::EmbeddingBroker;
use crate::extract;
use crate::governor::ResourceGate;
use crate::models::{CodeDefinitionRecord, CodeFileRecord, DefinitionKind, Priority, SyncProgress};
use crate::project::Project;
use crate::storage::PostgresStorage;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

pub const FILE_BATCH_SIZE: usize = 50;
pub const INNER_PARALLELISM: usize = 16;
pub const EMBEDDING_SUB_BATCH: usize = 100;
/// Sub-batch size for embedding a file's definitions; every definition is
/// still persisted, this only bounds how many are embedded per worker call.
pub const MAX_DEFINITIONS_EMBEDDED_PER_FILE: usize = 30;
const CONTENT_PREVIEW_BYTES: usize = 8000;

pub struct Pipeline {
    project: Arc<Project>,
    storage: Arc<PostgresStorage>,
    broker: Arc<EmbeddingBroker>,
    governor: Arc<dyn ResourceGate>,
    progress_tx: watch::Sender<SyncProgress>,
}

struct ReadFile {
    path: PathBuf,
    relative_path: String,
    language: &'static str,
    content: String,
    content_hash: String,
}

impl Pipeline {
    pub fn new(
        project: Arc<Project>,
        storage: Arc<PostgresStorage>,
        broker: Arc<EmbeddingBroker>,
        governor: Arc<dyn ResourceGate>,
    ) -> (Self, watch::Receiver<SyncProgress>) {
        let (tx, rx) = watch::channel(SyncProgress::default());
        (
            Self {
                project,
                storage,
                broker,
                governor,
                progress_tx: tx,
            },
            rx,
        )
    }

    /// Reconciles the on-disk tree with the store. Idempotent: a second call
    /// with no file changes performs zero embedding calls and zero row
    /// rewrites (§8 property 5, scenario S2).
    pub async fn run_once(&self, extra_ignores: &[String], priority: Priority) -> anyhow::Result<()> {
        if !self
            .governor
            .wait_until_admissible(priority, Duration::from_secs(30))
            .await
        {
            if priority == Priority::Idle {
                tracing::info!("resource governor denied idle-priority indexing pass; skipping");
                return Ok(());
            }
        }

        let paths = extract::scan_directory(&self.project.path, extra_ignores);
        let files_total = paths.len();
        self.emit_progress(|p| {
            p.files_total = files_total;
            p.phase = "read".to_string();
        });

        for (batch_idx, batch) in paths.chunks(FILE_BATCH_SIZE).enumerate() {
            tracing::debug!("indexing batch {batch_idx} ({} files)", batch.len());
            self.run_batch(batch, priority).await?;
        }

        self.emit_progress(|p| p.phase = "done".to_string());
        Ok(())
    }

    async fn run_batch(&self, batch: &[PathBuf], priority: Priority) -> anyhow::Result<()> {
        // Phase 1: Read (parallel, inner parallelism bounded).
        let semaphore = Arc::new(Semaphore::new(INNER_PARALLELISM));
        let mut read_handles = Vec::with_capacity(batch.len());
        for path in batch {
            let path = path.clone();
            let project_path = self.project.path.clone();
            let permit = semaphore.clone();
            read_handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                read_one(&path, &project_path)
            }));
        }

        let mut changed_files = Vec::new();
        for handle in read_handles {
            if let Ok(Some(read_file)) = handle.await {
                let state = self
                    .storage
                    .file_index_state(&self.project.path.to_string_lossy(), &read_file.relative_path)
                    .await
                    .ok()
                    .flatten();
                // `state.2` is "embedding IS NULL"; skip only when the hash is
                // unchanged AND a stored embedding already exists.
                let unchanged = matches!(&state, Some((_, hash, embedding_is_null)) if *hash == read_file.content_hash && !*embedding_is_null);
                if unchanged {
                    self.emit_progress(|p| p.files_done += 1);
                    continue;
                }
                changed_files.push(read_file);
            }
        }

        if changed_files.is_empty() {
            return Ok(());
        }

        // Phase 2: Embed (files), in sub-batches of EMBEDDING_SUB_BATCH.
        let mut file_embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(changed_files.len());
        for sub_batch in changed_files.chunks(EMBEDDING_SUB_BATCH) {
            let inputs: Vec<String> = sub_batch
                .iter()
                .map(|f| embedding_input_for_file(f))
                .collect();
            match self.broker.embed_batch(inputs, priority).await {
                Ok(vectors) => file_embeddings.extend(vectors),
                Err(e) => {
                    tracing::warn!("file embedding sub-batch failed: {e}");
                    file_embeddings.extend(std::iter::repeat(None).take(sub_batch.len()));
                    self.emit_progress(|p| p.embeddings_failed += sub_batch.len());
                }
            }
        }

        // Phase 3: Persist (files), delete-then-insert for id stability.
        let mut file_ids = Vec::with_capacity(changed_files.len());
        for (read_file, embedding) in changed_files.iter().zip(file_embeddings.iter()) {
            let record = CodeFileRecord {
                id: uuid::Uuid::new_v4(),
                relative_path: read_file.relative_path.clone(),
                absolute_path: read_file.path.to_string_lossy().to_string(),
                language: read_file.language.to_string(),
                content: read_file.content.clone(),
                content_hash: read_file.content_hash.clone(),
                size_bytes: read_file.content.len() as u64,
                line_count: read_file.content.lines().count() as u32,
                embedding: embedding.clone(),
                project_path: self.project.path.to_string_lossy().to_string(),
            };
            if embedding.is_some() {
                self.emit_progress(|p| p.embeddings_ok += 1);
            }
            let file_id = record.id;
            if let Err(e) = self.storage.upsert_code_file(&record).await {
                tracing::warn!("failed to persist {}: {e}", read_file.relative_path);
                continue;
            }
            file_ids.push((file_id, read_file));
            self.emit_progress(|p| {
                p.files_done += 1;
                p.current_file = Some(read_file.relative_path.clone());
            });
        }

        // Phase 4 + 5: extract, embed, and persist definitions per file.
        for (file_id, read_file) in file_ids {
            self.index_definitions(file_id, read_file, priority).await;
        }

        Ok(())
    }

    async fn index_definitions(&self, file_id: uuid::Uuid, read_file: &ReadFile, priority: Priority) {
        let extension = read_file
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let mut raw_defs = extract::extract_definitions(
            &read_file.content,
            read_file.language,
            extension,
            &read_file.relative_path,
        );
        if raw_defs.is_empty() {
            return;
        }

        // Every extracted definition is persisted (up to the extraction-time
        // cap already applied by `extract::extract_definitions`); embedding
        // is only sub-batched, never used to drop rows.
        let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(raw_defs.len());
        for sub_batch in raw_defs.chunks(MAX_DEFINITIONS_EMBEDDED_PER_FILE) {
            let inputs: Vec<String> = sub_batch
                .iter()
                .map(|d| {
                    format!(
                        "{:?} {}\n{}\nFile: {}",
                        d.kind, d.name, d.signature, read_file.relative_path
                    )
                })
                .collect();
            match self.broker.embed_batch(inputs, priority).await {
                Ok(v) => embeddings.extend(v),
                Err(e) => {
                    tracing::warn!("definition embedding failed for {}: {e}", read_file.relative_path);
                    embeddings.extend(std::iter::repeat(None).take(sub_batch.len()));
                }
            }
        }

        for (raw, embedding) in raw_defs.into_iter().zip(embeddings.into_iter()) {
            let record = CodeDefinitionRecord {
                id: deterministic_definition_id(file_id, &raw.name, raw.start_line),
                file_id,
                name: raw.name,
                kind: raw.kind,
                start_line: raw.start_line,
                end_line: raw.end_line,
                signature: raw.signature,
                exported: raw.exported,
                embedding,
            };
            if !record.is_valid() {
                continue;
            }
            if let Err(e) = self
                .storage
                .upsert_code_definition(&record, &self.project.path.to_string_lossy())
                .await
            {
                tracing::warn!("failed to persist definition {}: {e}", record.name);
            }
        }
    }

    fn emit_progress(&self, mutate: impl FnOnce(&mut SyncProgress)) {
        self.progress_tx.send_modify(mutate);
    }
}

/// Deterministic id so that repeated extraction passes converge to the same
/// rows on upsert (§4.6 "id generation is deterministic per extraction pass").
fn deterministic_definition_id(file_id: uuid::Uuid, name: &str, start_line: u32) -> uuid::Uuid {
    let mut hasher = Sha256::new();
    hasher.update(file_id.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(start_line.to_le_bytes());
    let digest = hasher.finalize();
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, &digest)
}

fn read_one(path: &std::path::Path, project_root: &std::path::Path) -> Option<ReadFile> {
    let bytes = std::fs::read(path).ok()?;
    if extract::is_binary(&bytes) {
        return None;
    }
    let content = String::from_utf8(bytes).ok()?;
    let relative_path = path
        .strip_prefix(project_root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let language = extract::language_for_extension(extension).unwrap_or("text");
    let content_hash = hex_sha256(content.as_bytes());

    Some(ReadFile {
        path: path.to_path_buf(),
        relative_path,
        language,
        content,
        content_hash,
    })
}

fn embedding_input_for_file(f: &ReadFile) -> String {
    let preview: String = f.content.chars().take(CONTENT_PREVIEW_BYTES).collect();
    format!("File: {}\nLanguage: {}\n\n{}", f.relative_path, f.language, preview)
}

fn hex_sha256(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(hex_sha256(b"hello"), hex_sha256(b"hello"));
        assert_ne!(hex_sha256(b"hello"), hex_sha256(b"world"));
    }

    #[test]
    fn definition_ids_are_deterministic_across_passes() {
        let file_id = uuid::Uuid::new_v4();
        let a = deterministic_definition_id(file_id, "foo", 10);
        let b = deterministic_definition_id(file_id, "foo", 10);
        assert_eq!(a, b);
    }
}
