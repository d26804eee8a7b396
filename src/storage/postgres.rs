#![allow(clippy::too_many_arguments)]
use crate::models::{
    CodeDefinitionRecord, CodeFileRecord, DefinitionKind, Importance, MemoryKind, MemoryRecord,
};
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("{0} not found")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Scores within this distance of each other are treated as tied for
/// `find_memory`'s recency/importance tiebreak (§4.7).
const SCORE_TIE_EPSILON: f32 = 1e-4;

/// Number of source lines returned as a `CodePointer`'s body snippet.
const CODE_POINTER_SNIPPET_LINES: usize = 10;

/// Query performance metrics, mirroring the reference daemon's `QueryMetrics`.
#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub total_queries: Arc<AtomicU64>,
    pub slow_queries: Arc<AtomicU64>,
}

impl QueryMetrics {
    fn record(&self, duration_ms: u64) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        if duration_ms > 100 {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("slow query: {duration_ms}ms");
        }
    }
}

/// C3 Schema Manager + relational access layer for a single project's schema.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    schema_name: String,
    metrics: QueryMetrics,
}

impl PostgresStorage {
    /// `ensureSchema(project)` + `bindConnection`: idempotently creates the
    /// project's schema and tables, then returns a pool whose connections
    /// all have `search_path` bound to `{schema_name}, public`.
    pub async fn connect(connection_string: &str, schema_name: &str) -> Result<Self> {
        // Bootstrap connection without a bound schema, to create it if absent.
        let bootstrap = PgPool::connect(connection_string).await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema_name}\""))
            .execute(&bootstrap)
            .await?;
        bootstrap.close().await;

        let schema_for_hook = schema_name.to_string();
        let opts = PgConnectOptions::from_str(connection_string)?;
        let pool = PgPoolOptions::new()
            .max_connections(3) // bounded relational pool, per the concurrency model
            .after_connect(move |conn, _meta| {
                let schema = schema_for_hook.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO \"{schema}\", public"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(opts)
            .await?;

        let migration_sql = include_str!("../../migrations/0001_schema.sql");
        sqlx::raw_sql(migration_sql).execute(&pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            schema_name: schema_name.to_string(),
            metrics: QueryMetrics::default(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    /// Pin the embedding dimensionality on first use; surface `DimensionMismatch`
    /// (never silently truncate/pad) if the broker later advertises a different one.
    pub async fn ensure_embedding_dimension(&self, dim: usize) -> Result<()> {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT value FROM schema_meta WHERE key = 'embedding_dim'",
        )
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO schema_meta (key, value) VALUES ('embedding_dim', $1)
                     ON CONFLICT (key) DO NOTHING",
                )
                .bind(dim.to_string())
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            Some(raw) => {
                let expected: usize = raw.parse().unwrap_or(dim);
                if expected != dim {
                    Err(StorageError::DimensionMismatch { expected, got: dim })
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn timed<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = f().await;
        self.metrics.record(start.elapsed().as_millis() as u64);
        result
    }

    // ---- code_files (C6) ----

    /// Delete-then-insert for id stability, per §4.6 phase 3.
    pub async fn upsert_code_file(&self, file: &CodeFileRecord) -> Result<()> {
        self.timed(|| async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM code_files WHERE project_path = $1 AND relative_path = $2")
                .bind(&file.project_path)
                .bind(&file.relative_path)
                .execute(&mut *tx)
                .await?;

            let embedding = file.embedding.clone().map(Vector::from);
            sqlx::query(
                "INSERT INTO code_files
                 (id, relative_path, absolute_path, language, content, content_hash,
                  size_bytes, line_count, embedding, project_path)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
            )
            .bind(file.id)
            .bind(&file.relative_path)
            .bind(&file.absolute_path)
            .bind(&file.language)
            .bind(&file.content)
            .bind(&file.content_hash)
            .bind(file.size_bytes as i64)
            .bind(file.line_count as i32)
            .bind(embedding)
            .bind(&file.project_path)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// `(content_hash, embedding_is_null)` for gating re-indexing.
    pub async fn file_index_state(
        &self,
        project_path: &str,
        relative_path: &str,
    ) -> Result<Option<(Uuid, String, bool)>> {
        let row = sqlx::query(
            "SELECT id, content_hash, embedding IS NULL AS no_embedding
             FROM code_files WHERE project_path = $1 AND relative_path = $2",
        )
        .bind(project_path)
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            (
                r.get::<Uuid, _>("id"),
                r.get::<String, _>("content_hash"),
                r.get::<bool, _>("no_embedding"),
            )
        }))
    }

    // ---- code_definitions (C5/C6) ----

    /// Upsert keyed by id; never overwrite an existing embedding with null.
    pub async fn upsert_code_definition(
        &self,
        def: &CodeDefinitionRecord,
        project_path: &str,
    ) -> Result<()> {
        let embedding = def.embedding.clone().map(Vector::from);
        sqlx::query(
            "INSERT INTO code_definitions
             (id, file_id, name, kind, start_line, end_line, signature, exported, embedding, project_path)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                kind = EXCLUDED.kind,
                start_line = EXCLUDED.start_line,
                end_line = EXCLUDED.end_line,
                signature = EXCLUDED.signature,
                exported = EXCLUDED.exported,
                embedding = COALESCE(EXCLUDED.embedding, code_definitions.embedding)",
        )
        .bind(def.id)
        .bind(def.file_id)
        .bind(&def.name)
        .bind(definition_kind_str(def.kind))
        .bind(def.start_line as i32)
        .bind(def.end_line as i32)
        .bind(&def.signature)
        .bind(def.exported)
        .bind(embedding)
        .bind(project_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- memories (C7) ----

    /// `saveMemory`: idempotent on `(metadata.hash, kind)` when supplied.
    pub async fn insert_memory(
        &self,
        content: &str,
        kind: MemoryKind,
        importance: Importance,
        tags: &HashSet<String>,
        metadata: &HashMap<String, serde_json::Value>,
        embedding: Option<Vec<f32>>,
        project_path: &str,
        metadata_hash: Option<&str>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let tags_vec: Vec<String> = tags.iter().cloned().collect();
        let metadata_json = serde_json::to_value(metadata).unwrap_or_default();
        let embedding_v = embedding.map(Vector::from);

        let row = sqlx::query(
            "INSERT INTO memories
             (id, content, kind, importance, tags, metadata, embedding, project_path, metadata_hash)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
             ON CONFLICT (metadata_hash, kind) WHERE metadata_hash IS NOT NULL
             DO NOTHING
             RETURNING id",
        )
        .bind(id)
        .bind(content)
        .bind(memory_kind_str(kind))
        .bind(importance_str(importance))
        .bind(&tags_vec)
        .bind(metadata_json)
        .bind(embedding_v)
        .bind(project_path)
        .bind(metadata_hash)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(r.get("id")),
            None => {
                // Conflict: row already existed for this (metadata_hash, kind).
                let existing: Uuid = sqlx::query_scalar(
                    "SELECT id FROM memories WHERE metadata_hash = $1 AND kind = $2",
                )
                .bind(metadata_hash)
                .bind(memory_kind_str(kind))
                .fetch_one(&self.pool)
                .await?;
                Ok(existing)
            }
        }
    }

    pub async fn backfill_memory_embedding(&self, id: Uuid, embedding: Vec<f32>) -> Result<()> {
        sqlx::query("UPDATE memories SET embedding = $1 WHERE id = $2")
            .bind(Vector::from(embedding))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn memories_pending_embedding(&self, project_path: &str, limit: i64) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM memories WHERE project_path = $1 AND embedding IS NULL LIMIT $2",
        )
        .bind(project_path)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    pub async fn get_memory(&self, id: Uuid, project_path: &str) -> Result<MemoryRecord> {
        let row = sqlx::query(
            "SELECT id, content, kind, importance, tags, metadata, embedding, created_at, project_path
             FROM memories WHERE id = $1 AND project_path = $2",
        )
        .bind(id)
        .bind(project_path)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("memory {id}")))?;

        Ok(row_to_memory(row))
    }

    /// `findMemory`: cosine k-NN, scoped to `project_path`, filtered by kind
    /// and tags, thresholded, tiebroken by recency then importance.
    pub async fn find_memory(
        &self,
        query_embedding: &[f32],
        project_path: &str,
        k: i64,
        threshold: f32,
        kind_filter: Option<MemoryKind>,
        tags_any: &[String],
    ) -> Result<Vec<(MemoryRecord, f32)>> {
        let vector = Vector::from(query_embedding.to_vec());
        let kind_str = kind_filter.map(memory_kind_str);

        let rows = sqlx::query(
            "SELECT id, content, kind, importance, tags, metadata, embedding, created_at, project_path,
                    1 - (embedding <=> $1) AS score
             FROM memories
             WHERE project_path = $2
               AND embedding IS NOT NULL
               AND ($3::text IS NULL OR kind = $3)
               AND ($4::text[] IS NULL OR tags && $4)
             ORDER BY embedding <=> $1 ASC
             LIMIT $5",
        )
        .bind(&vector)
        .bind(project_path)
        .bind(kind_str)
        .bind(if tags_any.is_empty() { None } else { Some(tags_any.to_vec()) })
        .bind(k.max(50)) // over-fetch; threshold + tiebreak applied in Rust
        .fetch_all(&self.pool)
        .await?;

        let mut results: Vec<(MemoryRecord, f32)> = rows
            .into_iter()
            .map(|row| {
                let score: f32 = row.get("score");
                (row_to_memory(row), score)
            })
            .filter(|(_, score)| *score >= threshold)
            .collect();

        // Score is the primary sort key; recency/importance only break ties
        // among (near-)equal scores, per §4.7.
        results.sort_by(|a, b| {
            if (a.1 - b.1).abs() < SCORE_TIE_EPSILON {
                b.0.created_at
                    .cmp(&a.0.created_at)
                    .then_with(|| b.0.importance.cmp(&a.0.importance))
            } else {
                b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            }
        });
        results.truncate(k as usize);
        Ok(results)
    }

    /// `findCodePointers`: searches both code-file and code-definition
    /// vectors, returning definitions with file context, an id for
    /// drill-down, and a first-N-lines snippet of the definition body.
    pub async fn find_code_pointers(
        &self,
        query_embedding: &[f32],
        project_path: &str,
        k: i64,
    ) -> Result<Vec<CodePointer>> {
        let vector = Vector::from(query_embedding.to_vec());
        let rows = sqlx::query(
            "SELECT d.id, d.name, d.kind, d.start_line, d.end_line, d.signature,
                    f.relative_path, f.content, 1 - (d.embedding <=> $1) AS score
             FROM code_definitions d
             JOIN code_files f ON f.id = d.file_id
             WHERE d.project_path = $2 AND d.embedding IS NOT NULL
             ORDER BY d.embedding <=> $1 ASC
             LIMIT $3",
        )
        .bind(&vector)
        .bind(project_path)
        .bind(k)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let start_line = row.get::<i32, _>("start_line") as u32;
                let content: String = row.get("content");
                CodePointer {
                    id: row.get("id"),
                    name: row.get("name"),
                    kind: row.get("kind"),
                    file: row.get("relative_path"),
                    start_line,
                    end_line: row.get::<i32, _>("end_line") as u32,
                    signature: row.get("signature"),
                    snippet: snippet_from_content(&content, start_line, CODE_POINTER_SNIPPET_LINES),
                    score: row.get("score"),
                }
            })
            .collect())
    }

    /// `reindex(force=true)`: drop all file/definition rows for a fresh
    /// full pass. Memories are untouched — only the code index is rebuilt.
    pub async fn clear_code_index(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM code_definitions").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM code_files").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn checksync_counts(&self, project_path: &str) -> Result<(i64, i64, i64)> {
        let row = sqlx::query(
            "SELECT
                (SELECT count(*) FROM code_files WHERE project_path = $1) AS files_total,
                (SELECT count(*) FROM code_files WHERE project_path = $1 AND embedding IS NOT NULL) AS indexed,
                (SELECT count(*) FROM code_files WHERE project_path = $1 AND embedding IS NULL) AS pending",
        )
        .bind(project_path)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get("files_total"), row.get("indexed"), row.get("pending")))
    }
}

#[derive(Debug, serde::Serialize)]
pub struct CodePointer {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    pub signature: String,
    pub snippet: String,
    pub score: f32,
}

/// Returns the first `max_lines` lines of `content` starting at `start_line`
/// (1-indexed, as stored in `code_definitions`).
fn snippet_from_content(content: &str, start_line: u32, max_lines: usize) -> String {
    let start = start_line.saturating_sub(1) as usize;
    content
        .lines()
        .skip(start)
        .take(max_lines)
        .collect::<Vec<_>>()
        .join("\n")
}

fn row_to_memory(row: sqlx::postgres::PgRow) -> MemoryRecord {
    let tags_vec: Vec<String> = row.get("tags");
    let metadata_json: serde_json::Value = row.get("metadata");
    let metadata = match metadata_json {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    };
    let embedding: Option<Vector> = row.get("embedding");
    let created_at: DateTime<Utc> = row.get("created_at");

    MemoryRecord {
        id: row.get("id"),
        content: row.get("content"),
        kind: parse_memory_kind(row.get("kind")),
        importance: parse_importance(row.get("importance")),
        tags: tags_vec.into_iter().collect(),
        metadata,
        embedding: embedding.map(|v| v.to_vec()),
        created_at,
        project_path: row.get("project_path"),
    }
}

fn memory_kind_str(kind: MemoryKind) -> &'static str {
    match kind {
        MemoryKind::Episodic => "episodic",
        MemoryKind::Semantic => "semantic",
        MemoryKind::Procedural => "procedural",
        MemoryKind::Working => "working",
        MemoryKind::Consolidated => "consolidated",
    }
}

fn parse_memory_kind(s: String) -> MemoryKind {
    match s.as_str() {
        "episodic" => MemoryKind::Episodic,
        "semantic" => MemoryKind::Semantic,
        "procedural" => MemoryKind::Procedural,
        "working" => MemoryKind::Working,
        _ => MemoryKind::Consolidated,
    }
}

fn importance_str(importance: Importance) -> &'static str {
    match importance {
        Importance::Low => "low",
        Importance::Medium => "medium",
        Importance::High => "high",
        Importance::Critical => "critical",
    }
}

fn parse_importance(s: String) -> Importance {
    match s.as_str() {
        "low" => Importance::Low,
        "high" => Importance::High,
        "critical" => Importance::Critical,
        _ => Importance::Medium,
    }
}

fn definition_kind_str(kind: DefinitionKind) -> &'static str {
    match kind {
        DefinitionKind::Function => "function",
        DefinitionKind::Method => "method",
        DefinitionKind::Class => "class",
        DefinitionKind::Interface => "interface",
        DefinitionKind::Type => "type",
        DefinitionKind::Struct => "struct",
        DefinitionKind::Enum => "enum",
        DefinitionKind::Trait => "trait",
        DefinitionKind::Impl => "impl",
        DefinitionKind::Macro => "macro",
    }
}
