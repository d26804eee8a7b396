//! Data model shared by storage, the embedding broker, and the tool surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// `importance ∈ {low, medium, high, critical}` — tiebreak order for search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Importance {
    fn default() -> Self {
        Importance::Medium
    }
}

/// `kind ∈ {episodic, semantic, procedural, working, consolidated}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Episodic,
    Semantic,
    Procedural,
    Working,
    Consolidated,
}

/// A single memory row. `embedding` is `None` until the broker produces one
/// (synchronously on save, or via backfill after a transient broker failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub content: String,
    pub kind: MemoryKind,
    pub importance: Importance,
    pub tags: HashSet<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub project_path: String,
}

/// A scanned source file, one row per path, content-hash gated on re-index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeFileRecord {
    pub id: Uuid,
    pub relative_path: String,
    pub absolute_path: String,
    pub language: String,
    pub content: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub line_count: u32,
    pub embedding: Option<Vec<f32>>,
    pub project_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Function,
    Method,
    Class,
    Interface,
    Type,
    Struct,
    Enum,
    Trait,
    Impl,
    Macro,
}

/// A single extracted definition (function, class, ...) within a `CodeFileRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeDefinitionRecord {
    pub id: Uuid,
    pub file_id: Uuid,
    pub name: String,
    pub kind: DefinitionKind,
    pub start_line: u32,
    pub end_line: u32,
    pub signature: String,
    pub exported: bool,
    pub embedding: Option<Vec<f32>>,
}

impl CodeDefinitionRecord {
    pub fn is_valid(&self) -> bool {
        self.start_line >= 1 && self.start_line <= self.end_line
    }
}

/// `{ pid, projectHash, startTime, status, dashboardPort, coordinationPort }` (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub pid: u32,
    pub project_hash: String,
    pub start_time: DateTime<Utc>,
    pub status: InstanceStatus,
    pub dashboard_port: Option<u16>,
    pub coordination_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

/// Priority levels used for both broker admission (C4) and pipeline scheduling (C6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Idle,
    Low,
    Medium,
    High,
    Critical,
}

/// Lazy, finite progress updates for a running indexing pass (§4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncProgress {
    pub files_done: usize,
    pub files_total: usize,
    pub embeddings_ok: usize,
    pub embeddings_failed: usize,
    pub phase: String,
    pub current_file: Option<String>,
}
