//! Process configuration: environment variables, `model-config.json` (tier plan),
//! `user-config.json` (resource-governor limits), and an optional `specmem.toml`
//! project override. Mirrors the reference daemon's `goferConfig` TOML-plus-serde
//! pattern, but the persisted surface here is the two JSON side-files the
//! filesystem layout names, since those are what this service actually owns.

use crate::error::SpecmemError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment-derived configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub project_path: Option<String>,
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: Option<String>,
    pub cpu_min: f32,
    pub cpu_max: f32,
    pub ram_min_mb: u64,
    pub ram_max_mb: u64,
    pub codebase_enabled: bool,
    pub debug: bool,
}

impl EnvConfig {
    /// Load from the environment. Per DESIGN.md's resolution of the "default
    /// credential fallback" open question, missing DB credentials are never
    /// silently defaulted; `connection_string` hard-errors instead of building
    /// a passwordless URL.
    pub fn from_env() -> Self {
        Self {
            project_path: std::env::var("SPECMEM_PROJECT_PATH").ok(),
            db_host: std::env::var("SPECMEM_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            db_port: std::env::var("SPECMEM_DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5432),
            db_name: std::env::var("SPECMEM_DB_NAME").unwrap_or_else(|_| "specmem".to_string()),
            db_user: std::env::var("SPECMEM_DB_USER").unwrap_or_else(|_| "specmem".to_string()),
            db_password: std::env::var("SPECMEM_DB_PASSWORD").ok(),
            cpu_min: std::env::var("SPECMEM_CPU_MIN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5.0),
            cpu_max: std::env::var("SPECMEM_CPU_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90.0),
            ram_min_mb: std::env::var("SPECMEM_RAM_MIN_MB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
            ram_max_mb: std::env::var("SPECMEM_RAM_MAX_MB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4096),
            codebase_enabled: std::env::var("SPECMEM_CODEBASE_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            debug: std::env::var("SPECMEM_DEBUG")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Builds the Postgres connection string. A hard error — never a
    /// passwordless URL — when a required credential is missing: an empty
    /// `db_user` is an `EnvironmentUnusable` misconfiguration, an unset
    /// `db_password` is a `StorageUnavailable` precondition.
    pub fn connection_string(&self) -> Result<String, SpecmemError> {
        if self.db_user.trim().is_empty() {
            return Err(SpecmemError::EnvironmentUnusable(
                "SPECMEM_DB_USER is empty".to_string(),
            ));
        }
        let password = self.db_password.as_ref().ok_or_else(|| {
            SpecmemError::StorageUnavailable(
                "SPECMEM_DB_PASSWORD is not set; refusing to connect without credentials".to_string(),
            )
        })?;
        Ok(format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, password, self.db_host, self.db_port, self.db_name
        ))
    }
}

/// Tier preset driving embedding/cache/processing knobs, persisted to
/// `<project>/specmem/model-config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingTierConfig {
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTierConfig {
    pub embedding_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingTierConfig {
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub tier: Tier,
    pub embedding: EmbeddingTierConfig,
    pub cache: CacheTierConfig,
    pub processing: ProcessingTierConfig,
}

impl ModelConfig {
    /// Derive a tier preset from file count, total lines of code and a rough
    /// complexity score (definitions-per-file), per §6's tier plan.
    pub fn from_codebase_stats(file_count: usize, total_lines: usize, avg_defs_per_file: f64) -> Self {
        let complexity = total_lines as f64 / file_count.max(1) as f64 + avg_defs_per_file * 10.0;
        let tier = if file_count < 200 && complexity < 500.0 {
            Tier::Small
        } else if file_count < 2000 && complexity < 2000.0 {
            Tier::Medium
        } else {
            Tier::Large
        };
        Self::for_tier(tier)
    }

    pub fn for_tier(tier: Tier) -> Self {
        let (batch_size, max_concurrent, timeout_secs, cache_size, chunk_size) = match tier {
            Tier::Small => (50, 2, 60, 2_000, 50),
            Tier::Medium => (100, 3, 90, 10_000, 50),
            Tier::Large => (100, 4, 120, 50_000, 50),
        };
        Self {
            tier,
            embedding: EmbeddingTierConfig {
                batch_size,
                max_concurrent,
                timeout_secs,
            },
            cache: CacheTierConfig {
                embedding_cache_size: cache_size,
            },
            processing: ProcessingTierConfig { chunk_size },
        }
    }

    pub async fn load_or_default(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("failed to parse model-config.json: {e}");
                Self::for_tier(Tier::Medium)
            }),
            Err(_) => Self::for_tier(Tier::Medium),
        }
    }

    pub async fn persist(&self, path: &Path) -> std::io::Result<()> {
        let raw = serde_json::to_string_pretty(self).expect("ModelConfig is always serializable");
        tokio::fs::write(path, raw).await
    }
}

/// User-preserved resource-governor limits, persisted to
/// `<project>/specmem/user-config.json`. Seeded from `SPECMEM_CPU_*` /
/// `SPECMEM_RAM_*_MB` on first write, then overridable independently of the
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub cpu_min: f32,
    pub cpu_max: f32,
    pub ram_min_mb: u64,
    pub ram_max_mb: u64,
}

impl From<&EnvConfig> for UserConfig {
    fn from(env: &EnvConfig) -> Self {
        Self {
            cpu_min: env.cpu_min,
            cpu_max: env.cpu_max,
            ram_min_mb: env.ram_min_mb,
            ram_max_mb: env.ram_max_mb,
        }
    }
}

impl UserConfig {
    pub async fn load_or_seed(path: &Path, env: &EnvConfig) -> std::io::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw).unwrap_or_else(|_| UserConfig::from(env))),
            Err(_) => {
                let cfg = UserConfig::from(env);
                cfg.persist(path).await?;
                Ok(cfg)
            }
        }
    }

    pub async fn persist(&self, path: &Path) -> std::io::Result<()> {
        let raw = serde_json::to_string_pretty(self).expect("UserConfig is always serializable");
        tokio::fs::write(path, raw).await
    }
}

/// Optional per-project override file, `<project>/specmem.toml`. Read the same
/// way the reference daemon reads `.gofer/config.toml`: missing file is not an
/// error, parse failure logs a warning and falls back to defaults.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ProjectOverride {
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub walk_depth: Option<usize>,
}

pub fn load_project_override(project_root: &Path) -> ProjectOverride {
    let path = project_root.join("specmem.toml");
    if !path.exists() {
        return ProjectOverride::default();
    }
    match std::fs::read_to_string(&path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("failed to parse specmem.toml: {e}");
            ProjectOverride::default()
        }),
        Err(e) => {
            tracing::warn!("failed to read specmem.toml: {e}");
            ProjectOverride::default()
        }
    }
}
