//! C1 — Project Identity & Paths.
//!
//! Derives a stable project hash and exposes the per-project filesystem
//! layout rooted at `{path}/specmem/`. Grounded on the reference daemon's
//! path handling in `daemon/registry.rs`, generalized from a global
//! path-to-uuid registry to a single resolved `Project` per instance.

use crate::error::{Result, SpecmemError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Project {
    pub path: PathBuf,
    pub hash: String,
    pub schema_name: String,
}

impl Project {
    /// Canonicalize, lowercase, and hash `input_path`; create
    /// `{path}/specmem/{sockets,run,cache}` on demand.
    pub fn resolve(input_path: &Path) -> Result<Self> {
        let canonical = std::fs::canonicalize(input_path).map_err(|e| {
            SpecmemError::EnvironmentUnusable(format!(
                "cannot canonicalize project path {:?}: {e}",
                input_path
            ))
        })?;

        let hash = project_hash(&canonical);
        let schema_name = format!("specmem_{hash}");

        let project = Self {
            path: canonical,
            hash,
            schema_name,
        };

        project.ensure_directories()?;
        Ok(project)
    }

    fn ensure_directories(&self) -> Result<()> {
        for dir in ["sockets", "run", "cache"] {
            let p = self.root().join(dir);
            std::fs::create_dir_all(&p).map_err(|e| {
                SpecmemError::EnvironmentUnusable(format!(
                    "cannot create {:?}: {e} (project path may not be writable)",
                    p
                ))
            })?;
        }
        Ok(())
    }

    /// `{path}/specmem`.
    pub fn root(&self) -> PathBuf {
        self.path.join("specmem")
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.root().join("sockets").join(name)
    }

    pub fn run_path(&self, name: &str) -> PathBuf {
        self.root().join("run").join(name)
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.root().join("run").join(name)
    }

    pub fn embedding_socket(&self) -> PathBuf {
        self.socket_path("embeddings.sock")
    }

    pub fn instance_socket(&self) -> PathBuf {
        self.socket_path("specmem.sock")
    }

    pub fn instance_record_path(&self) -> PathBuf {
        self.run_path("instance.json")
    }

    pub fn startup_lock_path(&self) -> PathBuf {
        self.run_path("startup.lock")
    }

    pub fn service_log_path(&self) -> PathBuf {
        self.log_path("mcp-startup.log")
    }

    pub fn model_config_path(&self) -> PathBuf {
        self.root().join("model-config.json")
    }

    pub fn user_config_path(&self) -> PathBuf {
        self.root().join("user-config.json")
    }
}

/// `hash = truncate16(sha256(lowercase(canonical(path))))`.
pub fn project_hash(canonical_path: &Path) -> String {
    let lowered = canonical_path.to_string_lossy().to_lowercase();
    let digest = Sha256::digest(lowered.as_bytes());
    let hex = hex_encode(&digest);
    hex[..16].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_lowercase_insensitive() {
        let p1 = PathBuf::from("/tmp/Some/Project");
        let p2 = PathBuf::from("/tmp/some/project");
        assert_eq!(project_hash(&p1), project_hash(&p2));
        assert_eq!(project_hash(&p1).len(), 16);
    }

    #[test]
    fn distinct_paths_hash_distinctly() {
        let a = project_hash(&PathBuf::from("/tmp/a"));
        let b = project_hash(&PathBuf::from("/tmp/b"));
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_creates_specmem_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let project = Project::resolve(tmp.path()).unwrap();
        assert!(project.root().join("sockets").is_dir());
        assert!(project.root().join("run").is_dir());
        assert!(project.root().join("cache").is_dir());
        assert!(project.schema_name.starts_with("specmem_"));
    }
}
