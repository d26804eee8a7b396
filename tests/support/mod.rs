//! Shared black-box test harness: drives the real `specmem` binary as a
//! subprocess against a temp-dir project and a mock embedding worker, the
//! same way the CLI's own users would. See tests/*.rs for the scenarios.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

pub fn specmem_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_specmem"))
}

pub fn mock_worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock_embedding_worker"))
}

pub struct TestProject {
    dir: tempfile::TempDir,
    metrics_addr: String,
}

impl TestProject {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp project dir");
        let offset = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let port = 19100 + (std::process::id() as u16 % 4000) + offset;
        Self {
            dir,
            metrics_addr: format!("127.0.0.1:{port}"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, relative: &str, contents: &str) {
        let full = self.path().join(relative);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dir for fixture file");
        }
        std::fs::write(&full, contents).expect("failed to write fixture file");
    }

    fn cmd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(specmem_binary());
        cmd.args(args)
            .current_dir(self.path())
            .env("SPECMEM_EMBEDDING_WORKER_CMD", mock_worker_binary())
            .env("SPECMEM_METRICS_ADDR", &self.metrics_addr);
        cmd
    }

    pub fn start(&self) -> Output {
        self.cmd(&["start"]).output().expect("failed to spawn `specmem start`")
    }

    pub fn stop(&self) -> Output {
        self.cmd(&["stop"]).output().expect("failed to spawn `specmem stop`")
    }

    pub fn status(&self) -> Output {
        self.cmd(&["status"]).output().expect("failed to spawn `specmem status`")
    }

    pub fn reindex(&self, force: bool) -> Output {
        let mut args = vec!["reindex"];
        if force {
            args.push("--force");
        }
        self.cmd(&args).output().expect("failed to spawn `specmem reindex`")
    }

    pub fn check_sync(&self) -> Output {
        self.cmd(&["check-sync"]).output().expect("failed to spawn `specmem check-sync`")
    }

    pub fn save_memory(&self, content: &str) -> Output {
        self.cmd(&["save-memory", content])
            .output()
            .expect("failed to spawn `specmem save-memory`")
    }

    pub fn find_memory(&self, query: &str) -> Output {
        self.cmd(&["find-memory", query])
            .output()
            .expect("failed to spawn `specmem find-memory`")
    }

    pub fn find_code_pointers(&self, query: &str) -> Output {
        self.cmd(&["find-code-pointers", query])
            .output()
            .expect("failed to spawn `specmem find-code-pointers`")
    }
}

pub trait OutputExt {
    fn stdout_string(&self) -> String;
    fn stderr_string(&self) -> String;
    fn assert_success(&self) -> &Self;
}

impl OutputExt for Output {
    fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    fn assert_success(&self) -> &Self {
        assert!(
            self.status.success(),
            "expected success, got {:?}\nstdout:\n{}\nstderr:\n{}",
            self.status,
            self.stdout_string(),
            self.stderr_string()
        );
        self
    }
}

/// Poll `predicate` until it returns true or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if predicate() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Parses the JSON body of a `check-sync` call and returns
/// `(files_total, indexed, pending_embeddings)`.
pub fn parse_check_sync(stdout: &str) -> (u64, u64, u64) {
    let value: serde_json::Value = serde_json::from_str(stdout.trim())
        .unwrap_or_else(|e| panic!("check-sync output was not JSON: {e}\n{stdout}"));
    let get = |key: &str| value.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    (get("filesTotal"), get("indexed"), get("pendingEmbeddings"))
}

pub const SAMPLE_RUST_FILE: &str = r#"
pub fn add(a: i32, b: i32) -> i32 {
    a + b
}

pub struct Accumulator {
    total: i32,
}

impl Accumulator {
    pub fn new() -> Self {
        Self { total: 0 }
    }

    pub fn push(&mut self, value: i32) {
        self.total += value;
    }
}
"#;
