//! S1 — cold start: a fresh project directory becomes a running, fully
//! indexed instance after `start`.
//!
//! Requires a local Postgres reachable via the `SPECMEM_DB_*` env vars (see
//! src/config.rs); run with `cargo test --test s1_cold_start -- --ignored`
//! after exporting them (defaults: host=localhost port=5432 name=specmem
//! user=specmem, no password).

mod support;

use std::time::Duration;
use support::{parse_check_sync, wait_for, OutputExt, TestProject, SAMPLE_RUST_FILE};

#[test]
#[ignore = "requires a local Postgres instance"]
fn cold_start_indexes_the_project_and_reports_running() {
    let project = TestProject::new();
    project.write_file("src/lib.rs", SAMPLE_RUST_FILE);

    project.start().assert_success();

    let became_running = wait_for(Duration::from_secs(15), || {
        project.status().stdout_string().contains("RUNNING")
    });
    assert!(became_running, "instance should report RUNNING shortly after start");

    let fully_indexed = wait_for(Duration::from_secs(15), || {
        let out = project.check_sync();
        if !out.status.success() {
            return false;
        }
        let (files_total, indexed, pending_embeddings) = parse_check_sync(&out.stdout_string());
        files_total >= 1 && indexed == files_total && pending_embeddings == 0
    });
    assert!(
        fully_indexed,
        "the single seeded source file should be indexed and embedded with no backlog"
    );

    project.stop().assert_success();
}
