//! S2 — idempotent reindex: running `reindex` repeatedly over an unchanged
//! tree neither grows the index nor duplicates code-pointer results.
//!
//! Requires a local Postgres instance, see tests/s1_cold_start.rs for the
//! env vars; run with `cargo test --test s2_idempotent_reindex -- --ignored`.

mod support;

use std::time::Duration;
use support::{parse_check_sync, wait_for, OutputExt, TestProject, SAMPLE_RUST_FILE};

#[test]
#[ignore = "requires a local Postgres instance"]
fn repeated_reindex_over_unchanged_tree_is_a_no_op() {
    let project = TestProject::new();
    project.write_file("src/lib.rs", SAMPLE_RUST_FILE);

    project.start().assert_success();
    let became_running = wait_for(Duration::from_secs(15), || {
        project.status().stdout_string().contains("RUNNING")
    });
    assert!(became_running, "instance should report RUNNING shortly after start");

    let settled = wait_for(Duration::from_secs(15), || {
        let out = project.check_sync();
        out.status.success() && parse_check_sync(&out.stdout_string()).2 == 0
    });
    assert!(settled, "initial indexing pass should settle with no embedding backlog");

    let baseline = parse_check_sync(&project.check_sync().stdout_string());
    let baseline_pointers = project
        .find_code_pointers("add")
        .assert_success()
        .stdout_string();

    project.reindex(false).assert_success();
    let after_first = wait_for(Duration::from_secs(15), || {
        let out = project.check_sync();
        out.status.success() && parse_check_sync(&out.stdout_string()).2 == 0
    });
    assert!(after_first, "first reindex should settle");

    project.reindex(false).assert_success();
    let after_second = wait_for(Duration::from_secs(15), || {
        let out = project.check_sync();
        out.status.success() && parse_check_sync(&out.stdout_string()).2 == 0
    });
    assert!(after_second, "second reindex should settle");

    let (files_total, indexed, _) = parse_check_sync(&project.check_sync().stdout_string());
    assert_eq!(files_total, baseline.0, "file count must not grow on an unchanged tree");
    assert_eq!(indexed, baseline.1, "indexed count must not grow on an unchanged tree");

    let after_pointers = project
        .find_code_pointers("add")
        .assert_success()
        .stdout_string();
    assert_eq!(
        baseline_pointers, after_pointers,
        "repeated reindexing over unchanged content must not duplicate code-pointer hits"
    );

    project.stop().assert_success();
}
