//! S5 — cross-project non-leakage: a memory saved in one project's instance
//! is invisible to a different project's instance, even when both run
//! concurrently against the same Postgres database (distinct per-project
//! schemas, §4.3).
//!
//! Requires a local Postgres instance, see tests/s1_cold_start.rs for the
//! env vars; run with `cargo test --test s5_cross_project_isolation -- --ignored`.

mod support;

use std::time::Duration;
use support::{wait_for, OutputExt, TestProject};

#[test]
#[ignore = "requires a local Postgres instance"]
fn memory_saved_in_one_project_is_invisible_to_another() {
    let project_a = TestProject::new();
    let project_b = TestProject::new();
    project_a.write_file("src/lib.rs", "pub fn a_marker() {}\n");
    project_b.write_file("src/lib.rs", "pub fn b_marker() {}\n");

    project_a.start().assert_success();
    project_b.start().assert_success();

    for project in [&project_a, &project_b] {
        let became_running = wait_for(Duration::from_secs(15), || {
            project.status().stdout_string().contains("RUNNING")
        });
        assert!(became_running, "both projects' instances should come up independently");
    }

    let secret = "project-a-only-remember-the-launch-date-is-2026-07-27";
    project_a.save_memory(secret).assert_success();

    let found_in_a = wait_for(Duration::from_secs(10), || {
        project_a.find_memory(secret).stdout_string().contains("2026-07-27")
    });
    assert!(found_in_a, "project A should find the memory it just saved");

    // Give any (incorrect) cross-project write time to propagate before
    // asserting its absence.
    std::thread::sleep(Duration::from_secs(1));
    let leaked_into_b = project_b
        .find_memory(secret)
        .assert_success()
        .stdout_string()
        .contains("2026-07-27");
    assert!(!leaked_into_b, "project B must never see project A's memories");

    project_a.stop().assert_success();
    project_b.stop().assert_success();
}
