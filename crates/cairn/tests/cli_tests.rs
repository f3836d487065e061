//! Integration tests for the cairn CLI.
//!
//! These tests drive the binary through whole workflows in a temporary
//! workspace and check both its output and the files it leaves behind.

use rstest::{fixture, rstest};
use std::process::Output;
use tempfile::TempDir;

mod common;
use common::run_cairn_in_dir;

/// Provides a temporary directory with an initialized workspace
#[fixture]
fn workspace() -> TempDir {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let output = run_cairn_in_dir(temp.path(), &["init", "--project", "core", "--quiet"]);
    assert_success(&output);
    temp
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn run(dir: &TempDir, args: &[&str]) -> String {
    let output = run_cairn_in_dir(dir.path(), args);
    assert_success(&output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn issue_file(dir: &TempDir) -> String {
    std::fs::read_to_string(dir.path().join("ISSUES.md")).unwrap()
}

#[test]
fn test_cli_help_lists_commands() {
    let temp = TempDir::new().unwrap();
    let stdout = run(&temp, &["--help"]);

    for command in ["init", "add", "status", "dep", "ready", "blocked", "sync", "watch"] {
        assert!(stdout.contains(command), "help is missing {command}");
    }
}

#[rstest]
fn test_add_mirrors_to_issue_file(workspace: TempDir) {
    let stdout = run(&workspace, &["add", "Write docs", "--priority", "high"]);
    assert!(stdout.contains("Created issue #1: Write docs"));

    let text = issue_file(&workspace);
    assert!(text.starts_with("# core\n"));
    assert!(text.contains("- [ ] #1: Write docs\n  **Priority**: high\n"));
}

#[rstest]
fn test_no_sync_leaves_file_alone(workspace: TempDir) {
    run(&workspace, &["--no-sync", "add", "Quiet change"]);
    assert!(issue_file(&workspace).is_empty());

    let stdout = run(&workspace, &["sync"]);
    assert!(stdout.contains("Synced"));
    assert!(issue_file(&workspace).contains("#1: Quiet change"));
}

#[rstest]
fn test_ready_and_blocked_follow_dependencies(workspace: TempDir) {
    run(&workspace, &["add", "Design"]);
    run(&workspace, &["add", "Build", "--deps", "1"]);

    let ready = run(&workspace, &["ready"]);
    assert!(ready.contains("Design"));
    assert!(!ready.contains("Build"));

    let blocked = run(&workspace, &["blocked"]);
    assert!(blocked.contains("Build"));
    assert!(blocked.contains("waiting on #1"));

    run(&workspace, &["status", "1", "completed"]);
    let ready = run(&workspace, &["ready"]);
    assert!(ready.contains("Build"));
    assert!(!ready.contains("Design"), "completed issues are hidden");
    assert!(run(&workspace, &["ready", "--all"]).contains("Design"));

    assert!(issue_file(&workspace).contains("- [x] #1: Design"));
}

#[rstest]
fn test_cycle_is_refused(workspace: TempDir) {
    run(&workspace, &["add", "First"]);
    run(&workspace, &["add", "Second"]);
    run(&workspace, &["dep", "add", "2", "1"]);

    let output = run_cairn_in_dir(workspace.path(), &["dep", "add", "1", "2"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("would create a cycle"), "Got: {stderr}");
}

#[rstest]
fn test_dep_rm_is_idempotent(workspace: TempDir) {
    run(&workspace, &["add", "First"]);
    run(&workspace, &["add", "Second", "--deps", "#1"]);

    assert!(run(&workspace, &["dep", "rm", "2", "1"]).contains("no longer depends"));
    assert!(run(&workspace, &["dep", "rm", "2", "1"]).contains("did not depend"));
    assert!(!issue_file(&workspace).contains("**Dependencies**"));
}

#[rstest]
fn test_file_edits_flow_into_store(workspace: TempDir) {
    run(&workspace, &["add", "Original title"]);
    let path = workspace.path().join("ISSUES.md");
    let edited = issue_file(&workspace).replace("Original title", "Edited in file");
    std::fs::write(&path, edited).unwrap();

    let stdout = run(&workspace, &["sync"]);
    assert!(stdout.contains("1 updated"), "Got: {stdout}");

    let listed = run(&workspace, &["list"]);
    assert!(listed.contains("Edited in file"));
    assert!(run(&workspace, &["sync"]).contains("Already in sync."));
}

#[rstest]
fn test_strict_sync_fails_on_conflict(workspace: TempDir) {
    run(&workspace, &["add", "Shared"]);
    let path = workspace.path().join("ISSUES.md");
    std::fs::write(&path, issue_file(&workspace).replace("- [ ] #1", "- [x] #1")).unwrap();
    run(&workspace, &["--no-sync", "status", "1", "blocked"]);

    let output = run_cairn_in_dir(workspace.path(), &["sync", "--strict"]);

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 conflict(s)"), "Got: {stdout}");

    // Store wins settles it.
    run(&workspace, &["sync", "--policy", "store-wins"]);
    assert!(issue_file(&workspace).contains("## Blocked"));
}

#[rstest]
fn test_delete_requires_force_for_dependents(workspace: TempDir) {
    run(&workspace, &["add", "Base"]);
    run(&workspace, &["add", "Top", "--deps", "1"]);

    let refused = run_cairn_in_dir(workspace.path(), &["delete", "1"]);
    assert!(!refused.status.success());

    let stdout = run(&workspace, &["delete", "1", "--force"]);
    assert!(stdout.contains("Deleted issue #1"));
    assert!(!issue_file(&workspace).contains("#1: Base"));
}

#[rstest]
fn test_migration_commands(workspace: TempDir) {
    let migrated = run(&workspace, &["migrate"]);
    assert!(migrated.contains("schema is at version 3"), "Got: {migrated}");

    let history = run(&workspace, &["--json", "history"]);
    let records: serde_json::Value = serde_json::from_str(&history).unwrap();
    assert_eq!(records.as_array().unwrap().len(), 3);

    let rolled = run(&workspace, &["rollback", "--to", "1"]);
    assert!(rolled.contains("Rolled back 2 migration(s)"), "Got: {rolled}");
    assert!(run(&workspace, &["migrate"]).contains("Applied 2 migration(s)"));
}

#[rstest]
fn test_json_list(workspace: TempDir) {
    run(&workspace, &["add", "One", "--assignee", "alice"]);

    let stdout = run(&workspace, &["--json", "list"]);
    let issues: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(issues[0]["number"], 1);
    assert_eq!(issues[0]["title"], "One");
    assert_eq!(issues[0]["assigned_to"], "alice");
}
