//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use cairn::domain::{Issue, IssueNumber, IssueUpdate, NewIssue, ProjectId};
use cairn::graph::DependencyGraph;
use cairn::store::issues;
use cairn::store::{Migrator, Pool, PoolConfig, StoreLocation};
use cairn::sync::{ConflictPolicy, LocalFs, SyncEngine, SyncSettings};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use tempfile::TempDir;

/// Project used by every harness.
pub const PROJECT: &str = "core";

/// Run the cairn binary in the specified directory.
pub fn run_cairn_in_dir(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cairn"))
        .args(args)
        .current_dir(dir)
        .env("RUST_LOG", "cairn=warn")
        .output()
        .expect("Failed to execute cairn binary")
}

/// A migrated in-memory store plus a sync engine bound to files in a
/// temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub graph: Arc<DependencyGraph>,
    pub engine: SyncEngine,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_policy(ConflictPolicy::Manual).await
    }

    pub async fn with_policy(policy: ConflictPolicy) -> Self {
        let dir = TempDir::new().unwrap();
        let graph = Arc::new(migrated_graph().await);
        let engine = engine_for(&graph, dir.path(), policy);
        Self { dir, graph, engine }
    }

    /// Another engine over the same store and files.
    pub fn engine(&self, policy: ConflictPolicy) -> SyncEngine {
        engine_for(&self.graph, self.dir.path(), policy)
    }

    pub fn project(&self) -> ProjectId {
        ProjectId::new(PROJECT)
    }

    pub fn file(&self) -> PathBuf {
        self.dir.path().join("ISSUES.md")
    }

    pub fn snapshot(&self) -> PathBuf {
        self.dir.path().join("snapshot.jsonl")
    }

    pub fn read_file(&self) -> String {
        std::fs::read_to_string(self.file()).unwrap()
    }

    pub fn write_file(&self, text: &str) {
        std::fs::write(self.file(), text).unwrap();
    }

    /// Apply a textual edit to the flat file, asserting it matched.
    pub fn edit_file(&self, from: &str, to: &str) {
        let text = self.read_file();
        assert!(text.contains(from), "file does not contain {from:?}:\n{text}");
        self.write_file(&text.replacen(from, to, 1));
    }

    pub async fn create(&self, title: &str) -> Issue {
        let conn = self.graph.pool().acquire().await.unwrap();
        issues::create_issue(&conn, NewIssue::new(self.project(), title, "alice")).unwrap()
    }

    pub async fn issue(&self, number: u32) -> Option<Issue> {
        let conn = self.graph.pool().acquire().await.unwrap();
        issues::get_issue_by_number(&conn, &self.project(), IssueNumber(number)).unwrap()
    }

    pub async fn update(&self, number: u32, update: IssueUpdate) -> Issue {
        let issue = self.issue(number).await.expect("issue exists");
        let conn = self.graph.pool().acquire().await.unwrap();
        issues::update_issue(&conn, issue.id, &update).unwrap()
    }

    /// Dependency numbers of an issue, as stored.
    pub async fn dependencies(&self, number: u32) -> Vec<u32> {
        let issue = self.issue(number).await.expect("issue exists");
        let ids = self.graph.dependencies_of(issue.id).await.unwrap();
        let conn = self.graph.pool().acquire().await.unwrap();
        let mut numbers: Vec<u32> = ids
            .into_iter()
            .map(|id| issues::require_issue(&conn, id).unwrap().number.0)
            .collect();
        numbers.sort_unstable();
        numbers
    }
}

/// A fresh in-memory store at the latest schema, with its graph loaded.
pub async fn migrated_graph() -> DependencyGraph {
    let pool = Pool::open(StoreLocation::unique_memory(), PoolConfig::default()).unwrap();
    let mut conn = pool.acquire().await.unwrap();
    Migrator::builtin().apply(&mut conn).unwrap();
    drop(conn);
    DependencyGraph::load(pool).await.unwrap()
}

fn engine_for(graph: &Arc<DependencyGraph>, dir: &Path, policy: ConflictPolicy) -> SyncEngine {
    SyncEngine::new(
        Arc::clone(graph),
        Arc::new(LocalFs),
        SyncSettings {
            project: ProjectId::new(PROJECT),
            file: dir.join("ISSUES.md"),
            snapshot: dir.join("snapshot.jsonl"),
            policy,
            default_author: "sync-bot".to_string(),
        },
    )
}
