//! One synchronization pass between the flat file and the store.
//!
//! ```text
//! Idle -> Parsing -> Diffing -> Resolving -> Writing -> Exporting -> Idle
//!                       \___________ error ___________/
//!                                     |
//!                                   Failed -> Idle (next pass)
//! ```
//!
//! Every file-driven change of a pass is written in one store transaction
//! while the project lock is held. Dependency edits are cycle-checked against
//! a staged copy of the project graph, which replaces the live graph only
//! after the transaction commits.

use super::diff::{diff, resolve, Conflict, ConflictPolicy, Resolution};
use super::export::export;
use super::io::FileIo;
use super::parse::{parse, ParseError, ParsedFile};
use super::record::{Field, Record};
use super::snapshot::{Snapshot, SnapshotEntry};
use crate::domain::{IssueFilter, IssueId, IssueNumber, IssueUpdate, NewIssue, ProjectId};
use crate::error::{Error, Result};
use crate::graph::{DependencyGraph, ProjectGraph};
use crate::store::issues;
use crate::store::pool::Pool;
use chrono::NaiveTime;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Where a pass currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// No pass running
    Idle,
    /// Reading the flat file and snapshot
    Parsing,
    /// Loading the store and comparing
    Diffing,
    /// Applying the conflict policy
    Resolving,
    /// Writing file-driven changes to the store
    Writing,
    /// Writing the flat file and snapshot
    Exporting,
    /// The last pass failed
    Failed,
}

/// Cooperative cancellation for a sync pass.
///
/// Cancelling before the Writing phase leaves everything untouched; during
/// Writing the transaction is rolled back.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with `Error::Cancelled` if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` after [`cancel`](Self::cancel).
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A dependency from the file that was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedEdge {
    /// Issue that listed the dependency
    pub issue: IssueNumber,
    /// The dependency it listed
    pub depends_on: IssueNumber,
    /// Why it was rejected
    pub reason: String,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Issues created from the file
    pub created: Vec<IssueNumber>,
    /// Issues updated from the file
    pub updated: Vec<IssueNumber>,
    /// Issues deleted because they were removed from the file
    pub deleted: Vec<IssueNumber>,
    /// Whether the flat file was rewritten
    pub exported: bool,
    /// Whether the snapshot was rewritten
    pub snapshot_written: bool,
    /// Conflicts left for manual resolution
    pub conflicts: Vec<Conflict>,
    /// File dependencies that could not be applied
    pub rejected: Vec<RejectedEdge>,
    /// Blocks of the file that failed to parse
    pub parse_errors: Vec<ParseError>,
}

impl SyncReport {
    /// Returns `true` if the pass changed nothing and found nothing to report.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && !self.exported
            && self.conflicts.is_empty()
            && self.rejected.is_empty()
            && self.parse_errors.is_empty()
    }

    /// Turn unresolved conflicts into an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConflictDetected` if the pass left any conflict.
    pub fn ensure_no_conflicts(&self) -> Result<()> {
        if self.conflicts.is_empty() {
            Ok(())
        } else {
            Err(Error::ConflictDetected {
                count: self.conflicts.len(),
            })
        }
    }
}

/// What a sync engine is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Project mirrored by the file
    pub project: ProjectId,
    /// The flat file
    pub file: PathBuf,
    /// The snapshot file
    pub snapshot: PathBuf,
    /// Conflict policy
    pub policy: ConflictPolicy,
    /// Author recorded on issues created from the file
    pub default_author: String,
}

/// The store side of a project, keyed by issue number.
struct StoreView {
    records: BTreeMap<IssueNumber, Record>,
    ids: BTreeMap<IssueNumber, IssueId>,
}

fn load_store(conn: &Connection, project: &ProjectId) -> Result<StoreView> {
    let project_issues = issues::list_issues(conn, &IssueFilter::project(project.clone()))?;
    let numbers: BTreeMap<IssueId, IssueNumber> =
        project_issues.iter().map(|i| (i.id, i.number)).collect();

    let mut deps: BTreeMap<IssueId, Vec<IssueNumber>> = BTreeMap::new();
    for (issue, depends_on) in issues::project_edges(conn, project)? {
        if let Some(number) = numbers.get(&depends_on) {
            deps.entry(issue).or_default().push(*number);
        }
    }

    let mut view = StoreView {
        records: BTreeMap::new(),
        ids: BTreeMap::new(),
    };
    for issue in &project_issues {
        let record = Record::from_issue(issue, deps.remove(&issue.id).unwrap_or_default());
        view.ids.insert(issue.number, issue.id);
        view.records.insert(issue.number, record);
    }
    Ok(view)
}

fn update_from(record: &Record, fields: &[Field]) -> IssueUpdate {
    let mut update = IssueUpdate::default();
    for field in fields {
        match field {
            Field::Title => update.title = Some(record.title.clone()),
            Field::Status => update.status = Some(record.status),
            Field::Priority => update.priority = Some(record.priority),
            Field::AssignedTo => update.assigned_to = Some(record.assigned_to.clone()),
            Field::Description => update.description = Some(record.description.clone()),
            Field::Dependencies => {}
        }
    }
    update
}

/// Result of the transactional part of a pass.
struct Reconciled {
    staged: ProjectGraph,
    store_after: BTreeMap<IssueNumber, Record>,
    resolution: Resolution,
    created: Vec<IssueNumber>,
    updated: Vec<IssueNumber>,
    deleted: Vec<IssueNumber>,
    rejected: Vec<RejectedEdge>,
}

type PhaseObserver = Box<dyn Fn(SyncPhase) + Send + Sync>;

/// Bidirectional sync between one flat file and one project in the store.
///
/// Passes are single-flight: a second caller waits for the running pass.
pub struct SyncEngine {
    pool: Pool,
    graph: Arc<DependencyGraph>,
    files: Arc<dyn FileIo>,
    settings: SyncSettings,
    single_flight: tokio::sync::Mutex<()>,
    phase: Mutex<SyncPhase>,
    observer: Option<PhaseObserver>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("settings", &self.settings)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create an engine that writes through the graph's pool.
    pub fn new(graph: Arc<DependencyGraph>, files: Arc<dyn FileIo>, settings: SyncSettings) -> Self {
        Self {
            pool: graph.pool().clone(),
            graph,
            files,
            settings,
            single_flight: tokio::sync::Mutex::new(()),
            phase: Mutex::new(SyncPhase::Idle),
            observer: None,
        }
    }

    /// Call `observer` with every phase the engine enters.
    ///
    /// The observer runs synchronously on the task driving the pass, so it
    /// sees each phase before any work of that phase is done.
    #[must_use]
    pub fn with_phase_observer(
        mut self,
        observer: impl Fn(SyncPhase) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Engine configuration.
    #[must_use]
    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, next: SyncPhase) {
        {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase == next {
                return;
            }
            tracing::debug!(from = ?*phase, to = ?next, "Sync phase");
            *phase = next;
        }
        if let Some(observer) = &self.observer {
            observer(next);
        }
    }

    /// Run one pass.
    ///
    /// # Errors
    ///
    /// Any error aborts the pass and rolls back its store transaction.
    pub async fn run_pass(&self) -> Result<SyncReport> {
        self.run_pass_with(self.settings.policy, &CancelToken::new()).await
    }

    /// Run one pass under `policy`, cancellable through `cancel`.
    ///
    /// The pass is serialized with every other pass of this engine whatever
    /// policy it uses.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if cancelled, or whatever aborted the pass.
    pub async fn run_pass_with(
        &self,
        policy: ConflictPolicy,
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        let _flight = self.single_flight.lock().await;
        self.set_phase(SyncPhase::Idle);

        let started = Instant::now();
        let result = self.pass(policy, cancel).await;
        match &result {
            Ok(report) => {
                self.set_phase(SyncPhase::Idle);
                tracing::info!(
                    file = %self.settings.file.display(),
                    created = report.created.len(),
                    updated = report.updated.len(),
                    deleted = report.deleted.len(),
                    conflicts = report.conflicts.len(),
                    rejected = report.rejected.len(),
                    parse_errors = report.parse_errors.len(),
                    exported = report.exported,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Sync pass complete"
                );
            }
            Err(e) => {
                self.set_phase(SyncPhase::Failed);
                tracing::warn!(file = %self.settings.file.display(), error = %e, "Sync pass failed");
            }
        }
        result
    }

    async fn pass(&self, policy: ConflictPolicy, cancel: &CancelToken) -> Result<SyncReport> {
        self.set_phase(SyncPhase::Parsing);
        let file_bytes = self.files.read(&self.settings.file).await?;
        let parsed = match &file_bytes {
            Some(bytes) => parse(std::str::from_utf8(bytes).map_err(|e| {
                Error::Validation(format!(
                    "{} is not valid UTF-8: {e}",
                    self.settings.file.display()
                ))
            })?),
            None => ParsedFile::default(),
        };
        let snapshot_bytes = self.files.read(&self.settings.snapshot).await?;
        let snapshot = match (&file_bytes, &snapshot_bytes) {
            // Without a file there is nothing to diff against; export from the store.
            (None, _) | (_, None) => Snapshot::default(),
            (Some(_), Some(bytes)) => {
                let (snapshot, warnings) = Snapshot::from_jsonl(&String::from_utf8_lossy(bytes));
                for warning in warnings {
                    tracing::warn!(?warning, "Skipped snapshot entry");
                }
                snapshot
            }
        };
        cancel.check()?;

        self.set_phase(SyncPhase::Diffing);
        let mut guard = self.graph.lock_project(&self.settings.project).await;
        let mut conn = self.pool.acquire().await?;
        conn.begin()?;
        let reconciled = match self.reconcile(&conn, &guard, &parsed, &snapshot, policy, cancel) {
            Ok(reconciled) => reconciled,
            Err(e) => {
                if let Err(rollback) = conn.rollback() {
                    tracing::warn!(error = %rollback, "Rollback of sync pass failed");
                }
                return Err(e);
            }
        };
        conn.commit()?;
        drop(conn);
        *guard = reconciled.staged.clone();
        drop(guard);

        self.set_phase(SyncPhase::Exporting);
        let mut report = SyncReport {
            created: reconciled.created,
            updated: reconciled.updated,
            deleted: reconciled.deleted,
            rejected: reconciled.rejected,
            conflicts: reconciled.resolution.conflicts.clone(),
            parse_errors: parsed.errors.clone(),
            ..SyncReport::default()
        };

        let file_after: BTreeMap<IssueNumber, Record> = if parsed.is_clean() {
            let mut records = reconciled.store_after.clone();
            for number in &reconciled.resolution.held {
                if let Some(file_record) = parsed.records.iter().find(|r| r.number == *number) {
                    records.insert(*number, file_record.clone());
                }
            }
            let rendered: Vec<Record> = records.values().cloned().collect();
            let text = export(self.settings.project.as_str(), &rendered);
            if file_bytes.as_deref() != Some(text.as_bytes()) {
                self.files
                    .write_atomic(&self.settings.file, text.as_bytes())
                    .await?;
                report.exported = true;
            }
            records
        } else {
            tracing::warn!(
                errors = parsed.errors.len(),
                "Flat file has unparsed blocks; leaving it untouched"
            );
            parsed.records.iter().map(|r| (r.number, r.clone())).collect()
        };

        let next = advance_snapshot(
            &snapshot,
            &reconciled.store_after,
            &file_after,
            &parsed.failed_numbers,
        );
        let text = next.to_jsonl()?;
        if snapshot_bytes.as_deref() != Some(text.as_bytes()) {
            self.files
                .write_atomic(&self.settings.snapshot, text.as_bytes())
                .await?;
            report.snapshot_written = true;
        }

        Ok(report)
    }

    fn reconcile(
        &self,
        conn: &Connection,
        graph: &ProjectGraph,
        parsed: &ParsedFile,
        snapshot: &Snapshot,
        policy: ConflictPolicy,
        cancel: &CancelToken,
    ) -> Result<Reconciled> {
        let project = &self.settings.project;
        let mut store = load_store(conn, project)?;
        let file: BTreeMap<IssueNumber, Record> =
            parsed.records.iter().map(|r| (r.number, r.clone())).collect();

        self.set_phase(SyncPhase::Resolving);
        let diffs = diff(snapshot, parsed, &store.records);
        let resolution = resolve(&diffs, policy, &file, &store.records);
        if !resolution.held.is_empty() {
            tracing::info!(
                issues = resolution.held.len(),
                conflicts = resolution.conflicts.len(),
                "Holding conflicting issues for manual resolution"
            );
        }
        cancel.check()?;

        self.set_phase(SyncPhase::Writing);
        let mut staged = graph.clone();
        let mut created = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();
        let mut rejected = Vec::new();
        let mut dependency_targets: BTreeMap<IssueNumber, &Record> = BTreeMap::new();

        for number in &resolution.creates {
            let Some(record) = file.get(number) else {
                continue;
            };
            let new = NewIssue {
                project_id: project.clone(),
                number: Some(*number),
                title: record.title.clone(),
                description: record.description.clone(),
                status: record.status,
                priority: record.priority,
                created_by: self.settings.default_author.clone(),
                assigned_to: record.assigned_to.clone(),
                created_at: record.created.map(|date| date.and_time(NaiveTime::MIN).and_utc()),
            };
            let issue = issues::create_issue(conn, new)?;
            store.ids.insert(*number, issue.id);
            created.push(*number);
            dependency_targets.insert(*number, record);
        }

        for (number, fields) in &resolution.updates {
            let (Some(record), Some(id)) = (file.get(number), store.ids.get(number)) else {
                continue;
            };
            let update = update_from(record, fields);
            if !update.is_empty() {
                issues::update_issue(conn, *id, &update)?;
            }
            if fields.contains(&Field::Dependencies) {
                dependency_targets.insert(*number, record);
            }
            updated.push(*number);
        }
        cancel.check()?;

        // Removals before deletes and additions, so an edit that reverses an
        // edge never trips the cycle check against its old direction.
        for (number, record) in &dependency_targets {
            let Some(id) = store.ids.get(number).copied() else {
                continue;
            };
            let wanted: BTreeSet<IssueId> = record
                .dependencies
                .iter()
                .filter_map(|dep| store.ids.get(dep).copied())
                .collect();
            for current in staged.dependencies(id) {
                if !wanted.contains(&current) {
                    issues::delete_dependency(conn, id, current)?;
                    staged.remove(id, current);
                }
            }
        }

        for number in &resolution.deletes {
            if let Some(id) = store.ids.remove(number) {
                issues::delete_issue(conn, id)?;
                staged.remove_issue(id);
                deleted.push(*number);
            }
        }
        cancel.check()?;

        for (number, record) in &dependency_targets {
            let Some(id) = store.ids.get(number).copied() else {
                continue;
            };
            for dep in &record.dependencies {
                let reject = |reason: String| RejectedEdge {
                    issue: *number,
                    depends_on: *dep,
                    reason,
                };
                let Some(dep_id) = store.ids.get(dep).copied() else {
                    rejected.push(reject(format!("issue {dep} does not exist")));
                    continue;
                };
                match staged.insert(id, dep_id) {
                    Ok(true) => {
                        issues::insert_dependency(conn, id, dep_id)?;
                    }
                    Ok(false) => {}
                    Err(e @ (Error::CycleDetected { .. } | Error::SelfDependency(_))) => {
                        tracing::warn!(issue = %number, depends_on = %dep, error = %e, "Rejected dependency from file");
                        rejected.push(reject(e.to_string()));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        cancel.check()?;

        let store_after = load_store(conn, project)?.records;
        Ok(Reconciled {
            staged,
            store_after,
            resolution,
            created,
            updated,
            deleted,
            rejected,
        })
    }
}

/// Advance each entry whose file and store records now agree; keep the
/// previous entry otherwise. Issues gone from both sides are dropped.
fn advance_snapshot(
    previous: &Snapshot,
    store: &BTreeMap<IssueNumber, Record>,
    file: &BTreeMap<IssueNumber, Record>,
    failed: &BTreeSet<IssueNumber>,
) -> Snapshot {
    let numbers: BTreeSet<IssueNumber> = store.keys().copied().chain(previous.numbers()).collect();

    let mut next = Snapshot::default();
    for number in numbers {
        match (store.get(&number), file.get(&number)) {
            (Some(store_record), Some(file_record)) if store_record.same_content(file_record) => {
                next.insert(SnapshotEntry::of(store_record));
            }
            (None, None) if !failed.contains(&number) => {}
            _ => {
                if let Some(entry) = previous.get(number) {
                    next.insert(entry.clone());
                }
            }
        }
    }
    next
}
