//! Dependency graph engine.
//!
//! Keeps one [`ProjectGraph`] per project in memory, rebuilt from the store by
//! [`DependencyGraph::load`] and kept current by the mutation methods here.
//! Dependencies never cross projects.
//!
//! # Locking
//!
//! Each project graph sits behind its own `tokio::sync::Mutex`. Adding or
//! removing an edge holds that lock across the reachability check *and* the
//! store write, so two concurrent inserts that are each cycle-free but
//! jointly cycle-forming cannot both succeed. Lock order is always project
//! lock first, then a store transaction.
//!
//! Readiness is computed on demand from direct dependency statuses; status
//! changes never trigger re-evaluation here.

mod project;

pub use project::ProjectGraph;

use crate::domain::{BlockedIssue, Issue, IssueFilter, IssueId, IssueStatus, ProjectId};
use crate::error::{Error, Result};
use crate::store::issues;
use crate::store::pool::Pool;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Exclusive access to one project's graph.
///
/// Mutating through the guard changes the published graph; callers that need
/// to stage changes clone it, mutate the clone and assign it back.
pub type ProjectGuard = OwnedMutexGuard<ProjectGraph>;

/// In-memory dependency relation of every project, backed by the store.
pub struct DependencyGraph {
    pool: Pool,
    projects: Mutex<HashMap<ProjectId, Arc<AsyncMutex<ProjectGraph>>>>,
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let projects = self
            .projects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("DependencyGraph")
            .field("projects", &projects)
            .finish_non_exhaustive()
    }
}

impl DependencyGraph {
    /// Rebuild the graphs from every dependency row in the store.
    ///
    /// # Errors
    ///
    /// Returns database errors, or `Error::CycleDetected` if the stored edges
    /// already contain a cycle.
    pub async fn load(pool: Pool) -> Result<Self> {
        let edges = {
            let conn = pool.acquire().await?;
            issues::list_dependency_edges(&conn)?
        };

        let mut grouped: HashMap<ProjectId, ProjectGraph> = HashMap::new();
        let edge_count = edges.len();
        for (project, issue, depends_on) in edges {
            grouped.entry(project).or_default().insert(issue, depends_on)?;
        }

        tracing::debug!(
            projects = grouped.len(),
            edges = edge_count,
            "Loaded dependency graph"
        );

        let projects = grouped
            .into_iter()
            .map(|(project, graph)| (project, Arc::new(AsyncMutex::new(graph))))
            .collect();
        Ok(Self {
            pool,
            projects: Mutex::new(projects),
        })
    }

    /// The pool this engine reads and writes through.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn project_slot(&self, project: &ProjectId) -> Arc<AsyncMutex<ProjectGraph>> {
        let mut projects = self
            .projects
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(projects.entry(project.clone()).or_default())
    }

    /// Take the project-scoped lock.
    pub async fn lock_project(&self, project: &ProjectId) -> ProjectGuard {
        self.project_slot(project).lock_owned().await
    }

    async fn project_of(&self, issue: IssueId) -> Result<Issue> {
        let conn = self.pool.acquire().await?;
        issues::require_issue(&conn, issue)
    }

    /// Record that `issue` depends on `depends_on`.
    ///
    /// Returns `false` if the edge already existed. On any error neither the
    /// store nor the in-memory graph is changed.
    ///
    /// # Errors
    ///
    /// - `Error::SelfDependency` if both ids are equal
    /// - `Error::NotFound` if either issue does not exist
    /// - `Error::Validation` if the issues belong to different projects
    /// - `Error::CycleDetected` if `issue` is reachable from `depends_on`
    pub async fn add_dependency(&self, issue: IssueId, depends_on: IssueId) -> Result<bool> {
        if issue == depends_on {
            return Err(Error::SelfDependency(issue));
        }

        let dependent = self.project_of(issue).await?;
        let dependency = self.project_of(depends_on).await?;
        if dependent.project_id != dependency.project_id {
            return Err(Error::Validation(format!(
                "issue {issue} ({}) and {depends_on} ({}) are in different projects",
                dependent.project_id, dependency.project_id
            )));
        }

        let mut graph = self.lock_project(&dependent.project_id).await;
        if graph.contains_edge(issue, depends_on) {
            return Ok(false);
        }
        if graph.would_create_cycle(issue, depends_on) {
            tracing::info!(%issue, %depends_on, "Rejected cycle-forming dependency");
            return Err(Error::CycleDetected { issue, depends_on });
        }

        let mut conn = self.pool.acquire().await?;
        conn.transaction(|tx| {
            // Either end may have been deleted while we waited for the lock.
            issues::require_issue(tx, issue)?;
            issues::require_issue(tx, depends_on)?;
            issues::insert_dependency(tx, issue, depends_on)
        })?;
        drop(conn);

        graph.insert(issue, depends_on)?;
        tracing::debug!(%issue, %depends_on, project = %dependent.project_id, "Added dependency");
        Ok(true)
    }

    /// Remove the edge `issue -> depends_on`. Removing a missing edge succeeds.
    ///
    /// Returns `true` if an edge was removed.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if `issue` does not exist, or database errors.
    pub async fn remove_dependency(&self, issue: IssueId, depends_on: IssueId) -> Result<bool> {
        let dependent = self.project_of(issue).await?;

        let mut graph = self.lock_project(&dependent.project_id).await;
        let mut conn = self.pool.acquire().await?;
        let removed = conn.transaction(|tx| issues::delete_dependency(tx, issue, depends_on))?;
        drop(conn);

        graph.remove(issue, depends_on);
        if removed {
            tracing::debug!(%issue, %depends_on, "Removed dependency");
        }
        Ok(removed)
    }

    /// Returns `true` if every direct dependency of `issue` is completed.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the issue does not exist.
    pub async fn is_ready(&self, issue: IssueId) -> Result<bool> {
        let subject = self.project_of(issue).await?;
        let graph = self.lock_project(&subject.project_id).await;
        let conn = self.pool.acquire().await?;
        let statuses = issues::statuses(&conn, &subject.project_id)?;
        Ok(graph.is_ready(issue, &statuses))
    }

    /// Issues matching `filter` whose direct dependencies are all completed,
    /// ordered by project then number.
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub async fn compute_ready_set(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        let mut ready = Vec::new();
        for project in self.projects_for(filter).await? {
            let graph = self.lock_project(&project).await;
            let (candidates, statuses) = self.scan(&project, filter).await?;
            ready.extend(
                candidates
                    .into_iter()
                    .filter(|issue| graph.is_ready(issue.id, &statuses)),
            );
        }
        Ok(ready)
    }

    /// Issues matching `filter` with at least one direct dependency that is
    /// not completed, each with those blockers.
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub async fn compute_blocked_set(&self, filter: &IssueFilter) -> Result<Vec<BlockedIssue>> {
        let mut blocked = Vec::new();
        for project in self.projects_for(filter).await? {
            let graph = self.lock_project(&project).await;
            let (candidates, statuses) = self.scan(&project, filter).await?;
            blocked.extend(candidates.into_iter().filter_map(|issue| {
                let blockers = graph.blockers(issue.id, &statuses);
                (!blockers.is_empty()).then_some(BlockedIssue { issue, blockers })
            }));
        }
        Ok(blocked)
    }

    async fn projects_for(&self, filter: &IssueFilter) -> Result<Vec<ProjectId>> {
        if let Some(project) = &filter.project_id {
            return Ok(vec![project.clone()]);
        }
        let conn = self.pool.acquire().await?;
        let projects: BTreeSet<ProjectId> = issues::list_issues(&conn, filter)?
            .into_iter()
            .map(|issue| issue.project_id)
            .collect();
        Ok(projects.into_iter().collect())
    }

    async fn scan(
        &self,
        project: &ProjectId,
        filter: &IssueFilter,
    ) -> Result<(Vec<Issue>, HashMap<IssueId, IssueStatus>)> {
        let conn = self.pool.acquire().await?;
        let scoped = IssueFilter {
            project_id: Some(project.clone()),
            ..filter.clone()
        };
        let candidates = issues::list_issues(&conn, &scoped)?;
        let statuses = issues::statuses(&conn, project)?;
        Ok((candidates, statuses))
    }

    /// Every issue that depends on `issue`, transitively, in breadth-first order.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the issue does not exist.
    pub async fn transitive_dependents(&self, issue: IssueId) -> Result<Vec<IssueId>> {
        let subject = self.project_of(issue).await?;
        let graph = self.lock_project(&subject.project_id).await;
        Ok(graph.transitive_dependents(issue))
    }

    /// Direct dependencies of `issue`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the issue does not exist.
    pub async fn dependencies_of(&self, issue: IssueId) -> Result<Vec<IssueId>> {
        let subject = self.project_of(issue).await?;
        let graph = self.lock_project(&subject.project_id).await;
        Ok(graph.dependencies(issue))
    }

    /// Drop a deleted issue from the in-memory graph.
    pub async fn forget_issue(&self, project: &ProjectId, issue: IssueId) {
        self.lock_project(project).await.remove_issue(issue);
    }

    /// Delete an issue and its dependency edges.
    ///
    /// Without `force`, an issue that others depend on is left alone and the
    /// call fails listing its transitive dependents. Returns the transitive
    /// dependents that were left without this dependency.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the issue does not exist
    /// - `Error::Validation` if it has dependents and `force` is false
    pub async fn delete_issue(&self, issue: IssueId, force: bool) -> Result<Vec<IssueId>> {
        let subject = self.project_of(issue).await?;

        let mut graph = self.lock_project(&subject.project_id).await;
        let dependents = graph.transitive_dependents(issue);
        if !dependents.is_empty() && !force {
            let listed: Vec<String> = dependents.iter().map(ToString::to_string).collect();
            return Err(Error::Validation(format!(
                "issue {issue} has dependents: {}",
                listed.join(", ")
            )));
        }

        let mut conn = self.pool.acquire().await?;
        conn.transaction(|tx| issues::delete_issue(tx, issue))?;
        drop(conn);

        graph.remove_issue(issue);
        tracing::info!(%issue, dependents = dependents.len(), "Deleted issue");
        Ok(dependents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IssueUpdate, NewIssue};
    use crate::store::migrate::Migrator;
    use crate::store::pool::{PoolConfig, StoreLocation};

    async fn setup() -> DependencyGraph {
        let pool = Pool::open(StoreLocation::unique_memory(), PoolConfig::default()).unwrap();
        let mut conn = pool.acquire().await.unwrap();
        Migrator::builtin().apply(&mut conn).unwrap();
        drop(conn);
        DependencyGraph::load(pool).await.unwrap()
    }

    async fn create(graph: &DependencyGraph, project: &str, title: &str) -> IssueId {
        let conn = graph.pool().acquire().await.unwrap();
        issues::create_issue(&conn, NewIssue::new(ProjectId::from(project), title, "alice"))
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_cycle_rejected_without_store_write() {
        let graph = setup().await;
        let five = create(&graph, "core", "five").await;
        let seven = create(&graph, "core", "seven").await;

        assert!(graph.add_dependency(seven, five).await.unwrap());
        let err = graph.add_dependency(five, seven).await.unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));

        let conn = graph.pool().acquire().await.unwrap();
        assert_eq!(issues::list_dependency_edges(&conn).unwrap().len(), 1);
        assert!(issues::dependencies_of(&conn, five).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cross_project_dependency_rejected() {
        let graph = setup().await;
        let a = create(&graph, "core", "a").await;
        let b = create(&graph, "web", "b").await;
        assert!(matches!(
            graph.add_dependency(a, b).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_issue_is_not_found() {
        let graph = setup().await;
        let a = create(&graph, "core", "a").await;
        assert!(matches!(
            graph.add_dependency(a, IssueId(999)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_dependency_is_idempotent() {
        let graph = setup().await;
        let a = create(&graph, "core", "a").await;
        let b = create(&graph, "core", "b").await;
        graph.add_dependency(a, b).await.unwrap();

        assert!(graph.remove_dependency(a, b).await.unwrap());
        assert!(!graph.remove_dependency(a, b).await.unwrap());
        assert!(graph.dependencies_of(a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_rebuilds_from_store() {
        let graph = setup().await;
        let a = create(&graph, "core", "a").await;
        let b = create(&graph, "core", "b").await;
        graph.add_dependency(a, b).await.unwrap();

        let reloaded = DependencyGraph::load(graph.pool().clone()).await.unwrap();
        assert_eq!(reloaded.dependencies_of(a).await.unwrap(), vec![b]);
        assert!(matches!(
            reloaded.add_dependency(b, a).await,
            Err(Error::CycleDetected { .. })
        ));
    }

    #[tokio::test]
    async fn test_ready_and_blocked_sets() {
        let graph = setup().await;
        let ten = create(&graph, "core", "ten").await;
        let eleven = create(&graph, "core", "eleven").await;
        let twelve = create(&graph, "core", "twelve").await;
        graph.add_dependency(ten, eleven).await.unwrap();
        graph.add_dependency(twelve, ten).await.unwrap();

        let filter = IssueFilter::project(ProjectId::from("core"));
        let ready: Vec<IssueId> = graph
            .compute_ready_set(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ready, vec![eleven]);

        {
            let conn = graph.pool().acquire().await.unwrap();
            issues::update_issue(
                &conn,
                eleven,
                &IssueUpdate {
                    status: Some(IssueStatus::Completed),
                    ..IssueUpdate::default()
                },
            )
            .unwrap();
        }
        assert!(graph.is_ready(ten).await.unwrap());

        let blocked = graph.compute_blocked_set(&filter).await.unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].issue.id, twelve);
        assert_eq!(blocked[0].blockers, vec![ten]);
    }

    #[tokio::test]
    async fn test_delete_requires_force_when_depended_on() {
        let graph = setup().await;
        let a = create(&graph, "core", "a").await;
        let b = create(&graph, "core", "b").await;
        let c = create(&graph, "core", "c").await;
        graph.add_dependency(b, a).await.unwrap();
        graph.add_dependency(c, b).await.unwrap();

        assert!(matches!(
            graph.delete_issue(a, false).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(graph.delete_issue(a, true).await.unwrap(), vec![b, c]);
        assert!(graph.dependencies_of(b).await.unwrap().is_empty());
        assert!(matches!(
            graph.transitive_dependents(a).await,
            Err(Error::NotFound(_))
        ));
    }
}
