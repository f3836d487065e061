//! Workspace context for CLI command execution.
//!
//! A [`Workspace`] owns everything a command needs: the migrated store pool,
//! the in-memory dependency graph, and the sync engine bound to the
//! configured flat file.
//!
//! # Example
//!
//! ```no_run
//! use cairn::app::Workspace;
//! use std::path::Path;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let workspace = Workspace::from_directory(Path::new(".")).await?;
//!     let report = workspace.engine().run_pass().await?;
//!     println!("created {} issue(s)", report.created.len());
//!     Ok(())
//! }
//! ```

use crate::commands::init::find_cairn_root;
use crate::config::{CairnConfig, CAIRN_DIR_NAME, CONFIG_FILE_NAME};
use crate::domain::{Issue, IssueNumber, ProjectId};
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::store::issues;
use crate::store::{Migrator, Pool, StoreLocation};
use crate::sync::{LocalFs, SyncEngine, SyncSettings};
use crate::watch::{watch_file, SyncPass, WatchCoordinator, WatchStats};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Find the workspace containing `working_dir` and load its configuration.
///
/// # Errors
///
/// Returns `Error::NotInitialized` if no `.cairn/` directory is found, or the
/// configuration error.
pub async fn locate(working_dir: &Path) -> Result<(PathBuf, CairnConfig)> {
    let root = find_cairn_root(working_dir).ok_or(Error::NotInitialized)?;
    let config_path = root.join(CAIRN_DIR_NAME).join(CONFIG_FILE_NAME);
    let config = CairnConfig::load(&config_path).await?;
    Ok((root, config))
}

/// Open the configured store without touching its schema.
///
/// Used by the migration commands, which must see the schema as it is.
///
/// # Errors
///
/// Returns an error if the pool cannot be opened.
pub fn open_pool(root: &Path, config: &CairnConfig) -> Result<Pool> {
    Pool::open(StoreLocation::File(config.store_path(root)), config.pool_config())
}

/// An opened cairn workspace.
pub struct Workspace {
    root: PathBuf,
    config: CairnConfig,
    pool: Pool,
    graph: Arc<DependencyGraph>,
    engine: Arc<SyncEngine>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.root)
            .field("project", &self.config.project)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Open the workspace containing `working_dir`.
    ///
    /// Searches up the directory tree for `.cairn/`, loads the configuration,
    /// and opens the store.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotInitialized` if no workspace is found, or any error
    /// from [`Workspace::open`].
    pub async fn from_directory(working_dir: &Path) -> Result<Self> {
        let (root, config) = locate(working_dir).await?;
        Self::open(&root, config).await
    }

    /// Open the store described by `config`, bringing its schema up to date.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be opened, a migration fails or an
    /// applied migration no longer matches its definition.
    pub async fn open(root: &Path, config: CairnConfig) -> Result<Self> {
        let location = StoreLocation::File(config.store_path(root));
        Self::with_location(root, config, location).await
    }

    /// Like [`Workspace::open`], with an explicit store location.
    ///
    /// # Errors
    ///
    /// See [`Workspace::open`].
    pub async fn with_location(
        root: &Path,
        config: CairnConfig,
        location: StoreLocation,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Pool::open(location, config.pool_config())?;

        {
            let migrator = Migrator::builtin();
            let mut conn = pool.acquire().await?;
            let applied = migrator.apply(&mut conn)?;
            if !applied.is_empty() {
                tracing::info!(?applied, "Applied schema migrations");
            }
        }

        let graph = Arc::new(DependencyGraph::load(pool.clone()).await?);
        let settings = SyncSettings {
            project: ProjectId::new(config.project.clone()),
            file: config.sync_file(root),
            snapshot: config.snapshot_path(root),
            policy: config.sync.policy,
            default_author: config.sync.default_author.clone(),
        };
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&graph),
            Arc::new(LocalFs),
            settings,
        ));

        Ok(Self {
            root: root.to_path_buf(),
            config,
            pool,
            graph,
            engine,
        })
    }

    /// Directory containing `.cairn/`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loaded configuration.
    pub fn config(&self) -> &CairnConfig {
        &self.config
    }

    /// The configured project.
    pub fn project(&self) -> &ProjectId {
        &self.engine.settings().project
    }

    /// Store connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Dependency graph engine.
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    /// Sync engine for the configured flat file.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Look up an issue of the configured project by number.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the project has no such issue.
    pub async fn resolve(&self, number: IssueNumber) -> Result<Issue> {
        let conn = self.pool.acquire().await?;
        issues::get_issue_by_number(&conn, self.project(), number)?
            .ok_or_else(|| Error::NotFound(format!("issue {number} in project {}", self.project())))
    }

    /// Watch the flat file and sync on every settled change until `shutdown`
    /// resolves.
    ///
    /// An initial pass runs first so the file and store start out agreeing.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial pass fails or the watcher cannot be
    /// started. Failures of later passes are logged and the loop continues.
    pub async fn watch(&self, shutdown: impl Future<Output = ()>) -> Result<WatchStats> {
        let initial = self.engine.run_pass().await?;
        tracing::info!(
            created = initial.created.len(),
            updated = initial.updated.len(),
            deleted = initial.deleted.len(),
            conflicts = initial.conflicts.len(),
            "Initial sync pass complete"
        );

        let file = self.engine.settings().file.clone();
        let (_guard, events) = watch_file(&file)?;
        let reaper = self.pool.spawn_reaper();

        let runner = Arc::clone(&self.engine) as Arc<dyn SyncPass>;
        let coordinator = WatchCoordinator::new(runner, file)
            .with_debounce(self.config.debounce());
        let stats = coordinator.run_with_shutdown(events, shutdown).await;

        reaper.abort();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_workspace_from_initialized_directory() {
        let temp_dir = TempDir::new().unwrap();
        init::init(temp_dir.path(), Some("core")).await.unwrap();

        let workspace = Workspace::from_directory(temp_dir.path()).await.unwrap();

        assert_eq!(workspace.project().as_str(), "core");
        assert_eq!(workspace.root(), temp_dir.path());
        assert!(temp_dir.path().join(".cairn").join("cairn.db").exists());
    }

    #[tokio::test]
    async fn test_workspace_from_subdirectory() {
        let temp_dir = TempDir::new().unwrap();
        init::init(temp_dir.path(), Some("core")).await.unwrap();
        let sub_dir = temp_dir.path().join("src").join("lib");
        std::fs::create_dir_all(&sub_dir).unwrap();

        let workspace = Workspace::from_directory(&sub_dir).await.unwrap();
        assert_eq!(workspace.root(), temp_dir.path());
    }

    #[tokio::test]
    async fn test_workspace_from_uninitialized_directory() {
        let temp_dir = TempDir::new().unwrap();

        let result = Workspace::from_directory(temp_dir.path()).await;
        assert!(matches!(result, Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_reopen_keeps_schema_current() {
        let temp_dir = TempDir::new().unwrap();
        init::init(temp_dir.path(), None).await.unwrap();

        drop(Workspace::from_directory(temp_dir.path()).await.unwrap());
        let workspace = Workspace::from_directory(temp_dir.path()).await.unwrap();

        let conn = workspace.pool().acquire().await.unwrap();
        assert_eq!(
            Migrator::current_version(&conn).unwrap(),
            Migrator::builtin().latest_version()
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_number() {
        let temp_dir = TempDir::new().unwrap();
        init::init(temp_dir.path(), None).await.unwrap();
        let workspace = Workspace::from_directory(temp_dir.path()).await.unwrap();

        let result = workspace.resolve(IssueNumber(9)).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_watch_exports_then_stops_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        init::init(temp_dir.path(), Some("core")).await.unwrap();
        let workspace = Workspace::from_directory(temp_dir.path()).await.unwrap();
        {
            let conn = workspace.pool().acquire().await.unwrap();
            let new = crate::domain::NewIssue::new(workspace.project().clone(), "Watched", "alice");
            crate::store::issues::create_issue(&conn, new).unwrap();
        }

        let stats = workspace.watch(std::future::ready(())).await.unwrap();

        assert_eq!(stats.passes, 0);
        let text = std::fs::read_to_string(temp_dir.path().join("ISSUES.md")).unwrap();
        assert!(text.contains("- [ ] #1: Watched"));
    }
}
