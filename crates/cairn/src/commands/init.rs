//! Implementation of the `init` command.
//!
//! Creates the `.cairn/` directory with its configuration, an empty flat
//! file, and a `.gitignore` that keeps the database out of version control.

use crate::config::{validate_project, CairnConfig, CAIRN_DIR_NAME, CONFIG_FILE_NAME};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Default project id if none specified
pub const DEFAULT_PROJECT: &str = "main";

/// Name of the gitignore file within .cairn
pub const GITIGNORE_FILE_NAME: &str = ".gitignore";

/// Maximum directory depth to traverse when searching for the workspace root
pub const MAX_TRAVERSAL_DEPTH: usize = 256;

/// Result of the init command
#[derive(Debug)]
pub struct InitResult {
    /// Path to the created `.cairn` directory
    pub cairn_dir: PathBuf,
    /// Path to the created config file
    pub config_file: PathBuf,
    /// Path to the flat file
    pub sync_file: PathBuf,
    /// Path to the created gitignore file
    pub gitignore_file: PathBuf,
    /// Project mirrored by the flat file
    pub project: String,
}

/// Initialize a new cairn workspace in the given directory.
///
/// An existing flat file is left untouched so the first sync pass can import
/// it.
///
/// # Errors
///
/// Returns an error if:
/// - The `.cairn/` directory already exists
/// - The project id is invalid
/// - File system operations fail
pub async fn init(base_dir: &Path, project: Option<&str>) -> Result<InitResult> {
    let project = project.unwrap_or(DEFAULT_PROJECT).trim();
    validate_project(project)?;

    let cairn_dir = base_dir.join(CAIRN_DIR_NAME);
    if cairn_dir.exists() {
        return Err(Error::Config(format!(
            "cairn is already initialized in this directory. Found existing '{CAIRN_DIR_NAME}'"
        )));
    }

    fs::create_dir_all(&cairn_dir).await?;

    let config_file = cairn_dir.join(CONFIG_FILE_NAME);
    let config = CairnConfig::new(project);
    config.save(&config_file).await?;

    let sync_file = config.sync_file(base_dir);
    if !sync_file.exists() {
        fs::write(&sync_file, "").await?;
    }

    let gitignore_file = cairn_dir.join(GITIGNORE_FILE_NAME);
    let gitignore_content = "\
# Local store and sync state; the Markdown issue file is what gets shared
*.db
*.db-journal
*.db-wal
*.db-shm
snapshot.jsonl
";
    fs::write(&gitignore_file, gitignore_content).await?;

    tracing::info!(project, dir = %cairn_dir.display(), "initialized cairn workspace");

    Ok(InitResult {
        cairn_dir,
        config_file,
        sync_file,
        gitignore_file,
        project: project.to_string(),
    })
}

/// Check if a directory has been initialized with cairn.
pub fn is_initialized(base_dir: &Path) -> bool {
    base_dir.join(CAIRN_DIR_NAME).exists()
}

/// Find the workspace root by searching up the directory tree.
///
/// Returns the directory containing `.cairn/`, or `None` if none is found
/// before the filesystem root or the depth limit.
pub fn find_cairn_root(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    let mut depth = 0;

    loop {
        if current.join(CAIRN_DIR_NAME).exists() {
            return Some(current);
        }

        depth += 1;
        if depth > MAX_TRAVERSAL_DEPTH || !current.pop() {
            return None;
        }
    }
}
