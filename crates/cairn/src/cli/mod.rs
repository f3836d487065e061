//! CLI argument parsing and command dispatch.
//!
//! This module provides the command-line interface for cairn using clap's
//! derive API.
//!
//! # Commands
//!
//! - `init`: Initialize a new cairn workspace
//! - `add`, `list`, `status`, `delete`: manage issues
//! - `dep add|rm`: manage dependencies
//! - `ready`, `blocked`: dependency-aware views
//! - `migrate`, `rollback`, `history`: schema management
//! - `sync`, `watch`: keep the Markdown file and the store in step
//!
//! # Global Flags
//!
//! - `--json`: Output in JSON format
//! - `--no-sync`: Do not rewrite the issue file after a store mutation
//!
//! # Example
//!
//! ```bash
//! cairn add "Fix login" --priority high
//! cairn dep add 2 1
//! cairn ready
//! cairn watch
//! ```

mod args;
mod execute;

use anyhow::Result;
use clap::{Parser, Subcommand};

pub use args::{
    parse_issue_number, AddArgs, BlockedArgs, DeleteArgs, DepAction, DepArgs, InitArgs, ListArgs,
    ReadyArgs, RollbackArgs, StatusArgs, SyncArgs,
};

/// Cairn - a dependency-aware issue store
///
/// Issues live in a local SQLite store and are mirrored to a Markdown file
/// (`ISSUES.md` by default) that can be edited by hand and synced back.
#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output in JSON format for programmatic use
    #[arg(long, global = true)]
    pub json: bool,

    /// Leave the issue file alone after changing the store
    #[arg(long, global = true)]
    pub no_sync: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Initialize a new cairn workspace
    ///
    /// Creates `.cairn/` with configuration, plus an empty issue file if none
    /// exists yet.
    Init(InitArgs),

    /// Create a new issue
    Add(AddArgs),

    /// List issues with optional filters
    List(ListArgs),

    /// Change the status of an issue
    Status(StatusArgs),

    /// Delete an issue and its dependency edges
    Delete(DeleteArgs),

    /// Add or remove a dependency between issues
    Dep(DepArgs),

    /// Show issues whose dependencies are all completed
    Ready(ReadyArgs),

    /// Show issues waiting on unfinished dependencies
    Blocked(BlockedArgs),

    /// Apply pending schema migrations
    Migrate,

    /// Roll the schema back to an earlier version
    Rollback(RollbackArgs),

    /// Show applied schema migrations
    History,

    /// Run one sync pass between the issue file and the store
    Sync(SyncArgs),

    /// Sync continuously whenever the issue file changes
    Watch,
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }

    /// Parse CLI arguments from an iterator (for testing)
    pub fn try_parse_from<I, T>(iter: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(iter)
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> Result<()> {
        use crate::output::OutputMode;

        let output_mode = if self.json {
            OutputMode::Json
        } else {
            OutputMode::Text
        };
        let sync = !self.no_sync;

        let Some(command) = &self.command else {
            println!("Cairn dependency-aware issue store");
            println!("Use --help for more information");
            return Ok(());
        };

        match command {
            Commands::Init(args) => execute::execute_init(args).await,
            Commands::Add(args) => {
                let workspace = open_workspace().await?;
                execute::execute_add(&workspace, args, output_mode, sync).await
            }
            Commands::List(args) => {
                let workspace = open_workspace().await?;
                execute::execute_list(&workspace, args, output_mode).await
            }
            Commands::Status(args) => {
                let workspace = open_workspace().await?;
                execute::execute_status(&workspace, args, output_mode, sync).await
            }
            Commands::Delete(args) => {
                let workspace = open_workspace().await?;
                execute::execute_delete(&workspace, args, output_mode, sync).await
            }
            Commands::Dep(args) => {
                let workspace = open_workspace().await?;
                execute::execute_dep(&workspace, args, output_mode, sync).await
            }
            Commands::Ready(args) => {
                let workspace = open_workspace().await?;
                execute::execute_ready(&workspace, args, output_mode).await
            }
            Commands::Blocked(args) => {
                let workspace = open_workspace().await?;
                execute::execute_blocked(&workspace, args, output_mode).await
            }
            Commands::Migrate => execute::execute_migrate(output_mode).await,
            Commands::Rollback(args) => execute::execute_rollback(args, output_mode).await,
            Commands::History => execute::execute_history(output_mode).await,
            Commands::Sync(args) => {
                let workspace = open_workspace().await?;
                execute::execute_sync(&workspace, args, output_mode).await
            }
            Commands::Watch => {
                let workspace = open_workspace().await?;
                execute::execute_watch(&workspace).await
            }
        }
    }
}

/// Open the workspace containing the current directory.
async fn open_workspace() -> Result<crate::app::Workspace> {
    Ok(crate::app::Workspace::from_directory(&std::env::current_dir()?).await?)
}
