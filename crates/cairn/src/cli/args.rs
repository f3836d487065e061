//! CLI argument structs for all commands.
//!
//! Each command has its own argument struct with clap derive attributes
//! for parsing and validation.

use clap::{Parser, Subcommand};

use crate::domain::{validate_title, IssueNumber, IssueStatus, Priority};
use crate::sync::ConflictPolicy;

/// Parse an issue number written as `7` or `#7`.
pub fn parse_issue_number(s: &str) -> Result<IssueNumber, String> {
    let digits = s.trim().trim_start_matches('#');
    match digits.parse::<u32>() {
        Ok(0) => Err("issue numbers start at 1".to_string()),
        Ok(n) => Ok(IssueNumber(n)),
        Err(_) => Err(format!("'{s}' is not an issue number")),
    }
}

fn parse_status(s: &str) -> Result<IssueStatus, String> {
    s.parse().map_err(|e: crate::error::Error| e.to_string())
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    s.parse().map_err(|e: crate::error::Error| e.to_string())
}

fn parse_policy(s: &str) -> Result<ConflictPolicy, String> {
    s.parse().map_err(|e: crate::error::Error| e.to_string())
}

fn parse_title(s: &str) -> Result<String, String> {
    validate_title(s).map_err(|e| e.to_string())?;
    Ok(s.trim().to_string())
}

/// Arguments for the `init` command
#[derive(Parser, Debug, Clone)]
pub struct InitArgs {
    /// Project mirrored by the flat file
    ///
    /// 1-64 letters, digits, '-' or '_'. Defaults to "main".
    #[arg(short, long)]
    pub project: Option<String>,

    /// Suppress output messages
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the `add` command
#[derive(Parser, Debug, Clone)]
pub struct AddArgs {
    /// Issue title
    #[arg(value_parser = parse_title)]
    pub title: String,

    /// Detailed description
    #[arg(short = 'D', long)]
    pub description: Option<String>,

    /// Priority (low, medium, high, critical)
    #[arg(short, long, value_parser = parse_priority, default_value = "medium")]
    pub priority: Priority,

    /// Initial status
    #[arg(short, long, value_parser = parse_status, default_value = "open")]
    pub status: IssueStatus,

    /// Assignee
    #[arg(short, long)]
    pub assignee: Option<String>,

    /// Author recorded on the issue (defaults to the configured author)
    #[arg(long)]
    pub author: Option<String>,

    /// Issues this one depends on (comma-separated numbers)
    #[arg(long, value_delimiter = ',', value_parser = parse_issue_number)]
    pub deps: Vec<IssueNumber>,
}

/// Arguments for the `list` command
#[derive(Parser, Debug, Clone)]
pub struct ListArgs {
    /// Filter by status
    #[arg(short, long, value_parser = parse_status)]
    pub status: Option<IssueStatus>,

    /// Filter by priority
    #[arg(short, long, value_parser = parse_priority)]
    pub priority: Option<Priority>,

    /// Filter by assignee
    #[arg(short, long)]
    pub assignee: Option<String>,
}

/// Arguments for the `status` command
#[derive(Parser, Debug, Clone)]
pub struct StatusArgs {
    /// Issue to update
    #[arg(value_parser = parse_issue_number)]
    pub issue: IssueNumber,

    /// New status (open, in_progress, blocked, completed)
    #[arg(value_parser = parse_status)]
    pub status: IssueStatus,
}

/// Arguments for the `delete` command
#[derive(Parser, Debug, Clone)]
pub struct DeleteArgs {
    /// Issue to delete
    #[arg(value_parser = parse_issue_number)]
    pub issue: IssueNumber,

    /// Delete even if other issues depend on it
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for the `ready` command
#[derive(Parser, Debug, Clone)]
pub struct ReadyArgs {
    /// Include completed issues
    #[arg(long)]
    pub all: bool,

    /// Filter by priority
    #[arg(short, long, value_parser = parse_priority)]
    pub priority: Option<Priority>,

    /// Filter by assignee
    #[arg(short, long)]
    pub assignee: Option<String>,
}

/// Arguments for the `blocked` command
#[derive(Parser, Debug, Clone)]
pub struct BlockedArgs {
    /// Filter by assignee
    #[arg(short, long)]
    pub assignee: Option<String>,
}

/// Arguments for the `dep` command
#[derive(Parser, Debug, Clone)]
pub struct DepArgs {
    /// Dependency action
    #[command(subcommand)]
    pub action: DepAction,
}

/// Dependency subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum DepAction {
    /// Make ISSUE depend on DEPENDS_ON
    Add {
        /// Issue that gains the dependency
        #[arg(value_parser = parse_issue_number)]
        issue: IssueNumber,

        /// Issue it depends on
        #[arg(value_parser = parse_issue_number)]
        depends_on: IssueNumber,
    },

    /// Remove a dependency (no-op if absent)
    Rm {
        /// Issue that loses the dependency
        #[arg(value_parser = parse_issue_number)]
        issue: IssueNumber,

        /// Issue it depended on
        #[arg(value_parser = parse_issue_number)]
        depends_on: IssueNumber,
    },
}

/// Arguments for the `rollback` command
#[derive(Parser, Debug, Clone)]
pub struct RollbackArgs {
    /// Version to roll back to (0 removes every migration)
    #[arg(long = "to")]
    pub target: u32,
}

/// Arguments for the `sync` command
#[derive(Parser, Debug, Clone)]
pub struct SyncArgs {
    /// Override the configured conflict policy (file-wins, store-wins, manual)
    #[arg(long, value_parser = parse_policy)]
    pub policy: Option<ConflictPolicy>,

    /// Exit with an error if conflicts remain
    #[arg(long)]
    pub strict: bool,
}
