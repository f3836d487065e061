//! Domain types for the cairn issue store.
//!
//! This module contains the core domain types shared by the store, the
//! dependency graph and the sync engine.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Global surrogate identifier of an issue (the store's row id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueId(pub i64);

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-project issue number, as shown in the flat file (`#12`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueNumber(pub u32);

impl fmt::Display for IssueNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of the project an issue belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl ProjectId {
    /// Create a new project ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the project ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Status of an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    /// Issue is open and not started
    Open,

    /// Issue is currently being worked on
    InProgress,

    /// Issue has been flagged as blocked by a person
    Blocked,

    /// Issue has been completed
    Completed,
}

impl IssueStatus {
    /// All statuses in flat-file bucket order.
    pub const BUCKETS: [IssueStatus; 4] = [
        IssueStatus::Open,
        IssueStatus::InProgress,
        IssueStatus::Blocked,
        IssueStatus::Completed,
    ];

    /// The value stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
        }
    }

    /// Position of the status bucket in exported files.
    #[must_use]
    pub fn bucket_rank(self) -> usize {
        match self {
            Self::Open => 0,
            Self::InProgress => 1,
            Self::Blocked => 2,
            Self::Completed => 3,
        }
    }

    /// Section heading used in the flat file.
    #[must_use]
    pub fn heading(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::InProgress => "In Progress",
            Self::Blocked => "Blocked",
            Self::Completed => "Completed",
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "completed" | "done" => Ok(Self::Completed),
            other => Err(Error::Validation(format!("unknown status '{other}'"))),
        }
    }
}

/// Priority of an issue. Ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Can wait
    Low,

    /// Default priority
    #[default]
    Medium,

    /// Should be picked up soon
    High,

    /// Drop everything
    Critical,
}

impl Priority {
    /// The value stored in the database and written to the flat file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(Error::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// An issue as held by the structured store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Global surrogate id
    pub id: IssueId,

    /// Owning project
    pub project_id: ProjectId,

    /// Number unique within the project
    pub number: IssueNumber,

    /// Issue title (never empty)
    pub title: String,

    /// Free-form description
    pub description: Option<String>,

    /// Current status
    pub status: IssueStatus,

    /// Priority level
    pub priority: Priority,

    /// Author of the issue
    pub created_by: String,

    /// Assignee (optional)
    pub assigned_to: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Set when the issue transitions to completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// Data for creating a new issue
#[derive(Debug, Clone)]
pub struct NewIssue {
    /// Owning project
    pub project_id: ProjectId,

    /// Explicit issue number; the next free number is used when `None`
    pub number: Option<IssueNumber>,

    /// Issue title
    pub title: String,

    /// Description (optional)
    pub description: Option<String>,

    /// Initial status
    pub status: IssueStatus,

    /// Priority level
    pub priority: Priority,

    /// Author
    pub created_by: String,

    /// Assignee (optional)
    pub assigned_to: Option<String>,

    /// Creation time to record instead of now, for imported issues
    pub created_at: Option<DateTime<Utc>>,
}

impl NewIssue {
    /// An open, medium-priority issue with the given title.
    pub fn new(project_id: ProjectId, title: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            project_id,
            number: None,
            title: title.into(),
            description: None,
            status: IssueStatus::Open,
            priority: Priority::default(),
            created_by: created_by.into(),
            assigned_to: None,
            created_at: None,
        }
    }

    /// Validate the new issue data.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` when the title is blank, the project id is
    /// empty or the explicit issue number is zero.
    pub fn validate(&self) -> Result<()> {
        validate_title(&self.title)?;
        if self.project_id.as_str().trim().is_empty() {
            return Err(Error::Validation("project id cannot be empty".to_string()));
        }
        if self.created_by.trim().is_empty() {
            return Err(Error::Validation("created_by cannot be empty".to_string()));
        }
        if matches!(self.number, Some(IssueNumber(0))) {
            return Err(Error::Validation("issue numbers start at 1".to_string()));
        }
        if let Some(assignee) = &self.assigned_to {
            validate_assignee(assignee)?;
        }
        Ok(())
    }
}

/// Data for updating an existing issue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueUpdate {
    /// New title (if updating)
    pub title: Option<String>,

    /// New description (if updating, `Some(None)` to clear)
    pub description: Option<Option<String>>,

    /// New status (if updating)
    pub status: Option<IssueStatus>,

    /// New priority (if updating)
    pub priority: Option<Priority>,

    /// New assignee (if updating, `Some(None)` to clear)
    pub assigned_to: Option<Option<String>>,
}

impl IssueUpdate {
    /// Returns `true` if the update touches no field.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Filter for querying issues
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    /// Restrict to one project
    pub project_id: Option<ProjectId>,

    /// Filter by status
    pub status: Option<IssueStatus>,

    /// Filter by priority
    pub priority: Option<Priority>,

    /// Filter by assignee
    pub assigned_to: Option<String>,
}

impl IssueFilter {
    /// Filter matching every issue of a project.
    #[must_use]
    pub fn project(project_id: ProjectId) -> Self {
        Self {
            project_id: Some(project_id),
            ..Self::default()
        }
    }

    /// Returns `true` if the issue satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, issue: &Issue) -> bool {
        self.project_id.as_ref().is_none_or(|p| *p == issue.project_id)
            && self.status.is_none_or(|s| s == issue.status)
            && self.priority.is_none_or(|p| p == issue.priority)
            && self
                .assigned_to
                .as_deref()
                .is_none_or(|a| issue.assigned_to.as_deref() == Some(a))
    }
}

/// An issue that cannot be worked on yet, with its unfinished direct dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedIssue {
    /// The blocked issue
    pub issue: Issue,

    /// Direct dependencies that are not completed
    pub blockers: Vec<IssueId>,
}

/// Validate an issue title.
///
/// # Errors
///
/// Returns `Error::Validation` if the title is empty after trimming or spans
/// several lines.
pub fn validate_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(Error::Validation("title cannot be empty".to_string()));
    }
    if title.contains(['\n', '\r']) {
        return Err(Error::Validation("title must be a single line".to_string()));
    }
    Ok(())
}

/// Check that an assignee fits on one metadata line.
///
/// # Errors
///
/// Returns `Error::Validation` if the assignee contains a line break.
pub fn validate_assignee(assignee: &str) -> Result<()> {
    if assignee.contains(['\n', '\r']) {
        return Err(Error::Validation("assignee must be a single line".to_string()));
    }
    Ok(())
}
