//! Canonical issue records.
//!
//! A [`Record`] is the part of an issue the flat file can represent. Parsing,
//! export, hashing and diffing all work on records, so whitespace or ordering
//! differences in the file never show up as changes.

use crate::domain::{Issue, IssueNumber, IssueStatus, Priority};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// File-representable projection of an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Per-project number
    pub number: IssueNumber,
    /// Title, trimmed
    pub title: String,
    /// Status bucket
    pub status: IssueStatus,
    /// Priority
    pub priority: Priority,
    /// Assignee
    pub assigned_to: Option<String>,
    /// Creation date (informational, never diffed)
    pub created: Option<NaiveDate>,
    /// Numbers of the issues this one depends on, sorted and deduplicated
    pub dependencies: Vec<IssueNumber>,
    /// Description with edge blank lines and trailing whitespace removed
    pub description: Option<String>,
}

/// Fields compared by the three-way diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Title
    Title,
    /// Status
    Status,
    /// Priority
    Priority,
    /// Assignee
    AssignedTo,
    /// Description
    Description,
    /// Dependency numbers
    Dependencies,
}

impl Field {
    /// Every diffed field, in report order.
    pub const ALL: [Field; 6] = [
        Field::Title,
        Field::Status,
        Field::Priority,
        Field::AssignedTo,
        Field::Description,
        Field::Dependencies,
    ];

    /// Snake-case name used in reports and snapshots.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Status => "status",
            Self::Priority => "priority",
            Self::AssignedTo => "assigned_to",
            Self::Description => "description",
            Self::Dependencies => "dependencies",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Record {
    /// Project a stored issue, given the numbers of its dependencies.
    #[must_use]
    pub fn from_issue(issue: &Issue, dependencies: Vec<IssueNumber>) -> Self {
        let mut record = Self {
            number: issue.number,
            title: issue.title.trim().to_string(),
            status: issue.status,
            priority: issue.priority,
            assigned_to: issue.assigned_to.clone(),
            created: Some(issue.created_at.date_naive()),
            dependencies,
            description: issue.description.clone(),
        };
        record.normalize();
        record
    }

    /// Bring the record into canonical form.
    pub fn normalize(&mut self) {
        self.title = self.title.trim().to_string();
        self.dependencies.sort_unstable();
        self.dependencies.dedup();
        self.assigned_to = self
            .assigned_to
            .take()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        self.description = self.description.take().and_then(|d| normalize_description(&d));
    }

    /// Canonical string value of a field, used for hashing and conflict reports.
    #[must_use]
    pub fn value(&self, field: Field) -> String {
        match field {
            Field::Title => self.title.clone(),
            Field::Status => self.status.as_str().to_string(),
            Field::Priority => self.priority.as_str().to_string(),
            Field::AssignedTo => self.assigned_to.clone().unwrap_or_default(),
            Field::Description => self.description.clone().unwrap_or_default(),
            Field::Dependencies => self
                .dependencies
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Returns `true` if every diffed field is equal.
    #[must_use]
    pub fn same_content(&self, other: &Record) -> bool {
        Field::ALL.iter().all(|f| self.value(*f) == other.value(*f))
    }

    /// SHA-256 of one field's canonical value.
    #[must_use]
    pub fn field_hash(&self, field: Field) -> String {
        hash_hex(self.value(field).as_bytes())
    }

    /// SHA-256 over every diffed field.
    #[must_use]
    pub fn record_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for field in Field::ALL {
            hasher.update(field.as_str().as_bytes());
            hasher.update([0u8]);
            hasher.update(self.value(field).as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

pub(crate) fn hash_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Trim trailing whitespace per line and drop leading/trailing blank lines.
/// Returns `None` if nothing is left.
#[must_use]
pub fn normalize_description(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let start = lines.iter().position(|l| !l.is_empty())?;
    let end = lines.iter().rposition(|l| !l.is_empty())?;
    Some(lines[start..=end].join("\n"))
}
