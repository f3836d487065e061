//! Issue and dependency rows.
//!
//! Plain functions over a borrowed [`Connection`], so callers decide the
//! transaction boundary: the graph engine wraps a single insert, the sync
//! engine wraps a whole reconciliation pass.

use crate::domain::{
    Issue, IssueFilter, IssueId, IssueNumber, IssueStatus, IssueUpdate, NewIssue, ProjectId,
    validate_assignee, validate_title,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

const ISSUE_COLUMNS: &str = "id, project_id, issue_number, title, description, status, priority, \
     created_by, assigned_to, created_at, updated_at, completed_at";

/// Parse an RFC 3339 column value.
pub(crate) fn parse_timestamp(index: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_column<T>(index: usize, value: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    value.parse().map_err(|e: Error| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_issue(row: &Row<'_>) -> rusqlite::Result<Issue> {
    let status: String = row.get(5)?;
    let priority: String = row.get(6)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    let completed_at: Option<String> = row.get(11)?;

    Ok(Issue {
        id: IssueId(row.get(0)?),
        project_id: ProjectId(row.get(1)?),
        number: IssueNumber(row.get(2)?),
        title: row.get(3)?,
        description: row.get(4)?,
        status: parse_column(5, &status)?,
        priority: parse_column(6, &priority)?,
        created_by: row.get(7)?,
        assigned_to: row.get(8)?,
        created_at: parse_timestamp(9, &created_at)?,
        updated_at: parse_timestamp(10, &updated_at)?,
        completed_at: completed_at
            .map(|value| parse_timestamp(11, &value))
            .transpose()?,
    })
}

/// Insert a new issue and return it.
///
/// Without an explicit number the issue gets one past the project's highest.
///
/// # Errors
///
/// - `Error::Validation` for invalid input or an explicit number already in use
/// - Database errors
pub fn create_issue(conn: &Connection, new: NewIssue) -> Result<Issue> {
    new.validate()?;

    let number = match new.number {
        Some(number) => {
            if get_issue_by_number(conn, &new.project_id, number)?.is_some() {
                return Err(Error::Validation(format!(
                    "issue {number} already exists in project {}",
                    new.project_id
                )));
            }
            number
        }
        None => next_number(conn, &new.project_id)?,
    };

    let now = Utc::now();
    let created_at = new.created_at.unwrap_or(now);
    let completed_at = (new.status == IssueStatus::Completed).then_some(now);
    conn.execute(
        "INSERT INTO issues (project_id, issue_number, title, description, status, priority,
                             created_by, assigned_to, created_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            new.project_id.as_str(),
            number.0,
            new.title.trim(),
            new.description,
            new.status.as_str(),
            new.priority.as_str(),
            new.created_by,
            new.assigned_to,
            created_at.to_rfc3339(),
            now.to_rfc3339(),
            completed_at.map(|t| t.to_rfc3339()),
        ],
    )?;

    let id = IssueId(conn.last_insert_rowid());
    tracing::debug!(%id, %number, project = %new.project_id, "Created issue");
    require_issue(conn, id)
}

fn next_number(conn: &Connection, project: &ProjectId) -> Result<IssueNumber> {
    let max: u32 = conn.query_row(
        "SELECT COALESCE(MAX(issue_number), 0) FROM issues WHERE project_id = ?1",
        [project.as_str()],
        |row| row.get(0),
    )?;
    Ok(IssueNumber(max + 1))
}

/// Fetch an issue by id.
///
/// # Errors
///
/// Returns database errors.
pub fn get_issue(conn: &Connection, id: IssueId) -> Result<Option<Issue>> {
    let sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1");
    conn.query_row(&sql, [id.0], row_to_issue)
        .optional()
        .map_err(Error::from)
}

/// Fetch an issue by id, failing if it does not exist.
///
/// # Errors
///
/// Returns `Error::NotFound` for an unknown id.
pub fn require_issue(conn: &Connection, id: IssueId) -> Result<Issue> {
    get_issue(conn, id)?.ok_or_else(|| Error::NotFound(format!("issue {id}")))
}

/// Fetch an issue by its per-project number.
///
/// # Errors
///
/// Returns database errors.
pub fn get_issue_by_number(
    conn: &Connection,
    project: &ProjectId,
    number: IssueNumber,
) -> Result<Option<Issue>> {
    let sql =
        format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE project_id = ?1 AND issue_number = ?2");
    conn.query_row(&sql, params![project.as_str(), number.0], row_to_issue)
        .optional()
        .map_err(Error::from)
}

/// Apply a partial update and return the updated issue.
///
/// `completed_at` is set when the status moves to completed and cleared when
/// it moves away from completed.
///
/// # Errors
///
/// - `Error::NotFound` for an unknown id
/// - `Error::Validation` for an invalid title
pub fn update_issue(conn: &Connection, id: IssueId, update: &IssueUpdate) -> Result<Issue> {
    let mut issue = require_issue(conn, id)?;
    if update.is_empty() {
        return Ok(issue);
    }

    if let Some(title) = &update.title {
        validate_title(title)?;
        issue.title = title.trim().to_string();
    }
    if let Some(description) = &update.description {
        issue.description.clone_from(description);
    }
    if let Some(priority) = update.priority {
        issue.priority = priority;
    }
    if let Some(assigned_to) = &update.assigned_to {
        if let Some(assignee) = assigned_to {
            validate_assignee(assignee)?;
        }
        issue.assigned_to.clone_from(assigned_to);
    }

    let now = Utc::now();
    if let Some(status) = update.status {
        if status == IssueStatus::Completed && issue.status != IssueStatus::Completed {
            issue.completed_at = Some(now);
        } else if status != IssueStatus::Completed {
            issue.completed_at = None;
        }
        issue.status = status;
    }
    issue.updated_at = now;

    conn.execute(
        "UPDATE issues SET title = ?2, description = ?3, status = ?4, priority = ?5,
                           assigned_to = ?6, updated_at = ?7, completed_at = ?8
         WHERE id = ?1",
        params![
            id.0,
            issue.title,
            issue.description,
            issue.status.as_str(),
            issue.priority.as_str(),
            issue.assigned_to,
            issue.updated_at.to_rfc3339(),
            issue.completed_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(issue)
}

/// Delete an issue; its dependency rows cascade.
///
/// Returns `false` if the issue did not exist.
///
/// # Errors
///
/// Returns database errors.
pub fn delete_issue(conn: &Connection, id: IssueId) -> Result<bool> {
    let removed = conn.execute("DELETE FROM issues WHERE id = ?1", [id.0])?;
    Ok(removed > 0)
}

/// List issues matching a filter, ordered by project then number.
///
/// # Errors
///
/// Returns database errors.
pub fn list_issues(conn: &Connection, filter: &IssueFilter) -> Result<Vec<Issue>> {
    let issues = match &filter.project_id {
        Some(project) => {
            let sql = format!(
                "SELECT {ISSUE_COLUMNS} FROM issues WHERE project_id = ?1 ORDER BY issue_number"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([project.as_str()], row_to_issue)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
        None => {
            let sql =
                format!("SELECT {ISSUE_COLUMNS} FROM issues ORDER BY project_id, issue_number");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_issue)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
    };
    Ok(issues.into_iter().filter(|i| filter.matches(i)).collect())
}

/// Current status of every issue in a project.
///
/// # Errors
///
/// Returns database errors.
pub fn statuses(conn: &Connection, project: &ProjectId) -> Result<HashMap<IssueId, IssueStatus>> {
    let mut stmt = conn.prepare("SELECT id, status FROM issues WHERE project_id = ?1")?;
    let rows = stmt.query_map([project.as_str()], |row| {
        let status: String = row.get(1)?;
        Ok((IssueId(row.get(0)?), parse_column(1, &status)?))
    })?;
    rows.collect::<rusqlite::Result<HashMap<_, _>>>()
        .map_err(Error::from)
}

/// Insert a dependency edge. Returns `false` if it already existed.
///
/// Acyclicity is not checked here; see [`crate::graph`].
///
/// # Errors
///
/// Returns database errors, including foreign key failures for unknown issues.
pub fn insert_dependency(conn: &Connection, issue: IssueId, depends_on: IssueId) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO dependencies (issue_id, depends_on_id, created_at)
         VALUES (?1, ?2, ?3)",
        params![issue.0, depends_on.0, Utc::now().to_rfc3339()],
    )?;
    Ok(inserted > 0)
}

/// Delete a dependency edge. Returns `false` if it did not exist.
///
/// # Errors
///
/// Returns database errors.
pub fn delete_dependency(conn: &Connection, issue: IssueId, depends_on: IssueId) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM dependencies WHERE issue_id = ?1 AND depends_on_id = ?2",
        params![issue.0, depends_on.0],
    )?;
    Ok(removed > 0)
}

/// Every dependency edge in the store, tagged with the owning project.
///
/// # Errors
///
/// Returns database errors.
pub fn list_dependency_edges(conn: &Connection) -> Result<Vec<(ProjectId, IssueId, IssueId)>> {
    let mut stmt = conn.prepare(
        "SELECT i.project_id, d.issue_id, d.depends_on_id
         FROM dependencies d JOIN issues i ON i.id = d.issue_id
         ORDER BY d.issue_id, d.depends_on_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            ProjectId(row.get(0)?),
            IssueId(row.get(1)?),
            IssueId(row.get(2)?),
        ))
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::from)
}

/// Dependency edges `(issue, depends_on)` within one project.
///
/// # Errors
///
/// Returns database errors.
pub fn project_edges(conn: &Connection, project: &ProjectId) -> Result<Vec<(IssueId, IssueId)>> {
    let mut stmt = conn.prepare(
        "SELECT d.issue_id, d.depends_on_id
         FROM dependencies d JOIN issues i ON i.id = d.issue_id
         WHERE i.project_id = ?1
         ORDER BY d.issue_id, d.depends_on_id",
    )?;
    let rows = stmt.query_map([project.as_str()], |row| {
        Ok((IssueId(row.get(0)?), IssueId(row.get(1)?)))
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::from)
}

/// Direct dependencies of an issue, ordered by id.
///
/// # Errors
///
/// Returns database errors.
pub fn dependencies_of(conn: &Connection, issue: IssueId) -> Result<Vec<IssueId>> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_id FROM dependencies WHERE issue_id = ?1 ORDER BY depends_on_id",
    )?;
    let rows = stmt.query_map([issue.0], |row| Ok(IssueId(row.get(0)?)))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::from)
}
