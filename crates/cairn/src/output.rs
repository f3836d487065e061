//! Output formatting for CLI commands.
//!
//! Every printer comes in two layers: a `write_*` function that renders to any
//! [`Write`], and a `print_*` function that locks stdout and dispatches on
//! [`OutputMode`].

use crate::domain::{Issue, IssueNumber};
use crate::store::MigrationRecord;
use crate::sync::SyncReport;
use serde::Serialize;
use serde_json::json;
use std::io::{self, Write};

/// Output format mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-readable text format
    Text,
    /// JSON format for programmatic use
    Json,
}

/// An issue waiting on unfinished dependencies, by number.
pub type BlockedRow = (Issue, Vec<IssueNumber>);

fn join_numbers(numbers: &[IssueNumber]) -> String {
    numbers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Print a JSON-formatted result for any serializable value
pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(handle, "{json}")
}

/// Print a list of issues in the specified format
pub fn print_issues(issues: &[Issue], mode: OutputMode) -> io::Result<()> {
    match mode {
        OutputMode::Text => write_issues(&mut io::stdout().lock(), issues),
        OutputMode::Json => print_json(&issues),
    }
}

/// Print blocked issues with their blockers
pub fn print_blocked(blocked: &[BlockedRow], mode: OutputMode) -> io::Result<()> {
    match mode {
        OutputMode::Text => write_blocked(&mut io::stdout().lock(), blocked),
        OutputMode::Json => print_json(&blocked_json(blocked)),
    }
}

/// Print the outcome of a sync pass
pub fn print_report(report: &SyncReport, mode: OutputMode) -> io::Result<()> {
    match mode {
        OutputMode::Text => write_report(&mut io::stdout().lock(), report),
        OutputMode::Json => print_json(&report_json(report)),
    }
}

/// Print applied migrations
pub fn print_history(history: &[MigrationRecord], mode: OutputMode) -> io::Result<()> {
    match mode {
        OutputMode::Text => write_history(&mut io::stdout().lock(), history),
        OutputMode::Json => print_json(&history_json(history)),
    }
}

/// Render issues one per line.
pub fn write_issues<W: Write>(w: &mut W, issues: &[Issue]) -> io::Result<()> {
    if issues.is_empty() {
        return writeln!(w, "No issues found.");
    }

    writeln!(w, "Found {} issue(s):", issues.len())?;
    writeln!(w)?;
    for issue in issues {
        write!(
            w,
            "{:>5}  {:<11}  {:<8}  {}",
            issue.number.to_string(),
            issue.status.as_str(),
            issue.priority.as_str(),
            issue.title
        )?;
        if let Some(assignee) = &issue.assigned_to {
            write!(w, "  @{assignee}")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// Render blocked issues followed by what they wait on.
pub fn write_blocked<W: Write>(w: &mut W, blocked: &[BlockedRow]) -> io::Result<()> {
    if blocked.is_empty() {
        return writeln!(w, "No blocked issues.");
    }

    writeln!(w, "{} blocked issue(s):", blocked.len())?;
    writeln!(w)?;
    for (issue, blockers) in blocked {
        writeln!(w, "{:>5}  {}", issue.number.to_string(), issue.title)?;
        writeln!(w, "       waiting on {}", join_numbers(blockers))?;
    }
    Ok(())
}

fn blocked_json(blocked: &[BlockedRow]) -> serde_json::Value {
    let rows: Vec<_> = blocked
        .iter()
        .map(|(issue, blockers)| {
            json!({
                "issue": issue,
                "blocked_by": blockers.iter().map(|n| n.0).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!(rows)
}

/// Render a sync report as a short summary plus any problems.
pub fn write_report<W: Write>(w: &mut W, report: &SyncReport) -> io::Result<()> {
    if report.is_noop() {
        return writeln!(w, "Already in sync.");
    }

    writeln!(
        w,
        "Synced: {} created, {} updated, {} deleted{}",
        report.created.len(),
        report.updated.len(),
        report.deleted.len(),
        if report.exported { ", file rewritten" } else { "" }
    )?;

    for error in &report.parse_errors {
        writeln!(w, "  parse error: {error}")?;
    }
    for edge in &report.rejected {
        writeln!(
            w,
            "  rejected dependency {} -> {}: {}",
            edge.issue, edge.depends_on, edge.reason
        )?;
    }
    if !report.conflicts.is_empty() {
        writeln!(w, "{} conflict(s) need manual resolution:", report.conflicts.len())?;
        for conflict in &report.conflicts {
            writeln!(
                w,
                "  {} {}: file {:?}, store {:?}",
                conflict.issue,
                conflict.field.as_str(),
                conflict.file_value,
                conflict.store_value
            )?;
        }
    }
    Ok(())
}

fn report_json(report: &SyncReport) -> serde_json::Value {
    let numbers = |list: &[IssueNumber]| list.iter().map(|n| n.0).collect::<Vec<_>>();
    json!({
        "created": numbers(&report.created),
        "updated": numbers(&report.updated),
        "deleted": numbers(&report.deleted),
        "exported": report.exported,
        "snapshot_written": report.snapshot_written,
        "conflicts": report.conflicts,
        "rejected": report.rejected,
        "parse_errors": report
            .parse_errors
            .iter()
            .map(|e| json!({ "line": e.line, "issue": e.number.map(|n| n.0), "message": e.message }))
            .collect::<Vec<_>>(),
    })
}

/// Render the migration history table.
pub fn write_history<W: Write>(w: &mut W, history: &[MigrationRecord]) -> io::Result<()> {
    if history.is_empty() {
        return writeln!(w, "No migrations applied.");
    }

    for record in history {
        writeln!(
            w,
            "{:>4}  {}  {:>6}ms  {}",
            record.version,
            record.applied_at.format("%Y-%m-%d %H:%M:%S"),
            record.duration.as_millis(),
            record.description
        )?;
    }
    Ok(())
}

fn history_json(history: &[MigrationRecord]) -> serde_json::Value {
    json!(history
        .iter()
        .map(|r| json!({
            "version": r.version,
            "description": r.description,
            "checksum": r.checksum,
            "applied_at": r.applied_at,
            "duration_ms": r.duration.as_millis(),
        }))
        .collect::<Vec<_>>())
}
