//! Deterministic Markdown export.
//!
//! Records are grouped by status bucket (open, in progress, blocked,
//! completed), then ordered by priority with critical first, then by number.
//! Empty buckets are omitted. Description lines that would read back as
//! metadata are escaped with a leading `\`. For any file this module writes,
//! `export(parse(file)) == file`.

use super::parse::needs_escape;
use super::record::Record;
use crate::domain::IssueStatus;
use std::cmp::Reverse;
use std::fmt::Write;

/// Render records as the canonical flat file.
#[must_use]
pub fn export(project: &str, records: &[Record]) -> String {
    let mut sorted: Vec<&Record> = records.iter().collect();
    sorted.sort_by_key(|r| (r.status.bucket_rank(), Reverse(r.priority), r.number));

    let mut out = String::new();
    let _ = writeln!(out, "# {project}");

    for status in IssueStatus::BUCKETS {
        let mut bucket = sorted.iter().filter(|r| r.status == status).peekable();
        if bucket.peek().is_none() {
            continue;
        }
        let _ = write!(out, "\n## {}\n", status.heading());
        for record in bucket {
            write_record(&mut out, record);
        }
    }

    out
}

fn write_record(out: &mut String, record: &Record) {
    let checkbox = if record.status == IssueStatus::Completed {
        "[x]"
    } else {
        "[ ]"
    };
    let _ = write!(out, "\n- {checkbox} #{}: {}\n", record.number.0, record.title);
    let _ = writeln!(out, "  **Priority**: {}", record.priority);
    if let Some(assignee) = &record.assigned_to {
        let _ = writeln!(out, "  **Assigned**: {assignee}");
    }
    if let Some(created) = record.created {
        let _ = writeln!(out, "  **Created**: {}", created.format("%Y-%m-%d"));
    }
    if !record.dependencies.is_empty() {
        let deps: Vec<String> = record.dependencies.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "  **Dependencies**: {}", deps.join(", "));
    }
    if let Some(description) = &record.description {
        for line in description.lines() {
            if line.is_empty() {
                out.push('\n');
            } else if needs_escape(line) {
                let content = line.trim_start();
                let indent = &line[..line.len() - content.len()];
                let _ = writeln!(out, "  {indent}\\{content}");
            } else {
                let _ = writeln!(out, "  {line}");
            }
        }
    }
}
