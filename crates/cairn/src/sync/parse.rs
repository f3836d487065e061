//! Tolerant parser for the Markdown issue file.
//!
//! ```text
//! # core
//!
//! ## In Progress
//!
//! - [ ] #4: Wire up the exporter
//!   **Priority**: high
//!   **Dependencies**: #2, #3
//!   Free-form description lines.
//! ```
//!
//! - `##` headers pick the status bucket for the items below them
//! - an item starts at column 0 with `-` or `*`, a checkbox, and `#<n>: title`
//! - indented `**Key**: value` lines carry metadata; keys are case-insensitive
//!   and may come in any order
//! - every other indented line belongs to the description; one that would
//!   read as metadata is written with a leading `\` (`\**Priority**: high`)
//!
//! A malformed block produces a [`ParseError`] and is reported in
//! [`ParsedFile::failed_numbers`] when its number could be read. Parsing
//! always continues with the next block.

use super::record::Record;
use crate::domain::{IssueNumber, IssueStatus, Priority};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use thiserror::Error;

/// A problem with one block of the flat file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    /// 1-based line number where the block (or offending line) starts
    pub line: usize,
    /// Issue number, if it could be read
    pub number: Option<IssueNumber>,
    /// What was wrong
    pub message: String,
}

/// Result of parsing a flat file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFile {
    /// Text of the top-level `#` heading, if present
    pub title: Option<String>,
    /// Records that parsed cleanly, in file order
    pub records: Vec<Record>,
    /// One entry per malformed block
    pub errors: Vec<ParseError>,
    /// Numbers of blocks that failed to parse
    pub failed_numbers: BTreeSet<IssueNumber>,
}

impl ParsedFile {
    /// Returns `true` if every block parsed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug)]
struct Block {
    line: usize,
    number: Option<IssueNumber>,
    checked: bool,
    title: String,
    section: Option<IssueStatus>,
    priority: Option<Priority>,
    assigned_to: Option<String>,
    created: Option<NaiveDate>,
    dependencies: Vec<IssueNumber>,
    description: Vec<String>,
    error: Option<String>,
}

impl Block {
    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }

    fn into_record(self) -> Result<Record, ParseError> {
        let number = self.number;
        let error = |message: String| ParseError {
            line: self.line,
            number,
            message,
        };
        if let Some(message) = self.error.clone() {
            return Err(error(message));
        }
        let Some(number) = number else {
            return Err(error("missing issue number".to_string()));
        };

        let status = if self.checked {
            IssueStatus::Completed
        } else {
            match self.section {
                Some(IssueStatus::Completed) | None => IssueStatus::Open,
                Some(status) => status,
            }
        };

        let mut record = Record {
            number,
            title: self.title,
            status,
            priority: self.priority.unwrap_or_default(),
            assigned_to: self.assigned_to,
            created: self.created,
            dependencies: self.dependencies,
            description: Some(self.description.join("\n")),
        };
        record.normalize();
        Ok(record)
    }
}

/// Parse the flat file.
#[must_use]
pub fn parse(text: &str) -> ParsedFile {
    let mut parsed = ParsedFile::default();
    let mut section: Option<IssueStatus> = None;
    let mut current: Option<Block> = None;
    let mut seen: BTreeSet<IssueNumber> = BTreeSet::new();

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;

        if let Some(heading) = line.strip_prefix("##") {
            finish(&mut parsed, &mut seen, current.take());
            let heading = heading.trim_start_matches('#').trim();
            section = match heading.parse::<IssueStatus>() {
                Ok(status) => Some(status),
                Err(_) => {
                    tracing::warn!(line = line_no, heading, "Unknown section heading; items default to open");
                    None
                }
            };
            continue;
        }

        if let Some(title) = line.strip_prefix("# ") {
            finish(&mut parsed, &mut seen, current.take());
            parsed.title = Some(title.trim().to_string());
            continue;
        }

        if let Some(item) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            finish(&mut parsed, &mut seen, current.take());
            current = Some(parse_item(item, line_no, section));
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        if line.trim().is_empty() || indented {
            if let Some(block) = current.as_mut() {
                parse_body_line(block, line, line_no);
            }
            continue;
        }

        match current.as_mut() {
            Some(block) => block.fail(format!(
                "unindented text on line {line_no}; indent description lines"
            )),
            None => tracing::warn!(line = line_no, "Ignoring text outside any item"),
        }
    }
    finish(&mut parsed, &mut seen, current.take());

    // A duplicated number poisons every block carrying it.
    let failed = parsed.failed_numbers.clone();
    parsed.records.retain(|r| !failed.contains(&r.number));
    parsed
}

fn finish(parsed: &mut ParsedFile, seen: &mut BTreeSet<IssueNumber>, block: Option<Block>) {
    let Some(block) = block else {
        return;
    };
    let line = block.line;
    match block.into_record() {
        Ok(record) => {
            if seen.insert(record.number) {
                parsed.records.push(record);
            } else {
                parsed.failed_numbers.insert(record.number);
                parsed.errors.push(ParseError {
                    line,
                    number: Some(record.number),
                    message: format!("duplicate issue number {}", record.number),
                });
            }
        }
        Err(error) => {
            if let Some(number) = error.number {
                seen.insert(number);
                parsed.failed_numbers.insert(number);
            }
            tracing::warn!(line = error.line, error = %error.message, "Failed to parse issue block");
            parsed.errors.push(error);
        }
    }
}

fn parse_item(item: &str, line: usize, section: Option<IssueStatus>) -> Block {
    let mut block = Block {
        line,
        number: None,
        checked: false,
        title: String::new(),
        section,
        priority: None,
        assigned_to: None,
        created: None,
        dependencies: Vec::new(),
        description: Vec::new(),
        error: None,
    };

    let item = item.trim_start();
    let rest = if let Some(rest) = item.strip_prefix("[ ]") {
        rest
    } else if let Some(rest) = item.strip_prefix("[x]").or_else(|| item.strip_prefix("[X]")) {
        block.checked = true;
        rest
    } else {
        block.fail("expected a checkbox '[ ]' or '[x]'".to_string());
        return block;
    };

    let Some(rest) = rest.trim_start().strip_prefix('#') else {
        block.fail("expected '#<number>: <title>' after the checkbox".to_string());
        return block;
    };
    let Some((digits, title)) = rest.split_once(':') else {
        block.fail("expected ':' after the issue number".to_string());
        return block;
    };
    match digits.trim().parse::<u32>() {
        Ok(0) => block.fail("issue numbers start at 1".to_string()),
        Ok(n) => block.number = Some(IssueNumber(n)),
        Err(_) => {
            block.fail(format!("invalid issue number '{}'", digits.trim()));
            return block;
        }
    }

    let title = title.trim();
    if title.is_empty() {
        block.fail("title cannot be empty".to_string());
    }
    block.title = title.to_string();
    block
}

fn parse_body_line(block: &mut Block, line: &str, line_no: usize) {
    if line.trim().is_empty() {
        block.description.push(String::new());
        return;
    }

    if let Some((key, value)) = split_metadata(line.trim()) {
        apply_metadata(block, &key, value, line_no);
        return;
    }

    let text = line
        .strip_prefix("  ")
        .or_else(|| line.strip_prefix('\t'))
        .unwrap_or_else(|| line.trim_start());
    block.description.push(unescape_description(text.trim_end()));
}

/// Returns `true` if a description line would be read back as metadata, or
/// as an escaped line, unless written with a leading `\`.
pub(crate) fn needs_escape(line: &str) -> bool {
    let content = line.trim();
    split_metadata(content).is_some() || content.strip_prefix('\\').is_some_and(needs_escape)
}

fn unescape_description(line: &str) -> String {
    let content = line.trim_start();
    let indent = &line[..line.len() - content.len()];
    match content.strip_prefix('\\') {
        Some(rest) if needs_escape(rest) => format!("{indent}{rest}"),
        _ => line.to_string(),
    }
}

/// Split `**Key**: value` or `**Key:** value` into a lowercase key and value.
fn split_metadata(content: &str) -> Option<(String, &str)> {
    let inner = content.strip_prefix("**")?;
    let end = inner.find("**")?;
    let key = &inner[..end];
    let after = &inner[end + 2..];

    let (key, value) = if let Some(key) = key.strip_suffix(':') {
        (key, after)
    } else {
        (key, after.trim_start().strip_prefix(':')?)
    };

    let key = key.split_whitespace().collect::<Vec<_>>().join(" ");
    if key.is_empty() {
        return None;
    }
    Some((key.to_ascii_lowercase(), value.trim()))
}

fn apply_metadata(block: &mut Block, key: &str, value: &str, line_no: usize) {
    match key {
        "priority" => match value.parse::<Priority>() {
            Ok(priority) => block.priority = Some(priority),
            Err(_) => block.fail(format!("invalid priority '{value}'")),
        },
        "assigned" | "assigned to" | "assignee" => {
            block.assigned_to = (!value.is_empty()).then(|| value.to_string());
        }
        "created" => {
            if value.is_empty() {
                block.created = None;
            } else {
                match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
                    Ok(date) => block.created = Some(date),
                    Err(_) => block.fail(format!(
                        "invalid created date '{value}', expected YYYY-MM-DD"
                    )),
                }
            }
        }
        "dependencies" | "depends on" => match parse_dependencies(value) {
            Ok(deps) => block.dependencies = deps,
            Err(token) => block.fail(format!("invalid dependency '{token}'")),
        },
        other => {
            tracing::warn!(line = line_no, key = other, "Ignoring unknown metadata key");
        }
    }
}

fn parse_dependencies(value: &str) -> Result<Vec<IssueNumber>, String> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        return Ok(Vec::new());
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            let digits = token.strip_prefix('#').unwrap_or(token).trim();
            match digits.parse::<u32>() {
                Ok(n) if n > 0 => Ok(IssueNumber(n)),
                _ => Err(token.to_string()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SAMPLE: &str = "\
# core

## Open

- [ ] #1: Write parser
  **Priority**: high
  **Assigned**: alice
  **Created**: 2026-10-19
  **Dependencies**: #2, #3
  Handle every block shape.

  Second paragraph.

## In Progress

- [ ] #2: Export
  **priority:** low

## Completed

- [x] #3: Schema
- [ ] #4: Reopened
";

    #[test]
    fn test_parses_sections_and_metadata() {
        let parsed = parse(SAMPLE);
        assert!(parsed.is_clean(), "{:?}", parsed.errors);
        assert_eq!(parsed.title.as_deref(), Some("core"));
        assert_eq!(parsed.records.len(), 4);

        let first = &parsed.records[0];
        assert_eq!(first.number, IssueNumber(1));
        assert_eq!(first.title, "Write parser");
        assert_eq!(first.status, IssueStatus::Open);
        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.assigned_to.as_deref(), Some("alice"));
        assert_eq!(first.created, NaiveDate::from_ymd_opt(2026, 10, 19));
        assert_eq!(first.dependencies, vec![IssueNumber(2), IssueNumber(3)]);
        assert_eq!(
            first.description.as_deref(),
            Some("Handle every block shape.\n\nSecond paragraph.")
        );

        assert_eq!(parsed.records[1].status, IssueStatus::InProgress);
        assert_eq!(parsed.records[1].priority, Priority::Low);
        assert_eq!(parsed.records[2].status, IssueStatus::Completed);
        assert_eq!(parsed.records[3].status, IssueStatus::Open);
    }

    #[test]
    fn test_metadata_keys_are_tolerant() {
        let text = "- [ ] #7: Title\n    **DEPENDS ON** :  1 ,#2\n  **Assigned  To**: bob\n  **Mood**: sunny\n";
        let parsed = parse(text);
        assert!(parsed.is_clean(), "{:?}", parsed.errors);
        let record = &parsed.records[0];
        assert_eq!(record.dependencies, vec![IssueNumber(1), IssueNumber(2)]);
        assert_eq!(record.assigned_to.as_deref(), Some("bob"));
        assert_eq!(record.priority, Priority::Medium);
        assert_eq!(record.description, None);
    }

    #[rstest]
    #[case::no_checkbox("- #1: Title\n", None)]
    #[case::no_number("- [ ] Title\n", None)]
    #[case::zero("- [ ] #0: Title\n", None)]
    #[case::empty_title("- [ ] #5:   \n", Some(5))]
    #[case::bad_priority("- [ ] #5: T\n  **Priority**: urgent\n", Some(5))]
    #[case::bad_date("- [ ] #5: T\n  **Created**: yesterday\n", Some(5))]
    #[case::bad_dependency("- [ ] #5: T\n  **Dependencies**: #x\n", Some(5))]
    fn test_malformed_block_reports_error(#[case] block: &str, #[case] failed: Option<u32>) {
        let text = format!("## Open\n\n{block}\n- [ ] #9: Fine\n");
        let parsed = parse(&text);
        assert_eq!(parsed.errors.len(), 1, "{:?}", parsed.errors);
        assert_eq!(parsed.errors[0].line, 3);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].number, IssueNumber(9));
        assert_eq!(
            parsed.failed_numbers.iter().next().copied(),
            failed.map(IssueNumber)
        );
    }

    #[test]
    fn test_duplicate_numbers_fail_every_copy() {
        let parsed = parse("- [ ] #1: A\n- [ ] #1: B\n- [ ] #2: C\n");
        assert_eq!(parsed.errors.len(), 1);
        assert!(parsed.failed_numbers.contains(&IssueNumber(1)));
        let numbers: Vec<_> = parsed.records.iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![IssueNumber(2)]);
    }

    #[test]
    fn test_unindented_text_inside_item_fails_block() {
        let parsed = parse("- [ ] #1: A\nstray text\n");
        assert_eq!(parsed.errors.len(), 1);
        assert!(parsed.failed_numbers.contains(&IssueNumber(1)));
        assert!(parsed.records.is_empty());
    }

    #[rstest]
    #[case::metadata("  \\**Priority**: critical", "**Priority**: critical")]
    #[case::escaped_twice("  \\\\**Assigned**: bob", "\\**Assigned**: bob")]
    #[case::indented("     \\**Dependencies**: #1", "   **Dependencies**: #1")]
    #[case::plain_backslash("  \\n is a newline", "\\n is a newline")]
    fn test_escaped_description_lines(#[case] body: &str, #[case] expected: &str) {
        let parsed = parse(&format!("- [ ] #1: T\n  **Priority**: low\n{body}\n"));
        assert!(parsed.is_clean(), "{:?}", parsed.errors);
        let record = &parsed.records[0];
        assert_eq!(record.priority, Priority::Low);
        assert_eq!(record.assigned_to, None);
        assert!(record.dependencies.is_empty());
        assert_eq!(record.description.as_deref(), Some(expected));
    }

    #[rstest]
    #[case("**Priority**: high", true)]
    #[case("  **Created:** 2026-01-01", true)]
    #[case("\\**Priority**: high", true)]
    #[case("\\plain", false)]
    #[case("**bold** text", false)]
    #[case("a **Key**: value", false)]
    fn test_needs_escape(#[case] line: &str, #[case] expected: bool) {
        assert_eq!(needs_escape(line), expected);
    }

    #[test]
    fn test_error_display_includes_line() {
        let parsed = parse("- [ ] #1:\n");
        assert_eq!(parsed.errors[0].to_string(), "line 1: title cannot be empty");
    }
}
