//! Last-synced state, the common ancestor for three-way diffing.
//!
//! Persisted as JSON Lines next to the flat file, one entry per issue number.
//! Entries hold only hashes, never field values.

use super::record::{Field, Record};
use crate::domain::IssueNumber;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hashes of one issue as of the last successful pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Issue number
    pub number: IssueNumber,
    /// Hash over every diffed field
    pub hash: String,
    /// Per-field hashes
    pub fields: BTreeMap<Field, String>,
}

impl SnapshotEntry {
    /// Hash a record.
    #[must_use]
    pub fn of(record: &Record) -> Self {
        Self {
            number: record.number,
            hash: record.record_hash(),
            fields: Field::ALL
                .iter()
                .map(|f| (*f, record.field_hash(*f)))
                .collect(),
        }
    }

    /// Hash of one field, if recorded.
    #[must_use]
    pub fn field(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }
}

/// Non-fatal problems found while loading a snapshot.
///
/// The offending line is skipped; its issue is then treated as never synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadWarning {
    /// Line could not be decoded
    MalformedJson {
        /// 1-based line number
        line_number: usize,
        /// Decoder message
        error: String,
    },

    /// A second entry for an issue number that already appeared
    DuplicateEntry {
        /// 1-based line number of the later entry
        line_number: usize,
        /// The repeated number
        number: IssueNumber,
    },
}

/// Snapshot of every synced issue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<IssueNumber, SnapshotEntry>,
}

impl Snapshot {
    /// Snapshot of the given records.
    #[must_use]
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let entries = records
            .into_iter()
            .map(|r| (r.number, SnapshotEntry::of(r)))
            .collect();
        Self { entries }
    }

    /// Entry for an issue number.
    #[must_use]
    pub fn get(&self, number: IssueNumber) -> Option<&SnapshotEntry> {
        self.entries.get(&number)
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, entry: SnapshotEntry) {
        self.entries.insert(entry.number, entry);
    }

    /// Drop the entry for an issue number.
    pub fn remove(&mut self, number: IssueNumber) -> Option<SnapshotEntry> {
        self.entries.remove(&number)
    }

    /// Issue numbers with an entry, ascending.
    pub fn numbers(&self) -> impl Iterator<Item = IssueNumber> + '_ {
        self.entries.keys().copied()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been synced yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize as JSON Lines, ordered by number.
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if an entry fails to serialize.
    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for entry in self.entries.values() {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Load from JSON Lines, skipping lines that cannot be used.
    #[must_use]
    pub fn from_jsonl(text: &str) -> (Self, Vec<LoadWarning>) {
        let mut snapshot = Self::default();
        let mut warnings = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let line_number = index + 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SnapshotEntry>(line) {
                Ok(entry) => {
                    if snapshot.entries.contains_key(&entry.number) {
                        warnings.push(LoadWarning::DuplicateEntry {
                            line_number,
                            number: entry.number,
                        });
                    } else {
                        snapshot.insert(entry);
                    }
                }
                Err(e) => warnings.push(LoadWarning::MalformedJson {
                    line_number,
                    error: e.to_string(),
                }),
            }
        }

        (snapshot, warnings)
    }
}
