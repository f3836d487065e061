//! Three-way diff and conflict resolution.
//!
//! Every field is compared across the snapshot (common ancestor), the file
//! and the store, using snapshot hashes for the ancestor:
//!
//! | file vs store | ancestor equals | outcome        |
//! |---------------|-----------------|----------------|
//! | equal         | -               | unchanged      |
//! | differ        | store           | file changed   |
//! | differ        | file            | store changed  |
//! | differ        | neither         | conflict       |

use super::parse::ParsedFile;
use super::record::{Field, Record};
use super::snapshot::Snapshot;
use crate::domain::IssueNumber;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// How a single field changed since the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange {
    /// File and store agree
    Unchanged,
    /// Only the file changed; the store must be updated
    FileOnly,
    /// Only the store changed; the file is regenerated
    StoreOnly,
    /// Both changed to different values
    Conflict,
}

/// Classify one field from its ancestor, file and store hashes.
///
/// Without an ancestor every difference is a conflict.
#[must_use]
pub fn classify_field(base: Option<&str>, file: &str, store: &str) -> FieldChange {
    if file == store {
        FieldChange::Unchanged
    } else if base == Some(store) {
        FieldChange::FileOnly
    } else if base == Some(file) {
        FieldChange::StoreOnly
    } else {
        FieldChange::Conflict
    }
}

/// Per-issue outcome of the three-way diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueDiff {
    /// New in the file; create it in the store
    Created(IssueNumber),

    /// Removed from the file and untouched in the store; delete it
    Deleted(IssueNumber),

    /// Present on both sides with at least one differing field
    Changed {
        /// Issue number
        number: IssueNumber,
        /// Fields only the file changed
        file_fields: Vec<Field>,
        /// Fields only the store changed
        store_fields: Vec<Field>,
        /// Fields both sides changed differently
        conflicts: Vec<Field>,
    },
}

/// Diff the parsed file and the store's records against the snapshot.
///
/// Blocks that failed to parse are left alone, and deletions are only
/// inferred from a file that parsed cleanly. An issue the store deleted
/// since the snapshot stays deleted.
#[must_use]
pub fn diff(
    snapshot: &Snapshot,
    file: &ParsedFile,
    store: &BTreeMap<IssueNumber, Record>,
) -> Vec<IssueDiff> {
    let file_records: BTreeMap<IssueNumber, &Record> =
        file.records.iter().map(|r| (r.number, r)).collect();

    let numbers: BTreeSet<IssueNumber> = file_records
        .keys()
        .chain(store.keys())
        .copied()
        .chain(snapshot.numbers())
        .collect();

    let mut diffs = Vec::new();
    for number in numbers {
        if file.failed_numbers.contains(&number) {
            continue;
        }
        let base = snapshot.get(number);
        match (file_records.get(&number), store.get(&number)) {
            (Some(file_record), Some(store_record)) => {
                let mut file_fields = Vec::new();
                let mut store_fields = Vec::new();
                let mut conflicts = Vec::new();
                for field in Field::ALL {
                    let change = classify_field(
                        base.and_then(|b| b.field(field)),
                        &file_record.field_hash(field),
                        &store_record.field_hash(field),
                    );
                    match change {
                        FieldChange::Unchanged => {}
                        FieldChange::FileOnly => file_fields.push(field),
                        FieldChange::StoreOnly => store_fields.push(field),
                        FieldChange::Conflict => conflicts.push(field),
                    }
                }
                if !(file_fields.is_empty() && store_fields.is_empty() && conflicts.is_empty()) {
                    diffs.push(IssueDiff::Changed {
                        number,
                        file_fields,
                        store_fields,
                        conflicts,
                    });
                }
            }
            (Some(_), None) if base.is_none() => diffs.push(IssueDiff::Created(number)),
            (None, Some(store_record)) => {
                let unchanged_in_store = base.is_some_and(|b| b.hash == store_record.record_hash());
                if unchanged_in_store && file.is_clean() {
                    diffs.push(IssueDiff::Deleted(number));
                }
            }
            _ => {}
        }
    }
    diffs
}

/// What to do when file and store changed the same field differently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// The file's value is written to the store
    FileWins,
    /// The store's value is kept and exported
    StoreWins,
    /// Conflicting issues are left unsynced and reported
    #[default]
    Manual,
}

impl ConflictPolicy {
    /// Name as used in configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileWins => "file-wins",
            Self::StoreWins => "store-wins",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "file-wins" | "file" => Ok(Self::FileWins),
            "store-wins" | "store" => Ok(Self::StoreWins),
            "manual" => Ok(Self::Manual),
            other => Err(Error::Validation(format!("unknown conflict policy '{other}'"))),
        }
    }
}

/// A field both sides changed differently, left for a person to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    /// Issue number
    pub issue: IssueNumber,
    /// Conflicting field
    pub field: Field,
    /// Value in the file
    pub file_value: String,
    /// Value in the store
    pub store_value: String,
}

/// The write plan produced by resolving diffs under a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Issues to create from the file
    pub creates: Vec<IssueNumber>,
    /// Fields to copy from the file into the store, per issue
    pub updates: BTreeMap<IssueNumber, Vec<Field>>,
    /// Issues to delete from the store
    pub deletes: Vec<IssueNumber>,
    /// Unresolved conflicts, ordered by issue then field
    pub conflicts: Vec<Conflict>,
    /// Issues excluded from this pass because of unresolved conflicts
    pub held: BTreeSet<IssueNumber>,
    /// Conflicts settled automatically by the policy
    pub auto_resolved: usize,
}

/// Turn diffs into a write plan.
#[must_use]
pub fn resolve(
    diffs: &[IssueDiff],
    policy: ConflictPolicy,
    file: &BTreeMap<IssueNumber, Record>,
    store: &BTreeMap<IssueNumber, Record>,
) -> Resolution {
    let mut resolution = Resolution::default();

    for diff in diffs {
        match diff {
            IssueDiff::Created(number) => resolution.creates.push(*number),
            IssueDiff::Deleted(number) => resolution.deletes.push(*number),
            IssueDiff::Changed {
                number,
                file_fields,
                conflicts,
                ..
            } => {
                let mut fields = file_fields.clone();
                if !conflicts.is_empty() {
                    match policy {
                        ConflictPolicy::FileWins => {
                            resolution.auto_resolved += conflicts.len();
                            fields.extend(conflicts.iter().copied());
                        }
                        ConflictPolicy::StoreWins => {
                            resolution.auto_resolved += conflicts.len();
                        }
                        ConflictPolicy::Manual => {
                            resolution.held.insert(*number);
                            for field in conflicts {
                                resolution.conflicts.push(Conflict {
                                    issue: *number,
                                    field: *field,
                                    file_value: file
                                        .get(number)
                                        .map(|r| r.value(*field))
                                        .unwrap_or_default(),
                                    store_value: store
                                        .get(number)
                                        .map(|r| r.value(*field))
                                        .unwrap_or_default(),
                                });
                            }
                            continue;
                        }
                    }
                }
                if !fields.is_empty() {
                    fields.sort_unstable();
                    resolution.updates.insert(*number, fields);
                }
            }
        }
    }

    resolution
}
