//! Bidirectional sync between the store and a Markdown issue file.
//!
//! - [`parse`]: tolerant flat-file parser producing canonical [`Record`]s
//! - [`export`]: deterministic renderer, the inverse of `parse`
//! - [`snapshot`]: last-synced hashes, the common ancestor for diffing
//! - [`diff`]: per-field three-way classification and policy resolution
//! - [`engine`]: the pass that ties them together under one transaction

pub mod diff;
pub mod engine;
pub mod export;
pub mod io;
pub mod parse;
pub mod record;
pub mod snapshot;

pub use diff::{Conflict, ConflictPolicy, FieldChange, IssueDiff, Resolution};
pub use engine::{CancelToken, RejectedEdge, SyncEngine, SyncPhase, SyncReport, SyncSettings};
pub use io::{FileIo, LocalFs};
pub use parse::{ParseError, ParsedFile};
pub use record::{Field, Record};
pub use snapshot::{Snapshot, SnapshotEntry};
