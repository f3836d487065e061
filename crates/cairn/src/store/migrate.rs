//! Versioned, transactional schema migrations.
//!
//! Each [`Migration`] carries forward and inverse SQL. Applied migrations are
//! recorded in the `schema_migrations` table together with a SHA-256 checksum
//! of their definition, so an edit to an already-applied migration is caught
//! before anything else touches the schema.
//!
//! ## Invariants
//!
//! - Definition versions start at 1 and increase by exactly 1
//! - Stored history is contiguous from 1 and every stored version has a definition
//! - A migration and its history row are written in the same transaction; a
//!   rollback step removes both together

use super::pool::PooledConnection;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// Name of the table holding applied migration records.
pub const HISTORY_TABLE: &str = "schema_migrations";

const HISTORY_DDL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    checksum TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL
);
";

/// A versioned schema change with its inverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Strictly increasing version, starting at 1
    pub version: u32,
    /// Human-readable summary
    pub description: String,
    /// Forward change set
    pub up: String,
    /// Inverse change set
    pub down: String,
}

impl Migration {
    /// Create a migration definition.
    pub fn new(
        version: u32,
        description: impl Into<String>,
        up: impl Into<String>,
        down: impl Into<String>,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            up: up.into(),
            down: down.into(),
        }
    }

    /// SHA-256 of the forward and inverse definitions, hex encoded.
    #[must_use]
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.up.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.down.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A row of the migration history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Applied version
    pub version: u32,
    /// Description at the time it was applied
    pub description: String,
    /// Checksum of the definition that was applied
    pub checksum: String,
    /// When it was applied
    pub applied_at: DateTime<Utc>,
    /// How long the forward change took
    pub duration: Duration,
}

/// Applies and rolls back an ordered set of migrations.
#[derive(Debug, Clone)]
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Migrator {
    /// Create a migrator over a definition set.
    ///
    /// # Errors
    ///
    /// Returns `Error::MigrationSequence` unless versions run 1, 2, 3, ...
    /// without gaps or duplicates.
    pub fn new(migrations: Vec<Migration>) -> Result<Self> {
        for (index, migration) in migrations.iter().enumerate() {
            let expected = u32::try_from(index + 1)
                .map_err(|_| Error::MigrationSequence("too many migrations".to_string()))?;
            if migration.version != expected {
                return Err(Error::MigrationSequence(format!(
                    "expected migration version {expected}, found {}",
                    migration.version
                )));
            }
        }
        Ok(Self { migrations })
    }

    /// The migrations shipped with cairn.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            migrations: super::schema::builtin_migrations(),
        }
    }

    /// Highest defined version.
    #[must_use]
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    /// Highest applied version, 0 for an empty store.
    ///
    /// # Errors
    ///
    /// Returns a database error if the history table cannot be read.
    pub fn current_version(conn: &Connection) -> Result<u32> {
        ensure_history_table(conn)?;
        let version: u32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// All applied records ordered by version.
    ///
    /// # Errors
    ///
    /// Returns a database error if the history table cannot be read.
    pub fn history(conn: &Connection) -> Result<Vec<MigrationRecord>> {
        ensure_history_table(conn)?;
        let mut stmt = conn.prepare(
            "SELECT version, description, checksum, applied_at, duration_ms
             FROM schema_migrations ORDER BY version",
        )?;
        let rows = stmt.query_map([], |row| {
            let applied_at: String = row.get(3)?;
            let duration_ms: i64 = row.get(4)?;
            Ok(MigrationRecord {
                version: row.get(0)?,
                description: row.get(1)?,
                checksum: row.get(2)?,
                applied_at: super::issues::parse_timestamp(3, &applied_at)?,
                duration: Duration::from_millis(u64::try_from(duration_ms).unwrap_or(0)),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Check stored history against the definitions.
    ///
    /// # Errors
    ///
    /// - `Error::MigrationSequence` if history has gaps or versions without a definition
    /// - `Error::MigrationChecksumMismatch` if an applied definition was edited
    pub fn verify(&self, conn: &Connection) -> Result<Vec<MigrationRecord>> {
        let history = Self::history(conn)?;

        for (index, record) in history.iter().enumerate() {
            if usize::try_from(record.version).ok() != Some(index + 1) {
                return Err(Error::MigrationSequence(format!(
                    "applied history has a gap before version {}",
                    record.version
                )));
            }
            let definition = self.definition(record.version).ok_or_else(|| {
                Error::MigrationSequence(format!(
                    "applied migration {} has no definition (latest known is {})",
                    record.version,
                    self.latest_version()
                ))
            })?;
            let actual = definition.checksum();
            if actual != record.checksum {
                tracing::error!(
                    version = record.version,
                    "Applied migration definition was modified"
                );
                return Err(Error::MigrationChecksumMismatch {
                    version: record.version,
                    recorded: record.checksum.clone(),
                    actual,
                });
            }
        }

        Ok(history)
    }

    /// Apply every pending migration in ascending order.
    ///
    /// Each migration runs in its own transaction. On the first failure that
    /// migration is rolled back and the run stops; earlier migrations stay
    /// applied. Returns the versions applied by this call.
    ///
    /// # Errors
    ///
    /// - Verification errors from [`verify`](Self::verify)
    /// - `Error::MigrationFailed` naming the version whose statements failed
    pub fn apply(&self, conn: &mut PooledConnection) -> Result<Vec<u32>> {
        let history = self.verify(conn)?;
        let current = history.last().map_or(0, |r| r.version);

        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .collect();
        if let Some(first) = pending.first() {
            if first.version != current + 1 {
                return Err(Error::MigrationSequence(format!(
                    "schema is at version {current} but the next pending migration is {}",
                    first.version
                )));
            }
        }

        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            conn.begin()?;
            let started = Instant::now();
            match run_forward(conn, migration, started) {
                Ok(()) => conn.commit()?,
                Err(source) => {
                    conn.rollback()?;
                    tracing::error!(
                        version = migration.version,
                        error = %source,
                        "Migration failed; schema left at version {}",
                        applied.last().copied().unwrap_or(current)
                    );
                    return Err(Error::MigrationFailed {
                        version: migration.version,
                        source,
                    });
                }
            }
            tracing::info!(
                version = migration.version,
                description = %migration.description,
                elapsed_ms = started.elapsed().as_millis(),
                "Applied migration"
            );
            applied.push(migration.version);
        }

        Ok(applied)
    }

    /// Undo applied migrations in descending order until `target` is the
    /// current version. Returns the versions rolled back.
    ///
    /// A `target` at or above the current version is a no-op.
    ///
    /// # Errors
    ///
    /// - Verification errors from [`verify`](Self::verify)
    /// - `Error::MigrationFailed` naming the version whose inverse failed
    pub fn rollback(&self, conn: &mut PooledConnection, target: u32) -> Result<Vec<u32>> {
        let history = self.verify(conn)?;

        let mut rolled_back = Vec::new();
        for record in history.iter().rev().filter(|r| r.version > target) {
            let migration = self.definition(record.version).ok_or_else(|| {
                Error::MigrationSequence(format!("no definition for version {}", record.version))
            })?;

            conn.begin()?;
            match run_inverse(conn, migration) {
                Ok(()) => conn.commit()?,
                Err(source) => {
                    conn.rollback()?;
                    return Err(Error::MigrationFailed {
                        version: migration.version,
                        source,
                    });
                }
            }
            tracing::info!(version = migration.version, "Rolled back migration");
            rolled_back.push(migration.version);
        }

        Ok(rolled_back)
    }

    fn definition(&self, version: u32) -> Option<&Migration> {
        let index = usize::try_from(version).ok()?.checked_sub(1)?;
        self.migrations.get(index)
    }
}

/// SHA-256 over the schema DDL, excluding SQLite internals and the history table.
///
/// # Errors
///
/// Returns a database error if `sqlite_master` cannot be read.
pub fn schema_fingerprint(conn: &Connection) -> Result<String> {
    let mut stmt = conn.prepare(
        "SELECT type, name, tbl_name, COALESCE(sql, '') FROM sqlite_master
         WHERE name NOT LIKE 'sqlite_%' AND tbl_name != ?1
         ORDER BY type, name",
    )?;
    let mut rows = stmt.query([HISTORY_TABLE])?;

    let mut hasher = Sha256::new();
    while let Some(row) = rows.next()? {
        for column in 0..4 {
            let value: String = row.get(column)?;
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn ensure_history_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(HISTORY_DDL)?;
    Ok(())
}

fn run_forward(conn: &Connection, migration: &Migration, started: Instant) -> rusqlite::Result<()> {
    conn.execute_batch(&migration.up)?;
    let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
    conn.execute(
        "INSERT INTO schema_migrations (version, description, checksum, applied_at, duration_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            migration.version,
            migration.description,
            migration.checksum(),
            Utc::now().to_rfc3339(),
            duration_ms
        ],
    )?;
    Ok(())
}

fn run_inverse(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    conn.execute_batch(&migration.down)?;
    conn.execute(
        "DELETE FROM schema_migrations WHERE version = ?1",
        [migration.version],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::pool::{Pool, PoolConfig, StoreLocation};
    use rstest::rstest;
    use tempfile::TempDir;

    fn open_pool(dir: &TempDir, name: &str) -> Pool {
        Pool::open(
            StoreLocation::File(dir.path().join(name)),
            PoolConfig::default(),
        )
        .unwrap()
    }

    fn sample_migrations() -> Vec<Migration> {
        vec![
            Migration::new(1, "a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;"),
            Migration::new(2, "b", "CREATE TABLE b (id INTEGER);", "DROP TABLE b;"),
            Migration::new(
                3,
                "index a",
                "CREATE INDEX idx_a ON a(id);",
                "DROP INDEX idx_a;",
            ),
            Migration::new(4, "c", "CREATE TABLE c (id INTEGER);", "DROP TABLE c;"),
        ]
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[rstest]
    #[case::starts_at_two(vec![2, 3])]
    #[case::gap(vec![1, 3])]
    #[case::duplicate(vec![1, 1])]
    #[case::descending(vec![2, 1])]
    fn test_definition_sequence_rejected(#[case] versions: Vec<u32>) {
        let migrations = versions
            .into_iter()
            .map(|v| Migration::new(v, "m", "SELECT 1;", "SELECT 1;"))
            .collect();
        assert!(matches!(
            Migrator::new(migrations),
            Err(Error::MigrationSequence(_))
        ));
    }

    #[test]
    fn test_checksum_covers_forward_and_inverse() {
        let a = Migration::new(1, "a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        let mut b = a.clone();
        b.down = "DROP TABLE IF EXISTS a;".to_string();
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.checksum(), a.clone().checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[tokio::test]
    async fn test_apply_runs_pending_in_order_and_records_history() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir, "m.db");
        let mut conn = pool.acquire().await.unwrap();
        let migrator = Migrator::new(sample_migrations()).unwrap();

        assert_eq!(migrator.apply(&mut conn).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(Migrator::current_version(&conn).unwrap(), 4);

        let history = Migrator::history(&conn).unwrap();
        let versions: Vec<u32> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
        assert_eq!(history[0].checksum, sample_migrations()[0].checksum());

        // Second run has nothing left to do
        assert!(migrator.apply(&mut conn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_migration_stops_at_last_good_version() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir, "m.db");
        let mut conn = pool.acquire().await.unwrap();

        let mut migrations = sample_migrations();
        migrations[2] = Migration::new(
            3,
            "broken",
            "CREATE TABLE half (id INTEGER); CREATE TABLE oops (",
            "DROP TABLE half;",
        );
        let migrator = Migrator::new(migrations).unwrap();

        let err = migrator.apply(&mut conn).unwrap_err();
        assert!(matches!(err, Error::MigrationFailed { version: 3, .. }));
        assert_eq!(Migrator::current_version(&conn).unwrap(), 2);
        assert!(!table_exists(&conn, "half"), "failed migration must roll back");
        assert!(!table_exists(&conn, "c"), "later migrations must not run");
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn test_edited_migration_fails_checksum_verification() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir, "m.db");
        let mut conn = pool.acquire().await.unwrap();
        Migrator::new(sample_migrations())
            .unwrap()
            .apply(&mut conn)
            .unwrap();

        let mut edited = sample_migrations();
        edited[1].up = "CREATE TABLE b (id INTEGER, extra TEXT);".to_string();
        let err = Migrator::new(edited).unwrap().apply(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            Error::MigrationChecksumMismatch { version: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_history_ahead_of_definitions_is_a_sequence_error() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir, "m.db");
        let mut conn = pool.acquire().await.unwrap();
        Migrator::new(sample_migrations())
            .unwrap()
            .apply(&mut conn)
            .unwrap();

        let fewer = sample_migrations().into_iter().take(2).collect();
        let err = Migrator::new(fewer).unwrap().apply(&mut conn).unwrap_err();
        assert!(matches!(err, Error::MigrationSequence(_)));
    }

    #[tokio::test]
    async fn test_rollback_removes_schema_and_records() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir, "m.db");
        let mut conn = pool.acquire().await.unwrap();
        let migrator = Migrator::new(sample_migrations()).unwrap();
        migrator.apply(&mut conn).unwrap();

        assert_eq!(migrator.rollback(&mut conn, 1).unwrap(), vec![4, 3, 2]);
        assert_eq!(Migrator::current_version(&conn).unwrap(), 1);
        assert!(table_exists(&conn, "a"));
        assert!(!table_exists(&conn, "b"));
        assert!(!table_exists(&conn, "c"));

        assert!(migrator.rollback(&mut conn, 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_and_reapply_matches_direct_apply() {
        let dir = TempDir::new().unwrap();
        let migrator = Migrator::builtin();

        let direct_pool = open_pool(&dir, "direct.db");
        let mut direct = direct_pool.acquire().await.unwrap();
        migrator.apply(&mut direct).unwrap();

        let cycled_pool = open_pool(&dir, "cycled.db");
        let mut cycled = cycled_pool.acquire().await.unwrap();
        migrator.apply(&mut cycled).unwrap();
        migrator.rollback(&mut cycled, 1).unwrap();
        migrator.apply(&mut cycled).unwrap();

        assert_eq!(
            schema_fingerprint(&direct).unwrap(),
            schema_fingerprint(&cycled).unwrap()
        );
        assert_eq!(
            Migrator::current_version(&cycled).unwrap(),
            migrator.latest_version()
        );
    }
}
