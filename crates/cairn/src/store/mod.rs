//! Structured store: SQLite behind a connection pool.
//!
//! - [`pool`]: bounded pool of transactional connections
//! - [`migrate`]: versioned schema migrations with checksummed history
//! - [`issues`]: issue and dependency rows
//! - [`schema`]: the built-in migrations

pub mod issues;
pub mod migrate;
pub mod pool;
pub mod schema;

pub use migrate::{Migration, MigrationRecord, Migrator};
pub use pool::{Pool, PoolConfig, PoolStatus, PooledConnection, StoreLocation};
