//! Cairn - a dependency-aware issue store.
//!
//! Issues live in a SQLite store reached through a bounded connection pool
//! and are mirrored to a human-editable Markdown file. The crate provides:
//!
//! - [`store`]: pooled connections, versioned migrations, issue rows
//! - [`graph`]: the per-project dependency DAG and ready/blocked queries
//! - [`sync`]: parse, three-way diff, conflict policy and deterministic export
//! - [`watch`]: debounced file watching that drives sync passes
//! - [`app`] and [`cli`]: the workspace wiring and the `cairn` binary

#![forbid(unsafe_code)]

// Public modules for library usage
pub mod domain;
pub mod error;
pub mod graph;
pub mod store;
pub mod sync;
pub mod watch;

// Workspace wiring and configuration
pub mod app;
pub mod config;

// Public CLI module (needed by binary)
pub mod cli;

// Command implementations
pub mod commands;

// Output formatting for the CLI
pub mod output;
