//! SQLite database management for local corral state.
//!
//! This crate provides persistent storage for workspaces, components and the
//! task tree using SQLite as the backing database. Every mutation that other
//! workers may race on is a single conditional statement, so the database is
//! the only concurrency control between workers.

pub mod connection;
pub mod migrations;
pub mod models;
pub mod schema;

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for database operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic database error: {0}")]
    Generic(String),
}

impl Error {
    /// Create a new migration error.
    pub fn migration<S: Into<String>>(message: S) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    /// Create a new generic database error.
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }
}

/// Database connection and management.
pub use connection::Database;
pub use rusqlite::Connection;

/// Database models and operations.
pub use models::{
    now_timestamp, ComponentFilter, ComponentPatch, ComponentRecord, ComponentStore,
    TaskEventRecord, TaskEventStore, TaskProgress, TaskRecord, TaskStore, WorkspaceRecord,
    WorkspaceStore,
};

/// Schema definitions and constants.
pub use schema::*;
