//! Database connection management.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Database connection wrapper shared by every store handle in the process.
#[derive(Debug, Clone)]
pub struct Database {
    connection: Arc<std::sync::Mutex<Connection>>,
}

impl Database {
    /// Get the default database path based on the CORRAL_HOME environment variable or
    /// the user's home directory.
    ///
    /// Priority order:
    /// 1. `$CORRAL_HOME/var/state.db`
    /// 2. `~/.corral/var/state.db`
    pub fn default_path() -> crate::Result<PathBuf> {
        if let Ok(home) = std::env::var("CORRAL_HOME") {
            return Ok(PathBuf::from(home).join("var").join("state.db"));
        }

        let home = dirs::home_dir()
            .ok_or_else(|| crate::Error::generic("Cannot determine home directory"))?;
        Ok(home.join(".corral").join("var").join("state.db"))
    }

    /// Open the database at the default path.
    pub fn open_default() -> crate::Result<Self> {
        let path = Self::default_path()?;
        Self::open(&path)
    }
}

impl Database {
    /// Open a new database connection at the specified path.
    ///
    /// If the path doesn't exist, the database (and its parent directory) will be created.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // WAL only makes sense for file-backed databases.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            connection: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> crate::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            connection: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    /// Initialize the database schema.
    fn initialize_schema(conn: &Connection) -> crate::Result<()> {
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Apply migrations to bring schema up to date
        crate::migrations::MigrationManager::migrate(conn)?;

        Ok(())
    }

    /// Get a reference to the underlying connection.
    ///
    /// The lock must never be held across an `.await`.
    pub fn connection(&self) -> &std::sync::Mutex<Connection> {
        &self.connection
    }

    /// Run `f` with the locked connection.
    pub fn with_connection<F, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Connection) -> crate::Result<T>,
    {
        let conn = self.connection.lock().map_err(|e| {
            crate::Error::generic(format!("Failed to acquire database lock: {}", e))
        })?;
        f(&conn)
    }

    /// Execute a transaction with automatic rollback on error.
    pub fn transaction<F, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Connection) -> crate::Result<T>,
    {
        let conn = self.connection.lock().map_err(|e| {
            crate::Error::generic(format!("Failed to acquire database lock: {}", e))
        })?;

        let tx = conn.unchecked_transaction()?;
        match f(&tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }
}
