//! Database migration management.

use rusqlite::{params, Connection};

/// Database migration manager.
pub struct MigrationManager;

impl MigrationManager {
    /// Apply all pending migrations to the database.
    pub fn migrate(conn: &Connection) -> crate::Result<()> {
        // Create schema migrations table first
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        // Get current version
        let current_version = Self::current_version(conn)?.unwrap_or(0);
        if current_version > crate::schema::SCHEMA_VERSION {
            return Err(crate::Error::migration(format!(
                "database schema version {} is newer than supported version {}",
                current_version,
                crate::schema::SCHEMA_VERSION
            )));
        }

        // Apply migrations sequentially
        if current_version < 1 {
            tracing::debug!("applying schema migration 1");
            Self::apply_migration_1(conn)?;
        }

        Ok(())
    }

    /// Apply migration version 1 - workspaces, components and the task tree.
    fn apply_migration_1(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            r#"
            -- Workspaces bind a component graph to a filesystem root
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                root TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(root)
            );

            -- Components; spec and state are JSON documents owned by controllers
            CREATE TABLE IF NOT EXISTS components (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                parent_id TEXT REFERENCES components(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                key TEXT,
                spec TEXT NOT NULL,
                spec_version INTEGER NOT NULL DEFAULT 1,
                state TEXT NOT NULL DEFAULT '{}',
                state_version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                initialized_at TEXT,
                disposed_at TEXT
            );

            -- Names are unique among siblings; top-level components share the '' parent
            CREATE UNIQUE INDEX IF NOT EXISTS idx_components_sibling_name
                ON components(workspace_id, COALESCE(parent_id, ''), name);
            CREATE INDEX IF NOT EXISTS idx_components_parent ON components(parent_id);

            -- Task tree; the job root has job_id = id and no parent
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                parent_id TEXT REFERENCES tasks(id) ON DELETE CASCADE,
                mutation TEXT NOT NULL,
                arguments TEXT NOT NULL DEFAULT '{}',
                worker_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                canceled_at TEXT,
                finished_at TEXT,
                completed_at TEXT,
                progress_current INTEGER,
                progress_total INTEGER,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_unclaimed ON tasks(worker_id, job_id);

            -- Task lifecycle events, polled by job watchers
            CREATE TABLE IF NOT EXISTS task_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                job_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                type TEXT NOT NULL,
                data TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_task_events_job ON task_events(job_id, id);

            -- Mark migration as applied
            INSERT OR REPLACE INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Get the current schema version.
    pub fn current_version(conn: &Connection) -> crate::Result<Option<u32>> {
        let mut stmt = conn.prepare("SELECT MAX(version) FROM schema_migrations")?;

        let version: Option<u32> =
            stmt.query_row(params![], |row| row.get::<_, Option<u32>>(0)).ok().flatten();

        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationManager::migrate(&conn).unwrap();
        MigrationManager::migrate(&conn).unwrap();
        assert_eq!(MigrationManager::current_version(&conn).unwrap(), Some(1));
    }

    #[test]
    fn test_sibling_names_are_unique_per_parent() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationManager::migrate(&conn).unwrap();
        conn.execute_batch(
            r#"
            INSERT INTO workspaces (id, root, created_at) VALUES ('w', '/w', 'now');
            INSERT INTO components (id, workspace_id, name, type, spec, created_at)
                VALUES ('a', 'w', 'web', 'process', '{}', 'now');
            INSERT INTO components (id, workspace_id, parent_id, name, type, spec, created_at)
                VALUES ('b', 'w', 'a', 'web', 'process', '{}', 'now');
            "#,
        )
        .unwrap();

        let duplicate = conn.execute(
            "INSERT INTO components (id, workspace_id, name, type, spec, created_at)
             VALUES ('c', 'w', 'web', 'process', '{}', 'now')",
            [],
        );
        assert!(duplicate.is_err());
    }
}
