//! Database models and persistence operations.

use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Current time in the timestamp format used by every table.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Database model for workspaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub id: String,
    pub root: String,
    pub created_at: String,
}

/// Database model for components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub id: String,
    pub workspace_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub type_: String, // `type` is a keyword in Rust
    pub key: Option<String>,
    pub spec: String,
    pub state: String,
    pub created_at: String,
    pub initialized_at: Option<String>,
    pub disposed_at: Option<String>,
}

/// Selection criteria for listing components in a workspace.
///
/// Empty criteria select every component of the workspace.
#[derive(Debug, Clone, Default)]
pub struct ComponentFilter {
    pub ids: Option<Vec<String>>,
    pub types: Option<Vec<String>>,
    pub parent_id: Option<String>,
    pub top_level_only: bool,
}

/// Partial update of a component. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ComponentPatch {
    pub spec: Option<String>,
    pub state: Option<String>,
    pub initialized_at: Option<String>,
    pub disposed_at: Option<String>,
}

/// Database model for tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub job_id: String,
    pub parent_id: Option<String>,
    pub mutation: String,
    pub arguments: String,
    pub worker_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub canceled_at: Option<String>,
    pub finished_at: Option<String>,
    pub completed_at: Option<String>,
    pub progress_current: Option<i64>,
    pub progress_total: Option<i64>,
    pub error: Option<String>,
}

/// Progress of a task, present once both fields have been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub current: i64,
    pub total: i64,
}

impl TaskRecord {
    /// `None` until the task has completed; then whether it recorded no error.
    ///
    /// Errors of descendant tasks are not taken into account.
    pub fn successful(&self) -> Option<bool> {
        self.completed_at.as_ref().map(|_| self.error.is_none())
    }

    /// Human readable label for the task.
    pub fn label(&self) -> &str {
        &self.mutation
    }

    pub fn progress(&self) -> Option<TaskProgress> {
        match (self.progress_current, self.progress_total) {
            (Some(current), Some(total)) => Some(TaskProgress { current, total }),
            _ => None,
        }
    }

    /// One-line status message: the error when failed, else the progress.
    pub fn message(&self) -> String {
        if let Some(error) = &self.error {
            return format!("error: {}", error);
        }
        match self.progress() {
            Some(progress) => format!("{}/{}", progress.current, progress.total),
            None => String::new(),
        }
    }
}

/// Database model for task lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEventRecord {
    pub id: i64,
    pub task_id: String,
    pub job_id: String,
    pub ts: String,
    pub type_: String, // `type` is a keyword in Rust
    pub data: Option<String>,
}

/// Database operations for workspaces.
pub struct WorkspaceStore<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> WorkspaceStore<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, record: &WorkspaceRecord) -> crate::Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO workspaces (id, root, created_at)
            VALUES (?, ?, ?)
            "#,
            params![record.id, record.root, record.created_at],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> crate::Result<Option<WorkspaceRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, root, created_at FROM workspaces WHERE id = ?",
                params![id],
                Self::from_row,
            )
            .optional()?)
    }

    pub fn get_by_root(&self, root: &str) -> crate::Result<Option<WorkspaceRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, root, created_at FROM workspaces WHERE root = ?",
                params![root],
                Self::from_row,
            )
            .optional()?)
    }

    pub fn list(&self) -> crate::Result<Vec<WorkspaceRecord>> {
        let mut stmt =
            self.conn.prepare("SELECT id, root, created_at FROM workspaces ORDER BY id")?;
        let rows = stmt.query_map(params![], Self::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Remove a workspace. Its components are removed by cascade.
    pub fn remove(&self, id: &str) -> crate::Result<bool> {
        let changed = self.conn.execute("DELETE FROM workspaces WHERE id = ?", params![id])?;
        Ok(changed > 0)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<WorkspaceRecord> {
        Ok(WorkspaceRecord {
            id: row.get(0)?,
            root: row.get(1)?,
            created_at: row.get(2)?,
        })
    }
}

const COMPONENT_COLUMNS: &str = "id, workspace_id, parent_id, name, type, key, spec, state, \
     created_at, initialized_at, disposed_at";

/// Database operations for components.
pub struct ComponentStore<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> ComponentStore<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, record: &ComponentRecord) -> crate::Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO components (id, workspace_id, parent_id, name, type, key, spec, state, created_at, initialized_at, disposed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.id,
                record.workspace_id,
                record.parent_id,
                record.name,
                record.type_,
                record.key,
                record.spec,
                record.state,
                record.created_at,
                record.initialized_at,
                record.disposed_at
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> crate::Result<Option<ComponentRecord>> {
        let sql = format!("SELECT {} FROM components WHERE id = ?", COMPONENT_COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], Self::from_row).optional()?)
    }

    /// List the components of a workspace matching `filter`, oldest first.
    pub fn list(
        &self,
        workspace_id: &str,
        filter: &ComponentFilter,
    ) -> crate::Result<Vec<ComponentRecord>> {
        let mut sql = format!(
            "SELECT {} FROM components WHERE workspace_id = ?",
            COMPONENT_COLUMNS
        );
        let mut values: Vec<String> = vec![workspace_id.to_string()];

        if let Some(ids) = &filter.ids {
            sql.push_str(&format!(" AND id IN ({})", placeholders(ids.len())));
            values.extend(ids.iter().cloned());
        }
        if let Some(types) = &filter.types {
            sql.push_str(&format!(" AND type IN ({})", placeholders(types.len())));
            values.extend(types.iter().cloned());
        }
        if let Some(parent_id) = &filter.parent_id {
            sql.push_str(" AND parent_id = ?");
            values.push(parent_id.clone());
        } else if filter.top_level_only {
            sql.push_str(" AND parent_id IS NULL");
        }
        sql.push_str(" ORDER BY created_at, rowid");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), Self::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Direct children of a component, oldest first.
    pub fn children(&self, parent_id: &str) -> crate::Result<Vec<ComponentRecord>> {
        let sql = format!(
            "SELECT {} FROM components WHERE parent_id = ? ORDER BY created_at, rowid",
            COMPONENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![parent_id], Self::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Resolve each ref to a component ID, by ID anywhere in the workspace or by name
    /// among top-level components. Unresolvable refs map to `None`.
    pub fn resolve(&self, workspace_id: &str, refs: &[String]) -> crate::Result<Vec<Option<String>>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id FROM components
            WHERE workspace_id = ?1
            AND (id = ?2 OR (parent_id IS NULL AND name = ?2))
            ORDER BY (id = ?2) DESC
            LIMIT 1
            "#,
        )?;
        refs.iter()
            .map(|r| {
                Ok(stmt
                    .query_row(params![workspace_id, r], |row| row.get::<_, String>(0))
                    .optional()?)
            })
            .collect()
    }

    /// Apply a partial update. Returns false if the component does not exist.
    ///
    /// Spec and state each carry a version counter that advances whenever the
    /// document is replaced.
    pub fn patch(&self, id: &str, patch: &ComponentPatch) -> crate::Result<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE components SET
                spec = COALESCE(?1, spec),
                spec_version = spec_version + (?1 IS NOT NULL),
                state = COALESCE(?2, state),
                state_version = state_version + (?2 IS NOT NULL),
                initialized_at = COALESCE(?3, initialized_at),
                disposed_at = COALESCE(?4, disposed_at)
            WHERE id = ?5
            "#,
            params![patch.spec, patch.state, patch.initialized_at, patch.disposed_at, id],
        )?;
        Ok(changed > 0)
    }

    pub fn remove(&self, id: &str) -> crate::Result<bool> {
        let changed = self.conn.execute("DELETE FROM components WHERE id = ?", params![id])?;
        Ok(changed > 0)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<ComponentRecord> {
        Ok(ComponentRecord {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            parent_id: row.get(2)?,
            name: row.get(3)?,
            type_: row.get(4)?,
            key: row.get(5)?,
            spec: row.get(6)?,
            state: row.get(7)?,
            created_at: row.get(8)?,
            initialized_at: row.get(9)?,
            disposed_at: row.get(10)?,
        })
    }
}

const TASK_COLUMNS: &str = "id, job_id, parent_id, mutation, arguments, worker_id, created_at, \
     updated_at, started_at, canceled_at, finished_at, completed_at, progress_current, \
     progress_total, error";

/// Database operations for tasks.
///
/// Claiming, progress updates and completion are single conditional statements so
/// that concurrent workers (in this process or another) never observe a torn state.
pub struct TaskStore<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> TaskStore<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, record: &TaskRecord) -> crate::Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO tasks (id, job_id, parent_id, mutation, arguments, worker_id, created_at, updated_at, started_at, canceled_at, finished_at, completed_at, progress_current, progress_total, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.id,
                record.job_id,
                record.parent_id,
                record.mutation,
                record.arguments,
                record.worker_id,
                record.created_at,
                record.updated_at,
                record.started_at,
                record.canceled_at,
                record.finished_at,
                record.completed_at,
                record.progress_current,
                record.progress_total,
                record.error
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> crate::Result<Option<TaskRecord>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], Self::from_row).optional()?)
    }

    pub fn all(&self) -> crate::Result<Vec<TaskRecord>> {
        let sql = format!("SELECT {} FROM tasks ORDER BY rowid", TASK_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![], Self::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn by_job_ids(&self, job_ids: &[String]) -> crate::Result<Vec<TaskRecord>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM tasks WHERE job_id IN ({}) ORDER BY rowid",
            TASK_COLUMNS,
            placeholders(job_ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(job_ids.iter()), Self::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn children(&self, parent_id: &str) -> crate::Result<Vec<TaskRecord>> {
        let sql = format!("SELECT {} FROM tasks WHERE parent_id = ? ORDER BY rowid", TASK_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![parent_id], Self::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Claim the oldest unclaimed, unfinished task (optionally within one job) for
    /// `worker_id`. The claim only succeeds where `worker_id` is still NULL.
    pub fn claim_next(
        &self,
        worker_id: &str,
        job_id: Option<&str>,
        now: &str,
    ) -> crate::Result<Option<TaskRecord>> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET worker_id = ?1, updated_at = ?2
            WHERE id = (
                SELECT id FROM tasks
                WHERE worker_id IS NULL
                AND finished_at IS NULL
                AND COALESCE(?3, job_id) = job_id
                ORDER BY rowid
                LIMIT 1
            )
            AND worker_id IS NULL
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![worker_id, now, job_id], Self::from_row)
            .optional()?)
    }

    /// Stamp `started_at` and take (or confirm) the claim. Returns `None` when the
    /// task is claimed by another worker, already finished, or missing.
    pub fn mark_started(
        &self,
        id: &str,
        worker_id: &str,
        now: &str,
    ) -> crate::Result<Option<TaskRecord>> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET worker_id = ?1, started_at = COALESCE(started_at, ?2), updated_at = ?2
            WHERE id = ?3
            AND (worker_id = ?1 OR worker_id IS NULL)
            AND finished_at IS NULL
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![worker_id, now, id], Self::from_row)
            .optional()?)
    }

    /// Merge progress fields. Returns `None` unless `worker_id` holds the claim.
    pub fn update_progress(
        &self,
        id: &str,
        worker_id: &str,
        current: Option<i64>,
        total: Option<i64>,
        now: &str,
    ) -> crate::Result<Option<TaskRecord>> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET updated_at = ?1,
                progress_current = COALESCE(?2, progress_current),
                progress_total = COALESCE(?3, progress_total)
            WHERE id = ?4
            AND worker_id = ?5
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![now, current, total, id, worker_id], Self::from_row)
            .optional()?)
    }

    /// Stamp `finished_at`; the first recorded error wins.
    pub fn mark_finished(
        &self,
        id: &str,
        error: Option<&str>,
        now: &str,
    ) -> crate::Result<Option<TaskRecord>> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET updated_at = ?1,
                finished_at = COALESCE(finished_at, ?1),
                error = COALESCE(error, ?2)
            WHERE id = ?3
            RETURNING {}
            "#,
            TASK_COLUMNS
        );
        Ok(self.conn.query_row(&sql, params![now, error, id], Self::from_row).optional()?)
    }

    /// Stamp `completed_at` if the task is finished and every direct child is
    /// completed. Returns true only when this call made the transition.
    pub fn mark_completed_if_ready(&self, id: &str, now: &str) -> crate::Result<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE tasks
            SET completed_at = ?1
            WHERE id = ?2
            AND finished_at IS NOT NULL
            AND completed_at IS NULL
            AND NOT EXISTS (
                SELECT 1 FROM tasks AS child
                WHERE child.parent_id = tasks.id
                AND child.completed_at IS NULL
            )
            "#,
            params![now, id],
        )?;
        Ok(changed > 0)
    }

    /// Mark every unfinished task in the subtree rooted at `id` as canceled. With
    /// `include_root` false only the descendants are affected.
    pub fn cancel_subtree(&self, id: &str, include_root: bool, now: &str) -> crate::Result<usize> {
        let changed = self.conn.execute(
            r#"
            UPDATE tasks
            SET canceled_at = COALESCE(canceled_at, ?1), updated_at = ?1
            WHERE id IN (
                WITH RECURSIVE rec (id) AS (
                    SELECT ?2
                    UNION
                    SELECT tasks.id FROM tasks, rec WHERE tasks.parent_id = rec.id
                )
                SELECT id FROM rec
            )
            AND (?3 OR id <> ?2)
            AND finished_at IS NULL
            AND canceled_at IS NULL
            "#,
            params![now, id, include_root],
        )?;
        Ok(changed)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
        Ok(TaskRecord {
            id: row.get(0)?,
            job_id: row.get(1)?,
            parent_id: row.get(2)?,
            mutation: row.get(3)?,
            arguments: row.get(4)?,
            worker_id: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            started_at: row.get(8)?,
            canceled_at: row.get(9)?,
            finished_at: row.get(10)?,
            completed_at: row.get(11)?,
            progress_current: row.get(12)?,
            progress_total: row.get(13)?,
            error: row.get(14)?,
        })
    }
}

/// Database operations for task lifecycle events.
pub struct TaskEventStore<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> TaskEventStore<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert(
        &self,
        task_id: &str,
        job_id: &str,
        type_: &str,
        data: Option<&str>,
    ) -> crate::Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO task_events (task_id, job_id, ts, type, data)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![task_id, job_id, now_timestamp(), type_, data],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Events of a job in insertion order, optionally only those after `after_id`.
    pub fn by_job(&self, job_id: &str, after_id: Option<i64>) -> crate::Result<Vec<TaskEventRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, task_id, job_id, ts, type, data
            FROM task_events
            WHERE job_id = ? AND id > ?
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![job_id, after_id.unwrap_or(0)], |row| {
            Ok(TaskEventRecord {
                id: row.get(0)?,
                task_id: row.get(1)?,
                job_id: row.get(2)?,
                ts: row.get(3)?,
                type_: row.get(4)?,
                data: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
