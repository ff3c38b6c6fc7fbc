//! The kernel: the server object constructed once at startup and shared by
//! every front-end and background task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use corral_local_db::{now_timestamp, Database, TaskRecord, WorkspaceRecord, WorkspaceStore};
use tokio::task::JoinHandle;

use crate::controller::ControllerFactory;
use crate::dispatch::Dispatcher;
use crate::logs::LogCollector;
use crate::manifest::{DefaultLoader, ManifestLoader};
use crate::runner::TaskRunner;
use crate::tracker::{new_id, TaskTracker};
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Tunables for a [`Kernel`].
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Port of the local syslog collector, handed to process controllers.
    pub syslog_port: u16,
    /// How long workers wait for a task before giving up a poll round.
    pub acquire_timeout: Duration,
    /// Leave created tasks for external workers instead of running them
    /// in-process.
    pub detached: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            syslog_port: 4500,
            acquire_timeout: Duration::from_millis(5000),
            detached: false,
        }
    }
}

pub struct Kernel {
    db: Database,
    tracker: TaskTracker,
    dispatcher: Dispatcher,
    loader: Arc<dyn ManifestLoader>,
    log_collector: Option<Arc<dyn LogCollector>>,
    config: KernelConfig,
    worker_id: String,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    pub fn new(db: Database, factory: ControllerFactory) -> Self {
        Self {
            tracker: TaskTracker::new(db.clone()),
            dispatcher: Dispatcher::new(db.clone(), factory),
            db,
            loader: Arc::new(DefaultLoader::new()),
            log_collector: None,
            config: KernelConfig::default(),
            worker_id: format!("kernel-{}", new_id()),
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn ManifestLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_log_collector(mut self, collector: Arc<dyn LogCollector>) -> Self {
        self.log_collector = Some(collector);
        self
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn loader(&self) -> &Arc<dyn ManifestLoader> {
        &self.loader
    }

    pub fn log_collector(&self) -> Option<&Arc<dyn LogCollector>> {
        self.log_collector.as_ref()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Worker identity used for tasks executed in-process.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Register a workspace rooted at `root`.
    pub fn create_workspace(self: &Arc<Self>, root: &Path) -> Result<Workspace> {
        let root = normalize_root(root)?;
        let record = WorkspaceRecord {
            id: new_id(),
            root: root.to_string_lossy().to_string(),
            created_at: now_timestamp(),
        };
        self.db
            .with_connection(|conn| WorkspaceStore::new(conn).insert(&record))?;
        tracing::info!(workspace = %record.id, root = %record.root, "created workspace");
        Ok(Workspace::new(self.clone(), record.id, root))
    }

    /// The workspace rooted exactly at `root`, created on first use.
    pub fn ensure_workspace(self: &Arc<Self>, root: &Path) -> Result<Workspace> {
        let normalized = normalize_root(root)?;
        let existing = self.db.with_connection(|conn| {
            WorkspaceStore::new(conn).get_by_root(&normalized.to_string_lossy())
        })?;
        match existing {
            Some(record) => Ok(Workspace::new(self.clone(), record.id, normalized)),
            None => self.create_workspace(&normalized),
        }
    }

    /// Resolve a workspace by ID, or by the deepest workspace root containing
    /// the given path.
    pub fn resolve_workspace(self: &Arc<Self>, reference: &str) -> Result<Option<Workspace>> {
        let workspaces = self.list_workspaces()?;
        if let Some(record) = workspaces.iter().find(|w| w.id == reference) {
            return Ok(Some(self.workspace_from(record)));
        }

        let path = match normalize_root(Path::new(reference)) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        let deepest = workspaces
            .iter()
            .filter(|w| path.starts_with(&w.root))
            .max_by_key(|w| Path::new(&w.root).components().count());
        Ok(deepest.map(|record| self.workspace_from(record)))
    }

    pub fn workspace(self: &Arc<Self>, id: &str) -> Result<Workspace> {
        let record = self
            .db
            .with_connection(|conn| WorkspaceStore::new(conn).get(id))?
            .ok_or_else(|| Error::NoSuchWorkspace {
                reference: id.to_string(),
            })?;
        Ok(self.workspace_from(&record))
    }

    pub fn list_workspaces(&self) -> Result<Vec<WorkspaceRecord>> {
        Ok(self.db.with_connection(|conn| WorkspaceStore::new(conn).list())?)
    }

    fn workspace_from(self: &Arc<Self>, record: &WorkspaceRecord) -> Workspace {
        Workspace::new(self.clone(), record.id.clone(), PathBuf::from(&record.root))
    }

    /// Execute a task in the background under this kernel's worker identity.
    ///
    /// Returns `None` when the kernel is detached; the task then waits for an
    /// external worker.
    pub fn spawn_task(self: &Arc<Self>, task_id: String) -> Option<JoinHandle<()>> {
        if self.config.detached {
            return None;
        }
        let runner = TaskRunner::new(self.clone());
        let worker_id = self.worker_id.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = runner.run(task_id.clone(), worker_id).await {
                tracing::error!(task = %task_id, error = %err, "task execution failed");
            }
        }))
    }

    /// Poll a job until its root task completes.
    pub async fn wait_for_job(&self, job_id: &str, interval: Duration) -> Result<TaskRecord> {
        loop {
            let job = self
                .tracker
                .task_by_id(job_id)?
                .ok_or_else(|| Error::NoSuchTask { id: job_id.to_string() })?;
            if job.completed_at.is_some() {
                return Ok(job);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Absolute, symlink-free form of a workspace root when it exists on disk.
fn normalize_root(root: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = std::fs::canonicalize(root) {
        return Ok(canonical);
    }
    if root.is_absolute() {
        return Ok(root.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> Arc<Kernel> {
        Arc::new(Kernel::new(
            Database::open_in_memory().unwrap(),
            ControllerFactory::with_builtin(),
        ))
    }

    #[test]
    fn test_ensure_workspace_is_idempotent() {
        let kernel = kernel();
        let dir = tempfile::TempDir::new().unwrap();
        let first = kernel.ensure_workspace(dir.path()).unwrap();
        let second = kernel.ensure_workspace(dir.path()).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(kernel.list_workspaces().unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_workspace_by_deepest_prefix() {
        let kernel = kernel();
        let dir = tempfile::TempDir::new().unwrap();
        let inner = dir.path().join("inner");
        std::fs::create_dir_all(inner.join("src")).unwrap();

        let outer_ws = kernel.create_workspace(dir.path()).unwrap();
        let inner_ws = kernel.create_workspace(&inner).unwrap();

        let by_path = kernel
            .resolve_workspace(&inner.join("src").to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(by_path.id(), inner_ws.id());

        let by_id = kernel.resolve_workspace(outer_ws.id()).unwrap().unwrap();
        assert_eq!(by_id.id(), outer_ws.id());

        assert!(kernel.resolve_workspace("/definitely/not/here").unwrap().is_none());
    }

    #[test]
    fn test_unknown_workspace_id() {
        let kernel = kernel();
        assert!(matches!(
            kernel.workspace("missing"),
            Err(Error::NoSuchWorkspace { .. })
        ));
    }
}
