//! Task execution: typed mutations, the runner that executes one task, and
//! the polling worker loop.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use corral_local_db::TaskRecord;

use crate::dispatch::Operation;
use crate::kernel::Kernel;
use crate::tracker::{new_id, NewTask};
use crate::{reconcile, Error, Result};

/// The work a task performs, stored as its mutation name and arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mutation", content = "arguments", rename_all = "kebab-case")]
pub enum Mutation {
    /// Grouping root of a fan-out; does no work itself.
    Job { label: String },
    Control {
        workspace_id: String,
        component_id: String,
        operation: Operation,
    },
    ReconcileComponent {
        workspace_id: String,
        component_id: String,
    },
}

impl Mutation {
    /// Split into the mutation name and arguments document of a new task.
    pub fn to_new_task(&self, parent_id: Option<&str>) -> Result<NewTask> {
        let mut encoded = serde_json::to_value(self)?;
        let name = encoded["mutation"].as_str().unwrap_or_default().to_string();
        let arguments = encoded["arguments"].take();
        Ok(NewTask {
            id: None,
            parent_id: parent_id.map(str::to_string),
            mutation: name,
            arguments,
            worker_id: None,
        })
    }

    pub fn from_task(task: &TaskRecord) -> Result<Self> {
        let arguments: serde_json::Value = serde_json::from_str(&task.arguments)
            .map_err(|e| Error::unmarshal("task arguments", e))?;
        serde_json::from_value(json!({ "mutation": task.mutation, "arguments": arguments }))
            .map_err(|e| Error::unmarshal(format!("{} task", task.mutation), e))
    }
}

/// Handle given to executing work.
#[derive(Debug, Clone)]
pub struct TaskContext {
    kernel: Arc<Kernel>,
    task: TaskRecord,
    worker_id: String,
}

impl TaskContext {
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn task(&self) -> &TaskRecord {
        &self.task
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Whether cancellation of this task has been requested.
    pub fn is_canceled(&self) -> Result<bool> {
        self.kernel.tracker().is_canceled(&self.task.id)
    }

    pub fn report_progress(&self, current: i64, total: i64) -> Result<()> {
        self.kernel
            .tracker()
            .update_task(&self.task.id, &self.worker_id, Some(current), Some(total))?;
        Ok(())
    }

    /// Create a child task and schedule it. Returns the child's ID.
    pub fn spawn_subtask(&self, mutation: &Mutation) -> Result<String> {
        let child = self
            .kernel
            .tracker()
            .create_task(mutation.to_new_task(Some(&self.task.id))?)?;
        self.kernel.spawn_task(child.id.clone());
        Ok(child.id)
    }
}

/// Executes individual tasks on behalf of a worker.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    kernel: Arc<Kernel>,
}

impl TaskRunner {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Start, execute and finish one task.
    ///
    /// The task's own failure is recorded on the task; the returned error
    /// only reports failures of the tracker itself. A task claimed by another
    /// worker is skipped.
    pub fn run(&self, task_id: String, worker_id: String) -> BoxFuture<'static, Result<()>> {
        let kernel = self.kernel.clone();
        Box::pin(async move {
            let tracker = kernel.tracker();
            let task = match tracker.start_task(&task_id, &worker_id) {
                Ok(task) => task,
                Err(Error::TaskUnavailable { .. }) => {
                    tracing::debug!(task = %task_id, worker = %worker_id, "task owned elsewhere");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            let ctx = TaskContext {
                kernel: kernel.clone(),
                task,
                worker_id,
            };
            let result = match ctx.is_canceled() {
                Ok(true) => Err(Error::Canceled { id: task_id.clone() }),
                Ok(false) => execute(&ctx).await,
                Err(err) => Err(err),
            };

            let error = result.err().map(|err| err.to_string());
            kernel.tracker().finish_task(&task_id, error.as_deref())?;
            Ok(())
        })
    }
}

async fn execute(ctx: &TaskContext) -> Result<()> {
    match Mutation::from_task(ctx.task())? {
        Mutation::Job { .. } => Ok(()),
        Mutation::Control {
            workspace_id,
            component_id,
            operation,
        } => {
            let workspace = ctx.kernel().workspace(&workspace_id)?;
            workspace.control_component(&component_id, operation).await?;
            Ok(())
        }
        Mutation::ReconcileComponent {
            workspace_id,
            component_id,
        } => {
            let workspace = ctx.kernel().workspace(&workspace_id)?;
            reconcile::reconcile_component(ctx, &workspace, &component_id).await
        }
    }
}

/// Polls for unclaimed tasks and runs them one at a time.
#[derive(Debug, Clone)]
pub struct Worker {
    id: String,
    kernel: Arc<Kernel>,
    acquire_timeout: Duration,
}

impl Worker {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            id: format!("worker-{}", new_id()),
            acquire_timeout: kernel.config().acquire_timeout,
            kernel,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run tasks (optionally only from one job) until `shutdown` turns true
    /// or its sender goes away.
    pub async fn run(&self, job_id: Option<&str>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let runner = TaskRunner::new(self.kernel.clone());
        tracing::info!(worker = %self.id, "worker started");
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                acquired = self.kernel.tracker().acquire_task(&self.id, job_id, Some(self.acquire_timeout)) => {
                    if let Some(task) = acquired? {
                        runner.run(task.id, self.id.clone()).await?;
                    }
                }
            }
        }
        tracing::info!(worker = %self.id, "worker stopped");
        Ok(())
    }

    /// Run tasks until none becomes available within the acquire timeout.
    /// Returns the number of tasks executed.
    pub async fn run_until_idle(&self, job_id: Option<&str>) -> Result<usize> {
        let runner = TaskRunner::new(self.kernel.clone());
        let mut executed = 0;
        while let Some(task) = self
            .kernel
            .tracker()
            .acquire_task(&self.id, job_id, Some(self.acquire_timeout))
            .await?
        {
            runner.run(task.id, self.id.clone()).await?;
            executed += 1;
        }
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerFactory;
    use crate::kernel::KernelConfig;
    use corral_local_db::Database;

    fn detached_kernel() -> Arc<Kernel> {
        Arc::new(
            Kernel::new(Database::open_in_memory().unwrap(), ControllerFactory::new()).with_config(
                KernelConfig {
                    detached: true,
                    ..Default::default()
                },
            ),
        )
    }

    #[test]
    fn test_mutation_encoding() {
        let mutation = Mutation::Control {
            workspace_id: "w".to_string(),
            component_id: "c".to_string(),
            operation: Operation::Stop,
        };
        let new = mutation.to_new_task(Some("parent")).unwrap();
        assert_eq!(new.mutation, "control");
        assert_eq!(
            new.arguments,
            json!({ "workspace_id": "w", "component_id": "c", "operation": "stop" })
        );

        let kernel = detached_kernel();
        let job = kernel
            .tracker()
            .create_task(Mutation::Job { label: "x".to_string() }.to_new_task(None).unwrap())
            .unwrap();
        let task = kernel
            .tracker()
            .create_task(mutation.to_new_task(Some(&job.id)).unwrap())
            .unwrap();
        assert_eq!(Mutation::from_task(&task).unwrap(), mutation);
        assert_eq!(task.label(), "control");
    }

    #[tokio::test]
    async fn test_canceled_task_finishes_with_error() {
        let kernel = detached_kernel();
        let job = kernel
            .tracker()
            .create_task(Mutation::Job { label: "x".to_string() }.to_new_task(None).unwrap())
            .unwrap();
        kernel.tracker().cancel_task(&job.id).unwrap();

        TaskRunner::new(kernel.clone())
            .run(job.id.clone(), "w".to_string())
            .await
            .unwrap();
        let job = kernel.tracker().task_by_id(&job.id).unwrap().unwrap();
        assert_eq!(job.successful(), Some(false));
        assert!(job.error.unwrap().contains("canceled"));
    }

    #[tokio::test]
    async fn test_unknown_mutation_is_recorded_as_error() {
        let kernel = detached_kernel();
        let task = kernel
            .tracker()
            .create_task(NewTask::job("frobnicate", json!({})))
            .unwrap();
        TaskRunner::new(kernel.clone())
            .run(task.id.clone(), "w".to_string())
            .await
            .unwrap();
        let task = kernel.tracker().task_by_id(&task.id).unwrap().unwrap();
        assert!(task.error.unwrap().contains("frobnicate"));
    }

    #[tokio::test]
    async fn test_worker_drains_job() {
        let kernel = detached_kernel();
        let tracker = kernel.tracker();
        let job = tracker
            .create_task(Mutation::Job { label: "x".to_string() }.to_new_task(None).unwrap())
            .unwrap();
        for _ in 0..3 {
            tracker
                .create_task(
                    Mutation::Job { label: "step".to_string() }
                        .to_new_task(Some(&job.id))
                        .unwrap(),
                )
                .unwrap();
        }

        let worker = Worker::new(kernel.clone()).with_acquire_timeout(Duration::from_millis(20));
        assert_eq!(worker.run_until_idle(Some(&job.id)).await.unwrap(), 4);
        let job = tracker.task_by_id(&job.id).unwrap().unwrap();
        assert_eq!(job.successful(), Some(true));
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let kernel = detached_kernel();
        let worker = Worker::new(kernel).with_acquire_timeout(Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(None, rx).await });
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
