//! Job inspection, cancellation and the worker pool.

use anyhow::Result;
use clap::Args;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use corral_core::{Mutation, Worker};
use corral_local_db::TaskRecord;

use crate::Context;

#[derive(Args)]
pub struct JobsArgs {
    /// Show the task tree of this job
    #[arg(value_name = "JOB")]
    pub job: Option<String>,
}

impl JobsArgs {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let tracker = ctx.kernel.tracker();
        match self.job {
            Some(job_id) => {
                let tasks = tracker.tasks_by_job_id(&job_id)?;
                if tasks.is_empty() {
                    anyhow::bail!("no such job: {}", job_id);
                }
                print!("{}", render_tree(&tasks));
            }
            None => {
                for job in tracker.all_tasks()?.iter().filter(|t| t.parent_id.is_none()) {
                    println!("{}\t{}\t{}", job.id, status(job), describe(job));
                }
            }
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct CancelArgs {
    #[arg(value_name = "TASK")]
    pub task: String,
}

impl CancelArgs {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let canceled = ctx.kernel.tracker().cancel_task(&self.task)?;
        println!("canceled {} task(s)", canceled);
        Ok(())
    }
}

#[derive(Args)]
pub struct WorkerArgs {
    /// Only run tasks of this job, and exit once it is drained
    #[arg(long = "job", value_name = "JOB")]
    pub job: Option<String>,

    /// Number of workers (defaults to the configured concurrency)
    #[arg(short = 'c', long = "concurrency", value_name = "N")]
    pub concurrency: Option<usize>,
}

impl WorkerArgs {
    pub async fn run(self, ctx: &Context) -> Result<()> {
        let concurrency = self.concurrency.unwrap_or(ctx.config.worker.concurrency).max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        for _ in 0..concurrency {
            let worker = Worker::new(ctx.kernel.clone());
            let job = self.job.clone();
            let shutdown = shutdown_rx.clone();
            workers.spawn(async move {
                match job {
                    Some(job) => worker.run_until_idle(Some(&job)).await.map(|_| ()),
                    None => worker.run(None, shutdown).await,
                }
            });
        }
        tracing::info!(concurrency, "workers running");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = shutdown_tx.send(true);
                }
                joined = workers.join_next() => match joined {
                    Some(result) => result??,
                    None => break,
                },
            }
        }
        Ok(())
    }
}

/// Human readable description of what a task does.
pub fn describe(task: &TaskRecord) -> String {
    match Mutation::from_task(task) {
        Ok(Mutation::Job { label }) => label,
        Ok(Mutation::Control {
            component_id,
            operation,
            ..
        }) => format!("{} {}", operation, component_id),
        Ok(Mutation::ReconcileComponent { component_id, .. }) => {
            format!("reconcile {}", component_id)
        }
        Err(_) => task.label().to_string(),
    }
}

pub fn status(task: &TaskRecord) -> &'static str {
    match task.successful() {
        Some(true) => "done",
        Some(false) => "failed",
        None if task.canceled_at.is_some() => "canceling",
        None if task.finished_at.is_some() => "waiting",
        None if task.started_at.is_some() => "running",
        None => "queued",
    }
}

/// Render a job's tasks as an indented tree, children under their parent.
pub fn render_tree(tasks: &[TaskRecord]) -> String {
    let mut children: HashMap<Option<&str>, Vec<&TaskRecord>> = HashMap::new();
    for task in tasks {
        children.entry(task.parent_id.as_deref()).or_default().push(task);
    }
    let present = |id: &str| tasks.iter().any(|t| t.id == id);
    let roots: Vec<&TaskRecord> = tasks
        .iter()
        .filter(|t| t.parent_id.as_deref().map_or(true, |parent| !present(parent)))
        .collect();

    let mut out = String::new();
    let mut stack: Vec<(&TaskRecord, usize)> = roots.into_iter().rev().map(|t| (t, 0)).collect();
    while let Some((task, depth)) = stack.pop() {
        let message = task.message();
        out.push_str(&format!("{}{} [{}]", "  ".repeat(depth), describe(task), status(task)));
        if !message.is_empty() {
            out.push_str(&format!(" {}", message));
        }
        out.push('\n');
        if let Some(kids) = children.get(&Some(task.id.as_str())) {
            stack.extend(kids.iter().rev().map(|kid| (*kid, depth + 1)));
        }
    }
    out
}

/// Poll interval used when watching jobs.
pub const WATCH_INTERVAL: Duration = Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::Operation;
    use serde_json::json;

    fn task(id: &str, parent: Option<&str>, mutation: &str, arguments: serde_json::Value) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            job_id: "j".to_string(),
            parent_id: parent.map(str::to_string),
            mutation: mutation.to_string(),
            arguments: arguments.to_string(),
            worker_id: None,
            created_at: "t".to_string(),
            updated_at: "t".to_string(),
            started_at: Some("t".to_string()),
            canceled_at: None,
            finished_at: Some("t".to_string()),
            completed_at: Some("t".to_string()),
            progress_current: None,
            progress_total: None,
            error: None,
        }
    }

    #[test]
    fn test_render_tree() {
        let control = json!({
            "workspace_id": "w",
            "component_id": "web",
            "operation": Operation::Stop,
        });
        let mut failed = task("c2", Some("j"), "control", control.clone());
        failed.error = Some("provider error: stop failed".to_string());
        let tasks = vec![
            task("j", None, "job", json!({"label": "stopping"})),
            task("c1", Some("j"), "control", control),
            failed,
        ];
        assert_eq!(
            render_tree(&tasks),
            "stopping [done]\n  stop web [done]\n  stop web [failed] error: provider error: stop failed\n"
        );
    }

    #[test]
    fn test_status_of_unfinished_tasks() {
        let mut t = task("j", None, "job", json!({"label": "x"}));
        t.completed_at = None;
        assert_eq!(status(&t), "waiting");
        t.finished_at = None;
        assert_eq!(status(&t), "running");
        t.started_at = None;
        assert_eq!(status(&t), "queued");
    }
}
