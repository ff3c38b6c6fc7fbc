//! Task and job tracking.
//!
//! Tasks form trees; the root of a tree is a job and every task in it shares
//! the root's ID as its job ID. All coordination between workers happens
//! through conditional updates in the database: a task is claimed only where
//! it was unclaimed, progress is accepted only from the claiming worker, and a
//! task completes only once it has finished and all of its children have
//! completed.

use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

use corral_local_db::{
    now_timestamp, Connection, Database, TaskEventRecord, TaskEventStore, TaskRecord, TaskStore,
    EVENT_TASK_COMPLETED, EVENT_TASK_FINISHED, EVENT_TASK_STARTED,
};

use crate::{Error, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// Parameters for [`TaskTracker::create_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Pre-allocated task ID; generated when absent.
    pub id: Option<String>,
    /// Parent task; `None` creates a new job.
    pub parent_id: Option<String>,
    pub mutation: String,
    pub arguments: serde_json::Value,
    /// Worker that owns the task from the start; it is created started.
    pub worker_id: Option<String>,
}

impl NewTask {
    pub fn job<S: Into<String>>(mutation: S, arguments: serde_json::Value) -> Self {
        Self {
            id: None,
            parent_id: None,
            mutation: mutation.into(),
            arguments,
            worker_id: None,
        }
    }

    pub fn child<P: Into<String>, S: Into<String>>(
        parent_id: P,
        mutation: S,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            parent_id: Some(parent_id.into()),
            mutation: mutation.into(),
            arguments,
            worker_id: None,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Create the task already claimed and started by `worker_id`, so no
    /// other worker can pick it up in between.
    pub fn claimed_by<S: Into<String>>(mut self, worker_id: S) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

/// Generate a new opaque identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Owns the task tree.
#[derive(Debug, Clone)]
pub struct TaskTracker {
    db: Database,
}

impl TaskTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a task. Without a parent the task becomes the root of a new job.
    pub fn create_task(&self, new: NewTask) -> Result<TaskRecord> {
        let id = new.id.unwrap_or_else(new_id);
        let arguments = serde_json::to_string(&new.arguments)?;
        let parent_id = new.parent_id;

        let created = self.db.transaction(|conn| {
            let store = TaskStore::new(conn);
            let job_id = match &parent_id {
                None => id.clone(),
                Some(parent) => match store.get(parent)? {
                    Some(parent) => parent.job_id,
                    None => return Ok(None),
                },
            };
            let now = now_timestamp();
            let record = TaskRecord {
                id: id.clone(),
                job_id,
                parent_id: parent_id.clone(),
                mutation: new.mutation.clone(),
                arguments: arguments.clone(),
                worker_id: new.worker_id.clone(),
                created_at: now.clone(),
                updated_at: now.clone(),
                started_at: new.worker_id.as_ref().map(|_| now.clone()),
                canceled_at: None,
                finished_at: None,
                completed_at: None,
                progress_current: None,
                progress_total: None,
                error: None,
            };
            store.insert(&record)?;
            if record.started_at.is_some() {
                TaskEventStore::new(conn).insert(&record.id, &record.job_id, EVENT_TASK_STARTED, None)?;
            }
            Ok(Some(record))
        })?;

        let record = created.ok_or_else(|| Error::NoSuchParent {
            id: parent_id.unwrap_or_default(),
        })?;
        tracing::debug!(task = %record.id, job = %record.job_id, mutation = %record.mutation, "created task");
        Ok(record)
    }

    /// Claim an unclaimed task, optionally within one job.
    ///
    /// Polls with exponential backoff until a task is available. With a
    /// timeout, returns `None` once it elapses; without one, waits forever.
    pub async fn acquire_task(
        &self,
        worker_id: &str,
        job_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Option<TaskRecord>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut delay = INITIAL_BACKOFF;
        loop {
            let claimed = self.db.with_connection(|conn| {
                TaskStore::new(conn).claim_next(worker_id, job_id, &now_timestamp())
            })?;
            if let Some(task) = claimed {
                tracing::debug!(task = %task.id, worker = worker_id, "acquired task");
                return Ok(Some(task));
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    delay.min(deadline - now)
                }
                None => delay,
            };
            tokio::time::sleep(pause).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }

    /// Mark a task started by `worker_id`, claiming it if unclaimed.
    pub fn start_task(&self, id: &str, worker_id: &str) -> Result<TaskRecord> {
        let started = self.db.with_connection(|conn| {
            let started = TaskStore::new(conn).mark_started(id, worker_id, &now_timestamp())?;
            if let Some(task) = &started {
                TaskEventStore::new(conn).insert(&task.id, &task.job_id, EVENT_TASK_STARTED, None)?;
            }
            Ok(started)
        })?;
        let task = started.ok_or_else(|| Error::TaskUnavailable { id: id.to_string() })?;
        tracing::info!(task = %task.id, worker = worker_id, mutation = %task.mutation, "task started");
        Ok(task)
    }

    /// Merge progress fields into a task claimed by `worker_id`.
    pub fn update_task(
        &self,
        id: &str,
        worker_id: &str,
        current: Option<i64>,
        total: Option<i64>,
    ) -> Result<TaskRecord> {
        let updated = self.db.with_connection(|conn| {
            TaskStore::new(conn).update_progress(id, worker_id, current, total, &now_timestamp())
        })?;
        updated.ok_or_else(|| Error::TaskUnavailable { id: id.to_string() })
    }

    /// Mark a task finished, recording `error` unless one was already recorded,
    /// then propagate completion up the tree.
    pub fn finish_task(&self, id: &str, error: Option<&str>) -> Result<TaskRecord> {
        let finished = self.db.transaction(|conn| {
            let store = TaskStore::new(conn);
            let Some(task) = store.mark_finished(id, error, &now_timestamp())? else {
                return Ok(None);
            };
            let data = json!({ "error": task.error }).to_string();
            TaskEventStore::new(conn).insert(&task.id, &task.job_id, EVENT_TASK_FINISHED, Some(&data))?;
            propagate_completion(conn, &task.id)?;
            Ok(store.get(id)?)
        })?;
        let task = finished.ok_or_else(|| Error::NoSuchTask { id: id.to_string() })?;
        match &task.error {
            Some(error) => tracing::warn!(task = %task.id, %error, "task failed"),
            None => tracing::info!(task = %task.id, "task finished"),
        }
        Ok(task)
    }

    /// Cancel a task and its whole unfinished subtree.
    pub fn cancel_task(&self, id: &str) -> Result<usize> {
        self.cancel(id, true)
    }

    /// Cancel the unfinished descendants of a task but not the task itself.
    pub fn cancel_subtasks(&self, id: &str) -> Result<usize> {
        self.cancel(id, false)
    }

    fn cancel(&self, id: &str, include_root: bool) -> Result<usize> {
        let canceled = self.db.with_connection(|conn| {
            TaskStore::new(conn).cancel_subtree(id, include_root, &now_timestamp())
        })?;
        tracing::info!(task = id, canceled, "canceled tasks");
        Ok(canceled)
    }

    /// Whether cancellation has been requested for the task.
    pub fn is_canceled(&self, id: &str) -> Result<bool> {
        let task = self.task_by_id(id)?.ok_or_else(|| Error::NoSuchTask { id: id.to_string() })?;
        Ok(task.canceled_at.is_some())
    }

    pub fn task_by_id(&self, id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.db.with_connection(|conn| TaskStore::new(conn).get(id))?)
    }

    pub fn tasks_by_job_id(&self, job_id: &str) -> Result<Vec<TaskRecord>> {
        self.tasks_by_job_ids(&[job_id.to_string()])
    }

    pub fn tasks_by_job_ids(&self, job_ids: &[String]) -> Result<Vec<TaskRecord>> {
        Ok(self.db.with_connection(|conn| TaskStore::new(conn).by_job_ids(job_ids))?)
    }

    pub fn children(&self, id: &str) -> Result<Vec<TaskRecord>> {
        Ok(self.db.with_connection(|conn| TaskStore::new(conn).children(id))?)
    }

    pub fn all_tasks(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.db.with_connection(|conn| TaskStore::new(conn).all())?)
    }

    /// Lifecycle events of a job, optionally only those after `after_id`.
    pub fn task_events(&self, job_id: &str, after_id: Option<i64>) -> Result<Vec<TaskEventRecord>> {
        Ok(self
            .db
            .with_connection(|conn| TaskEventStore::new(conn).by_job(job_id, after_id))?)
    }
}

/// Walk from `id` towards the root, completing every task whose children
/// have all completed. Stops at the first task that cannot complete yet.
fn propagate_completion(conn: &Connection, id: &str) -> corral_local_db::Result<()> {
    let store = TaskStore::new(conn);
    let events = TaskEventStore::new(conn);
    let mut next = Some(id.to_string());
    while let Some(id) = next {
        let completed = store.mark_completed_if_ready(&id, &now_timestamp())?;
        let Some(task) = store.get(&id)? else {
            break;
        };
        if completed {
            events.insert(&task.id, &task.job_id, EVENT_TASK_COMPLETED, None)?;
            tracing::debug!(task = %task.id, "task completed");
        }
        if task.completed_at.is_none() {
            break;
        }
        next = task.parent_id;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker() -> TaskTracker {
        TaskTracker::new(Database::open_in_memory().unwrap())
    }

    fn job(tracker: &TaskTracker) -> TaskRecord {
        tracker.create_task(NewTask::job("job", json!({}))).unwrap()
    }

    fn child(tracker: &TaskTracker, parent: &TaskRecord) -> TaskRecord {
        tracker
            .create_task(NewTask::child(&parent.id, "step", json!({})))
            .unwrap()
    }

    #[test]
    fn test_children_inherit_job_id() {
        let tracker = tracker();
        let root = job(&tracker);
        assert_eq!(root.job_id, root.id);
        let middle = child(&tracker, &root);
        let leaf = child(&tracker, &middle);
        assert_eq!(leaf.job_id, root.id);
        assert_eq!(tracker.tasks_by_job_id(&root.id).unwrap().len(), 3);
    }

    #[test]
    fn test_missing_parent_is_rejected() {
        let tracker = tracker();
        let err = tracker
            .create_task(NewTask::child("nope", "step", json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchParent { ref id } if id == "nope"));
    }

    #[test]
    fn test_finish_rolls_back_when_propagation_fails() {
        let tracker = tracker();
        let root = job(&tracker);
        let leaf = child(&tracker, &root);
        tracker.finish_task(&root.id, None).unwrap();

        let trigger = format!(
            "CREATE TRIGGER hold_root BEFORE UPDATE OF completed_at ON tasks \
             WHEN NEW.id = '{}' BEGIN SELECT RAISE(ABORT, 'root is held'); END",
            root.id
        );
        tracker.db.with_connection(|conn| Ok(conn.execute_batch(&trigger)?)).unwrap();
        assert!(tracker.finish_task(&leaf.id, Some("boom")).is_err());

        let leaf_now = tracker.task_by_id(&leaf.id).unwrap().unwrap();
        assert!(leaf_now.finished_at.is_none());
        assert!(leaf_now.error.is_none());

        tracker
            .db
            .with_connection(|conn| Ok(conn.execute_batch("DROP TRIGGER hold_root")?))
            .unwrap();
        tracker.finish_task(&leaf.id, Some("boom")).unwrap();
        let root = tracker.task_by_id(&root.id).unwrap().unwrap();
        assert!(root.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_claimed_task_is_not_acquirable() {
        let tracker = tracker();
        let root = tracker
            .create_task(NewTask::job("job", json!({})).claimed_by("kernel"))
            .unwrap();
        assert_eq!(root.worker_id.as_deref(), Some("kernel"));
        assert!(root.started_at.is_some());
        let acquired = tracker
            .acquire_task("other", None, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(acquired.is_none());
        assert_eq!(tracker.task_events(&root.id, None).unwrap().len(), 1);
    }

    #[test]
    fn test_preallocated_id_is_used() {
        let tracker = tracker();
        let root = tracker
            .create_task(NewTask::job("job", json!({})).with_id("fixed"))
            .unwrap();
        assert_eq!(root.id, "fixed");
        assert_eq!(root.job_id, "fixed");
    }

    #[test]
    fn test_start_requires_matching_claim() {
        let tracker = tracker();
        let root = job(&tracker);
        tracker.start_task(&root.id, "a").unwrap();
        let err = tracker.start_task(&root.id, "b").unwrap_err();
        assert!(matches!(err, Error::TaskUnavailable { .. }));
        assert!(tracker.update_task(&root.id, "b", Some(1), Some(2)).is_err());
        let updated = tracker.update_task(&root.id, "a", Some(1), Some(2)).unwrap();
        assert_eq!(updated.message(), "1/2");
    }

    #[tokio::test]
    async fn test_acquire_times_out_without_work() {
        let tracker = tracker();
        let acquired = tracker
            .acquire_task("w", None, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(acquired.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_claims_once() {
        let tracker = Arc::new(tracker());
        let root = job(&tracker);

        let mut handles = Vec::new();
        for n in 0..8 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let worker = format!("worker-{n}");
                tracker
                    .acquire_task(&worker, None, Some(Duration::from_millis(50)))
                    .await
                    .unwrap()
            }));
        }

        let mut claims = Vec::new();
        for handle in handles {
            if let Some(task) = handle.await.unwrap() {
                claims.push(task);
            }
        }
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].id, root.id);
    }

    #[test]
    fn test_completion_is_bottom_up() {
        let tracker = tracker();
        let root = job(&tracker);
        let left = child(&tracker, &root);
        let right = child(&tracker, &root);
        let left_a = child(&tracker, &left);
        let left_b = child(&tracker, &left);
        let completed = |id: &str| tracker.task_by_id(id).unwrap().unwrap().completed_at.is_some();

        tracker.finish_task(&root.id, None).unwrap();
        tracker.finish_task(&left.id, None).unwrap();
        tracker.finish_task(&left_b.id, None).unwrap();
        assert!(completed(&left_b.id));
        assert!(!completed(&left.id));

        tracker.finish_task(&right.id, Some("failed")).unwrap();
        assert!(completed(&right.id));
        assert!(!completed(&root.id));

        tracker.finish_task(&left_a.id, None).unwrap();
        assert!(completed(&left.id));
        assert!(completed(&root.id));

        let root = tracker.task_by_id(&root.id).unwrap().unwrap();
        assert_eq!(root.successful(), Some(true));
        let right = tracker.task_by_id(&right.id).unwrap().unwrap();
        assert_eq!(right.successful(), Some(false));

        let events = tracker.task_events(&root.id, None).unwrap();
        let completions = events
            .iter()
            .filter(|e| e.type_ == EVENT_TASK_COMPLETED)
            .count();
        assert_eq!(completions, 5);
        assert_eq!(events.last().unwrap().task_id, root.id);
    }

    #[test]
    fn test_first_error_is_kept() {
        let tracker = tracker();
        let root = job(&tracker);
        tracker.finish_task(&root.id, Some("first")).unwrap();
        let task = tracker.finish_task(&root.id, Some("second")).unwrap();
        assert_eq!(task.error.as_deref(), Some("first"));
    }

    #[test]
    fn test_cancel_affects_subtree_only() {
        let tracker = tracker();
        let root = job(&tracker);
        let target = child(&tracker, &root);
        let sibling = child(&tracker, &root);
        let below = child(&tracker, &target);
        let done = child(&tracker, &target);
        tracker.finish_task(&done.id, None).unwrap();

        assert_eq!(tracker.cancel_task(&target.id).unwrap(), 2);
        assert!(tracker.is_canceled(&target.id).unwrap());
        assert!(tracker.is_canceled(&below.id).unwrap());
        assert!(!tracker.is_canceled(&done.id).unwrap());
        assert!(!tracker.is_canceled(&sibling.id).unwrap());
        assert!(!tracker.is_canceled(&root.id).unwrap());
    }

    #[test]
    fn test_cancel_subtasks_spares_parent() {
        let tracker = tracker();
        let root = job(&tracker);
        let step = child(&tracker, &root);
        tracker.cancel_subtasks(&root.id).unwrap();
        assert!(!tracker.is_canceled(&root.id).unwrap());
        assert!(tracker.is_canceled(&step.id).unwrap());
    }
}
