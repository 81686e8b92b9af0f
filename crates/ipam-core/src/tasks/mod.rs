//! Asynchronous task layer
//!
//! Large bulk runs are handed to a worker through a [`TaskBroker`]:
//!
//! ```text
//! submit(raw) ──ping──▶ broker unreachable? ──▶ QueueUnavailable (no sync fallback)
//!      │
//!      └─plan (validation only)──▶ enqueue(Task{queued}, raw) ──▶ task id
//!
//! TaskWorker: claim_next ──▶ plan_as(raw, batch id) ──▶ execute_observed
//!                               progress ──▶ broker.save ◀── status(task id)
//!                               cancel flag ◀── cancel(task id)
//! ```

pub mod worker;

pub use worker::{TaskWorker, WorkerEvent};

use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::error::{Error, Result};
use crate::orchestrator::plan;
use crate::traits::{Task, TaskBroker};

/// Submitter-side handle on the task layer
#[derive(Clone)]
pub struct TaskManager {
    broker: Arc<dyn TaskBroker>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager").finish_non_exhaustive()
    }
}

impl TaskManager {
    pub fn new(broker: Arc<dyn TaskBroker>) -> Self {
        Self { broker }
    }

    /// Queue a bulk run for a worker
    ///
    /// The input is planned once here so malformed input is rejected at
    /// submission rather than inside the worker.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueUnavailable`] if the broker cannot be reached
    /// - [`Error::Validation`] / [`Error::Conflict`] if planning fails
    pub async fn submit(&self, raw: &Value) -> Result<String> {
        self.broker
            .ping()
            .await
            .map_err(|e| Error::queue_unavailable(e.to_string()))?;

        let batch = plan(raw)?;

        let task_id = uuid::Uuid::new_v4().to_string();
        let mut task = Task::queued(task_id.clone());
        task.batch_id = Some(batch.batch_id);
        task.progress.total = batch.operations.len();

        self.broker
            .enqueue(&task, raw)
            .await
            .map_err(|e| Error::queue_unavailable(e.to_string()))?;

        info!("Submitted task {} ({} operations)", task_id, task.progress.total);
        Ok(task_id)
    }

    /// Current status of a task
    pub async fn status(&self, task_id: &str) -> Result<Task> {
        self.broker
            .load(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// Request cancellation
    ///
    /// Queued tasks are cancelled at once. Running tasks stop before their
    /// next operation; writes already issued are not undone.
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let task = self
            .broker
            .request_cancel(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        info!("Cancel requested for task {} ({:?})", task_id, task.state);
        Ok(task)
    }

    /// All known tasks, oldest first
    pub async fn list(&self) -> Result<Vec<Task>> {
        self.broker.list().await
    }
}
