// # Task Broker Trait
//
// Defines the interface between task submitters and background workers.
//
// ## Purpose
//
// The broker is both the durable queue (payloads waiting for a worker) and
// the shared status store that `status()` polls while a worker publishes
// progress. Cancellation is a flag stored here and checked by the worker
// between operations.
//
// ## Implementations
//
// - In-memory: `ipam_core::broker::MemoryBroker`
// - JSON file: `ipam_core::broker::FileBroker`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::orchestrator::BatchSummary;

/// Lifecycle state of a background task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a worker
    Queued,
    /// Claimed by a worker
    Running,
    /// Finished; per-operation failures may still be recorded in the summary
    Succeeded,
    /// Planning failed or the worker hit a fatal error
    Failed,
    /// Stopped by a cancel request
    Cancelled,
}

impl TaskState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Operation counters published by the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Operations finished (any outcome)
    pub done: usize,
    /// Operations planned
    pub total: usize,
}

/// Status record of a background task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier
    pub task_id: String,
    /// Current state
    pub state: TaskState,
    /// Progress counters
    pub progress: TaskProgress,
    /// Batch identifier once planning succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Outcome counters once the run ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<BatchSummary>,
    /// Fatal error, if the task failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
    /// Last state or progress change
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a queued task
    ///
    /// # Visibility
    ///
    /// `pub(crate)`: tasks are created by `TaskManager::submit` only.
    pub(crate) fn queued(task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            state: TaskState::Queued,
            progress: TaskProgress::default(),
            batch_id: None,
            result_summary: None,
            error: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Move to a new state, refusing to leave a terminal state
    pub fn transition(&mut self, next: TaskState) -> Result<(), crate::Error> {
        if self.state.is_terminal() {
            return Err(crate::Error::conflict(format!(
                "task {} is already {:?}",
                self.task_id, self.state
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Trait for task broker implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from the submitting
/// process and any number of workers.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Check that the broker is reachable
    ///
    /// Submission calls this first and maps any failure to
    /// [`Error::QueueUnavailable`](crate::Error::QueueUnavailable).
    async fn ping(&self) -> Result<(), crate::Error>;

    /// Store a queued task together with its raw input
    async fn enqueue(&self, task: &Task, payload: &Value) -> Result<(), crate::Error>;

    /// Claim the oldest queued task, marking it running
    ///
    /// # Returns
    ///
    /// - `Ok(Some((task, payload)))`: The claimed task (already `Running`) and its input
    /// - `Ok(None)`: Queue is empty
    async fn claim_next(&self) -> Result<Option<(Task, Value)>, crate::Error>;

    /// Persist a task status update
    ///
    /// Fails with [`Error::Conflict`](crate::Error::Conflict) if the stored task is terminal.
    async fn save(&self, task: &Task) -> Result<(), crate::Error>;

    /// Load a task status
    async fn load(&self, task_id: &str) -> Result<Option<Task>, crate::Error>;

    /// Flag a task for cancellation
    ///
    /// A queued task is cancelled immediately. A running task keeps running
    /// until its worker observes the flag. Terminal tasks are returned unchanged.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(task))`: The task after the request was recorded
    /// - `Ok(None)`: Unknown task
    async fn request_cancel(&self, task_id: &str) -> Result<Option<Task>, crate::Error>;

    /// Whether cancellation was requested for a task
    async fn is_cancel_requested(&self, task_id: &str) -> Result<bool, crate::Error>;

    /// List all known tasks
    async fn list(&self) -> Result<Vec<Task>, crate::Error>;

    /// Forget terminal tasks last updated at or before `cutoff`
    ///
    /// Queued and running tasks are never removed.
    ///
    /// # Returns
    ///
    /// The number of tasks removed
    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize, crate::Error>;
}

/// Helper trait for constructing brokers from configuration
#[async_trait]
pub trait TaskBrokerFactory: Send + Sync {
    /// Create a broker instance from configuration
    async fn create(
        &self,
        config: &crate::config::BrokerConfig,
    ) -> Result<Arc<dyn TaskBroker>, crate::Error>;
}
