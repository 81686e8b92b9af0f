//! Background task worker
//!
//! The worker claims queued tasks from the broker and runs them through the
//! same plan/execute path as a synchronous caller.
//!
//! ## Lifecycle
//!
//! 1. Create with [`TaskWorker::new()`]
//! 2. Start with [`TaskWorker::run()`]
//! 3. The worker polls until SIGINT/SIGTERM
//! 4. A shutdown signal during a task stops it before its next operation
//!
//! ## Cancellation
//!
//! Cooperative: the cancel flag is checked between operations. A write
//! already issued to the remote is never aborted in flight.
//!
//! ## Retention
//!
//! After every finished task the worker asks the broker to forget terminal
//! tasks older than `retention_secs`.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::orchestrator::{BatchSummary, ExecutionObserver, Orchestrator, plan_as};
use crate::traits::{Task, TaskBroker, TaskState};

/// Capacity of the worker event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the TaskWorker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Worker started polling
    Started,

    /// A queued task was claimed
    TaskClaimed { task_id: String },

    /// An operation of a running task finished
    TaskProgress {
        task_id: String,
        done: usize,
        total: usize,
    },

    /// A task reached a terminal state
    TaskFinished {
        task_id: String,
        state: TaskState,
        summary: Option<BatchSummary>,
    },

    /// Worker stopped
    Stopped { reason: String },
}

/// Background worker executing queued bulk runs
pub struct TaskWorker {
    broker: Arc<dyn TaskBroker>,
    orchestrator: Orchestrator,
    config: WorkerConfig,
    stopping: AtomicBool,
    event_tx: mpsc::Sender<WorkerEvent>,
}

impl TaskWorker {
    /// Create a new worker
    ///
    /// # Returns
    ///
    /// A tuple of (worker, event_receiver) where event_receiver yields worker events
    pub fn new(
        broker: Arc<dyn TaskBroker>,
        orchestrator: Orchestrator,
        config: WorkerConfig,
    ) -> (Self, mpsc::Receiver<WorkerEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let worker = Self {
            broker,
            orchestrator,
            config,
            stopping: AtomicBool::new(false),
            event_tx: tx,
        };
        (worker, rx)
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run until `shutdown_rx` fires (or, if `None`, until SIGINT/SIGTERM)
    ///
    /// Tests drive shutdown through the channel; the daemon uses OS signals.
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.emit_event(WorkerEvent::Started);
        info!(
            "Task worker started (poll interval {}ms)",
            self.config.poll_interval_ms
        );

        let signal = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => wait_for_os_signal().await,
            }
        };
        tokio::pin!(signal);
        let mut signalled = false;

        while !signalled {
            let claimed = tokio::select! {
                _ = &mut signal, if !signalled => {
                    signalled = true;
                    continue;
                }
                claimed = self.broker.claim_next() => claimed,
            };

            match claimed {
                Ok(Some((task, payload))) => {
                    let work = async {
                        self.process(task, payload).await;
                        self.purge_finished().await;
                    };
                    tokio::pin!(work);
                    loop {
                        tokio::select! {
                            _ = &mut work => break,
                            _ = &mut signal, if !signalled => {
                                info!("Shutdown signal received, stopping after the current operation");
                                signalled = true;
                                self.stopping.store(true, Ordering::SeqCst);
                            }
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                        _ = &mut signal, if !signalled => signalled = true,
                    }
                }
                Err(e) => {
                    error!("Failed to claim task: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                        _ = &mut signal, if !signalled => signalled = true,
                    }
                }
            }
        }

        info!("Shutdown signal received, task worker stopped");
        self.emit_event(WorkerEvent::Stopped {
            reason: "Shutdown signal".to_string(),
        });
        Ok(())
    }

    /// Claim and run at most one task
    ///
    /// # Returns
    ///
    /// - `Ok(Some(task))`: The task in its terminal state
    /// - `Ok(None)`: Queue was empty
    pub async fn run_once(&self) -> Result<Option<Task>> {
        match self.broker.claim_next().await? {
            Some((task, payload)) => {
                let task = self.process(task, payload).await;
                self.purge_finished().await;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Drop terminal tasks older than the retention window
    async fn purge_finished(&self) {
        let cutoff = i64::try_from(self.config.retention_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .and_then(|retention| chrono::Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return;
        };
        match self.broker.purge_finished(cutoff).await {
            Ok(0) => {}
            Ok(removed) => debug!("Purged {} finished tasks", removed),
            Err(e) => warn!("Failed to purge finished tasks: {}", e),
        }
    }

    async fn process(&self, mut task: Task, payload: Value) -> Task {
        let task_id = task.task_id.clone();
        self.emit_event(WorkerEvent::TaskClaimed {
            task_id: task_id.clone(),
        });
        info!("Running task {}", task_id);

        let batch_id = task
            .batch_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let batch = match plan_as(&payload, batch_id) {
            Ok(batch) => batch,
            Err(e) => {
                error!("Task {} failed planning: {}", task_id, e);
                return self.finish(task, TaskState::Failed, None, Some(e.to_string())).await;
            }
        };

        task.batch_id = Some(batch.batch_id.clone());
        task.progress.done = 0;
        task.progress.total = batch.len();
        self.publish(&task).await;

        let observer = BrokerObserver {
            worker: self,
            task: Mutex::new(task),
            cancelled_by_request: AtomicBool::new(false),
        };
        let outcome = self
            .orchestrator
            .execute_observed(batch, self.config.confirm_writes, &observer)
            .await;
        let cancelled_by_request = observer.cancelled_by_request.load(Ordering::SeqCst);
        let task = observer.task.into_inner();

        match outcome {
            Ok(result) if result.cancelled && cancelled_by_request => {
                self.finish(task, TaskState::Cancelled, Some(result.summary), None).await
            }
            Ok(result) if result.cancelled => {
                let message = format!(
                    "worker shut down after {} of {} operations",
                    task.progress.done, task.progress.total
                );
                self.finish(task, TaskState::Failed, Some(result.summary), Some(message)).await
            }
            Ok(result) => {
                self.finish(task, TaskState::Succeeded, Some(result.summary), None).await
            }
            Err(e) => {
                error!("Task {} failed: {}", task_id, e);
                self.finish(task, TaskState::Failed, None, Some(e.to_string())).await
            }
        }
    }

    async fn finish(
        &self,
        mut task: Task,
        state: TaskState,
        summary: Option<BatchSummary>,
        error: Option<String>,
    ) -> Task {
        if let Err(e) = task.transition(state) {
            warn!("Task {} not finalized: {}", task.task_id, e);
            return task;
        }
        task.result_summary = summary;
        task.error = error;
        self.publish(&task).await;

        info!("Task {} finished: {:?}", task.task_id, task.state);
        self.emit_event(WorkerEvent::TaskFinished {
            task_id: task.task_id.clone(),
            state: task.state,
            summary,
        });
        task
    }

    async fn publish(&self, task: &Task) {
        if let Err(e) = self.broker.save(task).await {
            warn!("Failed to publish status of task {}: {}", task.task_id, e);
        }
    }

    /// Emit a worker event, dropping it if the channel is full
    fn emit_event(&self, event: WorkerEvent) {
        if self.event_tx.try_send(event).is_err() {
            debug!("Worker event channel full or closed, dropping event");
        }
    }
}

/// Publishes progress to the broker and polls the cancel flag
struct BrokerObserver<'a> {
    worker: &'a TaskWorker,
    task: Mutex<Task>,
    cancelled_by_request: AtomicBool,
}

#[async_trait::async_trait]
impl ExecutionObserver for BrokerObserver<'_> {
    async fn on_progress(&self, done: usize, total: usize) {
        let snapshot = {
            let mut task = self.task.lock().await;
            task.progress.done = done;
            task.progress.total = total;
            task.updated_at = chrono::Utc::now();
            task.clone()
        };
        self.worker.publish(&snapshot).await;
        self.worker.emit_event(WorkerEvent::TaskProgress {
            task_id: snapshot.task_id,
            done,
            total,
        });
    }

    async fn is_cancelled(&self) -> bool {
        let task_id = self.task.lock().await.task_id.clone();
        match self.worker.broker.is_cancel_requested(&task_id).await {
            Ok(true) => {
                info!("Task {} cancel requested", task_id);
                self.cancelled_by_request.store(true, Ordering::SeqCst);
                return true;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to read cancel flag of task {}: {}", task_id, e),
        }
        self.worker.stopping.load(Ordering::SeqCst)
    }
}

/// Wait for SIGINT or (on Unix) SIGTERM
async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
