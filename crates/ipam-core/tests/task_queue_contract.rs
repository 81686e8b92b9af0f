//! Architectural Contract Test: Asynchronous Task Queue
//!
//! This test verifies the submit / status / cancel contract of the task
//! layer.
//!
//! Constraints verified:
//! - An unreachable broker fails submission with QueueUnavailable (no sync fallback)
//! - A failing record inside a task does not fail its siblings
//! - Progress and the final summary are visible through status()
//! - Cancelling a queued task means it never runs
//! - Cancelling a running task stops it between operations
//! - The worker loop exits on shutdown
//!
//! If this test fails, callers cannot trust what status() reports.

mod common;

use async_trait::async_trait;
use common::*;
use ipam_core::broker::MemoryBroker;
use ipam_core::config::WorkerConfig;
use ipam_core::orchestrator::OperationStatus;
use ipam_core::tasks::WorkerEvent;
use ipam_core::traits::{Task, TaskBroker, TaskState};
use ipam_core::{Error, Orchestrator, Result, TaskManager, TaskWorker};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;

fn worker_over(
    broker: Arc<dyn TaskBroker>,
    orchestrator: Orchestrator,
) -> (TaskWorker, mpsc::Receiver<WorkerEvent>) {
    let config = WorkerConfig {
        poll_interval_ms: 10,
        confirm_writes: true,
        ..WorkerConfig::default()
    };
    TaskWorker::new(broker, orchestrator, config)
}

/// Two sites, one good device, one device whose role exists nowhere
fn partly_broken_input() -> Value {
    json!({
        "sites": [{"name": "AMS1"}, {"name": "FRA1"}],
        "manufacturers": [{"name": "Juniper"}],
        "device_roles": [{"name": "Router"}],
        "device_types": [{"model": "MX204", "manufacturer": "Juniper"}],
        "devices": [
            {"name": "ams1-r1", "site": "AMS1", "role": "Router", "device_type": "MX204"},
            {"name": "fra1-r1", "site": "FRA1", "role": "Spine", "device_type": "MX204"}
        ]
    })
}

#[tokio::test]
async fn unreachable_broker_is_queue_unavailable() {
    let manager = TaskManager::new(Arc::new(UnreachableBroker));

    match manager.submit(&json!({"sites": [{"name": "AMS1"}]})).await {
        Err(Error::QueueUnavailable(_)) => {}
        other => panic!("Expected QueueUnavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_reference_fails_one_record_not_the_task() {
    let broker = Arc::new(MemoryBroker::new());
    let manager = TaskManager::new(broker.clone());
    let (orchestrator, backend) = recording_orchestrator(false);
    let (worker, _events) = worker_over(broker, orchestrator);

    let task_id = manager.submit(&partly_broken_input()).await.unwrap();
    assert_eq!(manager.status(&task_id).await.unwrap().progress.total, 7);

    worker.run_once().await.unwrap().expect("a task was queued");

    let status = manager.status(&task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Succeeded);
    assert_eq!(status.progress.done, 7);
    let summary = status.result_summary.expect("summary published");
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.created, 6);

    let devices = backend.store().snapshot(&devices()).await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["name"], "ams1-r1");
}

#[tokio::test]
async fn missing_reference_is_reported_as_not_found() {
    let (orchestrator, _backend) = recording_orchestrator(false);
    let result = orchestrator
        .execute(orchestrator.plan(&partly_broken_input()).unwrap(), true)
        .await
        .unwrap();

    let failed = result
        .operations
        .iter()
        .find(|op| op.key == "fra1-r1")
        .unwrap();
    match &failed.status {
        OperationStatus::Failed { kind, message } => {
            assert_eq!(kind, "not_found");
            assert!(message.contains("Spine"), "message: {}", message);
        }
        other => panic!("Expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn cancelled_queued_task_never_runs() {
    let broker = Arc::new(MemoryBroker::new());
    let manager = TaskManager::new(broker.clone());
    let (orchestrator, backend) = recording_orchestrator(false);
    let (worker, _events) = worker_over(broker, orchestrator);

    let task_id = manager.submit(&json!({"sites": [{"name": "AMS1"}]})).await.unwrap();
    let cancelled = manager.cancel(&task_id).await.unwrap();
    assert_eq!(cancelled.state, TaskState::Cancelled);

    assert!(worker.run_once().await.unwrap().is_none());
    assert_eq!(backend.call_count(), 0);
}

/// Broker that requests cancellation once a task reports `after` operations done
struct CancelAfterBroker {
    inner: MemoryBroker,
    after: usize,
}

#[async_trait]
impl TaskBroker for CancelAfterBroker {
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn enqueue(&self, task: &Task, payload: &Value) -> Result<()> {
        self.inner.enqueue(task, payload).await
    }

    async fn claim_next(&self) -> Result<Option<(Task, Value)>> {
        self.inner.claim_next().await
    }

    async fn save(&self, task: &Task) -> Result<()> {
        self.inner.save(task).await?;
        if task.state == TaskState::Running && task.progress.done == self.after {
            self.inner.request_cancel(&task.task_id).await?;
        }
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<Task>> {
        self.inner.load(task_id).await
    }

    async fn request_cancel(&self, task_id: &str) -> Result<Option<Task>> {
        self.inner.request_cancel(task_id).await
    }

    async fn is_cancel_requested(&self, task_id: &str) -> Result<bool> {
        self.inner.is_cancel_requested(task_id).await
    }

    async fn list(&self) -> Result<Vec<Task>> {
        self.inner.list().await
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.inner.purge_finished(cutoff).await
    }
}

#[tokio::test]
async fn cancelled_running_task_stops_between_operations() {
    let broker = Arc::new(CancelAfterBroker {
        inner: MemoryBroker::new(),
        after: 2,
    });
    let manager = TaskManager::new(broker.clone());
    let (orchestrator, backend) = recording_orchestrator(false);
    let (worker, _events) = worker_over(broker, orchestrator);

    let task_id = manager
        .submit(&json!({"sites": [{"name": "A"}, {"name": "B"}, {"name": "C"}, {"name": "D"}]}))
        .await
        .unwrap();
    let task = worker.run_once().await.unwrap().unwrap();

    assert_eq!(task.state, TaskState::Cancelled);
    let status = manager.status(&task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Cancelled);
    assert_eq!(status.progress.done, 2);

    let summary = status.result_summary.unwrap();
    assert_eq!(summary.created, 2);
    assert_eq!(summary.skipped, 2);
    // Writes already made are kept.
    assert_eq!(backend.store().snapshot(&sites()).await.len(), 2);
}

#[tokio::test]
async fn worker_loop_runs_tasks_until_shutdown() {
    let broker = Arc::new(MemoryBroker::new());
    let manager = TaskManager::new(broker.clone());
    let (orchestrator, _backend) = recording_orchestrator(false);
    let (worker, mut events) = worker_over(broker, orchestrator);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move { worker.run_with_shutdown(Some(shutdown_rx)).await });

    let task_id = manager.submit(&json!({"tenants": [{"name": "Acme"}]})).await.unwrap();

    let finished = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let WorkerEvent::TaskFinished { task_id, state, .. } = event {
                return Some((task_id, state));
            }
        }
        None
    })
    .await
    .expect("task finished in time");
    assert_eq!(finished, Some((task_id.clone(), TaskState::Succeeded)));

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("worker stopped in time")
        .unwrap()
        .unwrap();

    assert_eq!(manager.status(&task_id).await.unwrap().state, TaskState::Succeeded);
    assert_eq!(manager.list().await.unwrap().len(), 1);
}
