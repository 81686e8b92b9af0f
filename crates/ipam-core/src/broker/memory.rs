// # Memory Broker
//
// In-memory implementation of TaskBroker.
//
// ## Purpose
//
// Queue and status store for workers running in the same process as the
// submitter. Nothing survives a restart.
//
// ## When to Use
//
// - Tests
// - Embedding a worker task next to the submitting code
//
// `set_available(false)` makes `ping` fail, which lets tests exercise the
// `QueueUnavailable` path without a real outage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::BrokerState;
use crate::Error;
use crate::config::BrokerConfig;
use crate::traits::{Task, TaskBroker, TaskBrokerFactory};

/// In-memory broker implementation
///
/// # Example
///
/// ```rust,no_run
/// use ipam_core::broker::MemoryBroker;
/// use ipam_core::traits::TaskBroker;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let broker = MemoryBroker::new();
///     broker.ping().await?;
///     assert!(broker.list().await?.is_empty());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<RwLock<BrokerState>>,
    available: Arc<AtomicBool>,
}

impl MemoryBroker {
    /// Create a new empty broker
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BrokerState::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the broker going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of tasks ever enqueued
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Check if no task was ever enqueued
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::broker("memory broker is unavailable"))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskBroker for MemoryBroker {
    async fn ping(&self) -> Result<(), Error> {
        self.check_available()
    }

    async fn enqueue(&self, task: &Task, payload: &Value) -> Result<(), Error> {
        self.check_available()?;
        self.inner.write().await.enqueue(task, payload)
    }

    async fn claim_next(&self) -> Result<Option<(Task, Value)>, Error> {
        self.check_available()?;
        Ok(self.inner.write().await.claim_next())
    }

    async fn save(&self, task: &Task) -> Result<(), Error> {
        self.check_available()?;
        self.inner.write().await.save(task)
    }

    async fn load(&self, task_id: &str) -> Result<Option<Task>, Error> {
        self.check_available()?;
        Ok(self.inner.read().await.load(task_id))
    }

    async fn request_cancel(&self, task_id: &str) -> Result<Option<Task>, Error> {
        self.check_available()?;
        Ok(self.inner.write().await.request_cancel(task_id))
    }

    async fn is_cancel_requested(&self, task_id: &str) -> Result<bool, Error> {
        self.check_available()?;
        Ok(self.inner.read().await.is_cancel_requested(task_id))
    }

    async fn list(&self) -> Result<Vec<Task>, Error> {
        self.check_available()?;
        Ok(self.inner.read().await.list())
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize, Error> {
        self.check_available()?;
        Ok(self.inner.write().await.purge_finished(cutoff))
    }
}

/// Factory for creating memory brokers
pub struct MemoryBrokerFactory;

#[async_trait]
impl TaskBrokerFactory for MemoryBrokerFactory {
    async fn create(&self, config: &BrokerConfig) -> Result<Arc<dyn TaskBroker>, Error> {
        match config {
            BrokerConfig::Memory => Ok(Arc::new(MemoryBroker::new())),
            other => Err(Error::config(format!(
                "Invalid config type for MemoryBrokerFactory: {}",
                other.type_name()
            ))),
        }
    }
}
