// # Task Broker Implementations
//
// This module provides implementations of the TaskBroker trait for
// different persistence strategies. Both share the queue bookkeeping in
// `BrokerState`; they differ only in where that state lives.
//
// ## Retention
//
// A task's raw input is dropped as soon as the task reaches a terminal
// state; the status record stays until `purge_finished` removes it.

pub mod file;
pub mod memory;

pub use file::{FileBroker, FileBrokerFactory};
pub use memory::{MemoryBroker, MemoryBrokerFactory};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

use crate::Error;
use crate::traits::{Task, TaskState};

/// One stored task with its input
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskEntry {
    task: Task,
    /// Raw input; `Null` once the task is terminal
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    cancel_requested: bool,
}

/// Queue plus status store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct BrokerState {
    tasks: BTreeMap<String, TaskEntry>,
    queue: VecDeque<String>,
}

impl BrokerState {
    pub(crate) fn enqueue(&mut self, task: &Task, payload: &Value) -> Result<(), Error> {
        if self.tasks.contains_key(&task.task_id) {
            return Err(Error::conflict(format!("task {} already exists", task.task_id)));
        }
        self.tasks.insert(
            task.task_id.clone(),
            TaskEntry {
                task: task.clone(),
                payload: payload.clone(),
                cancel_requested: false,
            },
        );
        self.queue.push_back(task.task_id.clone());
        Ok(())
    }

    pub(crate) fn claim_next(&mut self) -> Option<(Task, Value)> {
        while let Some(task_id) = self.queue.pop_front() {
            let Some(entry) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            // Cancelled while queued.
            if entry.task.state != TaskState::Queued {
                continue;
            }
            entry.task.state = TaskState::Running;
            entry.task.updated_at = Utc::now();
            return Some((entry.task.clone(), entry.payload.clone()));
        }
        None
    }

    pub(crate) fn save(&mut self, task: &Task) -> Result<(), Error> {
        let entry = self
            .tasks
            .get_mut(&task.task_id)
            .ok_or_else(|| Error::TaskNotFound(task.task_id.clone()))?;
        if entry.task.state.is_terminal() {
            return Err(Error::conflict(format!(
                "task {} is already {:?}",
                task.task_id, entry.task.state
            )));
        }
        entry.task = task.clone();
        if task.state.is_terminal() {
            entry.payload = Value::Null;
        }
        Ok(())
    }

    pub(crate) fn load(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|e| e.task.clone())
    }

    pub(crate) fn request_cancel(&mut self, task_id: &str) -> Option<Task> {
        let entry = self.tasks.get_mut(task_id)?;
        match entry.task.state {
            TaskState::Queued => {
                entry.cancel_requested = true;
                entry.task.state = TaskState::Cancelled;
                entry.task.updated_at = Utc::now();
                entry.payload = Value::Null;
                self.queue.retain(|id| id != task_id);
            }
            TaskState::Running => entry.cancel_requested = true,
            _ => {}
        }
        Some(entry.task.clone())
    }

    pub(crate) fn is_cancel_requested(&self, task_id: &str) -> bool {
        self.tasks.get(task_id).is_some_and(|e| e.cancel_requested)
    }

    pub(crate) fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        tasks
    }

    /// Remove terminal tasks last updated at or before `cutoff`
    pub(crate) fn purge_finished(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks
            .retain(|_, e| !(e.task.state.is_terminal() && e.task.updated_at <= cutoff));
        before - self.tasks.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}
