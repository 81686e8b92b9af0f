//! Test doubles and common utilities for contract tests
//!
//! The doubles wrap the in-memory backend and record every call that
//! reaches them, so tests can assert on what the client sent over the
//! "network" rather than on internal state.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipam_core::backend::MemoryBackend;
use ipam_core::config::ClientConfig;
use ipam_core::error::{Error, Result};
use ipam_core::traits::{CollectionPath, Filters, RemoteBackend, Task, TaskBroker};
use ipam_core::{Orchestrator, ProxyClient};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One call that reached the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: &'static str,
    pub resource_type: String,
}

/// Backend wrapper that records every call and can be taken offline
pub struct RecordingBackend {
    inner: MemoryBackend,
    calls: Arc<Mutex<Vec<Call>>>,
    list_calls: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::wrapping(MemoryBackend::new())
    }

    pub fn wrapping(inner: MemoryBackend) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(Vec::new())),
            list_calls: Arc::new(AtomicUsize::new(0)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The wrapped store (seed, edit and snapshot bypass the recording)
    pub fn store(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn list_call_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of create/update/delete calls
    pub fn write_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c.method, "create" | "update" | "delete"))
            .count()
    }

    /// Resource types of create calls, in order
    pub fn created_types(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == "create")
            .map(|c| c.resource_type.clone())
            .collect()
    }

    /// Make every subsequent call fail as if the remote were down
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn record(&self, method: &'static str, path: &CollectionPath) -> Result<()> {
        self.calls.lock().unwrap().push(Call {
            method,
            resource_type: path.resource_type(),
        });
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::remote(Some(503), "service unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for RecordingBackend {
    async fn list(&self, path: &CollectionPath, filters: &Filters) -> Result<Vec<Value>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.record("list", path)?;
        self.inner.list(path, filters).await
    }

    async fn get(&self, path: &CollectionPath, id: u64) -> Result<Value> {
        self.record("get", path)?;
        self.inner.get(path, id).await
    }

    async fn create(&self, path: &CollectionPath, payload: &Value) -> Result<Value> {
        self.record("create", path)?;
        self.inner.create(path, payload).await
    }

    async fn update(&self, path: &CollectionPath, id: u64, payload: &Value) -> Result<Value> {
        self.record("update", path)?;
        self.inner.update(path, id, payload).await
    }

    async fn delete(&self, path: &CollectionPath, id: u64) -> Result<()> {
        self.record("delete", path)?;
        self.inner.delete(path, id).await
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }
}

/// Broker whose every call fails, standing in for an unreachable queue
pub struct UnreachableBroker;

#[async_trait]
impl TaskBroker for UnreachableBroker {
    async fn ping(&self) -> Result<()> {
        Err(Error::broker("connection refused"))
    }

    async fn enqueue(&self, _task: &Task, _payload: &Value) -> Result<()> {
        Err(Error::broker("connection refused"))
    }

    async fn claim_next(&self) -> Result<Option<(Task, Value)>> {
        Err(Error::broker("connection refused"))
    }

    async fn save(&self, _task: &Task) -> Result<()> {
        Err(Error::broker("connection refused"))
    }

    async fn load(&self, _task_id: &str) -> Result<Option<Task>> {
        Err(Error::broker("connection refused"))
    }

    async fn request_cancel(&self, _task_id: &str) -> Result<Option<Task>> {
        Err(Error::broker("connection refused"))
    }

    async fn is_cancel_requested(&self, _task_id: &str) -> Result<bool> {
        Err(Error::broker("connection refused"))
    }

    async fn list(&self) -> Result<Vec<Task>> {
        Err(Error::broker("connection refused"))
    }

    async fn purge_finished(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
        Err(Error::broker("connection refused"))
    }
}

/// Client over a fresh recording backend
pub fn recording_client(dry_run: bool) -> (Arc<ProxyClient>, Arc<RecordingBackend>) {
    let backend = Arc::new(RecordingBackend::new());
    let config = ClientConfig::default().with_dry_run(dry_run);
    let client = Arc::new(ProxyClient::new(backend.clone(), &config).expect("valid config"));
    (client, backend)
}

/// Orchestrator over a fresh recording backend
pub fn recording_orchestrator(dry_run: bool) -> (Orchestrator, Arc<RecordingBackend>) {
    let (client, backend) = recording_client(dry_run);
    (Orchestrator::new(client), backend)
}

pub fn sites() -> CollectionPath {
    CollectionPath::new("dcim", "sites")
}

pub fn devices() -> CollectionPath {
    CollectionPath::new("dcim", "devices")
}

pub fn interfaces() -> CollectionPath {
    CollectionPath::new("dcim", "interfaces")
}

pub fn ip_addresses() -> CollectionPath {
    CollectionPath::new("ipam", "ip-addresses")
}

/// One site with a router, one interface and one address (7 records)
pub fn small_topology() -> Value {
    json!({
        "sites": [{"name": "AMS1", "status": "active"}],
        "manufacturers": [{"name": "Juniper"}],
        "device_roles": [{"name": "Router"}],
        "device_types": [{"model": "MX204", "manufacturer": "Juniper"}],
        "devices": [{
            "name": "ams1-r1",
            "site": "AMS1",
            "role": "Router",
            "device_type": "MX204",
            "interfaces": [{
                "name": "xe-0/0/0",
                "ip_addresses": [{"address": "192.0.2.1/31"}]
            }]
        }]
    })
}
