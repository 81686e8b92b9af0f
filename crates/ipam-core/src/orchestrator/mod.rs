//! Two-pass bulk orchestration
//!
//! ```text
//! raw input ──normalize──▶ records ──plan──▶ Batch (flat, ordered)
//!                                               │
//!                    ┌──────────────────────────┘
//!                    ▼
//!   for each operation (pass 1, then pass 2 in dependency order):
//!     dependency failed?  ──yes──▶ skipped
//!     resolve references: ObjectCache ──miss──▶ Resolver (remote)
//!     Reconciler::ensure(payload + reference ids, batch id)
//!     record action / result_ref, or failure kind + message
//! ```
//!
//! ## Failure policy
//!
//! Planning errors abort the run before any write. Execution errors are
//! isolated into the failing operation; independent operations continue
//! and dependents of a failed record are skipped.
//!
//! ## Rollback
//!
//! Best effort only: every object whose origin-batch metadata matches is
//! deleted, newest kinds first. Objects the batch merely updated are left
//! in place.

pub mod normalize;
pub mod plan;
pub mod report;

pub use normalize::{EntityKind, Record, Reference, normalize};
pub use plan::{Batch, BatchOperation, OperationStatus, cache_key, kind_order, plan, plan_as};
pub use report::{DryRunReport, ReportEntry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::proxy::ProxyClient;
use crate::reconciler::{Action, EnsureRequest, Reconciler};
use crate::resolver::{Lookup, Resolver, slugify};
use crate::traits::Filters;

/// Run-scoped map from `"kind:key"` to remote ID
///
/// Built fresh for every run and dropped with it, so IDs never leak between
/// runs.
#[derive(Debug, Default)]
pub struct ObjectCache {
    ids: HashMap<String, u64>,
}

impl ObjectCache {
    pub fn get(&self, kind: EntityKind, key: &str) -> Option<u64> {
        self.ids.get(&cache_key(kind, key)).copied()
    }

    pub fn insert(&mut self, kind: EntityKind, key: &str, id: u64) {
        self.ids.insert(cache_key(kind, key), id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Outcome counters of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchSummary {
    /// Count outcomes of executed operations
    pub fn from_operations(operations: &[BatchOperation]) -> Self {
        let mut summary = Self {
            total: operations.len(),
            ..Self::default()
        };
        for op in operations {
            match (&op.status, op.action) {
                (OperationStatus::Committed, Some(Action::Created)) => summary.created += 1,
                (OperationStatus::Committed, Some(Action::Updated)) => summary.updated += 1,
                (OperationStatus::Committed, Some(Action::Unchanged)) => summary.unchanged += 1,
                (OperationStatus::Failed { .. }, _) => summary.failed += 1,
                (OperationStatus::Skipped { .. }, _) => summary.skipped += 1,
                _ => {}
            }
        }
        summary
    }
}

/// Result of [`Orchestrator::execute`]
///
/// Identical in shape under dry-run and real execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub operations: Vec<BatchOperation>,
    pub summary: BatchSummary,
    /// Whether the run stopped early on a cancel request
    pub cancelled: bool,
}

/// Result of [`Orchestrator::rollback`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub batch_id: String,
    pub deleted: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Hooks a long-running execution reports to
///
/// Both hooks run between operations, never during one.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    /// Called after every finished operation
    async fn on_progress(&self, _done: usize, _total: usize) {}

    /// Stop before the next operation when this returns true
    async fn is_cancelled(&self) -> bool {
        false
    }
}

/// Observer that ignores progress and never cancels
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

/// Bulk orchestrator over a shared [`ProxyClient`]
#[derive(Debug, Clone)]
pub struct Orchestrator {
    client: Arc<ProxyClient>,
}

impl Orchestrator {
    pub fn new(client: Arc<ProxyClient>) -> Self {
        Self { client }
    }

    /// The client this orchestrator writes through
    pub fn client(&self) -> &ProxyClient {
        &self.client
    }

    /// Normalize and order raw input (no network calls)
    pub fn plan(&self, raw: &Value) -> Result<Batch> {
        plan(raw)
    }

    /// Execute a planned batch
    pub async fn execute(&self, batch: Batch, confirm: bool) -> Result<BatchResult> {
        self.execute_observed(batch, confirm, &NoopObserver).await
    }

    /// Execute a planned batch, reporting to `observer`
    ///
    /// # Errors
    ///
    /// Only [`Error::ConfirmationRequired`] (checked before anything runs).
    /// Per-operation errors are recorded in the result.
    pub async fn execute_observed(
        &self,
        mut batch: Batch,
        confirm: bool,
        observer: &dyn ExecutionObserver,
    ) -> Result<BatchResult> {
        if !confirm {
            return Err(Error::confirmation_required(format!(
                "execute batch {}",
                batch.batch_id
            )));
        }

        let total = batch.operations.len();
        info!(
            "Executing batch {} ({} operations{})",
            batch.batch_id,
            total,
            if self.client.is_dry_run() { ", dry-run" } else { "" }
        );

        let mut cache = ObjectCache::default();
        let mut broken: HashSet<String> = HashSet::new();
        let mut cancelled = false;

        for index in 0..total {
            if observer.is_cancelled().await {
                info!("Batch {} cancelled after {} operations", batch.batch_id, index);
                for op in &mut batch.operations[index..] {
                    op.status = OperationStatus::Skipped {
                        reason: "cancelled".to_string(),
                    };
                }
                cancelled = true;
                break;
            }

            let op = &mut batch.operations[index];
            let dead = op
                .references
                .iter()
                .find(|r| broken.contains(&cache_key(r.target, &r.key)));
            if let Some(dependency) = dead {
                debug!("Skipping {} '{}': {} '{}' failed", op.target, op.key, dependency.target, dependency.key);
                op.status = OperationStatus::Skipped {
                    reason: format!("dependency {} '{}' failed", dependency.target, dependency.key),
                };
                broken.insert(op.cache_key());
            } else {
                match self.run_operation(op, &mut cache).await {
                    Ok((action, id)) => {
                        op.action = Some(action);
                        op.result_ref = Some(id);
                        op.status = OperationStatus::Committed;
                        cache.insert(op.target, &op.key, id);
                    }
                    Err(e) => {
                        warn!("{} '{}' failed: {}", op.target, op.key, e);
                        op.status = OperationStatus::Failed {
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        };
                        broken.insert(op.cache_key());
                    }
                }
            }

            observer.on_progress(index + 1, total).await;
        }

        let summary = BatchSummary::from_operations(&batch.operations);
        info!(
            "Batch {} finished: {} created, {} updated, {} unchanged, {} failed, {} skipped",
            batch.batch_id,
            summary.created,
            summary.updated,
            summary.unchanged,
            summary.failed,
            summary.skipped
        );

        Ok(BatchResult {
            batch_id: batch.batch_id,
            operations: batch.operations,
            summary,
            cancelled,
        })
    }

    async fn run_operation(&self, op: &BatchOperation, cache: &mut ObjectCache) -> Result<(Action, u64)> {
        let mut desired = op.payload.clone();
        let mut scope = Filters::new();

        for reference in &op.references {
            let id = self.resolve_reference(reference.target, &reference.key, cache).await?;
            insert_reference(&mut desired, op.target, &reference.field, id);
            if op.target == EntityKind::Interface && reference.field == "device" {
                scope.insert("device_id".to_string(), id.to_string());
            }
        }
        if op.target == EntityKind::Interface {
            if let Some(id) = desired.get("device").and_then(Value::as_u64) {
                scope.insert("device_id".to_string(), id.to_string());
            }
        }

        let mut lookup = lookup_for(op.target, op.key_value());
        lookup.scope = scope;

        let managed = with_generated_slug(op.target, op.key_value(), &mut desired);
        let request = EnsureRequest::new(op.target.path(), lookup, Value::Object(desired))?
            .managed(managed)
            .with_batch(op.batch_id.clone());
        let outcome = Reconciler::new(&self.client).ensure(&request, true).await?;
        Ok((outcome.action, outcome.id))
    }

    /// Remote ID of a referenced record: batch cache first, then the remote
    async fn resolve_reference(&self, kind: EntityKind, key: &str, cache: &mut ObjectCache) -> Result<u64> {
        if let Some(id) = cache.get(kind, key) {
            return Ok(id);
        }

        let lookup = if kind == EntityKind::Interface {
            let (device, name) = key.split_once('/').ok_or_else(|| {
                Error::validation(format!("interface reference '{}' has no device", key))
            })?;
            let device_id = Box::pin(self.resolve_reference(EntityKind::Device, device, cache)).await?;
            lookup_for(kind, name).scoped("device_id", device_id)
        } else {
            lookup_for(kind, key)
        };

        let id = Resolver::new(&self.client)
            .resolve_id(&kind.path(), &lookup)
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => Error::not_found(format!(
                    "referenced {} '{}' does not exist in this batch or on the remote",
                    kind, key
                )),
                other => other,
            })?;
        cache.insert(kind, key, id);
        Ok(id)
    }

    /// Pre-flight diff of raw input (no writes)
    pub async fn dry_run_report(&self, raw: &Value) -> Result<DryRunReport> {
        let batch = self.plan(raw)?;
        report::build(&self.client, &batch).await
    }

    /// Delete every object created by `batch_id`, newest kinds first
    ///
    /// Per-object failures are collected, not raised.
    pub async fn rollback(&self, batch_id: &str, confirm: bool) -> Result<RollbackReport> {
        if !confirm {
            return Err(Error::confirmation_required(format!("rollback batch {}", batch_id)));
        }

        let filter = self.client.reconcile_config().origin_batch_filter();
        let mut report = RollbackReport {
            batch_id: batch_id.to_string(),
            ..RollbackReport::default()
        };

        let mut kinds = kind_order()?;
        kinds.reverse();
        for kind in kinds {
            let path = kind.path();
            let executor = self.client.collection(&path)?;
            let mut filters = Filters::new();
            filters.insert(filter.clone(), batch_id.to_string());

            let objects = match executor.list(&filters).await {
                Ok(objects) => objects,
                Err(e) => {
                    warn!("Rollback {}: listing {} failed: {}", batch_id, path, e);
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", path, e));
                    continue;
                }
            };

            for object in objects {
                // Re-check: remotes ignore unknown custom-field filters.
                if !created_by(&object, self.client.reconcile_config(), batch_id) {
                    continue;
                }
                let Some(id) = object.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                match executor.delete(id, true).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        warn!("Rollback {}: deleting {} #{} failed: {}", batch_id, path, id, e);
                        report.failed += 1;
                        report.errors.push(format!("{} #{}: {}", path, id, e));
                    }
                }
            }
        }

        info!(
            "Rollback {}: {} deleted, {} failed",
            batch_id, report.deleted, report.failed
        );
        Ok(report)
    }
}

fn created_by(object: &Value, config: &crate::config::ReconcileConfig, batch_id: &str) -> bool {
    object
        .get(&config.metadata_field)
        .and_then(|bag| bag.get(&config.origin_batch_key))
        .and_then(Value::as_str)
        == Some(batch_id)
}

/// How a record of `kind` is found on the remote
pub(crate) fn lookup_for(kind: EntityKind, key_value: &str) -> Lookup {
    match kind {
        EntityKind::DeviceType | EntityKind::IpAddress | EntityKind::Prefix => {
            Lookup::by_field(kind.key_field(), key_value)
        }
        _ => Lookup::name(key_value),
    }
}

/// Add the slug derived from the record key, if the input set none
///
/// Returns the fields the record owns. A derived slug is not among them, so
/// it is sent on create and never overwrites a slug set on the remote.
pub(crate) fn with_generated_slug(kind: EntityKind, key_value: &str, desired: &mut Map<String, Value>) -> Vec<String> {
    let managed = desired.keys().cloned().collect();
    if kind.has_slug() && !desired.contains_key("slug") {
        desired.insert("slug".to_string(), json!(slugify(key_value)));
    }
    managed
}

/// Write a resolved reference into a payload
///
/// Addresses attach to interfaces through the remote's generic assignment
/// fields rather than an `interface` field.
pub(crate) fn insert_reference(desired: &mut Map<String, Value>, kind: EntityKind, field: &str, id: u64) {
    if kind == EntityKind::IpAddress && field == "interface" {
        desired.insert("assigned_object_type".to_string(), json!("dcim.interface"));
        desired.insert("assigned_object_id".to_string(), json!(id));
    } else {
        desired.insert(field.to_string(), json!(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::ClientConfig;
    use crate::traits::CollectionPath;

    fn setup(dry_run: bool) -> (Orchestrator, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let config = ClientConfig::default().with_dry_run(dry_run);
        let client = Arc::new(ProxyClient::new(backend.clone(), &config).unwrap());
        (Orchestrator::new(client), backend)
    }

    fn topology() -> Value {
        json!({
            "sites": [{"name": "AMS1", "status": "active"}],
            "manufacturers": [{"name": "Juniper"}],
            "device_roles": [{"name": "Router"}],
            "device_types": [{"model": "MX204", "manufacturer": "Juniper"}],
            "devices": [{
                "name": "r1", "site": "AMS1", "role": "Router", "device_type": "MX204",
                "interfaces": [{"name": "xe-0/0/0", "ip_addresses": [{"address": "10.0.0.1/31"}]}]
            }]
        })
    }

    #[tokio::test]
    async fn test_execute_creates_then_is_idempotent() {
        let (orchestrator, backend) = setup(false);

        let first = orchestrator
            .execute(orchestrator.plan(&topology()).unwrap(), true)
            .await
            .unwrap();
        assert_eq!(first.summary.created, 7);
        assert_eq!(first.summary.failed, 0);

        let interface = backend.snapshot(&CollectionPath::new("dcim", "interfaces")).await;
        let device = backend.snapshot(&CollectionPath::new("dcim", "devices")).await;
        assert_eq!(interface[0]["device"], device[0]["id"]);

        let address = backend.snapshot(&CollectionPath::new("ipam", "ip-addresses")).await;
        assert_eq!(address[0]["assigned_object_id"], interface[0]["id"]);

        let writes = backend.write_count();
        let second = orchestrator
            .execute(orchestrator.plan(&topology()).unwrap(), true)
            .await
            .unwrap();
        assert_eq!(second.summary.unchanged, 7);
        assert_eq!(backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let (orchestrator, backend) = setup(false);
        backend
            .reject_name(CollectionPath::new("dcim", "sites"), "AMS1")
            .await;

        let result = orchestrator
            .execute(orchestrator.plan(&topology()).unwrap(), true)
            .await
            .unwrap();

        assert_eq!(result.summary.failed, 1);
        // device, interface and address hang off the failed site
        assert_eq!(result.summary.skipped, 3);
        assert_eq!(result.summary.created, 3);
    }

    #[tokio::test]
    async fn test_execute_requires_confirmation() {
        let (orchestrator, backend) = setup(false);
        let batch = orchestrator.plan(&topology()).unwrap();
        let err = orchestrator.execute(batch, false).await.unwrap_err();
        assert!(matches!(err, Error::ConfirmationRequired { .. }));
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_deletes_only_created_objects() {
        let (orchestrator, backend) = setup(false);
        let sites = CollectionPath::new("dcim", "sites");
        backend
            .seed(&sites, json!({"name": "AMS1", "slug": "ams1"}))
            .await
            .unwrap();

        let result = orchestrator
            .execute(orchestrator.plan(&topology()).unwrap(), true)
            .await
            .unwrap();
        assert_eq!(result.summary.updated, 1);

        let report = orchestrator.rollback(&result.batch_id, true).await.unwrap();
        assert_eq!(report.deleted, 6);
        assert_eq!(report.failed, 0);
        assert_eq!(backend.snapshot(&sites).await.len(), 1);
        assert!(backend.snapshot(&CollectionPath::new("dcim", "devices")).await.is_empty());
    }

    #[tokio::test]
    async fn test_derived_slug_never_overwrites_remote_slug() {
        let (orchestrator, backend) = setup(false);
        let sites = CollectionPath::new("dcim", "sites");
        backend
            .seed(&sites, json!({"name": "Amsterdam 1", "slug": "ams-one"}))
            .await
            .unwrap();
        let input = json!({"sites": [{"name": "Amsterdam 1"}, {"name": "Frankfurt 2"}]});

        let result = orchestrator
            .execute(orchestrator.plan(&input).unwrap(), true)
            .await
            .unwrap();
        assert_eq!(result.summary.updated, 1);
        assert_eq!(result.summary.created, 1);

        let stored = backend.snapshot(&sites).await;
        let slug_of = |name: &str| {
            stored
                .iter()
                .find(|s| s["name"] == name)
                .map(|s| s["slug"].clone())
                .unwrap()
        };
        assert_eq!(slug_of("Amsterdam 1"), "ams-one");
        assert_eq!(slug_of("Frankfurt 2"), "frankfurt-2");
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let mut batch = plan(&json!({"sites": [{"name": "a"}, {"name": "b"}, {"name": "c"}]})).unwrap();
        batch.operations[0].status = OperationStatus::Committed;
        batch.operations[0].action = Some(Action::Created);
        batch.operations[1].status = OperationStatus::Failed {
            kind: "conflict".to_string(),
            message: "x".to_string(),
        };

        let summary = BatchSummary::from_operations(&batch.operations);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);
    }
}
