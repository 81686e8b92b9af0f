// # Memory Backend
//
// In-memory implementation of RemoteBackend.
//
// ## Purpose
//
// Behaves like the remote inventory closely enough to exercise the proxy,
// reconciler and orchestrator without a network:
//
// - Auto-incrementing numeric IDs per collection
// - Filters: top-level field equality, `<field>_id` against nested `{id}`
//   references, `cf_<key>` against the `custom_fields` bag, `q` substring
// - PATCH updates with JSON merge-patch semantics (RFC 7386), so nested
//   `custom_fields` keys not in the patch survive
// - Unique `slug` per collection, and unique `name` for reference collections
// - Unknown collections fail with `NotFound`
//
// ## When to Use
//
// - Tests and examples
// - Embedding the core without a remote system (everything is lost on drop)

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::config::BackendConfig;
use crate::proxy::DomainTable;
use crate::traits::{BackendFactory, CollectionPath, Filters, RemoteBackend};
use crate::{Error, Result};

/// Collections where `name` must be unique
const UNIQUE_NAME_COLLECTIONS: &[&str] = &[
    "dcim.sites",
    "dcim.manufacturers",
    "dcim.device-roles",
    "dcim.platforms",
    "tenancy.tenants",
];

/// Metadata bag the remote exposes on every object
const METADATA_FIELD: &str = "custom_fields";

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<CollectionPath, BTreeMap<u64, Value>>,
    next_id: u64,
    failures: HashSet<(CollectionPath, String)>,
}

/// In-memory backend implementation
///
/// # Example
///
/// ```rust,no_run
/// use ipam_core::backend::MemoryBackend;
/// use ipam_core::traits::{CollectionPath, RemoteBackend};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let backend = MemoryBackend::new();
///     let sites = CollectionPath::new("dcim", "sites");
///
///     let site = backend.create(&sites, &serde_json::json!({"name": "AMS1"})).await?;
///     assert_eq!(backend.get(&sites, site["id"].as_u64().unwrap()).await?["name"], "AMS1");
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<RwLock<MemoryState>>,
    read_count: Arc<AtomicUsize>,
    write_count: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Create a backend that knows the built-in collections of every domain
    pub fn new() -> Self {
        let mut collections = HashMap::new();
        let domains = DomainTable::builtin();
        for name in domains.names() {
            if let Some(domain) = domains.get(name) {
                for collection in &domain.known_collections {
                    collections.insert(CollectionPath::new(name, collection.clone()), BTreeMap::new());
                }
            }
        }
        Self {
            inner: Arc::new(RwLock::new(MemoryState {
                collections,
                next_id: 1,
                failures: HashSet::new(),
            })),
            read_count: Arc::new(AtomicUsize::new(0)),
            write_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make an extra collection available
    pub async fn add_collection(&self, path: CollectionPath) {
        let mut state = self.inner.write().await;
        state.collections.entry(path).or_default();
    }

    /// Number of list/get calls served
    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Number of create/update/delete calls attempted
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Store an object directly, bypassing counters (simulates another actor)
    pub async fn seed(&self, path: &CollectionPath, object: Value) -> Result<u64> {
        let mut state = self.inner.write().await;
        insert_object(&mut state, path, object)
    }

    /// Merge-patch an object directly, bypassing counters (simulates a manual edit)
    pub async fn edit(&self, path: &CollectionPath, id: u64, patch: &Value) -> Result<Value> {
        let mut state = self.inner.write().await;
        patch_object(&mut state, path, id, patch)
    }

    /// All objects of a collection, ordered by ID
    pub async fn snapshot(&self, path: &CollectionPath) -> Vec<Value> {
        let state = self.inner.read().await;
        state
            .collections
            .get(path)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every write to `path` carrying `name` fail with a validation error
    pub async fn reject_name(&self, path: CollectionPath, name: impl Into<String>) {
        let mut state = self.inner.write().await;
        state.failures.insert((path, name.into()));
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn collection_mut<'a>(
    state: &'a mut MemoryState,
    path: &CollectionPath,
) -> Result<&'a mut BTreeMap<u64, Value>> {
    state
        .collections
        .get_mut(path)
        .ok_or_else(|| Error::not_found(format!("collection {} does not exist", path)))
}

fn check_injected_failure(state: &MemoryState, path: &CollectionPath, payload: &Value) -> Result<()> {
    if let Some(name) = payload.get("name").and_then(Value::as_str) {
        if state.failures.contains(&(path.clone(), name.to_string())) {
            return Err(Error::validation(format!(
                "{}: object '{}' rejected by remote validation",
                path, name
            )));
        }
    }
    Ok(())
}

fn check_unique(
    objects: &BTreeMap<u64, Value>,
    path: &CollectionPath,
    candidate: &Value,
    skip_id: Option<u64>,
) -> Result<()> {
    let mut fields = vec!["slug"];
    if UNIQUE_NAME_COLLECTIONS.contains(&path.resource_type().as_str()) {
        fields.push("name");
    }
    for field in fields {
        let Some(wanted) = candidate.get(field).filter(|v| !v.is_null()) else {
            continue;
        };
        let clash = objects
            .iter()
            .any(|(id, existing)| Some(*id) != skip_id && existing.get(field) == Some(wanted));
        if clash {
            return Err(Error::conflict(format!(
                "{} with this {} already exists: {}",
                path, field, wanted
            )));
        }
    }
    Ok(())
}

fn insert_object(state: &mut MemoryState, path: &CollectionPath, object: Value) -> Result<u64> {
    let Value::Object(mut map) = object else {
        return Err(Error::validation("object must be a JSON object"));
    };
    let id = state.next_id;
    map.insert("id".to_string(), json!(id));
    map.entry(METADATA_FIELD.to_string()).or_insert_with(|| json!({}));
    let object = Value::Object(map);

    let objects = collection_mut(state, path)?;
    check_unique(objects, path, &object, None)?;
    objects.insert(id, object);
    state.next_id += 1;
    Ok(id)
}

fn patch_object(state: &mut MemoryState, path: &CollectionPath, id: u64, patch: &Value) -> Result<Value> {
    let objects = collection_mut(state, path)?;
    let current = objects
        .get(&id)
        .ok_or_else(|| Error::not_found(format!("{} object {} does not exist", path, id)))?;

    let mut next = current.clone();
    let mut patch = patch.clone();
    if let Some(map) = patch.as_object_mut() {
        map.remove("id");
    }
    json_patch::merge(&mut next, &patch);
    check_unique(objects, path, &next, Some(id))?;
    objects.insert(id, next.clone());
    Ok(next)
}

/// Compare a filter value against a stored field
fn field_matches(field: Option<&Value>, wanted: &str) -> bool {
    match field {
        Some(Value::String(s)) => s == wanted,
        Some(Value::Number(n)) => n.to_string() == wanted,
        Some(Value::Bool(b)) => b.to_string() == wanted,
        Some(Value::Object(map)) => ["id", "slug", "name", "value"]
            .iter()
            .any(|k| field_matches(map.get(*k), wanted)),
        _ => false,
    }
}

fn matches_filters(object: &Value, filters: &Filters) -> bool {
    filters.iter().all(|(key, wanted)| {
        if key == "q" {
            let needle = wanted.to_lowercase();
            return ["name", "display", "address", "model"].iter().any(|f| {
                object
                    .get(*f)
                    .and_then(Value::as_str)
                    .is_some_and(|s| s.to_lowercase().contains(&needle))
            });
        }
        if key == "limit" || key == "offset" {
            return true;
        }
        if let Some(cf) = key.strip_prefix("cf_") {
            return field_matches(object.get(METADATA_FIELD).and_then(|m| m.get(cf)), wanted);
        }
        if let Some(field) = object.get(key.as_str()) {
            return field_matches(Some(field), wanted);
        }
        if let Some(reference) = key.strip_suffix("_id") {
            return field_matches(object.get(reference), wanted);
        }
        false
    })
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn list(&self, path: &CollectionPath, filters: &Filters) -> Result<Vec<Value>> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let state = self.inner.read().await;
        let objects = state
            .collections
            .get(path)
            .ok_or_else(|| Error::not_found(format!("collection {} does not exist", path)))?;
        Ok(objects
            .values()
            .filter(|o| matches_filters(o, filters))
            .cloned()
            .collect())
    }

    async fn get(&self, path: &CollectionPath, id: u64) -> Result<Value> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let state = self.inner.read().await;
        state
            .collections
            .get(path)
            .ok_or_else(|| Error::not_found(format!("collection {} does not exist", path)))?
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{} object {} does not exist", path, id)))
    }

    async fn create(&self, path: &CollectionPath, payload: &Value) -> Result<Value> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.write().await;
        check_injected_failure(&state, path, payload)?;
        let id = insert_object(&mut state, path, payload.clone())?;
        tracing::debug!("memory backend created {} {}", path, id);
        collection_mut(&mut state, path)?
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Other(format!("{} object {} vanished after insert", path, id)))
    }

    async fn update(&self, path: &CollectionPath, id: u64, payload: &Value) -> Result<Value> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.write().await;
        check_injected_failure(&state, path, payload)?;
        patch_object(&mut state, path, id, payload)
    }

    async fn delete(&self, path: &CollectionPath, id: u64) -> Result<()> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.write().await;
        collection_mut(&mut state, path)?
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("{} object {} does not exist", path, id)))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Factory for creating memory backends
pub struct MemoryBackendFactory;

impl BackendFactory for MemoryBackendFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn RemoteBackend>> {
        match config {
            BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
            _ => Err(Error::config("Invalid config for memory backend")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites() -> CollectionPath {
        CollectionPath::new("dcim", "sites")
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_metadata_bag() {
        let backend = MemoryBackend::new();
        let a = backend.create(&sites(), &json!({"name": "AMS1"})).await.unwrap();
        let b = backend.create(&sites(), &json!({"name": "FRA1"})).await.unwrap();

        assert_eq!(a["id"], 1);
        assert_eq!(b["id"], 2);
        assert_eq!(a["custom_fields"], json!({}));
        assert_eq!(backend.write_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_collection_is_not_found() {
        let backend = MemoryBackend::new();
        let path = CollectionPath::new("dcim", "warp-drives");
        let err = backend.list(&path, &Filters::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_merges_nested_metadata() {
        let backend = MemoryBackend::new();
        let id = backend
            .seed(&sites(), json!({"name": "AMS1", "custom_fields": {"owner": "noc"}}))
            .await
            .unwrap();

        let updated = backend
            .update(&sites(), id, &json!({"status": "active", "custom_fields": {"sync_fields_hash": "abc"}}))
            .await
            .unwrap();

        assert_eq!(updated["custom_fields"]["owner"], "noc");
        assert_eq!(updated["custom_fields"]["sync_fields_hash"], "abc");
        assert_eq!(updated["status"], "active");
    }

    #[tokio::test]
    async fn test_filters() {
        let backend = MemoryBackend::new();
        let devices = CollectionPath::new("dcim", "devices");
        backend
            .seed(&devices, json!({"name": "sw1", "site": {"id": 4, "name": "AMS1"}, "custom_fields": {"sync_batch_id": "b1"}}))
            .await
            .unwrap();
        backend
            .seed(&devices, json!({"name": "sw2", "site": 5}))
            .await
            .unwrap();

        let by_site = |v: &str| {
            let mut f = Filters::new();
            f.insert("site_id".to_string(), v.to_string());
            f
        };
        assert_eq!(backend.list(&devices, &by_site("4")).await.unwrap().len(), 1);
        assert_eq!(backend.list(&devices, &by_site("5")).await.unwrap().len(), 1);

        let mut cf = Filters::new();
        cf.insert("cf_sync_batch_id".to_string(), "b1".to_string());
        let tagged = backend.list(&devices, &cf).await.unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0]["name"], "sw1");

        let mut q = Filters::new();
        q.insert("q".to_string(), "SW".to_string());
        assert_eq!(backend.list(&devices, &q).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_slug_is_conflict() {
        let backend = MemoryBackend::new();
        backend.create(&sites(), &json!({"name": "AMS1", "slug": "ams1"})).await.unwrap();
        let err = backend
            .create(&sites(), &json!({"name": "AMS-1", "slug": "ams1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_rejected_name() {
        let backend = MemoryBackend::new();
        backend.reject_name(sites(), "BAD").await;
        let err = backend.create(&sites(), &json!({"name": "BAD"})).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_factory() {
        let factory = MemoryBackendFactory;
        assert!(factory.create(&BackendConfig::Memory).is_ok());
        let http = BackendConfig::Http {
            base_url: "https://x".to_string(),
            api_token: "t".to_string(),
            timeout_secs: 1,
            page_size: 1,
        };
        assert!(factory.create(&http).is_err());
    }
}
