//! Idempotent "ensure" semantics
//!
//! `ensure` is fetch-or-create with selective-field diffing:
//!
//! ```text
//! resolve(lookup) ──miss──▶ create(desired + name/slug + fingerprint)        => created
//!        │
//!        └─hit──▶ hash(managed ⊂ desired) == stored hash ? ──yes──▶ no write => unchanged
//!                                                         └─no───▶ PATCH managed + fingerprint => updated
//! ```
//!
//! Only managed fields are written on update, and only managed fields enter
//! the hash, so values other actors set on unmanaged fields survive every
//! call. An object without a stored fingerprint is updated once to establish
//! a baseline.
//!
//! The resolve-then-create step is not atomic. Two concurrent calls creating
//! the same entity race at the remote; the loser sees the remote's uniqueness
//! error as [`Error::Conflict`] and is not retried.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fingerprint::{ManagedFieldFingerprint, fields_hash, managed_value, project_managed};
use crate::proxy::ProxyClient;
use crate::resolver::{Identifier, Lookup, Resolver, has_slug, object_id, slugify};
use crate::traits::CollectionPath;

/// What `ensure` did (or would do)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    Updated,
    Unchanged,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Created => write!(f, "created"),
            Action::Updated => write!(f, "updated"),
            Action::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Input to [`Reconciler::ensure`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsureRequest {
    /// Target collection
    pub path: CollectionPath,
    /// How to find an existing object
    pub lookup: Lookup,
    /// Desired field values
    pub desired: Map<String, Value>,
    /// Fields this system owns; defaults to every desired field
    ///
    /// "custom_fields.owner" owns one key of the metadata bag.
    pub managed: Vec<String>,
    /// Orchestration batch writing the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl EnsureRequest {
    /// Build a request managing every field in `desired`
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] if `desired` is not a JSON object.
    pub fn new(path: CollectionPath, lookup: impl Into<Lookup>, desired: Value) -> Result<Self> {
        let Value::Object(desired) = desired else {
            return Err(Error::validation(format!(
                "desired fields for {} must be a JSON object",
                path
            )));
        };
        let managed = desired.keys().cloned().collect();
        Ok(Self {
            path,
            lookup: lookup.into(),
            desired,
            managed,
            batch_id: None,
        })
    }

    /// Restrict the managed fields
    pub fn managed<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.managed = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Tag writes with an orchestration batch
    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    fn validate(&self, metadata_field: &str) -> Result<()> {
        for name in &self.managed {
            if name == metadata_field {
                return Err(Error::validation(format!(
                    "'{}' holds sync metadata and cannot be managed as a whole",
                    name
                )));
            }
            if managed_value(&self.desired, name).is_none() {
                return Err(Error::validation(format!(
                    "managed field '{}' has no desired value",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Result of [`Reconciler::ensure`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsureOutcome {
    /// Object as returned by the remote (or simulated under dry-run)
    pub object: Value,
    /// What happened
    pub action: Action,
    /// Remote ID of the object
    pub id: u64,
}

/// Result of [`Reconciler::preview`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsurePreview {
    /// What `ensure` would do
    pub action: Action,
    /// ID of the existing object, if any
    pub existing_id: Option<u64>,
    /// Managed fields whose remote value differs (all desired fields on create)
    pub changed_fields: Vec<String>,
}

/// Applies ensure semantics through a [`ProxyClient`]
#[derive(Debug, Clone, Copy)]
pub struct Reconciler<'a> {
    client: &'a ProxyClient,
}

impl<'a> Reconciler<'a> {
    pub fn new(client: &'a ProxyClient) -> Self {
        Self { client }
    }

    /// Make the remote reflect `request`, writing only when needed
    ///
    /// # Errors
    ///
    /// - [`Error::ConfirmationRequired`] if `confirm` is false (checked before any network call)
    /// - [`Error::Validation`] on a malformed request or a remote rejection
    /// - [`Error::NotFound`] when looking up by ID and the object does not exist
    /// - [`Error::Conflict`] on an ambiguous lookup or a remote uniqueness clash
    pub async fn ensure(&self, request: &EnsureRequest, confirm: bool) -> Result<EnsureOutcome> {
        if !confirm {
            return Err(Error::confirmation_required(format!("ensure {}", request.path)));
        }
        let config = self.client.reconcile_config();
        request.validate(&config.metadata_field)?;

        let executor = self.client.collection(&request.path)?;
        let hash = fields_hash(&request.desired, &request.managed);
        let existing = Resolver::new(self.client)
            .resolve_in(&request.path, &request.lookup)
            .await?;

        let Some(existing) = existing else {
            let payload = self.create_payload(request, hash)?;
            let object = executor.create(&payload, true).await?;
            let id = object_id(&object)?;
            info!("Ensure {} {}: created #{}", request.path, request.lookup.identifier, id);
            return Ok(EnsureOutcome {
                object,
                action: Action::Created,
                id,
            });
        };

        let id = object_id(&existing)?;
        let stored = ManagedFieldFingerprint::read(&existing, config);
        if stored.as_ref().is_some_and(|fp| fp.fields_hash == hash) {
            debug!("Ensure {} #{}: fingerprint matches, no write", request.path, id);
            return Ok(EnsureOutcome {
                object: existing,
                action: Action::Unchanged,
                id,
            });
        }
        if stored.is_none() {
            debug!("Ensure {} #{}: no fingerprint, establishing baseline", request.path, id);
        }

        let patch = self.update_payload(request, hash);
        let returned = executor.update(id, &patch, true).await?;
        let object = if self.client.is_dry_run() {
            // Simulated PATCH echoes the patch only; show the merged result.
            let mut merged = existing;
            json_patch::merge(&mut merged, &patch);
            merged
        } else {
            returned
        };
        info!("Ensure {} #{}: updated", request.path, id);
        Ok(EnsureOutcome {
            object,
            action: Action::Updated,
            id,
        })
    }

    /// Classify what `ensure` would do, without writing
    pub async fn preview(&self, request: &EnsureRequest) -> Result<EnsurePreview> {
        let config = self.client.reconcile_config();
        request.validate(&config.metadata_field)?;

        let existing = Resolver::new(self.client)
            .resolve_in(&request.path, &request.lookup)
            .await?;

        let Some(existing) = existing else {
            if let Identifier::Id(id) = request.lookup.identifier {
                return Err(missing_by_id(&request.path, id));
            }
            let mut changed: Vec<String> = request.desired.keys().cloned().collect();
            changed.sort();
            return Ok(EnsurePreview {
                action: Action::Created,
                existing_id: None,
                changed_fields: changed,
            });
        };

        let id = object_id(&existing)?;
        let hash = fields_hash(&request.desired, &request.managed);
        let stored = ManagedFieldFingerprint::read(&existing, config);
        if stored.as_ref().is_some_and(|fp| fp.fields_hash == hash) {
            return Ok(EnsurePreview {
                action: Action::Unchanged,
                existing_id: Some(id),
                changed_fields: Vec::new(),
            });
        }

        let mut changed: Vec<String> = project_managed(&request.desired, &request.managed)
            .into_iter()
            .filter(|(name, wanted)| {
                let current = existing.as_object().and_then(|o| managed_value(o, name));
                !equivalent(current, wanted)
            })
            .map(|(name, _)| name)
            .collect();
        changed.sort();
        changed.dedup();

        Ok(EnsurePreview {
            action: Action::Updated,
            existing_id: Some(id),
            changed_fields: changed,
        })
    }

    fn fingerprint(&self, request: &EnsureRequest, hash: String) -> ManagedFieldFingerprint {
        ManagedFieldFingerprint::new(
            hash,
            self.client.reconcile_config().source_tag.clone(),
            request.batch_id.clone(),
        )
    }

    fn create_payload(&self, request: &EnsureRequest, hash: String) -> Result<Value> {
        let config = self.client.reconcile_config();
        let mut payload = request.desired.clone();

        match (&request.lookup.identifier, &request.lookup.field) {
            (Identifier::Id(id), _) => return Err(missing_by_id(&request.path, *id)),
            (Identifier::Name(value), Some(field)) => {
                payload.entry(field.clone()).or_insert_with(|| json!(value));
            }
            (Identifier::Name(value), None) => {
                payload.entry("name".to_string()).or_insert_with(|| json!(value));
            }
        }
        if has_slug(&request.path) && !payload.contains_key("slug") {
            if let Some(name) = payload.get("name").and_then(Value::as_str) {
                let slug = slugify(name);
                payload.insert("slug".to_string(), json!(slug));
            }
        }

        let mut bag = payload
            .get(&config.metadata_field)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        bag.extend(self.fingerprint(request, hash).to_metadata(config));
        if let Some(batch_id) = &request.batch_id {
            bag.insert(config.origin_batch_key.clone(), json!(batch_id));
        }
        payload.insert(config.metadata_field.clone(), Value::Object(bag));

        Ok(Value::Object(payload))
    }

    fn update_payload(&self, request: &EnsureRequest, hash: String) -> Value {
        let config = self.client.reconcile_config();
        let bag_prefix = format!("{}.", config.metadata_field);

        // Only managed bag keys ride along with the fingerprint; the remote
        // merges the bag, so keys left out keep whatever value they hold.
        let mut patch = Map::new();
        let mut bag = Map::new();
        for (name, value) in project_managed(&request.desired, &request.managed) {
            match name.strip_prefix(&bag_prefix) {
                Some(key) => {
                    bag.insert(key.to_string(), value);
                }
                None => {
                    patch.insert(name, value);
                }
            }
        }
        bag.extend(self.fingerprint(request, hash).to_metadata(config));
        patch.insert(config.metadata_field.clone(), Value::Object(bag));

        Value::Object(patch)
    }
}

fn missing_by_id(path: &CollectionPath, id: u64) -> Error {
    Error::not_found(format!(
        "{} #{} does not exist and objects cannot be created by id",
        path, id
    ))
}

/// Whether a remote value already satisfies a desired one
///
/// Remote objects expand references (`{"id": 3, "name": ..}`) and choice
/// fields (`{"value": "active", "label": ..}`) that are written as scalars.
fn equivalent(remote: Option<&Value>, wanted: &Value) -> bool {
    let Some(remote) = remote else {
        return wanted.is_null();
    };
    if remote == wanted {
        return true;
    }
    match (remote, wanted) {
        (Value::Object(map), scalar) if !scalar.is_object() && !scalar.is_array() => {
            ["id", "value", "slug"].iter().any(|k| map.get(*k) == Some(scalar))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::ClientConfig;
    use std::sync::Arc;

    fn sites() -> CollectionPath {
        CollectionPath::new("dcim", "sites")
    }

    fn setup(dry_run: bool) -> (ProxyClient, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let config = ClientConfig::default().with_dry_run(dry_run);
        (ProxyClient::new(backend.clone(), &config).unwrap(), backend)
    }

    fn request(status: &str) -> EnsureRequest {
        EnsureRequest::new(sites(), "AMS1", json!({"status": status}))
            .unwrap()
            .managed(["status"])
    }

    #[tokio::test]
    async fn test_created_then_unchanged_then_updated() {
        let (client, backend) = setup(false);
        let reconciler = Reconciler::new(&client);

        let first = reconciler.ensure(&request("active"), true).await.unwrap();
        assert_eq!(first.action, Action::Created);
        assert_eq!(first.object["name"], "AMS1");
        assert_eq!(first.object["slug"], "ams1");

        let writes = backend.write_count();
        let second = reconciler.ensure(&request("active"), true).await.unwrap();
        assert_eq!(second.action, Action::Unchanged);
        assert_eq!(second.id, first.id);
        assert_eq!(backend.write_count(), writes);

        let third = reconciler.ensure(&request("planned"), true).await.unwrap();
        assert_eq!(third.action, Action::Updated);
        assert_eq!(third.object["status"], "planned");
        assert_eq!(third.object["name"], "AMS1");
    }

    #[tokio::test]
    async fn test_unmanaged_edits_survive() {
        let (client, backend) = setup(false);
        let reconciler = Reconciler::new(&client);
        let created = reconciler.ensure(&request("active"), true).await.unwrap();

        backend
            .edit(&sites(), created.id, &json!({"description": "hand edited"}))
            .await
            .unwrap();
        client.cache().clear();

        let outcome = reconciler.ensure(&request("planned"), true).await.unwrap();
        assert_eq!(outcome.action, Action::Updated);
        assert_eq!(outcome.object["description"], "hand edited");
    }

    #[tokio::test]
    async fn test_object_without_fingerprint_updated_once() {
        let (client, backend) = setup(false);
        backend
            .seed(&sites(), json!({"name": "AMS1", "slug": "ams1", "status": "active"}))
            .await
            .unwrap();
        let reconciler = Reconciler::new(&client);

        let first = reconciler.ensure(&request("active"), true).await.unwrap();
        assert_eq!(first.action, Action::Updated);
        let second = reconciler.ensure(&request("active"), true).await.unwrap();
        assert_eq!(second.action, Action::Unchanged);
    }

    #[tokio::test]
    async fn test_requires_confirmation_before_any_call() {
        let (client, backend) = setup(false);
        let err = Reconciler::new(&client)
            .ensure(&request("active"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfirmationRequired { .. }));
        assert_eq!(backend.read_count(), 0);
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_managed_field_must_be_desired() {
        let (client, _backend) = setup(false);
        let req = EnsureRequest::new(sites(), "AMS1", json!({"status": "active"}))
            .unwrap()
            .managed(["status", "facility"]);
        let err = Reconciler::new(&client).ensure(&req, true).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_preview_reports_changed_fields_without_writing() {
        let (client, backend) = setup(false);
        let reconciler = Reconciler::new(&client);

        let preview = reconciler.preview(&request("active")).await.unwrap();
        assert_eq!(preview.action, Action::Created);

        let created = reconciler.ensure(&request("active"), true).await.unwrap();
        let writes = backend.write_count();

        let same = reconciler.preview(&request("active")).await.unwrap();
        assert_eq!(same.action, Action::Unchanged);

        let changed = reconciler.preview(&request("planned")).await.unwrap();
        assert_eq!(changed.action, Action::Updated);
        assert_eq!(changed.existing_id, Some(created.id));
        assert_eq!(changed.changed_fields, vec!["status".to_string()]);
        assert_eq!(backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_dry_run_shapes_match() {
        let (client, backend) = setup(true);
        let outcome = Reconciler::new(&client).ensure(&request("active"), true).await.unwrap();
        assert_eq!(outcome.action, Action::Created);
        assert_eq!(outcome.object["name"], "AMS1");
        assert!(outcome.object["custom_fields"]["sync_fields_hash"].is_string());
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_id_written_to_metadata() {
        let (client, _backend) = setup(false);
        let req = request("active").with_batch("batch-1");
        let outcome = Reconciler::new(&client).ensure(&req, true).await.unwrap();
        assert_eq!(outcome.object["custom_fields"]["sync_batch_id"], "batch-1");
        assert_eq!(outcome.object["custom_fields"]["sync_origin_batch"], "batch-1");
    }

    #[test]
    fn test_equivalent_handles_expanded_values() {
        assert!(equivalent(Some(&json!({"id": 3, "name": "x"})), &json!(3)));
        assert!(equivalent(Some(&json!({"value": "active", "label": "Active"})), &json!("active")));
        assert!(!equivalent(Some(&json!("planned")), &json!("active")));
        assert!(equivalent(None, &Value::Null));
    }
}
