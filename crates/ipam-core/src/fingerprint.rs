//! Managed-field fingerprints
//!
//! A fingerprint is a SHA-256 over the canonical JSON of the *managed*
//! subset of an object's desired fields. It is stored on the remote object
//! itself, in its metadata bag, so any process can tell whether the remote
//! already reflects a given desired state.
//!
//! Unmanaged fields never enter the hash, so edits made by other actors to
//! those fields neither trigger writes nor get overwritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::config::ReconcileConfig;

/// Fingerprint metadata as stored on a remote object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedFieldFingerprint {
    /// Hex SHA-256 of the managed projection
    pub fields_hash: String,
    /// Tag of the writer that produced the hash
    pub source_tag: String,
    /// When the hash was written
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Last orchestration batch that wrote the object
    pub batch_id: Option<String>,
}

impl ManagedFieldFingerprint {
    /// Fingerprint for a fresh write
    pub fn new(fields_hash: String, source_tag: impl Into<String>, batch_id: Option<String>) -> Self {
        Self {
            fields_hash,
            source_tag: source_tag.into(),
            last_synced_at: Some(Utc::now()),
            batch_id,
        }
    }

    /// Read the fingerprint from a remote object's metadata bag
    ///
    /// Returns `None` when the object carries no hash (created by another actor).
    pub fn read(object: &Value, config: &ReconcileConfig) -> Option<Self> {
        let bag = object.get(&config.metadata_field)?;
        let fields_hash = bag.get(&config.fingerprint_key)?.as_str()?.to_string();
        if fields_hash.is_empty() {
            return None;
        }
        Some(Self {
            fields_hash,
            source_tag: bag
                .get(&config.source_key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            last_synced_at: bag
                .get(&config.synced_at_key)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            batch_id: bag
                .get(&config.batch_key)
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Metadata entries to merge into the object's metadata bag
    pub fn to_metadata(&self, config: &ReconcileConfig) -> Map<String, Value> {
        let mut bag = Map::new();
        bag.insert(config.fingerprint_key.clone(), json!(self.fields_hash));
        bag.insert(config.source_key.clone(), json!(self.source_tag));
        if let Some(ts) = self.last_synced_at {
            bag.insert(config.synced_at_key.clone(), json!(ts.to_rfc3339()));
        }
        if let Some(batch_id) = &self.batch_id {
            bag.insert(config.batch_key.clone(), json!(batch_id));
        }
        bag
    }
}

/// Look up one managed name in an object
///
/// A dotted name ("custom_fields.owner") addresses a single key inside a
/// nested object, so one entry of a shared bag can be owned on its own.
pub fn managed_value<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(value) = object.get(name) {
        return Some(value);
    }
    let (outer, inner) = name.split_once('.')?;
    object.get(outer)?.as_object()?.get(inner)
}

/// Project the managed fields out of the desired state
///
/// Managed names absent from `desired` are skipped. Dotted names keep their
/// dotted form as the key.
pub fn project_managed(desired: &Map<String, Value>, managed: &[String]) -> Map<String, Value> {
    managed
        .iter()
        .filter_map(|name| managed_value(desired, name).map(|v| (name.clone(), v.clone())))
        .collect()
}

/// Hash of the managed projection
///
/// The sorted list of managed names is hashed too, so changing which
/// fields are managed counts as a change.
pub fn fields_hash(desired: &Map<String, Value>, managed: &[String]) -> String {
    let mut names: Vec<&String> = managed.iter().collect();
    names.sort();
    names.dedup();

    let projected = project_managed(desired, managed);
    let document = json!({
        "fields": canonicalize(&Value::Object(projected)),
        "managed": names,
    });

    let mut hasher = Sha256::new();
    hasher.update(document.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Rebuild a value with object keys in sorted order at every depth
///
/// Keeps the hash stable regardless of map ordering features enabled
/// elsewhere in the dependency graph.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
