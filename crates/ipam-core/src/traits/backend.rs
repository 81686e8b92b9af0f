// # Remote Backend Trait
//
// Defines the interface to the remote network-documentation system.
//
// ## Implementations
//
// - HTTP/REST: `ipam-backend-http` crate
// - In-process fake: `ipam_core::backend::MemoryBackend`
//
// ## Usage
//
// ```rust,ignore
// use ipam_core::traits::{CollectionPath, Filters, RemoteBackend};
//
// let sites = CollectionPath::new("dcim", "sites");
// let mut filters = Filters::new();
// filters.insert("slug".to_string(), "ams1".to_string());
// let found = backend.list(&sites, &filters).await?;
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Query filters for list calls
///
/// A `BTreeMap` so iteration order is sorted, which keeps cache keys and
/// request URLs deterministic.
pub type Filters = BTreeMap<String, String>;

/// Address of one remote collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionPath {
    /// API domain (e.g. "dcim")
    pub domain: String,
    /// Collection within the domain (e.g. "sites")
    pub collection: String,
}

impl CollectionPath {
    /// Create a new collection path
    pub fn new(domain: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            collection: collection.into(),
        }
    }

    /// Resource type tag used for caching and TTL lookup ("dcim.sites")
    pub fn resource_type(&self) -> String {
        format!("{}.{}", self.domain, self.collection)
    }

    /// REST path of the collection ("/api/dcim/sites/")
    pub fn api_path(&self) -> String {
        format!("/api/{}/{}/", self.domain, self.collection)
    }

    /// REST path of one object ("/api/dcim/sites/7/")
    pub fn object_path(&self, id: u64) -> String {
        format!("/api/{}/{}/{}/", self.domain, self.collection, id)
    }
}

impl std::fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.domain, self.collection)
    }
}

/// Trait for remote backend implementations
///
/// # Trust Level: Untrusted
///
/// Backends are single-shot transports:
///
/// - ✅ Translate one call into one logical remote request (pagination excepted)
/// - ✅ Map remote failures onto the crate error taxonomy
/// - ❌ Retry (the caller decides; mutating calls are never retried)
/// - ❌ Cache (owned by the proxy client's cache layer)
/// - ❌ Enforce confirmation or dry-run (owned by the proxy executor)
///
/// # Error mapping
///
/// - 400/422 → [`Error::Validation`](crate::Error::Validation), or
///   [`Error::Conflict`](crate::Error::Conflict) when the body reports a uniqueness violation
/// - 401/403 → [`Error::Authentication`](crate::Error::Authentication)
/// - 404 → [`Error::NotFound`](crate::Error::NotFound)
/// - 409 → [`Error::Conflict`](crate::Error::Conflict)
/// - 429, 5xx, transport failure → [`Error::RemoteSystem`](crate::Error::RemoteSystem)
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// List objects in a collection matching all filters
    ///
    /// Implementations follow pagination and return every matching object.
    async fn list(&self, path: &CollectionPath, filters: &Filters)
    -> Result<Vec<Value>, crate::Error>;

    /// Fetch one object by numeric ID
    async fn get(&self, path: &CollectionPath, id: u64) -> Result<Value, crate::Error>;

    /// Create an object, returning the stored representation
    async fn create(&self, path: &CollectionPath, payload: &Value) -> Result<Value, crate::Error>;

    /// Partially update an object (PATCH semantics), returning the stored representation
    ///
    /// Fields absent from `payload` are left untouched.
    async fn update(
        &self,
        path: &CollectionPath,
        id: u64,
        payload: &Value,
    ) -> Result<Value, crate::Error>;

    /// Delete an object
    async fn delete(&self, path: &CollectionPath, id: u64) -> Result<(), crate::Error>;

    /// Get the backend name (for logging/debugging)
    fn backend_name(&self) -> &'static str;
}

/// Helper trait for constructing backends from configuration
pub trait BackendFactory: Send + Sync {
    /// Create a backend instance from configuration
    fn create(
        &self,
        config: &crate::config::BackendConfig,
    ) -> Result<Arc<dyn RemoteBackend>, crate::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_path_formats() {
        let path = CollectionPath::new("ipam", "ip-addresses");

        assert_eq!(path.resource_type(), "ipam.ip-addresses");
        assert_eq!(path.api_path(), "/api/ipam/ip-addresses/");
        assert_eq!(path.object_path(42), "/api/ipam/ip-addresses/42/");
        assert_eq!(path.to_string(), "ipam.ip-addresses");
    }

    #[test]
    fn test_collection_path_serializes_as_object() {
        let path = CollectionPath::new("dcim", "sites");
        let json = serde_json::to_value(&path).unwrap();

        assert_eq!(json, serde_json::json!({"domain": "dcim", "collection": "sites"}));
        assert_eq!(serde_json::from_value::<CollectionPath>(json).unwrap(), path);
    }
}
