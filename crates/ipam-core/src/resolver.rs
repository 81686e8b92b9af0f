//! Resource reference resolution
//!
//! Turns a human identifier (name or slug) or a numeric ID into the one
//! remote object it denotes. Strategies degrade gracefully:
//!
//! 1. Numeric ID: `get`, a remote `NotFound` means "no such object"
//! 2. Slug, as given, then slugified (collections that carry slugs)
//! 3. Exact name
//!
//! A strategy the remote rejects as a bad filter (`Validation`) falls through
//! to the next one. More than one match is never guessed at: it fails with
//! [`Error::Conflict`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::proxy::ProxyClient;
use crate::traits::{CollectionPath, Filters};

/// Collections whose objects carry a unique `slug`
pub const SLUG_COLLECTIONS: &[&str] = &[
    "dcim.sites",
    "dcim.regions",
    "dcim.locations",
    "dcim.manufacturers",
    "dcim.device-roles",
    "dcim.device-types",
    "dcim.platforms",
    "ipam.vlan-groups",
    "circuits.providers",
    "circuits.circuit-types",
    "tenancy.tenants",
    "tenancy.tenant-groups",
    "extras.tags",
];

/// Whether objects of `path` carry a slug
pub fn has_slug(path: &CollectionPath) -> bool {
    SLUG_COLLECTIONS.contains(&path.resource_type().as_str())
}

/// Derive a URL-safe slug from a display name
///
/// Lowercases, keeps ASCII letters, digits and `_`, and collapses every
/// other run of characters into one `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// How an object is identified by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    /// Remote numeric ID
    Id(u64),
    /// Name or slug
    Name(String),
}

impl Identifier {
    /// Parse user input: all-digit strings are IDs, anything else is a name
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = trimmed.parse() {
                return Identifier::Id(id);
            }
        }
        Identifier::Name(trimmed.to_string())
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::Id(id) => write!(f, "#{}", id),
            Identifier::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// `{domain, collection, identifier}` naming at most one remote object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReference {
    /// API domain
    pub domain: String,
    /// Collection within the domain
    pub collection: String,
    /// Name, slug or ID
    pub identifier: Identifier,
}

impl ResourceReference {
    /// Create a reference, parsing `identifier` with [`Identifier::parse`]
    pub fn new(domain: impl Into<String>, collection: impl Into<String>, identifier: &str) -> Self {
        Self {
            domain: domain.into(),
            collection: collection.into(),
            identifier: Identifier::parse(identifier),
        }
    }

    /// Collection this reference points into
    pub fn path(&self) -> CollectionPath {
        CollectionPath::new(self.domain.clone(), self.collection.clone())
    }
}

/// How to find an object inside a known collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lookup {
    /// What the caller knows about the object
    pub identifier: Identifier,
    /// Match on this field instead of slug/name (e.g. `address`, `model`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Extra filters narrowing a name lookup (e.g. `device_id`)
    #[serde(default, skip_serializing_if = "Filters::is_empty")]
    pub scope: Filters,
}

impl Lookup {
    /// Look up by remote ID
    pub fn id(id: u64) -> Self {
        Self {
            identifier: Identifier::Id(id),
            field: None,
            scope: Filters::new(),
        }
    }

    /// Look up by name or slug
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            identifier: Identifier::Name(name.into()),
            field: None,
            scope: Filters::new(),
        }
    }

    /// Look up by exact value of one field
    pub fn by_field(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            identifier: Identifier::Name(value.into()),
            field: Some(field.into()),
            scope: Filters::new(),
        }
    }

    /// Add a scope filter
    pub fn scoped(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.scope.insert(key.into(), value.to_string());
        self
    }
}

impl From<&str> for Lookup {
    fn from(input: &str) -> Self {
        match Identifier::parse(input) {
            Identifier::Id(id) => Lookup::id(id),
            Identifier::Name(name) => Lookup::name(name),
        }
    }
}

impl From<u64> for Lookup {
    fn from(id: u64) -> Self {
        Lookup::id(id)
    }
}

/// Resolves lookups through the proxy client (and therefore its cache)
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    client: &'a ProxyClient,
}

impl<'a> Resolver<'a> {
    pub fn new(client: &'a ProxyClient) -> Self {
        Self { client }
    }

    /// Resolve a full reference
    ///
    /// # Returns
    ///
    /// - `Ok(Some(object))`: Exactly one object matched
    /// - `Ok(None)`: Nothing matched
    /// - `Err(Error::Conflict)`: More than one object matched
    pub async fn resolve(&self, reference: &ResourceReference) -> Result<Option<Value>> {
        let lookup = Lookup {
            identifier: reference.identifier.clone(),
            field: None,
            scope: Filters::new(),
        };
        self.resolve_in(&reference.path(), &lookup).await
    }

    /// Resolve a lookup inside `path`
    pub async fn resolve_in(&self, path: &CollectionPath, lookup: &Lookup) -> Result<Option<Value>> {
        let executor = self.client.collection(path)?;

        let value = match &lookup.identifier {
            Identifier::Id(id) => {
                return match executor.get(*id).await {
                    Ok(object) => Ok(Some(object)),
                    Err(Error::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                };
            }
            Identifier::Name(value) => value,
        };

        for (field, candidate) in strategies(path, lookup, value) {
            let mut filters = lookup.scope.clone();
            filters.insert(field.clone(), candidate.clone());

            let items = match executor.list(&filters).await {
                Ok(items) => items,
                Err(Error::Validation(msg)) => {
                    debug!("{} lookup by {} rejected, trying next: {}", path, field, msg);
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Remotes silently ignore filters they do not know; re-check here.
            let mut matches: Vec<Value> = items
                .into_iter()
                .filter(|item| item.get(&field).and_then(Value::as_str) == Some(candidate.as_str()))
                .collect();

            match matches.len() {
                0 => continue,
                1 => {
                    debug!("Resolved {} {} via {}", path, lookup.identifier, field);
                    return Ok(matches.pop());
                }
                n => {
                    return Err(Error::conflict(format!(
                        "{} {}={} is ambiguous ({} matches)",
                        path, field, candidate, n
                    )));
                }
            }
        }

        debug!("{} {} did not resolve", path, lookup.identifier);
        Ok(None)
    }

    /// Resolve and return the object's ID
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if nothing matched.
    pub async fn resolve_id(&self, path: &CollectionPath, lookup: &Lookup) -> Result<u64> {
        let object = self
            .resolve_in(path, lookup)
            .await?
            .ok_or_else(|| Error::not_found(format!("{} {} does not exist", path, lookup.identifier)))?;
        object_id(&object)
    }
}

/// Ordered `(field, value)` filters to try for a name lookup
fn strategies(path: &CollectionPath, lookup: &Lookup, value: &str) -> Vec<(String, String)> {
    if let Some(field) = &lookup.field {
        return vec![(field.clone(), value.to_string())];
    }

    let mut out = Vec::with_capacity(3);
    if has_slug(path) {
        out.push(("slug".to_string(), value.to_string()));
        let slug = slugify(value);
        if !slug.is_empty() && slug != value {
            out.push(("slug".to_string(), slug));
        }
    }
    out.push(("name".to_string(), value.to_string()));
    out
}

/// Numeric `id` of a remote object
pub fn object_id(object: &Value) -> Result<u64> {
    object
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Other(format!("remote object has no numeric id: {}", object)))
}
