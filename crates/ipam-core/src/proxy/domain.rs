//! API domain lookup table
//!
//! The remote system groups collections under a small, fixed set of API
//! domains. Domains are validated eagerly; collections are not, so new remote
//! resource types work without a code change and surface as `NotFound` on
//! first use if they do not exist.

use std::collections::BTreeMap;

/// Built-in domains and the collections commonly used under each
///
/// The collection lists are informational (discovery, docs); they are never
/// used to reject a collection name.
const BUILTIN_DOMAINS: &[(&str, &[&str])] = &[
    (
        "dcim",
        &[
            "sites",
            "regions",
            "locations",
            "racks",
            "manufacturers",
            "device-roles",
            "device-types",
            "platforms",
            "devices",
            "interfaces",
            "cables",
        ],
    ),
    (
        "ipam",
        &[
            "ip-addresses",
            "prefixes",
            "vlans",
            "vlan-groups",
            "vrfs",
            "aggregates",
        ],
    ),
    ("circuits", &["providers", "circuit-types", "circuits"]),
    ("tenancy", &["tenants", "tenant-groups", "contacts"]),
    ("virtualization", &["clusters", "virtual-machines", "interfaces"]),
    ("extras", &["tags", "custom-fields", "journal-entries"]),
    ("users", &["users", "groups", "tokens"]),
    ("wireless", &["wireless-lans", "wireless-links"]),
    ("vpn", &["tunnels", "l2vpns"]),
    ("core", &["data-sources", "jobs"]),
];

/// One remote API domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiDomain {
    /// Domain name as it appears in the URL
    pub name: String,
    /// Commonly used collections (not exhaustive)
    pub known_collections: Vec<String>,
}

/// Explicit table from domain name to domain capability
#[derive(Debug, Clone)]
pub struct DomainTable {
    domains: BTreeMap<String, ApiDomain>,
}

impl DomainTable {
    /// Table with the remote system's built-in domains
    pub fn builtin() -> Self {
        let domains = BUILTIN_DOMAINS
            .iter()
            .map(|(name, collections)| {
                (
                    name.to_string(),
                    ApiDomain {
                        name: name.to_string(),
                        known_collections: collections.iter().map(|c| c.to_string()).collect(),
                    },
                )
            })
            .collect();
        Self { domains }
    }

    /// Add a domain (e.g. a plugin namespace such as "plugins/bgp")
    pub fn register(&mut self, name: impl Into<String>, known_collections: Vec<String>) {
        let name = name.into();
        self.domains.insert(
            name.clone(),
            ApiDomain {
                name,
                known_collections,
            },
        );
    }

    /// Look up a domain
    pub fn get(&self, name: &str) -> Option<&ApiDomain> {
        self.domains.get(name)
    }

    /// All domain names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.domains.keys().map(String::as_str).collect()
    }
}

impl Default for DomainTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Check that a collection name is URL-safe
///
/// Only the syntax is checked; whether the collection exists is the
/// remote's call.
pub fn validate_collection_name(name: &str) -> Result<(), crate::Error> {
    if name.is_empty() {
        return Err(crate::Error::validation("Collection name cannot be empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(crate::Error::validation(format!(
            "Collection name '{}' may only contain lowercase letters, digits, '-' and '_'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_domains() {
        let table = DomainTable::builtin();
        assert!(table.get("dcim").is_some());
        assert!(table.get("ipam").is_some());
        assert!(table.get("dns").is_none());
        assert_eq!(table.names().len(), BUILTIN_DOMAINS.len());
    }

    #[test]
    fn test_register_plugin_domain() {
        let mut table = DomainTable::builtin();
        table.register("plugins/bgp", vec!["sessions".to_string()]);
        assert!(table.get("plugins/bgp").is_some());
    }

    #[test]
    fn test_collection_name_syntax() {
        assert!(validate_collection_name("ip-addresses").is_ok());
        assert!(validate_collection_name("brand_new_thing").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("../sites").is_err());
        assert!(validate_collection_name("Sites").is_err());
    }
}
