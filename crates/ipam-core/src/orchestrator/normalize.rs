//! Input normalization
//!
//! Flattens nested bulk input (devices embedding interfaces embedding
//! addresses) into typed records. Each record carries its natural key and
//! the by-name references it makes to other records.
//!
//! Accepted shape:
//!
//! ```json
//! {
//!   "sites": [{"name": "AMS1", "status": "active"}],
//!   "device_roles": [{"name": "Router"}],
//!   "devices": [{
//!     "name": "r1", "site": "AMS1", "role": "Router", "device_type": "MX204",
//!     "interfaces": [{"name": "xe-0/0/0", "ip_addresses": [{"address": "10.0.0.1/31"}]}]
//!   }]
//! }
//! ```
//!
//! A reference given as a string names another record (in the batch or
//! already on the remote). A reference given as a number is a remote ID and
//! creates no dependency.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::traits::CollectionPath;

/// Entity kinds the orchestrator understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Tenant,
    Site,
    Manufacturer,
    DeviceRole,
    Platform,
    DeviceType,
    Device,
    Interface,
    IpAddress,
    Vlan,
    Prefix,
}

/// A by-name reference field of an entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSpec {
    /// Field name in input and payload
    pub field: &'static str,
    /// Kind the field points at
    pub target: EntityKind,
    /// Whether the record is invalid without it
    pub required: bool,
}

const fn reference(field: &'static str, target: EntityKind, required: bool) -> ReferenceSpec {
    ReferenceSpec {
        field,
        target,
        required,
    }
}

const DEVICE_TYPE_REFS: &[ReferenceSpec] = &[reference("manufacturer", EntityKind::Manufacturer, true)];
const DEVICE_REFS: &[ReferenceSpec] = &[
    reference("site", EntityKind::Site, true),
    reference("role", EntityKind::DeviceRole, true),
    reference("device_type", EntityKind::DeviceType, true),
    reference("tenant", EntityKind::Tenant, false),
    reference("platform", EntityKind::Platform, false),
];
const INTERFACE_REFS: &[ReferenceSpec] = &[reference("device", EntityKind::Device, true)];
const IP_ADDRESS_REFS: &[ReferenceSpec] = &[reference("interface", EntityKind::Interface, false)];
const VLAN_REFS: &[ReferenceSpec] = &[
    reference("site", EntityKind::Site, false),
    reference("tenant", EntityKind::Tenant, false),
];
const PREFIX_REFS: &[ReferenceSpec] = &[
    reference("site", EntityKind::Site, false),
    reference("vlan", EntityKind::Vlan, false),
    reference("tenant", EntityKind::Tenant, false),
];

impl EntityKind {
    /// Every kind, in input-key documentation order
    pub const ALL: [EntityKind; 11] = [
        EntityKind::Tenant,
        EntityKind::Site,
        EntityKind::Manufacturer,
        EntityKind::DeviceRole,
        EntityKind::Platform,
        EntityKind::DeviceType,
        EntityKind::Device,
        EntityKind::Interface,
        EntityKind::IpAddress,
        EntityKind::Vlan,
        EntityKind::Prefix,
    ];

    /// Top-level key in bulk input
    pub fn input_key(&self) -> &'static str {
        match self {
            EntityKind::Tenant => "tenants",
            EntityKind::Site => "sites",
            EntityKind::Manufacturer => "manufacturers",
            EntityKind::DeviceRole => "device_roles",
            EntityKind::Platform => "platforms",
            EntityKind::DeviceType => "device_types",
            EntityKind::Device => "devices",
            EntityKind::Interface => "interfaces",
            EntityKind::IpAddress => "ip_addresses",
            EntityKind::Vlan => "vlans",
            EntityKind::Prefix => "prefixes",
        }
    }

    /// Kind for a top-level input key
    pub fn from_input_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.input_key() == key)
    }

    /// Remote collection holding this kind
    pub fn path(&self) -> CollectionPath {
        let (domain, collection) = match self {
            EntityKind::Tenant => ("tenancy", "tenants"),
            EntityKind::Site => ("dcim", "sites"),
            EntityKind::Manufacturer => ("dcim", "manufacturers"),
            EntityKind::DeviceRole => ("dcim", "device-roles"),
            EntityKind::Platform => ("dcim", "platforms"),
            EntityKind::DeviceType => ("dcim", "device-types"),
            EntityKind::Device => ("dcim", "devices"),
            EntityKind::Interface => ("dcim", "interfaces"),
            EntityKind::IpAddress => ("ipam", "ip-addresses"),
            EntityKind::Vlan => ("ipam", "vlans"),
            EntityKind::Prefix => ("ipam", "prefixes"),
        };
        CollectionPath::new(domain, collection)
    }

    /// Field holding the natural key
    pub fn key_field(&self) -> &'static str {
        match self {
            EntityKind::DeviceType => "model",
            EntityKind::IpAddress => "address",
            EntityKind::Prefix => "prefix",
            _ => "name",
        }
    }

    /// Execution pass: 1 for kinds that never reference other kinds
    pub fn pass(&self) -> u8 {
        if self.references().is_empty() { 1 } else { 2 }
    }

    /// Whether the remote gives this kind a slug
    pub fn has_slug(&self) -> bool {
        matches!(
            self,
            EntityKind::Tenant
                | EntityKind::Site
                | EntityKind::Manufacturer
                | EntityKind::DeviceRole
                | EntityKind::Platform
                | EntityKind::DeviceType
        )
    }

    /// By-name references this kind makes
    pub fn references(&self) -> &'static [ReferenceSpec] {
        match self {
            EntityKind::Tenant
            | EntityKind::Site
            | EntityKind::Manufacturer
            | EntityKind::DeviceRole
            | EntityKind::Platform => &[],
            EntityKind::DeviceType => DEVICE_TYPE_REFS,
            EntityKind::Device => DEVICE_REFS,
            EntityKind::Interface => INTERFACE_REFS,
            EntityKind::IpAddress => IP_ADDRESS_REFS,
            EntityKind::Vlan => VLAN_REFS,
            EntityKind::Prefix => PREFIX_REFS,
        }
    }

    /// Nested child arrays this kind may embed
    fn children(&self) -> Option<(&'static str, EntityKind)> {
        match self {
            EntityKind::Device => Some(("interfaces", EntityKind::Interface)),
            EntityKind::Interface => Some(("ip_addresses", EntityKind::IpAddress)),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.input_key())
    }
}

/// A resolved-by-name link from one record to another
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Payload field that receives the remote ID
    pub field: String,
    /// Kind of the referenced record
    pub target: EntityKind,
    /// Natural key of the referenced record
    pub key: String,
}

/// One flattened input record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: EntityKind,
    /// Natural key, unique per kind within a batch
    ///
    /// Interfaces are keyed `device/interface` since names repeat across devices.
    pub key: String,
    /// Payload fields, references excluded
    pub fields: Map<String, Value>,
    pub references: Vec<Reference>,
}

impl Record {
    /// Value of the kind's key field (the interface name, not `device/name`)
    pub fn key_value(&self) -> &str {
        self.fields
            .get(self.kind.key_field())
            .and_then(Value::as_str)
            .unwrap_or(&self.key)
    }
}

/// Flatten raw bulk input into records, parents before children
///
/// # Errors
///
/// [`Error::Validation`] for unknown keys, non-object records, missing key
/// fields, missing required references, and malformed reference values.
pub fn normalize(raw: &Value) -> Result<Vec<Record>> {
    let Value::Object(sections) = raw else {
        return Err(Error::validation("bulk input must be a JSON object"));
    };

    let mut records = Vec::new();
    for (section, items) in sections {
        let kind = EntityKind::from_input_key(section).ok_or_else(|| {
            Error::validation(format!("unknown section '{}' in bulk input", section))
        })?;
        let items = as_array(items, section)?;
        for (index, item) in items.iter().enumerate() {
            let location = format!("{}[{}]", section, index);
            flatten(kind, item, None, &location, &mut records)?;
        }
    }
    Ok(records)
}

fn as_array<'v>(value: &'v Value, location: &str) -> Result<&'v Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| Error::validation(format!("'{}' must be an array of records", location)))
}

/// Parent link injected into nested children
struct Parent {
    field: &'static str,
    key: String,
}

fn flatten(
    kind: EntityKind,
    item: &Value,
    parent: Option<Parent>,
    location: &str,
    out: &mut Vec<Record>,
) -> Result<()> {
    let Value::Object(map) = item else {
        return Err(Error::validation(format!("{} must be a JSON object", location)));
    };
    let mut fields = map.clone();

    let key_field = kind.key_field();
    let key_value = match fields.get(key_field) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => {
            return Err(Error::validation(format!(
                "{} is missing '{}'",
                location, key_field
            )));
        }
    };
    fields.insert(key_field.to_string(), json!(key_value));

    if let Some(parent) = &parent {
        if fields.contains_key(parent.field) {
            return Err(Error::validation(format!(
                "{} is nested and must not set '{}'",
                location, parent.field
            )));
        }
        fields.insert(parent.field.to_string(), json!(parent.key));
    }

    // Addresses name their interface as `device` + `interface` when not nested.
    let device_hint = if kind == EntityKind::IpAddress {
        match fields.remove("device") {
            None => None,
            Some(Value::String(s)) if s.contains('/') => {
                return Err(Error::validation(format!(
                    "{}: device name '{}' must not contain '/'",
                    location, s
                )));
            }
            Some(Value::String(s)) => Some(s),
            Some(_) => {
                return Err(Error::validation(format!(
                    "{}.device must be a device name",
                    location
                )));
            }
        }
    } else {
        None
    };

    let mut references = Vec::new();
    for spec in kind.references() {
        match fields.remove(spec.field) {
            None | Some(Value::Null) => {
                if spec.required {
                    return Err(Error::validation(format!(
                        "{} is missing required reference '{}'",
                        location, spec.field
                    )));
                }
            }
            Some(Value::Number(n)) if n.is_u64() => {
                fields.insert(spec.field.to_string(), Value::Number(n));
            }
            Some(Value::String(name)) => {
                let key = if spec.target == EntityKind::Interface && parent.is_none() {
                    let device = device_hint.as_deref().ok_or_else(|| {
                        Error::validation(format!(
                            "{} names interface '{}' without its 'device'",
                            location, name
                        ))
                    })?;
                    format!("{}/{}", device, name)
                } else {
                    name
                };
                references.push(Reference {
                    field: spec.field.to_string(),
                    target: spec.target,
                    key,
                });
            }
            Some(other) => {
                return Err(Error::validation(format!(
                    "{}.{} must be a name or a numeric id, got {}",
                    location, spec.field, other
                )));
            }
        }
    }

    let key = if kind == EntityKind::Interface {
        let device = references
            .iter()
            .find(|r| r.field == "device")
            .map(|r| r.key.clone())
            .or_else(|| fields.get("device").map(|id| id.to_string()))
            .unwrap_or_default();
        if device.contains('/') {
            return Err(Error::validation(format!(
                "{}: device name '{}' must not contain '/'",
                location, device
            )));
        }
        format!("{}/{}", device, key_value)
    } else {
        key_value.clone()
    };

    let nested = match kind.children() {
        Some((child_field, child_kind)) => fields
            .remove(child_field)
            .map(|children| (child_field, child_kind, children)),
        None => None,
    };

    out.push(Record {
        kind,
        key: key.clone(),
        fields,
        references,
    });

    if let Some((child_field, child_kind, children)) = nested {
        let parent_field = match child_kind {
            EntityKind::Interface => "device",
            _ => "interface",
        };
        let children_location = format!("{}.{}", location, child_field);
        for (index, child) in as_array(&children, &children_location)?.iter().enumerate() {
            flatten(
                child_kind,
                child,
                Some(Parent {
                    field: parent_field,
                    key: key.clone(),
                }),
                &format!("{}[{}]", children_location, index),
                out,
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_devices_flatten_with_parent_links() {
        let raw = json!({
            "devices": [{
                "name": "r1", "site": "AMS1", "role": "Router", "device_type": "MX204",
                "interfaces": [{
                    "name": "xe-0/0/0",
                    "ip_addresses": [{"address": "10.0.0.1/31"}]
                }]
            }]
        });

        let records = normalize(&raw).unwrap();
        assert_eq!(records.len(), 3);

        let interface = &records[1];
        assert_eq!(interface.kind, EntityKind::Interface);
        assert_eq!(interface.key, "r1/xe-0/0/0");
        assert_eq!(interface.key_value(), "xe-0/0/0");
        assert_eq!(interface.references[0].key, "r1");

        let address = &records[2];
        assert_eq!(address.references[0].target, EntityKind::Interface);
        assert_eq!(address.references[0].key, "r1/xe-0/0/0");
    }

    #[test]
    fn test_flat_address_needs_device_for_interface() {
        let ok = json!({"ip_addresses": [{"address": "10.0.0.1/31", "device": "r1", "interface": "eth0"}]});
        let records = normalize(&ok).unwrap();
        assert_eq!(records[0].references[0].key, "r1/eth0");
        assert!(!records[0].fields.contains_key("device"));

        let bad = json!({"ip_addresses": [{"address": "10.0.0.1/31", "interface": "eth0"}]});
        assert!(matches!(normalize(&bad).unwrap_err(), Error::Validation(_)));
    }

    #[test]
    fn test_flat_address_rejects_slash_in_device() {
        let raw = json!({"ip_addresses": [{"address": "10.0.0.1/31", "device": "a/b", "interface": "eth0"}]});
        let err = normalize(&raw).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("a/b")));
    }

    #[test]
    fn test_slug_left_to_the_reconcile_step() {
        let records = normalize(&json!({"sites": [{"name": "Amsterdam 1"}]})).unwrap();
        assert!(!records[0].fields.contains_key("slug"));
        assert_eq!(records[0].kind.pass(), 1);

        let explicit = normalize(&json!({"sites": [{"name": "Amsterdam 1", "slug": "ams-one"}]})).unwrap();
        assert_eq!(explicit[0].fields["slug"], "ams-one");
    }

    #[test]
    fn test_numeric_reference_is_not_a_dependency() {
        let raw = json!({"vlans": [{"name": "mgmt", "vid": 10, "site": 4}]});
        let records = normalize(&raw).unwrap();
        assert!(records[0].references.is_empty());
        assert_eq!(records[0].fields["site"], 4);
    }

    #[test]
    fn test_malformed_input_rejected() {
        assert!(normalize(&json!([1, 2])).is_err());
        assert!(normalize(&json!({"routers": []})).is_err());
        assert!(normalize(&json!({"sites": [42]})).is_err());
        assert!(normalize(&json!({"sites": [{"status": "active"}]})).is_err());
        assert!(normalize(&json!({"devices": [{"name": "r1"}]})).is_err());
        assert!(normalize(&json!({"devices": [{"name": "r1", "site": true, "role": "x", "device_type": "y"}]})).is_err());
    }
}
