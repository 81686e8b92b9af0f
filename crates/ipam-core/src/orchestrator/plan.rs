//! Planning: records to an ordered, flat batch
//!
//! Kinds are ordered with Kahn's algorithm over the static reference
//! relation, so every kind comes after the kinds it references. Records keep
//! input order within a kind. The result is a flat list, never a graph.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::normalize::{EntityKind, Record, Reference, normalize};
use crate::error::{Error, Result};
use crate::reconciler::Action;

/// Outcome of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    /// Not executed yet
    Planned,
    /// Reconciled; `action` and `result_ref` are set
    Committed,
    /// Reconciliation failed
    Failed {
        /// Machine-readable error kind (`not_found`, `conflict`, ...)
        kind: String,
        message: String,
    },
    /// Not attempted
    Skipped { reason: String },
}

/// One planned write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub batch_id: String,
    /// Position in execution order
    pub sequence: usize,
    /// 1 or 2
    pub pass: u8,
    pub target: EntityKind,
    /// Natural key of the record
    pub key: String,
    /// Fields to write, references excluded
    pub payload: Map<String, Value>,
    /// References resolved to remote IDs at execution time
    pub references: Vec<Reference>,
    /// What the reconciler did, once committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(flatten)]
    pub status: OperationStatus,
    /// Remote ID, once committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<u64>,
}

impl BatchOperation {
    /// ObjectCache key of the record this operation writes
    pub fn cache_key(&self) -> String {
        cache_key(self.target, &self.key)
    }

    /// Value of the kind's key field
    pub fn key_value(&self) -> &str {
        self.payload
            .get(self.target.key_field())
            .and_then(Value::as_str)
            .unwrap_or(&self.key)
    }
}

/// `"kind:key"` identity used by the run-scoped object cache
pub fn cache_key(kind: EntityKind, key: &str) -> String {
    format!("{}:{}", kind, key)
}

/// A planned batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub operations: Vec<BatchOperation>,
}

impl Batch {
    /// Number of operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Plan raw input under a fresh batch ID
pub fn plan(raw: &Value) -> Result<Batch> {
    plan_as(raw, uuid::Uuid::new_v4().to_string())
}

/// Plan raw input under a given batch ID
///
/// # Errors
///
/// - [`Error::Validation`] for malformed input
/// - [`Error::Conflict`] for two records with the same key and different content
pub fn plan_as(raw: &Value, batch_id: String) -> Result<Batch> {
    let records = dedupe(normalize(raw)?)?;

    let mut by_kind: BTreeMap<EntityKind, Vec<Record>> = BTreeMap::new();
    for record in records {
        by_kind.entry(record.kind).or_default().push(record);
    }

    let mut operations = Vec::new();
    for kind in kind_order()? {
        for record in by_kind.remove(&kind).unwrap_or_default() {
            operations.push(BatchOperation {
                batch_id: batch_id.clone(),
                sequence: operations.len(),
                pass: kind.pass(),
                target: kind,
                key: record.key,
                payload: record.fields,
                references: record.references,
                action: None,
                status: OperationStatus::Planned,
                result_ref: None,
            });
        }
    }

    Ok(Batch {
        batch_id,
        operations,
    })
}

/// Merge exact duplicates; differing duplicates are a conflict
fn dedupe(records: Vec<Record>) -> Result<Vec<Record>> {
    let mut seen: HashMap<(EntityKind, String), usize> = HashMap::new();
    let mut out: Vec<Record> = Vec::with_capacity(records.len());

    for record in records {
        let identity = (record.kind, record.key.clone());
        match seen.get(&identity) {
            Some(&index) if out[index] == record => continue,
            Some(_) => {
                return Err(Error::conflict(format!(
                    "{} '{}' appears twice with different fields",
                    record.kind, record.key
                )));
            }
            None => {
                seen.insert(identity, out.len());
                out.push(record);
            }
        }
    }
    Ok(out)
}

/// Kinds in dependency order, pass 1 first
pub fn kind_order() -> Result<Vec<EntityKind>> {
    let mut pending: BTreeMap<EntityKind, BTreeSet<EntityKind>> = EntityKind::ALL
        .into_iter()
        .map(|kind| {
            let deps = kind.references().iter().map(|r| r.target).collect();
            (kind, deps)
        })
        .collect();

    let mut order = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        // Pass 1 kinds drain first; ties keep declaration order.
        let ready: Vec<EntityKind> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(kind, _)| *kind)
            .collect();
        if ready.is_empty() {
            return Err(Error::Other(format!(
                "entity schema has a reference cycle among {:?}",
                pending.keys().collect::<Vec<_>>()
            )));
        }
        for kind in ready {
            pending.remove(&kind);
            for deps in pending.values_mut() {
                deps.remove(&kind);
            }
            order.push(kind);
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_order_respects_references() {
        let order = kind_order().unwrap();
        let position = |k: EntityKind| order.iter().position(|x| *x == k).unwrap();

        for kind in EntityKind::ALL {
            for reference in kind.references() {
                assert!(position(reference.target) < position(kind), "{} before {}", reference.target, kind);
            }
        }
        assert!(order.iter().take(5).all(|k| k.pass() == 1));
    }

    #[test]
    fn test_plan_orders_referenced_records_first() {
        let raw = json!({
            "devices": [{"name": "r1", "site": "AMS1", "role": "Router", "device_type": "MX204"}],
            "device_types": [{"model": "MX204", "manufacturer": "Juniper"}],
            "manufacturers": [{"name": "Juniper"}],
            "device_roles": [{"name": "Router"}],
            "sites": [{"name": "AMS1"}]
        });
        let batch = plan(&raw).unwrap();
        let targets: Vec<EntityKind> = batch.operations.iter().map(|op| op.target).collect();

        let at = |k: EntityKind| targets.iter().position(|x| *x == k).unwrap();
        assert!(at(EntityKind::Manufacturer) < at(EntityKind::DeviceType));
        assert!(at(EntityKind::DeviceType) < at(EntityKind::Device));
        assert!(at(EntityKind::Site) < at(EntityKind::Device));
        assert!(batch.operations.iter().all(|op| op.batch_id == batch.batch_id));
        assert!(batch.operations.iter().enumerate().all(|(i, op)| op.sequence == i));
    }

    #[test]
    fn test_exact_duplicates_merge_and_differing_conflict() {
        let same = json!({"sites": [{"name": "AMS1"}, {"name": "AMS1"}]});
        assert_eq!(plan(&same).unwrap().len(), 1);

        let differing = json!({"sites": [{"name": "AMS1", "status": "active"}, {"name": "AMS1", "status": "planned"}]});
        assert!(matches!(plan(&differing).unwrap_err(), Error::Conflict(_)));
    }

    #[test]
    fn test_operation_serializes_status_inline() {
        let batch = plan_as(&json!({"sites": [{"name": "AMS1"}]}), "b-1".to_string()).unwrap();
        let value = serde_json::to_value(&batch.operations[0]).unwrap();
        assert_eq!(value["status"], "planned");
        assert_eq!(value["target"], "site");
        assert_eq!(value["pass"], 1);
    }
}
