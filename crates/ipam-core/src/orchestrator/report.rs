//! Pre-flight diff of a planned batch
//!
//! Classifies every operation as create, update or unchanged without
//! writing. A reference to a record this batch would create has no remote
//! ID yet; its referrer is reported as a create (if absent) or an update of
//! the reference field (if present).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::normalize::EntityKind;
use super::plan::{Batch, cache_key};
use super::{insert_reference, lookup_for, with_generated_slug};
use crate::error::{Error, Result};
use crate::proxy::ProxyClient;
use crate::reconciler::{Action, EnsurePreview, EnsureRequest, Reconciler};
use crate::resolver::{Lookup, Resolver};

/// One line of a dry-run report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub sequence: usize,
    pub pass: u8,
    pub target: EntityKind,
    pub key: String,
    /// Predicted action; `None` when the operation would fail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
    /// Why the operation would fail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pre-flight review of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub batch_id: String,
    pub entries: Vec<ReportEntry>,
    pub creates: usize,
    pub updates: usize,
    pub unchanged: usize,
    pub errors: usize,
}

/// What the report knows about a record's remote ID
#[derive(Debug, Clone, Copy)]
enum Known {
    Exists(u64),
    /// Would be created by this batch
    Pending,
    /// Would fail
    Broken,
}

pub(crate) async fn build(client: &ProxyClient, batch: &Batch) -> Result<DryRunReport> {
    let mut known: HashMap<String, Known> = HashMap::new();
    let mut entries = Vec::with_capacity(batch.operations.len());

    for op in &batch.operations {
        let mut entry = ReportEntry {
            sequence: op.sequence,
            pass: op.pass,
            target: op.target,
            key: op.key.clone(),
            action: None,
            existing_id: None,
            changed_fields: Vec::new(),
            error: None,
        };

        let mut desired = op.payload.clone();
        let mut pending_fields = Vec::new();
        let mut scope_device = desired.get("device").and_then(Value::as_u64).map(Known::Exists);
        let mut failure = None;

        for reference in &op.references {
            let state = match known.get(&cache_key(reference.target, &reference.key)) {
                Some(state) => *state,
                None => remote_state(client, reference.target, &reference.key, &known).await,
            };
            match state {
                Known::Exists(id) => insert_reference(&mut desired, op.target, &reference.field, id),
                Known::Pending => pending_fields.push(reference.field.clone()),
                Known::Broken => {
                    failure = Some(format!(
                        "referenced {} '{}' does not resolve",
                        reference.target, reference.key
                    ));
                    break;
                }
            }
            if op.target == EntityKind::Interface && reference.field == "device" {
                scope_device = Some(state);
            }
        }

        let outcome = match failure {
            Some(message) => Err(Error::not_found(message)),
            None => {
                preview(client, op.target, op.key_value(), desired, scope_device, &pending_fields).await
            }
        };

        match outcome {
            Ok(preview) => {
                known.insert(
                    op.cache_key(),
                    preview.existing_id.map(Known::Exists).unwrap_or(Known::Pending),
                );
                entry.action = Some(preview.action);
                entry.existing_id = preview.existing_id;
                entry.changed_fields = preview.changed_fields;
            }
            Err(e) => {
                known.insert(op.cache_key(), Known::Broken);
                entry.error = Some(e.to_string());
            }
        }
        entries.push(entry);
    }

    let count = |action: Action| entries.iter().filter(|e| e.action == Some(action)).count();
    Ok(DryRunReport {
        batch_id: batch.batch_id.clone(),
        creates: count(Action::Created),
        updates: count(Action::Updated),
        unchanged: count(Action::Unchanged),
        errors: entries.iter().filter(|e| e.error.is_some()).count(),
        entries,
    })
}

async fn preview(
    client: &ProxyClient,
    kind: EntityKind,
    key_value: &str,
    mut desired: serde_json::Map<String, Value>,
    scope_device: Option<Known>,
    pending_fields: &[String],
) -> Result<EnsurePreview> {
    let managed = with_generated_slug(kind, key_value, &mut desired);
    let mut lookup = lookup_for(kind, key_value);
    match scope_device {
        Some(Known::Exists(id)) => lookup = lookup.scoped("device_id", id),
        // The parent device does not exist yet, so neither does the interface.
        Some(Known::Pending) | Some(Known::Broken) => {
            let mut changed: Vec<String> = desired.keys().cloned().collect();
            changed.extend(pending_fields.iter().cloned());
            changed.sort();
            return Ok(EnsurePreview {
                action: Action::Created,
                existing_id: None,
                changed_fields: changed,
            });
        }
        None => {}
    }

    let request = EnsureRequest::new(kind.path(), lookup, Value::Object(desired))?.managed(managed);
    let mut preview = Reconciler::new(client).preview(&request).await?;

    if !pending_fields.is_empty() {
        if preview.action == Action::Unchanged {
            preview.action = Action::Updated;
        }
        preview.changed_fields.extend(pending_fields.iter().cloned());
        preview.changed_fields.sort();
        preview.changed_fields.dedup();
    }
    Ok(preview)
}

/// Look up a reference outside the batch
async fn remote_state(
    client: &ProxyClient,
    kind: EntityKind,
    key: &str,
    known: &HashMap<String, Known>,
) -> Known {
    let lookup: Lookup = if kind == EntityKind::Interface {
        let Some((device, name)) = key.split_once('/') else {
            return Known::Broken;
        };
        let device_id = match known.get(&cache_key(EntityKind::Device, device)) {
            Some(Known::Exists(id)) => *id,
            Some(Known::Pending) => return Known::Pending,
            Some(Known::Broken) => return Known::Broken,
            None => match Resolver::new(client)
                .resolve_id(&EntityKind::Device.path(), &lookup_for(EntityKind::Device, device))
                .await
            {
                Ok(id) => id,
                Err(_) => return Known::Broken,
            },
        };
        lookup_for(kind, name).scoped("device_id", device_id)
    } else {
        lookup_for(kind, key)
    };

    match Resolver::new(client).resolve_id(&kind.path(), &lookup).await {
        Ok(id) => Known::Exists(id),
        Err(_) => Known::Broken,
    }
}
