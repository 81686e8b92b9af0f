//! Architectural Contract Test: Idempotent Reconciliation
//!
//! This test verifies that "ensure" semantics converge and stay quiet.
//!
//! Constraints verified:
//! - A missing object is created, then reported unchanged with no write
//! - Changing a managed field updates only that field remotely
//! - Manual edits to unmanaged fields survive reconciliation
//! - Unmanaged keys of the metadata bag are never sent on update
//! - Re-running a whole bulk input issues zero writes
//!
//! If this test fails, repeated automation runs will churn the remote.

mod common;

use common::*;
use ipam_core::{Action, EnsureRequest, Reconciler};
use serde_json::json;

#[tokio::test]
async fn ensure_site_created_then_unchanged_then_updated() {
    let (client, backend) = recording_client(false);
    let reconciler = Reconciler::new(&client);

    let request = EnsureRequest::new(sites(), "AMS1", json!({"status": "active"}))
        .expect("desired is an object")
        .managed(["status"]);

    let first = reconciler.ensure(&request, true).await.unwrap();
    assert_eq!(first.action, Action::Created);
    assert_eq!(first.object["name"], "AMS1");

    let writes = backend.write_count();
    let second = reconciler.ensure(&request, true).await.unwrap();
    assert_eq!(second.action, Action::Unchanged);
    assert_eq!(second.id, first.id);
    assert_eq!(
        backend.write_count(),
        writes,
        "An unchanged ensure must not write"
    );

    let before = backend.store().snapshot(&sites()).await.remove(0);

    let planned = EnsureRequest::new(sites(), "AMS1", json!({"status": "planned"}))
        .unwrap()
        .managed(["status"]);
    let third = reconciler.ensure(&planned, true).await.unwrap();
    assert_eq!(third.action, Action::Updated);
    assert_eq!(third.id, first.id);

    let after = backend.store().snapshot(&sites()).await.remove(0);
    assert_eq!(after["status"], "planned");
    assert_eq!(after["name"], before["name"]);
    assert_eq!(after["slug"], before["slug"]);

    // Only status and the sync metadata bag differ.
    let changed: Vec<&String> = after
        .as_object()
        .unwrap()
        .iter()
        .filter(|(k, v)| before.get(k.as_str()) != Some(*v))
        .map(|(k, _)| k)
        .collect();
    assert_eq!(changed.len(), 2, "unexpected changes: {:?}", changed);
}

#[tokio::test]
async fn manual_edit_of_unmanaged_field_survives() {
    let (client, backend) = recording_client(false);
    let reconciler = Reconciler::new(&client);

    let request = EnsureRequest::new(
        sites(),
        "FRA1",
        json!({"status": "active", "description": "Frankfurt"}),
    )
    .unwrap()
    .managed(["status"]);
    let created = reconciler.ensure(&request, true).await.unwrap();

    backend
        .store()
        .edit(&sites(), created.id, &json!({"description": "edited by hand"}))
        .await
        .unwrap();
    client.cache().clear();

    // Unmanaged field differs from desired, but the fingerprint still matches.
    let again = reconciler.ensure(&request, true).await.unwrap();
    assert_eq!(again.action, Action::Unchanged);

    let changed = EnsureRequest::new(
        sites(),
        "FRA1",
        json!({"status": "retired", "description": "Frankfurt"}),
    )
    .unwrap()
    .managed(["status"]);
    reconciler.ensure(&changed, true).await.unwrap();

    let stored = backend.store().snapshot(&sites()).await.remove(0);
    assert_eq!(stored["status"], "retired");
    assert_eq!(stored["description"], "edited by hand");
}

#[tokio::test]
async fn update_leaves_unmanaged_bag_keys_alone() {
    let (client, backend) = recording_client(false);
    let reconciler = Reconciler::new(&client);

    let desired = |status: &str| {
        json!({"status": status, "custom_fields": {"owner": "automation", "ticket": "CHG-1"}})
    };
    let request = EnsureRequest::new(sites(), "AMS1", desired("active"))
        .unwrap()
        .managed(["status", "custom_fields.ticket"]);
    let created = reconciler.ensure(&request, true).await.unwrap();
    assert_eq!(created.object["custom_fields"]["owner"], "automation");

    backend
        .store()
        .edit(
            &sites(),
            created.id,
            &json!({"custom_fields": {"owner": "noc-human", "ticket": "CHG-9"}}),
        )
        .await
        .unwrap();
    client.cache().clear();

    let changed = EnsureRequest::new(sites(), "AMS1", desired("planned"))
        .unwrap()
        .managed(["status", "custom_fields.ticket"]);
    let outcome = reconciler.ensure(&changed, true).await.unwrap();
    assert_eq!(outcome.action, Action::Updated);

    let stored = backend.store().snapshot(&sites()).await.remove(0);
    assert_eq!(stored["status"], "planned");
    assert_eq!(stored["custom_fields"]["owner"], "noc-human");
    assert_eq!(stored["custom_fields"]["ticket"], "CHG-1");
    assert!(stored["custom_fields"]["sync_fields_hash"].is_string());
}

#[tokio::test]
async fn object_without_fingerprint_gets_a_baseline_once() {
    let (client, backend) = recording_client(false);
    backend
        .store()
        .seed(&sites(), json!({"name": "LON1", "slug": "lon1", "status": "active"}))
        .await
        .unwrap();

    let reconciler = Reconciler::new(&client);
    let request = EnsureRequest::new(sites(), "LON1", json!({"status": "active"})).unwrap();

    let first = reconciler.ensure(&request, true).await.unwrap();
    assert_eq!(first.action, Action::Updated, "first contact records a baseline");

    let second = reconciler.ensure(&request, true).await.unwrap();
    assert_eq!(second.action, Action::Unchanged);
}

#[tokio::test]
async fn rerunning_bulk_input_issues_no_writes() {
    let (orchestrator, backend) = recording_orchestrator(false);

    let first = orchestrator
        .execute(orchestrator.plan(&small_topology()).unwrap(), true)
        .await
        .unwrap();
    assert_eq!(first.summary.created, 7);

    let writes = backend.write_count();
    let second = orchestrator
        .execute(orchestrator.plan(&small_topology()).unwrap(), true)
        .await
        .unwrap();

    assert_eq!(second.summary.unchanged, 7);
    assert_eq!(second.summary.created + second.summary.updated, 0);
    assert_eq!(
        backend.write_count(),
        writes,
        "Second run of identical input must not write"
    );
}
