//! Integration tests for destroying clusters
//!
//! Teardown runs applications first, then the node, then the record. Only the
//! node deletion is allowed to stop it, and when it does the record stays so
//! the operator can simply run destroy again.

use std::collections::BTreeMap;

use stratus::{ClusterRecord, Credential};

use super::fakes::{FakeBackend, FakeConnector, HarnessBuilder};

fn record(dir: &std::path::Path) -> ClusterRecord {
    ClusterRecord {
        id: "abc".to_string(),
        address: "10.0.0.5".to_string(),
        api_endpoint: "https://10.0.0.5/toscasubmitter".to_string(),
        api_version: "v2.0".to_string(),
        credential: Credential::basic("admin", "s3cret"),
        cert_path: dir.join("abc-ssl.pem"),
        provider_params: BTreeMap::from([("provider".to_string(), "openstack".to_string())]),
    }
}

// =============================================================================
// Story: a reachable cluster is torn down completely
// =============================================================================

#[tokio::test]
async fn destroy_removes_apps_then_node_then_record() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let harness = builder
        .connector(FakeConnector::new(&journal, &["stress-ng", "nginx"]))
        .build(FakeBackend::new(&journal, "abc", "10.0.0.5"));

    let certs = tempfile::tempdir().unwrap();
    let record = record(certs.path());
    std::fs::write(&record.cert_path, "-----BEGIN CERTIFICATE-----").unwrap();
    harness.store.put(&record).unwrap();

    harness.orchestrator.destroy("abc").await.unwrap();

    assert_eq!(
        harness.journal.events(),
        vec!["connect:abc", "destroy_all", "delete:abc"]
    );
    assert!(harness.store.list().unwrap().is_empty());
    assert!(!record.cert_path.exists());
}

#[tokio::test]
async fn unreachable_api_does_not_block_teardown() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let harness = builder
        .connector(FakeConnector::new(&journal, &["nginx"]).unreachable())
        .build(FakeBackend::new(&journal, "abc", "10.0.0.5"));

    let certs = tempfile::tempdir().unwrap();
    harness.store.put(&record(certs.path())).unwrap();

    harness.orchestrator.destroy("abc").await.unwrap();

    assert_eq!(harness.journal.count("delete:abc"), 1);
    assert!(harness.store.get("abc").is_err());
}

// =============================================================================
// Story: a failed node deletion can be retried
// =============================================================================

#[tokio::test]
async fn failing_delete_keeps_record_for_retry() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let harness = builder.build(
        FakeBackend::new(&journal, "abc", "10.0.0.5").failing_delete("nova unavailable"),
    );

    let certs = tempfile::tempdir().unwrap();
    let stored = record(certs.path());
    harness.store.put(&stored).unwrap();

    for _ in 0..2 {
        let err = harness.orchestrator.destroy("abc").await.unwrap_err();
        assert_eq!(err.kind(), "DeprovisioningFailed");
        assert!(err.to_string().contains("nova unavailable"));
        assert_eq!(harness.store.get("abc").unwrap(), stored);
    }
    assert_eq!(harness.journal.count("delete:abc"), 2);
}

#[tokio::test]
async fn unknown_cluster_is_not_found() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let harness = builder.build(FakeBackend::new(&journal, "abc", "10.0.0.5"));

    let err = harness.orchestrator.destroy("missing").await.unwrap_err();

    assert_eq!(err.kind(), "RecordNotFound");
    assert!(harness.journal.events().is_empty());
}

// =============================================================================
// Story: an operator reattaches to a recorded cluster
// =============================================================================

#[tokio::test]
async fn attach_lists_running_applications() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let harness = builder
        .connector(FakeConnector::new(&journal, &["stress-ng"]))
        .build(FakeBackend::new(&journal, "abc", "10.0.0.5"));

    let certs = tempfile::tempdir().unwrap();
    harness.store.put(&record(certs.path())).unwrap();

    let api = harness.orchestrator.attach("abc").unwrap();
    assert_eq!(api.applications().await.unwrap(), vec!["stress-ng"]);
}
