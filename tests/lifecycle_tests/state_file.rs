//! Integration tests for the cluster state file
//!
//! Records are written by one process and read by the next, so these tests
//! always reopen the file through a fresh store.

use std::collections::BTreeMap;
use std::path::PathBuf;

use stratus::{ClusterRecord, ClusterStateStore, Credential};

fn record(id: &str, address: &str) -> ClusterRecord {
    ClusterRecord {
        id: id.to_string(),
        address: address.to_string(),
        api_endpoint: format!("https://{}/toscasubmitter", address),
        api_version: "v2.0".to_string(),
        credential: Credential::basic("admin", "s3cret"),
        cert_path: PathBuf::from(format!("/certs/{}.pem", id)),
        provider_params: BTreeMap::from([
            ("provider".to_string(), "openstack".to_string()),
            ("region".to_string(), "RegionOne".to_string()),
        ]),
    }
}

#[test]
fn records_survive_a_new_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clusters.yaml");

    let writer = ClusterStateStore::new(&path);
    writer.put(&record("abc", "10.0.0.5")).unwrap();
    writer.put(&record("def", "10.0.0.6")).unwrap();

    let reader = ClusterStateStore::new(&path);
    assert_eq!(reader.get("abc").unwrap(), record("abc", "10.0.0.5"));
    let ids: Vec<String> = reader.list().unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["abc", "def"]);
}

#[test]
fn token_credentials_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = ClusterStateStore::new(dir.path().join("clusters.yaml"));

    let mut stored = record("abc", "10.0.0.5");
    stored.credential = Credential::token("t0k3n");
    store.put(&stored).unwrap();

    assert_eq!(store.get("abc").unwrap().credential, Credential::token("t0k3n"));
}

#[test]
fn removal_is_visible_to_other_stores() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clusters.yaml");

    ClusterStateStore::new(&path).put(&record("abc", "10.0.0.5")).unwrap();
    ClusterStateStore::new(&path).remove("abc").unwrap();

    assert_eq!(
        ClusterStateStore::new(&path).remove("abc").unwrap_err().kind(),
        "RecordNotFound"
    );
    assert_eq!(
        ClusterStateStore::new(&path).get("abc").unwrap_err().kind(),
        "RecordNotFound"
    );
}

#[test]
fn corrupted_file_is_a_persistence_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clusters.yaml");
    std::fs::write(&path, "clusters: [not, a, map").unwrap();

    let err = ClusterStateStore::new(&path).list().unwrap_err();
    assert_eq!(err.kind(), "PersistenceFailed");
}
