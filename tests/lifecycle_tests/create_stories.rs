//! Integration tests for creating clusters
//!
//! These tests tell the story of a node going from nothing to a recorded
//! deployment, and of the pipeline cleaning up after itself when any stage
//! after provisioning fails.

use std::path::PathBuf;
use std::time::Duration;

use stratus::provider::{ProvisioningBackend, ProvisioningError, StaticBackend, PROVIDER_PARAM};
use stratus::{CreateOptions, Credential, Error, RetryPolicy, Stage};

use super::fakes::{settings, FakeBackend, FakeRunner, FlakyProbe, HarnessBuilder};

// =============================================================================
// Story: a healthy node becomes a recorded cluster
// =============================================================================

#[tokio::test]
async fn healthy_node_is_deployed_and_recorded() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let harness = builder
        .probe(FlakyProbe::new(&journal, 2))
        .build(FakeBackend::new(&journal, "abc", "10.0.0.5"));

    let options = CreateOptions {
        password: Some("s3cret".to_string()),
        ..Default::default()
    };
    let report = harness.orchestrator.create(&options).await.unwrap();

    // The port came up on the second of five attempts
    assert_eq!(*harness.probe.successes.lock().unwrap(), vec![(22, 2)]);

    let record = &report.record;
    assert_eq!(record.id, "abc");
    assert_eq!(record.address, "10.0.0.5");
    assert_eq!(record.api_endpoint, "https://10.0.0.5/toscasubmitter");
    assert_eq!(record.api_version, "v2.0");
    assert_eq!(record.cert_path, PathBuf::from("/certs/abc.pem"));
    assert_eq!(record.credential, Credential::basic("admin", "s3cret"));
    assert_eq!(
        record.provider_params.get(PROVIDER_PARAM).map(String::as_str),
        Some("openstack")
    );
    assert_eq!(report.final_stage(), Some(Stage::Ready));

    assert_eq!(harness.store.get("abc").unwrap(), *record);
    assert_eq!(
        harness.journal.events(),
        vec![
            "create",
            "port:22",
            "trust",
            "shell:ubuntu",
            "deploy:10.0.0.5",
            "fetch",
        ]
    );
    assert_eq!(harness.journal.count("delete:abc"), 0);
}

#[tokio::test]
async fn deployment_receives_credential_and_extra_vars() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let harness = builder.build(FakeBackend::new(&journal, "abc", "10.0.0.5"));

    let mut options = CreateOptions::default();
    options
        .extra_vars
        .insert("enable_terraform".to_string(), true.into());
    let report = harness.orchestrator.create(&options).await.unwrap();

    let runs = harness.runner.runs.lock().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].credential, report.record.credential);
    assert_eq!(
        runs[0].extra_vars.get("enable_terraform"),
        Some(&serde_yaml::Value::Bool(true))
    );
}

#[tokio::test]
async fn api_port_is_awaited_after_deployment() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let mut settings = settings(5);
    settings.api_port = Some(443);
    let harness = builder
        .settings(settings)
        .build(FakeBackend::new(&journal, "abc", "10.0.0.5"));

    harness
        .orchestrator
        .create(&CreateOptions::default())
        .await
        .unwrap();

    let events = harness.journal.events();
    let deploy = events.iter().position(|e| e == "deploy:10.0.0.5").unwrap();
    let api_wait = events.iter().position(|e| e == "port:443").unwrap();
    assert!(deploy < api_wait);
}

#[tokio::test]
async fn existing_host_runs_the_same_pipeline() {
    let builder = HarnessBuilder::new();
    let harness = builder.build(StaticBackend::new("192.168.1.20", Some("edge-1".to_string())));

    let report = harness
        .orchestrator
        .create(&CreateOptions::default())
        .await
        .unwrap();

    assert_eq!(report.record.id, "edge-1");
    assert_eq!(report.record.address, "192.168.1.20");
    assert_eq!(
        report.record.provider_params,
        StaticBackend::new("192.168.1.20", Some("edge-1".to_string())).provider_params()
    );
}

// =============================================================================
// Story: a failed stage leaves no node and no record behind
// =============================================================================

#[tokio::test]
async fn deployment_failure_deletes_node_once_and_records_nothing() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let harness = builder
        .runner(FakeRunner::new(&journal).failing("TASK [docker] fatal: unreachable"))
        .build(FakeBackend::new(&journal, "abc", "10.0.0.5"));

    let err = harness
        .orchestrator
        .create(&CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "DeploymentFailed");
    assert!(err.to_string().contains("fatal: unreachable"));
    assert_eq!(harness.journal.count("delete:abc"), 1);
    assert!(harness.store.list().unwrap().is_empty());
    assert_eq!(harness.journal.count("fetch"), 0);
}

#[tokio::test(start_paused = true)]
async fn port_that_never_opens_exhausts_its_budget() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let mut settings = settings(3);
    settings.port_policy = RetryPolicy::new(Duration::from_millis(10), 3);
    let harness = builder
        .probe(FlakyProbe::new(&journal, u32::MAX))
        .settings(settings)
        .build(FakeBackend::new(&journal, "abc", "10.0.0.5"));

    let err = harness
        .orchestrator
        .create(&CreateOptions::default())
        .await
        .unwrap_err();

    match err {
        Error::PortTimeout {
            address,
            port,
            attempts,
            elapsed,
        } => {
            assert_eq!(address, "10.0.0.5");
            assert_eq!(port, 22);
            assert_eq!(attempts, 3);
            assert_eq!(elapsed, Duration::from_millis(30));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(harness.journal.count("delete:abc"), 1);
    assert_eq!(harness.journal.count("trust"), 0);
}

#[tokio::test]
async fn failed_cleanup_does_not_mask_the_original_error() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let harness = builder
        .runner(FakeRunner::new(&journal).failing("playbook error"))
        .build(FakeBackend::new(&journal, "abc", "10.0.0.5").failing_delete("nova unavailable"));

    let err = harness
        .orchestrator
        .create(&CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "DeploymentFailed");
    assert_eq!(harness.journal.count("delete:abc"), 1);
}

#[tokio::test]
async fn partially_provisioned_node_is_deleted() {
    let builder = HarnessBuilder::new();
    let journal = builder.journal().clone();
    let harness = builder.build(
        FakeBackend::new(&journal, "abc", "10.0.0.5")
            .failing_create(ProvisioningError::partial("srv-7", "no floating IP available")),
    );

    let err = harness
        .orchestrator
        .create(&CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "ProvisioningFailed");
    assert_eq!(harness.journal.events(), vec!["create", "delete:srv-7"]);
    assert!(harness.store.list().unwrap().is_empty());
}
