//! Unit tests for the provisioning workflow.

use std::collections::BTreeMap;
use std::fs;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::backend::{ConnectionMode, InstanceSnapshot, PortBinding, SSH_PORT_KEY};
use crate::ssh_config::FragmentStore;
use crate::test_support::{MarketplaceCall, ScriptedFailure, ScriptedMarketplace, ScriptedProbe};

const INSTANCE_ID: u64 = 42;

struct SshDir {
    path: Utf8PathBuf,
    _tmp: TempDir,
}

#[fixture]
fn ssh_dir() -> SshDir {
    let tmp = TempDir::new().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    SshDir { path, _tmp: tmp }
}

fn offer(id: u64, score: f64) -> Offer {
    Offer {
        id,
        dph_total: 0.25,
        gpu_name: "RTX_A5000".to_owned(),
        num_gpus: 1,
        score,
    }
}

fn plan() -> ProvisionPlan {
    ProvisionPlan {
        query: OfferQuery::builder()
            .gpu_name("RTX_A5000")
            .gpu_count(1)
            .max_price(0.3)
            .build()
            .expect("valid query"),
        launch: LaunchRequest {
            image: "motilin/huggingface-pytorch-ml:latest".to_owned(),
            disk_gb: 70,
            env: BTreeMap::new(),
            exposed_ports: vec![8080],
            onstart: "#!/bin/bash\n".to_owned(),
            direct: true,
            label: "vastdev-test".to_owned(),
        },
        public_key: Some("ssh-ed25519 AAAA".to_owned()),
    }
}

fn settings(timeout_ms: u64, interval_ms: u64) -> WorkflowSettings {
    WorkflowSettings {
        alias: "vast-ai-dev".to_owned(),
        poll_timeout: Duration::from_millis(timeout_ms),
        poll_interval: Duration::from_millis(interval_ms),
    }
}

fn loading() -> InstanceSnapshot {
    InstanceSnapshot {
        id: INSTANCE_ID,
        actual_status: Some("loading".to_owned()),
        ..InstanceSnapshot::default()
    }
}

fn proxied() -> InstanceSnapshot {
    InstanceSnapshot {
        id: INSTANCE_ID,
        actual_status: Some("running".to_owned()),
        ssh_host: Some("ssh5.vast.ai".to_owned()),
        ssh_port: Some(30924),
        ..InstanceSnapshot::default()
    }
}

fn direct() -> InstanceSnapshot {
    InstanceSnapshot {
        public_ipaddr: Some("203.0.113.7".to_owned()),
        ports: BTreeMap::from([(
            SSH_PORT_KEY.to_owned(),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_owned(),
                host_port: 41022,
            }],
        )]),
        ..proxied()
    }
}

fn failed() -> InstanceSnapshot {
    InstanceSnapshot {
        status_msg: Some("Error response from daemon: manifest unknown".to_owned()),
        ..proxied()
    }
}

fn workflow(
    marketplace: &ScriptedMarketplace,
    probe: &ScriptedProbe,
    ssh_dir: &Utf8PathBuf,
    settings: WorkflowSettings,
) -> ProvisioningWorkflow<ScriptedMarketplace, ScriptedProbe, FragmentStore> {
    ProvisioningWorkflow::new(
        marketplace.clone(),
        probe.clone(),
        FragmentStore::new(ssh_dir.clone(), "root", 10),
        settings,
    )
}

#[rstest]
#[tokio::test]
async fn ready_only_after_endpoint_and_probe(ssh_dir: SshDir) {
    let marketplace = ScriptedMarketplace::new()
        .with_offers(vec![offer(11, 310.0), offer(7, 120.0)])
        .with_create_result(Ok(InstanceHandle { id: INSTANCE_ID }))
        .with_snapshot(Ok(None))
        .with_snapshot(Ok(Some(loading())))
        .with_snapshot(Ok(Some(proxied())));
    let probe = ScriptedProbe::new();
    probe.push_unreachable();
    probe.push_reachable();

    let outcome = workflow(&marketplace, &probe, &ssh_dir.path, settings(5_000, 5))
        .execute(&plan())
        .await
        .expect("workflow should succeed");

    assert_eq!(outcome.offer.id, 11);
    assert_eq!(outcome.instance, InstanceHandle { id: INSTANCE_ID });
    assert_eq!(outcome.details.mode, ConnectionMode::Proxy);
    assert_eq!(outcome.details.host, "ssh5.vast.ai");
    assert_eq!(outcome.details.port, 30924);
    assert_eq!(probe.probed().len(), 2);
    assert_eq!(
        outcome.states,
        vec![
            ProvisionState::Searching,
            ProvisionState::Creating,
            ProvisionState::Polling,
            ProvisionState::Configuring,
            ProvisionState::Ready,
        ]
    );
    let fragment = fs::read_to_string(&outcome.fragment_path).expect("fragment written");
    assert!(fragment.contains("Host vast-ai-dev\n"));
    assert!(fragment.contains("    Port 30924\n"));
    assert!(marketplace.destroyed().is_empty());
    assert!(
        marketplace
            .calls()
            .contains(&MarketplaceCall::Create { offer_id: 11 })
    );
}

#[rstest]
#[tokio::test]
async fn direct_mapping_is_probed_before_proxy(ssh_dir: SshDir) {
    let marketplace = ScriptedMarketplace::new()
        .with_offers(vec![offer(11, 310.0)])
        .with_snapshot(Ok(Some(direct())));
    let probe = ScriptedProbe::new();
    probe.push_reachable();

    let outcome = workflow(&marketplace, &probe, &ssh_dir.path, settings(5_000, 5))
        .execute(&plan())
        .await
        .expect("workflow should succeed");

    assert_eq!(outcome.details.mode, ConnectionMode::Direct);
    assert_eq!(outcome.details.host, "203.0.113.7");
    assert_eq!(outcome.details.port, 41022);
}

#[rstest]
#[tokio::test]
async fn empty_offer_set_never_creates(ssh_dir: SshDir) {
    let marketplace = ScriptedMarketplace::new();
    let probe = ScriptedProbe::new();

    let failure = workflow(&marketplace, &probe, &ssh_dir.path, settings(5_000, 5))
        .execute(&plan())
        .await
        .expect_err("no offers should fail");

    assert!(matches!(failure.error, ProvisionError::NoOffers));
    assert_eq!(failure.instance, None);
    assert_eq!(
        marketplace.calls(),
        vec![MarketplaceCall::RegisterKey, MarketplaceCall::Search]
    );
    assert_eq!(
        failure.states,
        vec![
            ProvisionState::Searching,
            ProvisionState::Failed,
            ProvisionState::Terminated,
        ]
    );
}

#[rstest]
#[tokio::test]
async fn rejected_creation_has_nothing_to_destroy(ssh_dir: SshDir) {
    let marketplace = ScriptedMarketplace::new()
        .with_offers(vec![offer(11, 310.0)])
        .with_create_result(Err(ScriptedFailure::new("offer no longer available")));
    let probe = ScriptedProbe::new();

    let failure = workflow(&marketplace, &probe, &ssh_dir.path, settings(5_000, 5))
        .execute(&plan())
        .await
        .expect_err("creation should fail");

    assert!(matches!(
        failure.error,
        ProvisionError::Create { offer_id: 11, .. }
    ));
    assert!(marketplace.destroyed().is_empty());
    assert!(failure.cleaned_up());
}

#[rstest]
#[tokio::test]
async fn key_registration_failure_does_not_abort(ssh_dir: SshDir) {
    let marketplace = ScriptedMarketplace::new()
        .with_register_result(Err(ScriptedFailure::new("key already exists")))
        .with_offers(vec![offer(11, 310.0)])
        .with_snapshot(Ok(Some(proxied())));
    let probe = ScriptedProbe::new();
    probe.push_reachable();

    let outcome = workflow(&marketplace, &probe, &ssh_dir.path, settings(5_000, 5))
        .execute(&plan())
        .await;

    assert!(outcome.is_ok());
}

#[rstest]
#[tokio::test]
async fn error_status_fails_fast(ssh_dir: SshDir) {
    let marketplace = ScriptedMarketplace::new()
        .with_offers(vec![offer(11, 310.0)])
        .with_create_result(Ok(InstanceHandle { id: INSTANCE_ID }))
        .with_snapshot(Ok(Some(failed())));
    let probe = ScriptedProbe::new();
    probe.push_reachable();
    let started = Instant::now();

    let failure = workflow(&marketplace, &probe, &ssh_dir.path, settings(30_000, 10_000))
        .execute(&plan())
        .await
        .expect_err("error status should fail");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        failure.error,
        ProvisionError::InstanceFailed {
            instance_id: INSTANCE_ID,
            ..
        }
    ));
    assert!(probe.probed().is_empty());
    assert_eq!(marketplace.destroyed(), vec![INSTANCE_ID]);
}

#[rstest]
#[tokio::test]
async fn readiness_timeout_fetches_logs_then_destroys_once(ssh_dir: SshDir) {
    let timeout = Duration::from_millis(120);
    let interval = Duration::from_millis(50);
    let marketplace = ScriptedMarketplace::new()
        .with_offers(vec![offer(11, 310.0)])
        .with_create_result(Ok(InstanceHandle { id: INSTANCE_ID }))
        .with_snapshot(Ok(Some(proxied())))
        .with_logs(Ok("--- Starting onstart script ---".to_owned()));
    let probe = ScriptedProbe::new();
    let started = Instant::now();

    let failure = workflow(&marketplace, &probe, &ssh_dir.path, settings(120, 50))
        .execute(&plan())
        .await
        .expect_err("unreachable instance should time out");

    let elapsed = started.elapsed();
    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(
        elapsed <= timeout + interval,
        "overran the poll budget: {elapsed:?}"
    );
    assert!(matches!(
        failure.error,
        ProvisionError::ReadinessTimeout {
            instance_id: INSTANCE_ID,
            ..
        }
    ));
    assert_eq!(marketplace.destroyed(), vec![INSTANCE_ID]);

    let calls = marketplace.calls();
    let logs_at = calls
        .iter()
        .position(|call| *call == MarketplaceCall::FetchLogs { instance_id: INSTANCE_ID })
        .expect("logs fetched");
    let destroy_at = calls
        .iter()
        .position(|call| *call == MarketplaceCall::Destroy { instance_id: INSTANCE_ID })
        .expect("instance destroyed");
    assert!(logs_at < destroy_at);
    assert_eq!(
        failure.startup_log.as_deref(),
        Some("--- Starting onstart script ---")
    );
    assert_eq!(
        failure.states.last().copied(),
        Some(ProvisionState::Terminated)
    );
    assert!(!ssh_dir.path.join("config.d").exists());
}

#[rstest]
#[tokio::test]
async fn slow_ssh_check_cannot_overrun_poll_budget(ssh_dir: SshDir) {
    let timeout = Duration::from_millis(200);
    let interval = Duration::from_millis(50);
    let marketplace = ScriptedMarketplace::new()
        .with_offers(vec![offer(11, 310.0)])
        .with_create_result(Ok(InstanceHandle { id: INSTANCE_ID }))
        .with_snapshot(Ok(Some(proxied())));
    let probe = ScriptedProbe::new().with_delay(Duration::from_secs(2));
    probe.push_reachable();
    let started = Instant::now();

    let failure = workflow(&marketplace, &probe, &ssh_dir.path, settings(200, 50))
        .execute(&plan())
        .await
        .expect_err("a hung ssh should not count as ready");

    let elapsed = started.elapsed();
    assert!(
        elapsed <= timeout + interval,
        "ssh check ran past the deadline: {elapsed:?}"
    );
    assert!(matches!(
        failure.error,
        ProvisionError::ReadinessTimeout {
            instance_id: INSTANCE_ID,
            ..
        }
    ));
    assert_eq!(probe.probed().len(), 1);
    assert_eq!(marketplace.destroyed(), vec![INSTANCE_ID]);
}

#[rstest]
#[tokio::test]
async fn search_failure_never_creates(ssh_dir: SshDir) {
    let marketplace = ScriptedMarketplace::new().with_search_failure("503 service unavailable");
    let probe = ScriptedProbe::new();

    let failure = workflow(&marketplace, &probe, &ssh_dir.path, settings(5_000, 5))
        .execute(&plan())
        .await
        .expect_err("search failure should stop the workflow");

    assert!(matches!(failure.error, ProvisionError::Search(_)));
    assert_eq!(failure.instance, None);
    assert_eq!(
        marketplace.calls(),
        vec![MarketplaceCall::RegisterKey, MarketplaceCall::Search]
    );
    assert!(
        failure
            .to_string()
            .starts_with("offer search failed: 503 service unavailable")
    );
}

#[rstest]
#[tokio::test]
async fn cleanup_failures_do_not_mask_original_error(ssh_dir: SshDir) {
    let marketplace = ScriptedMarketplace::new()
        .with_offers(vec![offer(11, 310.0)])
        .with_create_result(Ok(InstanceHandle { id: INSTANCE_ID }))
        .with_snapshot(Ok(Some(loading())))
        .with_logs(Err(ScriptedFailure::new("logs unavailable")))
        .with_destroy_result(Err(ScriptedFailure::new("api down")));
    let probe = ScriptedProbe::new();

    let failure = workflow(&marketplace, &probe, &ssh_dir.path, settings(30, 10))
        .execute(&plan())
        .await
        .expect_err("should time out");

    assert!(matches!(
        failure.error,
        ProvisionError::ReadinessTimeout { .. }
    ));
    assert_eq!(failure.log_error, Some(ScriptedFailure::new("logs unavailable")));
    assert_eq!(failure.teardown_error, Some(ScriptedFailure::new("api down")));
    assert!(!failure.cleaned_up());
    let rendered = failure.to_string();
    assert!(rendered.starts_with("instance 42 did not become reachable over SSH within 30ms"));
    assert!(rendered.contains("teardown of instance 42 also failed: api down"));
    assert_eq!(marketplace.destroyed(), vec![INSTANCE_ID]);
}

#[rstest]
#[tokio::test]
async fn fetch_errors_and_missing_records_are_retried(ssh_dir: SshDir) {
    let marketplace = ScriptedMarketplace::new()
        .with_offers(vec![offer(11, 310.0)])
        .with_snapshot(Err(ScriptedFailure::new("502 bad gateway")))
        .with_snapshot(Ok(None))
        .with_snapshot(Ok(Some(proxied())));
    let probe = ScriptedProbe::new();
    probe.push_reachable();

    let outcome = workflow(&marketplace, &probe, &ssh_dir.path, settings(5_000, 5))
        .execute(&plan())
        .await
        .expect("transient errors should be retried");

    assert_eq!(outcome.details.port, 30924);
}

#[rstest]
#[tokio::test]
async fn local_access_failure_destroys_instance(ssh_dir: SshDir) {
    let blocked = ssh_dir.path.join("not-a-directory");
    fs::write(&blocked, "file in the way").expect("write blocker");
    let marketplace = ScriptedMarketplace::new()
        .with_offers(vec![offer(11, 310.0)])
        .with_create_result(Ok(InstanceHandle { id: INSTANCE_ID }))
        .with_snapshot(Ok(Some(proxied())));
    let probe = ScriptedProbe::new();
    probe.push_reachable();

    let failure = workflow(&marketplace, &probe, &blocked, settings(5_000, 5))
        .execute(&plan())
        .await
        .expect_err("fragment write should fail");

    assert!(matches!(failure.error, ProvisionError::LocalAccess(_)));
    assert_eq!(marketplace.destroyed(), vec![INSTANCE_ID]);
}
