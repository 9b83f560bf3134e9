//! End-to-end tests driving the drift manager against a recording transport.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;

use driftwatch_common::{DriftConfiguration, ResourceId, Result};
use driftwatch_digest::ContentDigest;
use driftwatch_engine::{
    ChangeSetHeaders, ChangeSetTransport, DriftManager, DriftManagerConfig, GateStatus,
};
use driftwatch_scan::{ChangeSetCategory, DriftCategory};
use driftwatch_store::archive::read_manifest;

#[derive(Default)]
struct RecordingTransport {
    change_sets: Mutex<Vec<(ChangeSetHeaders, PathBuf)>>,
    files: Mutex<Vec<(String, PathBuf)>>,
}

#[async_trait]
impl ChangeSetTransport for RecordingTransport {
    async fn send_change_set(&self, headers: ChangeSetHeaders, archive: PathBuf) -> Result<()> {
        self.change_sets.lock().await.push((headers, archive));
        Ok(())
    }

    async fn send_files_zip(
        &self,
        _resource_id: ResourceId,
        _config_name: &str,
        token: &str,
        archive: PathBuf,
    ) -> Result<()> {
        self.files.lock().await.push((token.to_string(), archive));
        Ok(())
    }
}

impl RecordingTransport {
    async fn deliveries(&self) -> Vec<(ChangeSetHeaders, PathBuf)> {
        self.change_sets.lock().await.clone()
    }
}

async fn wait_for_deliveries(
    transport: &RecordingTransport,
    count: usize,
) -> Vec<(ChangeSetHeaders, PathBuf)> {
    for _ in 0..200 {
        let deliveries = transport.deliveries().await;
        if deliveries.len() >= count {
            return deliveries;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Timed out waiting for {} change set deliveries", count);
}

struct Fixture {
    transport: Arc<RecordingTransport>,
    manager: DriftManager,
    basedir: TempDir,
    _store_root: TempDir,
    _install_dir: TempDir,
}

fn fixture() -> Fixture {
    let store_root = TempDir::new().unwrap();
    let basedir = TempDir::new().unwrap();
    let install_dir = TempDir::new().unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let manager = DriftManager::new(
        DriftManagerConfig {
            store_root: store_root.path().to_path_buf(),
            install_dir: install_dir.path().to_path_buf(),
        },
        transport.clone(),
    )
    .unwrap();

    Fixture {
        transport,
        manager,
        basedir,
        _store_root: store_root,
        _install_dir: install_dir,
    }
}

fn config(fixture: &Fixture, interval: Duration) -> DriftConfiguration {
    DriftConfiguration::new("app-config", fixture.basedir.path().to_string_lossy())
        .with_interval(interval)
}

const RESOURCE: ResourceId = ResourceId::new(42);

#[tokio::test]
async fn detection_cycle_blocks_until_acked() {
    let fx = fixture();
    fs::write(fx.basedir.path().join("a.txt"), "x").unwrap();

    fx.manager
        .schedule_drift_detection(RESOURCE, config(&fx, Duration::from_millis(100)))
        .await
        .unwrap();

    // Run 1: coverage version 0 with the file's content aboard.
    let deliveries = wait_for_deliveries(&fx.transport, 1).await;
    let (headers, archive) = &deliveries[0];
    assert_eq!(headers.category, ChangeSetCategory::Coverage);
    assert_eq!(headers.version, 0);
    assert_eq!(headers.config_name, "app-config");
    let coverage_token = headers.content_token.clone().expect("coverage carries content");
    let coverage_archive = archive.clone();

    assert_eq!(
        fx.manager.gate_status(RESOURCE, "app-config").await,
        GateStatus::AwaitingMetadataAck
    );

    // The file drifts while run 1 is unacknowledged: detection stays
    // suspended, no second change set appears.
    fs::write(fx.basedir.path().join("a.txt"), "y").unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fx.transport.deliveries().await.len(), 1);

    // Acknowledge metadata, then content.
    fx.manager.ack_change_set(RESOURCE, "app-config").await.unwrap();
    assert_eq!(
        fx.manager.gate_status(RESOURCE, "app-config").await,
        GateStatus::AwaitingContentAck
    );
    fx.manager
        .ack_change_set_content(RESOURCE, "app-config", &coverage_token)
        .await
        .unwrap();

    // Run 2: drift version 1 with exactly one CHANGE entry for a.txt.
    let deliveries = wait_for_deliveries(&fx.transport, 2).await;
    let (headers, archive) = &deliveries[1];
    assert_eq!(headers.category, ChangeSetCategory::Drift);
    assert_eq!(headers.version, 1);
    let drift_token = headers.content_token.clone().expect("change carries content");

    let manifest = read_manifest(archive).unwrap();
    assert_eq!(manifest.entries.len(), 1);
    assert_eq!(manifest.entries[0].relative_path, "a.txt");
    assert_eq!(manifest.entries[0].category, DriftCategory::Changed);
    assert_eq!(manifest.entries[0].digest, ContentDigest::from_bytes(b"y"));

    // Acking version 1 purges the superseded coverage archive.
    assert!(coverage_archive.exists());
    fx.manager.ack_change_set(RESOURCE, "app-config").await.unwrap();
    fx.manager
        .ack_change_set_content(RESOURCE, "app-config", &drift_token)
        .await
        .unwrap();
    assert!(!coverage_archive.exists());

    // Run 3: the file disappears; a delete-only change set carries no
    // content and acks in a single step.
    fs::remove_file(fx.basedir.path().join("a.txt")).unwrap();
    let deliveries = wait_for_deliveries(&fx.transport, 3).await;
    let (headers, archive) = &deliveries[2];
    assert_eq!(headers.version, 2);
    assert!(headers.content_token.is_none());

    let manifest = read_manifest(archive).unwrap();
    assert_eq!(manifest.entries.len(), 1);
    assert_eq!(manifest.entries[0].relative_path, "a.txt");
    assert_eq!(manifest.entries[0].category, DriftCategory::Deleted);

    fx.manager.ack_change_set(RESOURCE, "app-config").await.unwrap();
    assert_eq!(
        fx.manager.gate_status(RESOURCE, "app-config").await,
        GateStatus::Idle
    );

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn empty_base_directory_emits_empty_coverage() {
    let fx = fixture();

    fx.manager
        .schedule_drift_detection(RESOURCE, config(&fx, Duration::from_millis(50)))
        .await
        .unwrap();

    let deliveries = wait_for_deliveries(&fx.transport, 1).await;
    let (headers, archive) = &deliveries[0];
    assert_eq!(headers.category, ChangeSetCategory::Coverage);
    assert_eq!(headers.version, 0);
    assert!(headers.content_token.is_none());

    let manifest = read_manifest(archive).unwrap();
    assert!(manifest.entries.is_empty());

    // The baseline the coverage run established is durably recorded.
    let baseline = fx
        .manager
        .store()
        .load_baseline(RESOURCE, "app-config")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(baseline.version, 0);
    assert!(baseline.snapshot.is_empty());

    // With nothing drifting, acking never yields another change set.
    fx.manager.ack_change_set(RESOURCE, "app-config").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fx.transport.deliveries().await.len(), 1);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn detect_drift_runs_ahead_of_the_interval() {
    let fx = fixture();
    fs::write(fx.basedir.path().join("a.txt"), "x").unwrap();

    let cfg = config(&fx, Duration::from_secs(3600));
    fx.manager
        .schedule_drift_detection(RESOURCE, cfg.clone())
        .await
        .unwrap();

    // Nothing happens on its own for an hour-long interval.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fx.transport.deliveries().await.is_empty());

    fx.manager.detect_drift(RESOURCE, cfg).await.unwrap();
    let deliveries = wait_for_deliveries(&fx.transport, 1).await;
    assert_eq!(deliveries[0].0.version, 0);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn unschedule_stops_further_detection() {
    let fx = fixture();

    fx.manager
        .schedule_drift_detection(RESOURCE, config(&fx, Duration::from_millis(50)))
        .await
        .unwrap();
    wait_for_deliveries(&fx.transport, 1).await;
    fx.manager.ack_change_set(RESOURCE, "app-config").await.unwrap();

    fx.manager
        .unschedule_drift_detection(RESOURCE, &config(&fx, Duration::from_millis(50)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Drift introduced after the unschedule is never picked up.
    fs::write(fx.basedir.path().join("late.txt"), "z").unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fx.transport.deliveries().await.len(), 1);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn disabling_via_update_unschedules() {
    let fx = fixture();

    let cfg = config(&fx, Duration::from_millis(50));
    fx.manager
        .schedule_drift_detection(RESOURCE, cfg.clone())
        .await
        .unwrap();
    wait_for_deliveries(&fx.transport, 1).await;
    fx.manager.ack_change_set(RESOURCE, "app-config").await.unwrap();

    fx.manager
        .update_drift_detection(RESOURCE, cfg.with_enabled(false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    fs::write(fx.basedir.path().join("late.txt"), "z").unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fx.transport.deliveries().await.len(), 1);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn requested_drift_files_ship_under_a_fresh_token() {
    let fx = fixture();
    fs::write(fx.basedir.path().join("a.txt"), "x").unwrap();

    fx.manager
        .schedule_drift_detection(RESOURCE, config(&fx, Duration::from_millis(50)))
        .await
        .unwrap();
    wait_for_deliveries(&fx.transport, 1).await;

    let digest = ContentDigest::from_bytes(b"x");
    let token = fx
        .manager
        .request_drift_files(RESOURCE, "app-config", &[digest])
        .await
        .unwrap();

    let files = fx.transport.files.lock().await.clone();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, token);
    assert!(files[0].1.exists());

    // The fresh token replaces the one minted at ship time.
    fx.manager.ack_change_set(RESOURCE, "app-config").await.unwrap();
    fx.manager
        .ack_change_set_content(RESOURCE, "app-config", &token)
        .await
        .unwrap();
    assert_eq!(
        fx.manager.gate_status(RESOURCE, "app-config").await,
        GateStatus::Idle
    );
    // The content archive is cleaned up with the ack.
    assert!(!files[0].1.exists());

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn content_ack_with_wrong_token_is_rejected() {
    let fx = fixture();
    fs::write(fx.basedir.path().join("a.txt"), "x").unwrap();

    fx.manager
        .schedule_drift_detection(RESOURCE, config(&fx, Duration::from_millis(50)))
        .await
        .unwrap();
    wait_for_deliveries(&fx.transport, 1).await;

    fx.manager.ack_change_set(RESOURCE, "app-config").await.unwrap();
    assert!(fx
        .manager
        .ack_change_set_content(RESOURCE, "app-config", "bogus-token")
        .await
        .is_err());
    // Still blocked; the real token is required.
    assert_eq!(
        fx.manager.gate_status(RESOURCE, "app-config").await,
        GateStatus::AwaitingContentAck
    );

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_pending_delivery_under_the_same_identity() {
    let store_root = TempDir::new().unwrap();
    let basedir = TempDir::new().unwrap();
    let install_dir = TempDir::new().unwrap();
    fs::write(basedir.path().join("a.txt"), "x").unwrap();

    let make_config = || {
        DriftConfiguration::new("app-config", basedir.path().to_string_lossy())
            .with_interval(Duration::from_millis(50))
    };
    let manager_config = DriftManagerConfig {
        store_root: store_root.path().to_path_buf(),
        install_dir: install_dir.path().to_path_buf(),
    };

    // First process: ship coverage, then go down before any ack.
    let first_identity = {
        let transport = Arc::new(RecordingTransport::default());
        let manager = DriftManager::new(manager_config.clone(), transport.clone()).unwrap();
        manager
            .schedule_drift_detection(RESOURCE, make_config())
            .await
            .unwrap();
        let deliveries = wait_for_deliveries(&transport, 1).await;
        manager.shutdown().await;
        deliveries[0].0.clone()
    };

    // Second process over the same store.
    let transport = Arc::new(RecordingTransport::default());
    let manager = DriftManager::new(manager_config, transport.clone()).unwrap();

    let resumed = manager.resume_pending().await.unwrap();
    assert_eq!(resumed, 1);
    assert_eq!(
        manager.gate_status(RESOURCE, "app-config").await,
        GateStatus::AwaitingMetadataAck
    );

    // The identical archive identity is redelivered.
    let deliveries = wait_for_deliveries(&transport, 1).await;
    assert_eq!(deliveries[0].0.id(), first_identity.id());
    assert!(deliveries[0].1.exists());

    // Scheduling again while unacknowledged does not generate a new version.
    manager
        .schedule_drift_detection(RESOURCE, make_config())
        .await
        .unwrap();
    fs::write(basedir.path().join("a.txt"), "y").unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(transport.deliveries().await.len(), 1);

    // After the ack the baseline recovered from disk drives version 1.
    manager.ack_change_set(RESOURCE, "app-config").await.unwrap();
    if let Some(token) = &deliveries[0].0.content_token {
        manager
            .ack_change_set_content(RESOURCE, "app-config", token)
            .await
            .unwrap();
    }

    let deliveries = wait_for_deliveries(&transport, 2).await;
    assert_eq!(deliveries[1].0.category, ChangeSetCategory::Drift);
    assert_eq!(deliveries[1].0.version, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn missing_base_directory_retries_at_the_next_tick() {
    let fx = fixture();
    let missing = fx.basedir.path().join("not-yet");

    let cfg = DriftConfiguration::new("app-config", missing.to_string_lossy())
        .with_interval(Duration::from_millis(100));
    fx.manager
        .schedule_drift_detection(RESOURCE, cfg)
        .await
        .unwrap();

    // Scan failures are logged and retried; nothing ships.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(fx.transport.deliveries().await.is_empty());

    // The transient cause heals and the next tick produces coverage.
    fs::create_dir(&missing).unwrap();
    fs::write(missing.join("a.txt"), "x").unwrap();
    let deliveries = wait_for_deliveries(&fx.transport, 1).await;
    assert_eq!(deliveries[0].0.category, ChangeSetCategory::Coverage);

    fx.manager.shutdown().await;
}
