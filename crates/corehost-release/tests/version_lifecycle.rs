//! End-to-end version lifecycle on the filesystem backend: bootstrap,
//! deploy from upstream, move an instance forward and back, then retire a
//! version.

use std::sync::Arc;
use std::time::Duration;

use corehost_core::{InstanceId, LocalFsBackend, StorageBackend};
use corehost_release::{
    DeployConfig, DeploymentJob, DeploymentOrchestrator, DirectorySeed, HistoryStatus,
    HttpManifestSource, InstanceDirectory, InstanceVersionTracker, JobState, LocalSourceTree,
    ReleaseError, StorageInstanceDirectory, VersionLayout, VersionStatus, import_seed,
};
use corehost_test_utils::{ManifestServer, SourceFixture, manifest_json, write_file};

const ADMIN: u64 = 10;

struct World {
    _source: SourceFixture,
    _server: ManifestServer,
    core: tempfile::TempDir,
    orchestrator: Arc<DeploymentOrchestrator>,
    tracker: InstanceVersionTracker,
}

async fn world() -> anyhow::Result<World> {
    corehost_test_utils::init_test_logging();

    let core = tempfile::tempdir()?;
    write_file(core.path(), "versions/v1.0.0/index.js", "seed");

    let source = SourceFixture::new()
        .with_version("v1.1.0", &[("index.js", "one-one"), ("lib/util.js", "util")])
        .with_version("v1.2.0", &[("index.js", "one-two"), ("lib/util.js", "util")]);
    let server = ManifestServer::start(manifest_json("v1.1.0", &["v1.0.0", "v1.1.0"])).await;

    let storage: Arc<dyn StorageBackend> = Arc::new(LocalFsBackend::new(core.path().join("state"))?);
    let directory = Arc::new(StorageInstanceDirectory::new(Arc::clone(&storage)));
    let timeout = Duration::from_secs(10);

    let orchestrator = DeploymentOrchestrator::new(
        Arc::clone(&storage),
        Arc::clone(&directory) as Arc<dyn InstanceDirectory>,
        VersionLayout::new(core.path()),
        DeployConfig {
            operation_timeout: timeout,
            ..DeployConfig::default()
        },
    )
    .with_remote(Arc::new(HttpManifestSource::new(server.url(), None, timeout)?))
    .with_source(Arc::new(LocalSourceTree::new(source.root(), timeout)));
    assert!(orchestrator.bootstrap("v1.0.0", "Initial release").await?);

    let seed: DirectorySeed = serde_json::from_value(serde_json::json!({
        "instances": [{"id": 1, "clientId": 7, "subdomain": "acme", "coreVersion": "v1.0.0"}],
        "users": [{"id": ADMIN, "instanceId": 1, "email": "ops@acme.test", "role": "admin"}]
    }))?;
    import_seed(directory.as_ref(), &seed).await?;

    let tracker = InstanceVersionTracker::new(storage, orchestrator.manifests().clone(), directory);
    Ok(World {
        _source: source,
        _server: server,
        core,
        orchestrator: Arc::new(orchestrator),
        tracker,
    })
}

async fn deploy(orchestrator: &Arc<DeploymentOrchestrator>, version: &str) -> anyhow::Result<DeploymentJob> {
    let job = orchestrator.start_deploy(version, "release").await?;
    for _ in 0..200 {
        let job = orchestrator.get_job(&job.id).await?;
        if job.state.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    anyhow::bail!("deployment {} did not finish", job.id)
}

#[tokio::test]
async fn full_lifecycle() -> anyhow::Result<()> {
    let w = world().await?;
    let instance = InstanceId::new(1);

    let status = w.orchestrator.check_status().await?;
    assert!(status.has_new_version);
    assert_eq!(status.remote_latest.as_str(), "v1.1.0");
    assert_eq!(status.candidate_versions.len(), 2);

    let job = deploy(&w.orchestrator, "v1.1.0").await?;
    assert_eq!(job.state, JobState::Succeeded, "{:?}", job.error);
    assert!(!w.orchestrator.check_status().await?.has_new_version);
    let job = deploy(&w.orchestrator, "v1.2.0").await?;
    assert_eq!(job.state, JobState::Succeeded, "{:?}", job.error);

    let jobs = w.orchestrator.list_jobs().await?;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].version.as_str(), "v1.2.0");

    // Move the instance forward twice.
    w.tracker.update_version(instance, &"v1.1.0".parse()?, Some(ADMIN)).await?;
    let change = w.tracker.update_version(instance, &"v1.2.0".parse()?, Some(ADMIN)).await?;
    assert_eq!(change.message, "Updated from v1.1.0 to v1.2.0");

    let listed = w.orchestrator.list_versions().await?;
    assert_eq!(listed.latest.as_str(), "v1.2.0");
    assert_eq!(listed.find(&"v1.2.0".parse()?).map(|e| e.stats.instances_using), Some(1));
    assert_eq!(
        listed.find(&"v1.1.0".parse()?).map(|e| e.status),
        Some(VersionStatus::Stable)
    );

    // Rollback skips the most recent completed change: back to v1.0.0.
    let rolled = w.tracker.rollback(instance, Some(ADMIN)).await?;
    assert_eq!(rolled.instance.core_version.as_str(), "v1.0.0");
    let history = w.tracker.history(instance).await?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].status, HistoryStatus::RolledBack);
    assert!(history.iter().all(|e| e.completed_at.is_some()));

    // Files are served from the materialized tree.
    let body = w.orchestrator.core_file("1.1.0", "index.js").await?;
    assert_eq!(body, b"one-one");
    let err = w.orchestrator.core_file("v1.1.0", "../v1.0.0/index.js").await.unwrap_err();
    assert!(matches!(err, ReleaseError::Validation { .. }));

    // v1.1.0 is unused now and not latest, so it can go.
    w.orchestrator.delete_version("v1.1.0").await?;
    assert!(!w.core.path().join("versions/v1.1.0").exists());
    let err = w.orchestrator.delete_version("v1.0.0").await.unwrap_err();
    assert!(matches!(err, ReleaseError::InvalidOperation { .. }));
    Ok(())
}

#[tokio::test]
async fn verify_detects_tampering() -> anyhow::Result<()> {
    let w = world().await?;
    let job = deploy(&w.orchestrator, "v1.1.0").await?;
    assert_eq!(job.state, JobState::Succeeded, "{:?}", job.error);
    assert!(w.orchestrator.verify_version("v1.1.0").await?.is_intact());

    write_file(w.core.path(), "versions/v1.1.0/index.js", "tampered");
    let report = w.orchestrator.verify_version("v1.1.0").await?;
    assert_eq!(report.mismatched, vec!["index.js".to_string()]);
    Ok(())
}

#[tokio::test]
async fn restart_fails_interrupted_jobs() -> anyhow::Result<()> {
    let w = world().await?;
    let job = deploy(&w.orchestrator, "v1.1.0").await?;
    assert_eq!(job.state, JobState::Succeeded);

    // Nothing was in flight, so recovery changes nothing.
    assert!(w.orchestrator.recover_interrupted().await?.is_empty());
    assert_eq!(w.orchestrator.get_job(&job.id).await?.state, JobState::Succeeded);
    Ok(())
}
