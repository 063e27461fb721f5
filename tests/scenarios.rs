// dbvault/tests/scenarios.rs
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use dbvault::backup::verification::checksum;
use dbvault::backup::{ArtifactPlan, BackupRunner, store_artifact};
use dbvault::catalog::Catalog;
use dbvault::config::{Credentials, EnvSecretResolver, ExecutorSettings, PackageSettings, TargetSpec};
use dbvault::errors::{AppError, Result};
use dbvault::executor::BoundedExecutor;
use dbvault::model::{
    Artifact, BackupRecord, Compression, ConnectionParams, Engine, RecordStatus, RetentionPolicy,
    Target,
};
use dbvault::observer::ObserverSet;
use dbvault::retention::RetentionEnforcer;
use dbvault::service::BackupService;
use dbvault::storage::{LocalStorage, StorageBackend};

/// Stores `<target id>` as the dump once a permit is available and records
/// the highest number of `running` records seen while it runs.
struct GatedRunner {
    storage: Arc<dyn StorageBackend>,
    catalog: Arc<Catalog>,
    gate: Semaphore,
    peak_running_records: AtomicUsize,
}

impl GatedRunner {
    fn new(storage: Arc<dyn StorageBackend>, catalog: Arc<Catalog>, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            storage,
            catalog,
            gate: Semaphore::new(permits),
            peak_running_records: AtomicUsize::new(0),
        })
    }

    fn open(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

#[async_trait]
impl BackupRunner for GatedRunner {
    async fn run(&self, target: &Target, plan: &ArtifactPlan) -> Result<Artifact> {
        let running = self
            .catalog
            .list_backups(None)
            .await
            .iter()
            .filter(|r| r.status == RecordStatus::Running)
            .count();
        self.peak_running_records.fetch_max(running, Ordering::SeqCst);

        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let bytes = format!("dump of {}", target.id).into_bytes();
        store_artifact(self.storage.as_ref(), &plan.path, bytes).await
    }
}

fn target(id: &str, package: bool, retention: RetentionPolicy) -> Target {
    Target {
        id: id.into(),
        name: id.into(),
        engine: Engine::Postgres,
        connection: ConnectionParams {
            host: "127.0.0.1".into(),
            port: 5432,
            username: "app".into(),
            password: "app".into(),
            database_name: id.into(),
        },
        schedule: None,
        retention,
        compression: Compression::None,
        package,
    }
}

fn spec(id: &str, package: bool) -> TargetSpec {
    TargetSpec {
        id: id.into(),
        name: String::new(),
        engine: Engine::Postgres,
        host: "127.0.0.1".into(),
        port: 5432,
        database_name: id.into(),
        credentials: Credentials {
            username: Some("app".into()),
            password: Some("app".into()),
            username_var: None,
            password_var: None,
        },
        schedule: None,
        retention: RetentionPolicy::default(),
        compression: Compression::None,
        package,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    storage: Arc<dyn StorageBackend>,
    catalog: Arc<Catalog>,
    runner: Arc<GatedRunner>,
    executor: BoundedExecutor,
}

fn harness(max_parallel_jobs: usize, permits: usize) -> anyhow::Result<Harness> {
    let dir = tempfile::tempdir()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
    let catalog = Arc::new(Catalog::in_memory());
    let runner = GatedRunner::new(storage.clone(), catalog.clone(), permits);
    let settings = ExecutorSettings {
        max_parallel_jobs,
        ..ExecutorSettings::default()
    };
    let executor = BoundedExecutor::new(
        settings,
        runner.clone(),
        catalog.clone(),
        storage.clone(),
        ObserverSet::new(),
    );
    Ok(Harness {
        _dir: dir,
        storage,
        catalog,
        runner,
        executor,
    })
}

#[tokio::test]
async fn concurrent_submissions_for_one_target_admit_exactly_one() -> anyhow::Result<()> {
    let h = harness(4, 0)?;
    let t1 = target("t1", false, RetentionPolicy::default());

    let (first, second) = tokio::join!(
        h.executor.submit_backup(t1.clone()),
        h.executor.submit_backup(t1.clone())
    );
    let (accepted, rejected) = match (first, second) {
        (Ok(job), Err(e)) | (Err(e), Ok(job)) => (job, e),
        other => anyhow::bail!("expected one acceptance and one rejection, got {:?}", other),
    };
    assert!(matches!(rejected, AppError::Busy(_)));

    h.runner.open(1);
    h.executor.wait_idle().await;
    let records = h.catalog.list_backups(Some("t1")).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, accepted.id);
    assert_eq!(records[0].status, RecordStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn running_records_never_exceed_parallelism_cap() -> anyhow::Result<()> {
    let h = harness(2, 0)?;
    for i in 0..6 {
        let t = target(&format!("t{}", i), false, RetentionPolicy::default());
        h.executor.submit_backup(t).await?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.executor.running_jobs(), 2);
    assert_eq!(h.executor.queued_jobs(), 4);

    h.runner.open(6);
    h.executor.wait_idle().await;

    assert!(h.runner.peak_running_records.load(Ordering::SeqCst) <= 2);
    let records = h.catalog.list_backups(None).await;
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| r.status == RecordStatus::Completed));
    Ok(())
}

#[tokio::test]
async fn stored_artifacts_match_recorded_checksums() -> anyhow::Result<()> {
    let h = harness(2, 8)?;
    for id in ["orders", "billing", "audit"] {
        h.executor
            .submit_backup(target(id, false, RetentionPolicy::default()))
            .await?;
    }
    h.executor.wait_idle().await;

    for record in h.catalog.list_backups(None).await {
        assert_eq!(record.status, RecordStatus::Completed);
        let path = record.storage_path.as_deref().unwrap_or_default();
        let bytes = h.storage.get(path).await?;
        assert_eq!(Some(checksum(&bytes)), record.checksum);
        assert_eq!(Some(bytes.len() as u64), record.size_bytes);
    }
    Ok(())
}

async fn completed_on_day(
    catalog: &Catalog,
    storage: &dyn StorageBackend,
    target_id: &str,
    days_ago: i64,
) -> anyhow::Result<BackupRecord> {
    let created_at = Utc::now() - ChronoDuration::days(days_ago);
    let mut record = BackupRecord::running(target_id, created_at);
    let path = format!("backups/{}/{}.dump", target_id, record.id);
    let artifact = store_artifact(storage, &path, record.id.clone().into_bytes()).await?;
    record.finish(&Ok(artifact), created_at, Duration::ZERO);
    catalog.insert_backup(record.clone()).await;
    Ok(record)
}

#[tokio::test]
async fn seven_day_three_copy_retention_keeps_last_three() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
    let catalog = Arc::new(Catalog::in_memory());
    let policy = RetentionPolicy::new(Some(7), Some(3))?;
    let t1 = target("t1", false, policy);

    // created on days 1, 3, 5 and 9; today is day 9
    let mut records = Vec::new();
    for days_ago in [8, 6, 4, 0] {
        records.push(completed_on_day(&catalog, storage.as_ref(), "t1", days_ago).await?);
    }

    let enforcer = RetentionEnforcer::new(catalog.clone(), storage.clone(), ObserverSet::new());
    let reports = enforcer.sweep_all(&[t1.clone()], &RetentionPolicy::default()).await;
    let removed: Vec<String> = reports.iter().flat_map(|r| r.deleted.clone()).collect();
    assert_eq!(removed, vec![records[0].id.clone()]);

    let mut kept: Vec<String> = catalog
        .list_backups(Some("t1"))
        .await
        .into_iter()
        .map(|r| r.id)
        .collect();
    kept.sort();
    let mut expected: Vec<String> = records[1..].iter().map(|r| r.id.clone()).collect();
    expected.sort();
    assert_eq!(kept, expected);
    assert!(matches!(
        storage.get(records[0].storage_path.as_deref().unwrap_or_default()).await,
        Err(AppError::NotFound(_))
    ));

    let again = enforcer.sweep_all(&[t1], &RetentionPolicy::default()).await;
    assert!(again.iter().all(|r| r.deleted.is_empty() && r.is_clean()));
    assert_eq!(catalog.list_backups(Some("t1")).await.len(), 3);
    Ok(())
}

#[tokio::test]
async fn package_bundles_two_targets_and_skips_the_empty_one() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
    let catalog = Arc::new(Catalog::in_memory());
    let runner = GatedRunner::new(storage.clone(), catalog.clone(), 8);
    let executor = BoundedExecutor::new(
        ExecutorSettings::default(),
        runner,
        catalog.clone(),
        storage,
        ObserverSet::new(),
    );
    let service = Arc::new(BackupService::new(
        executor,
        catalog,
        Arc::new(EnvSecretResolver),
        PackageSettings::default(),
        Duration::from_secs(60),
    ));
    for (id, package) in [("a", true), ("b", true), ("empty", true), ("private", false)] {
        service.register_target(spec(id, package)).await?;
    }

    let a = service.trigger_backup("a").await?;
    let b = service.trigger_backup("b").await?;
    let private = service.trigger_backup("private").await?;
    service.executor().wait_idle().await;

    let job = service.trigger_package().await?;
    service.executor().wait_idle().await;
    let package = service.get_package(&job.id).await?;

    assert_eq!(package.status, RecordStatus::Completed);
    let mut sources = package.sources.clone();
    sources.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(sources, expected);
    assert!(!package.sources.contains(&private.id));
    assert_eq!(package.skipped_targets, vec!["empty".to_string()]);
    Ok(())
}
