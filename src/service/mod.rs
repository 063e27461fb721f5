// dbvault/src/service/mod.rs
//! Command surface of the orchestration core.
//!
//! Owns the registered targets and the scheduler, and forwards work to the
//! bounded executor. Every command returns a record, a job or a typed error.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::BackupRunner;
use crate::catalog::Catalog;
use crate::config::{AppConfig, PackageSettings, SecretResolver, TargetSpec};
use crate::errors::{AppError, Result};
use crate::executor::BoundedExecutor;
use crate::model::{BackupRecord, ConnectionParams, Job, PackageRecord, Target, TargetId};
use crate::observer::ObserverSet;
use crate::retention::{RetentionEnforcer, RetentionReport};
use crate::scheduler::{ScheduleKey, Scheduler};
use crate::storage::StorageBackend;

/// What one scheduler tick did for one due entry. `job` is `None` for the
/// retention sweep, which runs on its own task, and `Busy` when the previous
/// sweep is still running.
#[derive(Debug)]
pub struct TickOutcome {
    pub key: ScheduleKey,
    pub job: Result<Option<Job>>,
}

pub struct BackupService {
    targets: RwLock<BTreeMap<TargetId, Target>>,
    package: PackageSettings,
    scheduler: Mutex<Scheduler>,
    executor: BoundedExecutor,
    catalog: Arc<Catalog>,
    resolver: Arc<dyn SecretResolver>,
    tick_interval: Duration,
    /// Task of the last scheduled sweep; awaited on shutdown.
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    /// Held for the length of any sweep so two never interleave.
    sweep_lock: AsyncMutex<()>,
}

impl std::fmt::Debug for BackupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupService")
            .field("package", &self.package)
            .field("executor", &self.executor)
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

fn validate_target_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(AppError::Configuration(format!(
            "target id '{}' must be non-empty and use only letters, digits, '-' or '_'",
            id
        )));
    }
    Ok(())
}

impl BackupService {
    pub fn new(
        executor: BoundedExecutor,
        catalog: Arc<Catalog>,
        resolver: Arc<dyn SecretResolver>,
        package: PackageSettings,
        tick_interval: Duration,
    ) -> Self {
        Self {
            targets: RwLock::new(BTreeMap::new()),
            package,
            scheduler: Mutex::new(Scheduler::new()),
            executor,
            catalog,
            resolver,
            tick_interval,
            sweep_task: Mutex::new(None),
            sweep_lock: AsyncMutex::new(()),
        }
    }

    /// Wires the executor and registers every configured target and schedule.
    ///
    /// Targets whose credentials cannot be resolved are skipped with a warning;
    /// any other invalid entry is an error.
    pub async fn from_config(
        config: &AppConfig,
        runner: Arc<dyn BackupRunner>,
        catalog: Arc<Catalog>,
        storage: Arc<dyn StorageBackend>,
        resolver: Arc<dyn SecretResolver>,
        observers: ObserverSet,
    ) -> Result<Self> {
        let executor = BoundedExecutor::new(config.executor, runner, catalog.clone(), storage, observers);
        let service = Self::new(
            executor,
            catalog,
            resolver,
            config.package.clone(),
            config.executor.tick_interval,
        );

        let now = Utc::now();
        {
            let mut scheduler = service.lock_scheduler();
            scheduler.register(ScheduleKey::RetentionSweep, &config.retention_sweep_schedule, now)?;
            if let Some(schedule) = &config.package.schedule {
                scheduler.register(ScheduleKey::Package, schedule, now)?;
            }
        }

        for spec in &config.targets {
            if let Err(e) = service.resolver.resolve(&spec.id, &spec.credentials) {
                warn!(target_id = %spec.id, error = %e, "Skipping target with unresolved credentials");
                continue;
            }
            service.register_target(spec.clone()).await?;
        }
        let targets = service.targets.read().await.len();
        let schedules = service.lock_scheduler().len();
        info!(targets, schedules, "Backup service ready");
        Ok(service)
    }

    fn lock_scheduler(&self) -> MutexGuard<'_, Scheduler> {
        match self.scheduler.lock() {
            Ok(scheduler) => scheduler,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_sweep_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.sweep_task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn executor(&self) -> &BoundedExecutor {
        &self.executor
    }

    fn retention(&self) -> &RetentionEnforcer {
        self.executor.retention()
    }

    fn build_target(&self, spec: TargetSpec) -> Result<Target> {
        validate_target_id(&spec.id)?;
        let (username, password) = self.resolver.resolve(&spec.id, &spec.credentials)?;
        Ok(Target {
            name: if spec.name.is_empty() { spec.id.clone() } else { spec.name },
            id: spec.id,
            engine: spec.engine,
            connection: ConnectionParams {
                host: spec.host,
                port: spec.port,
                username,
                password,
                database_name: spec.database_name,
            },
            schedule: spec.schedule,
            retention: spec.retention,
            compression: spec.compression,
            package: spec.package,
        })
    }

    fn schedule_target(&self, target: &Target) -> Result<()> {
        let key = ScheduleKey::Target(target.id.clone());
        let mut scheduler = self.lock_scheduler();
        match &target.schedule {
            Some(schedule) => scheduler.register(key, schedule, Utc::now()),
            None => {
                scheduler.unregister(&key);
                Ok(())
            }
        }
    }

    /// Adds a new target. Credentials are resolved once, here.
    pub async fn register_target(&self, spec: TargetSpec) -> Result<Target> {
        let target = self.build_target(spec)?;
        let mut targets = self.targets.write().await;
        if targets.contains_key(&target.id) {
            return Err(AppError::Configuration(format!(
                "target '{}' is already registered",
                target.id
            )));
        }
        self.schedule_target(&target)?;
        targets.insert(target.id.clone(), target.clone());
        info!(target_id = %target.id, engine = %target.engine, schedule = ?target.schedule, "Target registered");
        Ok(target)
    }

    /// Replaces a target's settings. The id cannot change; a new schedule takes
    /// effect on the next tick. A job already submitted keeps the old settings.
    pub async fn update_target(&self, spec: TargetSpec) -> Result<Target> {
        let target = self.build_target(spec)?;
        let mut targets = self.targets.write().await;
        if !targets.contains_key(&target.id) {
            return Err(AppError::NotFound(format!("target '{}'", target.id)));
        }
        self.schedule_target(&target)?;
        targets.insert(target.id.clone(), target.clone());
        info!(target_id = %target.id, "Target updated");
        Ok(target)
    }

    /// Unregisters a target. Its records stay listable and deletable.
    pub async fn remove_target(&self, target_id: &str) -> Result<Target> {
        let removed = self
            .targets
            .write()
            .await
            .remove(target_id)
            .ok_or_else(|| AppError::NotFound(format!("target '{}'", target_id)))?;
        self.lock_scheduler()
            .unregister(&ScheduleKey::Target(target_id.to_string()));
        info!(target_id, "Target removed");
        Ok(removed)
    }

    pub async fn get_target(&self, target_id: &str) -> Result<Target> {
        self.targets
            .read()
            .await
            .get(target_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("target '{}'", target_id)))
    }

    pub async fn list_targets(&self) -> Vec<Target> {
        self.targets.read().await.values().cloned().collect()
    }

    /// Submits an on-demand backup. `Busy` if the target already has one.
    pub async fn trigger_backup(&self, target_id: &str) -> Result<Job> {
        let target = self.get_target(target_id).await?;
        self.executor.submit_backup(target).await
    }

    pub async fn list_backups(&self, target_id: Option<&str>) -> Vec<BackupRecord> {
        self.catalog.list_backups(target_id).await
    }

    pub async fn get_backup(&self, record_id: &str) -> Result<BackupRecord> {
        self.catalog
            .get_backup(record_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("backup record {}", record_id)))
    }

    pub async fn delete_backup(&self, record_id: &str) -> Result<BackupRecord> {
        self.retention().delete_backup(record_id).await
    }

    /// Submits a package build over the current package-eligible targets.
    pub async fn trigger_package(&self) -> Result<Job> {
        let targets = self.list_targets().await;
        self.executor
            .submit_package(targets, self.package.clone())
            .await
    }

    pub async fn list_packages(&self) -> Vec<PackageRecord> {
        self.catalog.list_packages().await
    }

    pub async fn get_package(&self, record_id: &str) -> Result<PackageRecord> {
        self.catalog
            .get_package(record_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("package record {}", record_id)))
    }

    pub async fn delete_package(&self, record_id: &str) -> Result<PackageRecord> {
        self.retention().delete_package(record_id).await
    }

    pub async fn delete_all_packages(&self) -> RetentionReport {
        self.retention().delete_all_packages().await
    }

    /// Applies every target's retention policy and the package policy.
    pub async fn run_retention_sweep(&self) -> Vec<RetentionReport> {
        let _sweeping = self.sweep_lock.lock().await;
        let targets = self.list_targets().await;
        self.retention()
            .sweep_all(&targets, &self.package.retention)
            .await
    }

    /// Cancels a job that is still queued.
    pub async fn cancel_job(&self, job_id: &str) -> Result<Job> {
        self.executor.cancel(job_id).await
    }

    /// Evaluates schedules once and submits what is due. Never waits for jobs.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<TickOutcome> {
        let due = self.lock_scheduler().due(now);
        let mut outcomes = Vec::with_capacity(due.len());
        for key in due {
            let job = match &key {
                ScheduleKey::Target(target_id) => self.trigger_backup(target_id).await.map(Some),
                ScheduleKey::Package => self.trigger_package().await.map(Some),
                ScheduleKey::RetentionSweep => self.start_sweep(),
            };
            match &job {
                Ok(Some(job)) => debug!(schedule = %key, job_id = %job.id, "Scheduled job submitted"),
                Ok(None) => debug!(schedule = %key, "Retention sweep started"),
                Err(AppError::Busy(reason)) => info!(schedule = %key, "Skipping scheduled run: {}", reason),
                Err(e) => warn!(schedule = %key, error = %e, "Scheduled run not submitted"),
            }
            outcomes.push(TickOutcome { key, job });
        }
        outcomes
    }

    /// Starts the scheduled sweep on its own task unless the last one is still running.
    fn start_sweep(self: &Arc<Self>) -> Result<Option<Job>> {
        let mut task = self.lock_sweep_task();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(AppError::Busy("the previous retention sweep is still running".to_string()));
        }
        let service = self.clone();
        *task = Some(tokio::spawn(async move {
            service.run_retention_sweep().await;
        }));
        Ok(None)
    }

    /// Ticks until `shutdown` fires, then waits for an in-flight sweep and
    /// drains the executor.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_secs = self.tick_interval.as_secs(), "Scheduler loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        info!("Shutdown requested, no further ticks");
        let sweep = self.lock_sweep_task().take();
        if let Some(handle) = sweep {
            if !handle.is_finished() {
                info!("Waiting for the retention sweep to finish");
            }
            if let Err(e) = handle.await {
                warn!(error = %e, "Retention sweep task failed");
            }
        }
        self.executor.shutdown().await;
    }
}
