// dbvault/src/executor/mod.rs
//! Bounded job execution.
//!
//! Two limits apply: at most `max_parallel_jobs` jobs execute at once, and at
//! most one job per target exists (queued or running). A target conflict is
//! rejected with `Busy`; a full executor queues FIFO. Package builds have no
//! owning target, but only one of them may be queued or running at a time.
//!
//! A job's record is created when the job starts, so the number of `running`
//! records never exceeds the parallelism cap.

use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::backup::{ArtifactPlan, BackupRunner};
use crate::catalog::{Catalog, GroupKey};
use crate::config::{ExecutorSettings, PackageSettings};
use crate::errors::{AppError, Result};
use crate::model::{BackupRecord, Job, JobKind, PackageRecord, RecordStatus, Target, TargetId};
use crate::observer::{Event, EventKind, ObserverSet};
use crate::packager::Packager;
use crate::retention::RetentionEnforcer;
use crate::storage::StorageBackend;

enum Work {
    Backup(Target),
    Package {
        targets: Vec<Target>,
        settings: PackageSettings,
    },
}

struct Submission {
    job: Job,
    work: Work,
}

#[derive(Default)]
struct State {
    running: HashSet<String>,
    busy_targets: HashSet<TargetId>,
    package_busy: bool,
    queue: VecDeque<Submission>,
    accepting: bool,
}

struct Inner {
    settings: ExecutorSettings,
    runner: Arc<dyn BackupRunner>,
    packager: Packager,
    retention: RetentionEnforcer,
    catalog: Arc<Catalog>,
    storage: Arc<dyn StorageBackend>,
    observers: ObserverSet,
    state: Mutex<State>,
    idle: Notify,
}

/// Cloneable handle to the shared executor.
#[derive(Clone)]
pub struct BoundedExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BoundedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("BoundedExecutor")
            .field("settings", &self.inner.settings)
            .field("running", &state.running.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl BoundedExecutor {
    pub fn new(
        settings: ExecutorSettings,
        runner: Arc<dyn BackupRunner>,
        catalog: Arc<Catalog>,
        storage: Arc<dyn StorageBackend>,
        observers: ObserverSet,
    ) -> Self {
        let packager = Packager::new(catalog.clone(), storage.clone());
        let retention = RetentionEnforcer::new(catalog.clone(), storage.clone(), observers.clone());
        Self {
            inner: Arc::new(Inner {
                settings,
                runner,
                packager,
                retention,
                catalog,
                storage,
                observers,
                state: Mutex::new(State {
                    accepting: true,
                    ..State::default()
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn retention(&self) -> &RetentionEnforcer {
        &self.inner.retention
    }

    /// Admits a backup job for `target`.
    ///
    /// Fails with `Busy` if the target already has a queued or running job.
    pub async fn submit_backup(&self, target: Target) -> Result<Job> {
        let job = Job {
            id: format!("bkp_{}", Uuid::new_v4().simple()),
            kind: JobKind::Backup,
            target_id: Some(target.id.clone()),
            submitted_at: Utc::now(),
        };
        let start = {
            let mut state = self.inner.lock_state();
            state.ensure_accepting()?;
            if !state.busy_targets.insert(target.id.clone()) {
                return Err(AppError::Busy(format!(
                    "target '{}' already has a backup in progress",
                    target.id
                )));
            }
            self.inner.place(
                &mut state,
                Submission {
                    job: job.clone(),
                    work: Work::Backup(target),
                },
            )
        };
        if let Some(submission) = start {
            self.inner.spawn(submission);
        }
        Ok(job)
    }

    /// Admits a package build over `targets`. Only one build may be pending.
    pub async fn submit_package(&self, targets: Vec<Target>, settings: PackageSettings) -> Result<Job> {
        let job = Job {
            id: format!("pkg_{}", Uuid::new_v4().simple()),
            kind: JobKind::Package,
            target_id: None,
            submitted_at: Utc::now(),
        };
        let start = {
            let mut state = self.inner.lock_state();
            state.ensure_accepting()?;
            if state.package_busy {
                return Err(AppError::Busy("a package build is already in progress".to_string()));
            }
            state.package_busy = true;
            self.inner.place(
                &mut state,
                Submission {
                    job: job.clone(),
                    work: Work::Package { targets, settings },
                },
            )
        };
        if let Some(submission) = start {
            self.inner.spawn(submission);
        }
        Ok(job)
    }

    /// Removes a job that has not started yet. Its record is written as failed
    /// with kind `cancelled`. Running jobs end only by finishing or timing out.
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        let submission = {
            let mut state = self.inner.lock_state();
            match state.queue.iter().position(|s| s.job.id == job_id) {
                Some(index) => {
                    let submission = state.queue.remove(index);
                    if let Some(submission) = &submission {
                        state.release(&submission.job);
                    }
                    submission
                }
                None if state.running.contains(job_id) => {
                    return Err(AppError::Busy(format!(
                        "job {} is already running and can only end by completing or timing out",
                        job_id
                    )));
                }
                None => return Err(AppError::NotFound(format!("queued job {}", job_id))),
            }
        };
        let Some(submission) = submission else {
            return Err(AppError::NotFound(format!("queued job {}", job_id)));
        };
        let job = self.inner.record_cancelled(submission).await;
        self.inner.notify_if_idle();
        Ok(job)
    }

    pub fn running_jobs(&self) -> usize {
        self.inner.lock_state().running.len()
    }

    pub fn queued_jobs(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    pub fn is_target_busy(&self, target_id: &str) -> bool {
        self.inner.lock_state().busy_targets.contains(target_id)
    }

    /// Waits until no job is running or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock_state().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting work, cancels queued jobs and waits for running ones.
    pub async fn shutdown(&self) {
        let queued: Vec<Submission> = {
            let mut state = self.inner.lock_state();
            state.accepting = false;
            let queued: Vec<Submission> = state.queue.drain(..).collect();
            for submission in &queued {
                state.release(&submission.job);
            }
            queued
        };
        for submission in queued {
            self.inner.record_cancelled(submission).await;
        }
        self.inner.notify_if_idle();
        info!(running = self.running_jobs(), "Executor draining");
        self.wait_idle().await;
        info!("Executor stopped");
    }
}

fn cancelled_before_start<T>() -> Result<T> {
    Err(AppError::Cancelled("cancelled before start".to_string()))
}

impl State {
    fn ensure_accepting(&self) -> Result<()> {
        if self.accepting {
            Ok(())
        } else {
            Err(AppError::Busy("executor is shutting down".to_string()))
        }
    }

    fn release(&mut self, job: &Job) {
        self.running.remove(&job.id);
        match job.kind {
            JobKind::Backup => {
                if let Some(target_id) = &job.target_id {
                    self.busy_targets.remove(target_id);
                }
            }
            JobKind::Package => self.package_busy = false,
        }
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.queue.is_empty()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify_if_idle(&self) {
        if self.lock_state().is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Takes a running slot for `submission` or queues it. Returns the
    /// submission when it should be spawned once `state` is unlocked.
    fn place(&self, state: &mut State, submission: Submission) -> Option<Submission> {
        if state.running.len() < self.settings.max_parallel_jobs {
            state.running.insert(submission.job.id.clone());
            Some(submission)
        } else {
            debug!(job_id = %submission.job.id, queued = state.queue.len() + 1, "Executor full, job queued");
            state.queue.push_back(submission);
            None
        }
    }

    /// Writes the failed `cancelled` record of a job that never started.
    async fn record_cancelled(&self, submission: Submission) -> Job {
        let now = Utc::now();
        let job = submission.job;
        match submission.work {
            Work::Backup(target) => {
                let mut record = BackupRecord::running(&target.id, job.submitted_at);
                record.id = job.id.clone();
                record.finish(&cancelled_before_start(), now, Duration::ZERO);
                self.catalog.insert_backup(record).await;
            }
            Work::Package { settings, .. } => {
                let mut record = PackageRecord::running(settings.format, job.submitted_at);
                record.id = job.id.clone();
                record.finish(&cancelled_before_start(), now, Duration::ZERO);
                self.catalog.insert_package(record).await;
            }
        }
        self.observers.emit(Event {
            kind: EventKind::for_job(job.kind),
            record_id: job.id.clone(),
            target_id: job.target_id.clone(),
            status: RecordStatus::Failed,
            duration: None,
            size_bytes: None,
        });
        info!(job_id = %job.id, "Queued job cancelled");
        job
    }

    fn spawn(self: &Arc<Self>, submission: Submission) {
        let inner = self.clone();
        let span = info_span!(
            "job",
            job_id = %submission.job.id,
            kind = ?submission.job.kind,
            target_id = submission.job.target_id.as_deref().unwrap_or("-")
        );
        tokio::spawn(async move { inner.execute(submission).await }.instrument(span));
    }

    /// Frees the job's slots and starts queued jobs that now fit.
    fn finish_job(self: &Arc<Self>, job: &Job) {
        let ready = {
            let mut state = self.lock_state();
            state.release(job);
            let mut ready = Vec::new();
            while state.running.len() < self.settings.max_parallel_jobs {
                let Some(next) = state.queue.pop_front() else {
                    break;
                };
                state.running.insert(next.job.id.clone());
                ready.push(next);
            }
            ready
        };
        for submission in ready {
            self.spawn(submission);
        }
        self.notify_if_idle();
    }

    async fn execute(self: Arc<Self>, submission: Submission) {
        let Submission { job, work } = submission;
        match work {
            Work::Backup(target) => self.execute_backup(&job, target).await,
            Work::Package { targets, settings } => self.execute_package(&job, targets, settings).await,
        }
        self.finish_job(&job);
    }

    async fn execute_backup(self: &Arc<Self>, job: &Job, target: Target) {
        let started_at = Utc::now();
        let started = Instant::now();
        let plan = ArtifactPlan::for_backup(&target, started_at);
        let mut record = BackupRecord::running(&target.id, started_at);
        record.id = job.id.clone();
        self.catalog.insert_backup(record).await;
        info!(path = %plan.path, "Backup started");

        let runner = self.runner.clone();
        let job_target = target.clone();
        let job_plan = plan.clone();
        let outcome = self
            .guarded(async move { runner.run(&job_target, &job_plan).await })
            .await;
        if outcome.is_err() {
            self.discard(&plan).await;
        }

        let elapsed = started.elapsed();
        {
            let _guard = self.catalog.lock_group(&GroupKey::Target(target.id.clone())).await;
            self.catalog
                .update_backup(&job.id, |r| r.finish(&outcome, Utc::now(), elapsed))
                .await;
        }
        self.report(job, &outcome.as_ref().map(|a| a.size_bytes), elapsed);

        if outcome.is_ok() {
            let report = self.retention.enforce_target(&target).await;
            if !report.is_clean() {
                warn!(failures = report.failures.len(), "Retention after backup left records in place");
            }
        }
    }

    async fn execute_package(self: &Arc<Self>, job: &Job, targets: Vec<Target>, settings: PackageSettings) {
        let started_at = Utc::now();
        let started = Instant::now();
        let plan = ArtifactPlan::for_package(settings.format, started_at);
        let mut record = PackageRecord::running(settings.format, started_at);
        record.id = job.id.clone();
        self.catalog.insert_package(record).await;
        info!(path = %plan.path, "Package build started");

        let packager = self.packager.clone();
        let format = settings.format;
        let job_plan = plan.clone();
        let outcome = self
            .guarded(async move { packager.build(&targets, format, &job_plan).await })
            .await;
        if outcome.is_err() {
            self.discard(&plan).await;
        }

        let elapsed = started.elapsed();
        {
            let _guard = self.catalog.lock_group(&GroupKey::Packages).await;
            self.catalog
                .update_package(&job.id, |r| r.finish(&outcome, Utc::now(), elapsed))
                .await;
        }
        self.report(job, &outcome.as_ref().map(|b| b.artifact.size_bytes), elapsed);

        if outcome.is_ok() {
            let report = self.retention.enforce_packages(&settings.retention).await;
            if !report.is_clean() {
                warn!(failures = report.failures.len(), "Package retention left records in place");
            }
        }
    }

    /// Runs `work` on its own task under the job timeout. A timeout aborts the
    /// task, which drops (and kills) any child process it owns. A panic
    /// becomes an `Internal` error.
    async fn guarded<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let mut handle = tokio::spawn(work);
        match tokio::time::timeout(self.settings.job_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => {
                error!("Job panicked");
                Err(AppError::Internal("job panicked".to_string()))
            }
            Ok(Err(join_error)) => Err(AppError::Internal(join_error.to_string())),
            Err(_) => {
                handle.abort();
                let _ = handle.await;
                warn!(timeout_secs = self.settings.job_timeout.as_secs(), "Job timed out");
                Err(AppError::Timeout(self.settings.job_timeout))
            }
        }
    }

    /// Removes whatever a failed job left at its planned path, staging files included.
    async fn discard(&self, plan: &ArtifactPlan) {
        if let Err(e) = self.storage.discard(&plan.path).await {
            warn!(path = %plan.path, error = %e, "Failed to discard partial artifact");
        }
    }

    fn report<E>(&self, job: &Job, outcome: &std::result::Result<u64, E>, elapsed: Duration)
    where
        E: std::fmt::Display,
    {
        let (status, size_bytes) = match outcome {
            Ok(size) => (RecordStatus::Completed, Some(*size)),
            Err(e) => {
                warn!(error = %e, "Job failed");
                (RecordStatus::Failed, None)
            }
        };
        self.observers.emit(Event {
            kind: EventKind::for_job(job.kind),
            record_id: job.id.clone(),
            target_id: job.target_id.clone(),
            status,
            duration: Some(elapsed),
            size_bytes,
        });
    }
}
