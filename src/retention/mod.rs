// dbvault/src/retention/mod.rs
//! Dual age/count retention for backup and package records.
//!
//! Order is fixed: the age pass runs first, then the count pass trims the
//! survivors down to the oldest-first excess. Only `completed` records are
//! ever considered, and the newest completed record of a group always stays.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, GroupKey};
use crate::errors::{AppError, Result};
use crate::model::{
    BackupRecord, FailureDetail, PackageRecord, RecordStatus, Retainable, RetentionPolicy, Target,
};
use crate::observer::{Event, EventKind, ObserverSet};
use crate::storage::StorageBackend;

/// Returns the ids of the records `policy` removes, oldest first.
///
/// # Arguments
/// * `records` - Any records of one group; non-completed ones are ignored.
/// * `policy` - Age and count limits; `None` on an axis disables that pass.
/// * `now` - Reference instant for the age pass.
pub fn plan<R: Retainable>(records: &[R], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<String> {
    let mut completed: Vec<&R> = records
        .iter()
        .filter(|r| r.status() == RecordStatus::Completed)
        .collect();
    completed.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.record_id().cmp(b.record_id()))
    });
    let Some(newest) = completed.len().checked_sub(1) else {
        return Vec::new();
    };

    let mut victims = Vec::new();
    let mut survivors = Vec::with_capacity(completed.len());
    match policy.max_age_days {
        Some(days) => {
            let cutoff = now - ChronoDuration::days(i64::from(days));
            for (index, record) in completed.into_iter().enumerate() {
                if index != newest && record.created_at() < cutoff {
                    victims.push(record.record_id().to_string());
                } else {
                    survivors.push(record);
                }
            }
        }
        None => survivors = completed,
    }

    if let Some(max_count) = policy.max_count {
        let excess = survivors.len().saturating_sub(max_count.max(1));
        victims.extend(survivors[..excess].iter().map(|r| r.record_id().to_string()));
    }
    victims
}

/// A record whose artifact could not be deleted. The record was kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionFailure {
    pub record_id: String,
    pub storage_path: Option<String>,
    pub error: FailureDetail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub group: GroupKey,
    pub deleted: Vec<String>,
    pub failures: Vec<RetentionFailure>,
}

impl RetentionReport {
    fn empty(group: GroupKey) -> Self {
        Self {
            group,
            deleted: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Victim {
    record_id: String,
    storage_path: Option<String>,
}

fn victims_of<R: Retainable>(records: &[R], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<Victim> {
    plan(records, policy, now)
        .into_iter()
        .filter_map(|id| {
            records.iter().find(|r| r.record_id() == id).map(|r| Victim {
                record_id: id,
                storage_path: r.storage_path().map(str::to_string),
            })
        })
        .collect()
}

fn backup_deleted(record: &BackupRecord) -> Event {
    Event {
        kind: EventKind::BackupDeleted,
        record_id: record.id.clone(),
        target_id: Some(record.target_id.clone()),
        status: record.status,
        duration: None,
        size_bytes: record.size_bytes,
    }
}

fn package_deleted(record: &PackageRecord) -> Event {
    Event {
        kind: EventKind::PackageDeleted,
        record_id: record.id.clone(),
        target_id: None,
        status: record.status,
        duration: None,
        size_bytes: record.size_bytes,
    }
}

/// Applies retention policies and explicit deletions against the catalog and
/// the storage backend.
#[derive(Clone)]
pub struct RetentionEnforcer {
    catalog: Arc<Catalog>,
    storage: Arc<dyn StorageBackend>,
    observers: ObserverSet,
}

impl RetentionEnforcer {
    pub fn new(catalog: Arc<Catalog>, storage: Arc<dyn StorageBackend>, observers: ObserverSet) -> Self {
        Self {
            catalog,
            storage,
            observers,
        }
    }

    /// Prunes one target's completed backups under its own policy.
    pub async fn enforce_target(&self, target: &Target) -> RetentionReport {
        self.enforce(GroupKey::Target(target.id.clone()), &target.retention)
            .await
    }

    /// Prunes completed packages under the package group's policy.
    pub async fn enforce_packages(&self, policy: &RetentionPolicy) -> RetentionReport {
        self.enforce(GroupKey::Packages, policy).await
    }

    /// Runs every target's policy and then the package policy.
    pub async fn sweep_all(&self, targets: &[Target], package_policy: &RetentionPolicy) -> Vec<RetentionReport> {
        let mut reports = Vec::with_capacity(targets.len() + 1);
        for target in targets {
            reports.push(self.enforce_target(target).await);
        }
        reports.push(self.enforce_packages(package_policy).await);
        let deleted: usize = reports.iter().map(|r| r.deleted.len()).sum();
        let failed: usize = reports.iter().map(|r| r.failures.len()).sum();
        info!(deleted, failed, "Retention sweep finished");
        reports
    }

    async fn enforce(&self, group: GroupKey, policy: &RetentionPolicy) -> RetentionReport {
        let mut report = RetentionReport::empty(group.clone());
        if policy.is_unbounded() {
            return report;
        }

        let victims = {
            let _guard = self.catalog.lock_group(&group).await;
            let now = Utc::now();
            match &group {
                GroupKey::Target(target_id) => {
                    victims_of(&self.catalog.completed_backups(target_id).await, policy, now)
                }
                GroupKey::Packages => victims_of(&self.catalog.completed_packages().await, policy, now),
            }
        };
        if victims.is_empty() {
            debug!(group = ?group, "Nothing to prune");
            return report;
        }

        // Storage calls happen without the group lock.
        let mut removable = Vec::with_capacity(victims.len());
        for victim in victims {
            match self.delete_artifact(victim.storage_path.as_deref()).await {
                Ok(()) => removable.push(victim.record_id),
                Err(e) => {
                    warn!(group = ?group, record_id = %victim.record_id, error = %e, "Failed to delete artifact, keeping record");
                    report.failures.push(RetentionFailure {
                        record_id: victim.record_id,
                        storage_path: victim.storage_path,
                        error: FailureDetail::from(&e),
                    });
                }
            }
        }

        {
            let _guard = self.catalog.lock_group(&group).await;
            match &group {
                GroupKey::Target(_) => {
                    for record in self.catalog.remove_backups(&removable).await {
                        self.observers.emit(backup_deleted(&record));
                        report.deleted.push(record.id);
                    }
                }
                GroupKey::Packages => {
                    for record in self.catalog.remove_packages(&removable).await {
                        self.observers.emit(package_deleted(&record));
                        report.deleted.push(record.id);
                    }
                }
            }
        }
        info!(group = ?group, deleted = report.deleted.len(), failed = report.failures.len(), "Retention applied");
        report
    }

    async fn delete_artifact(&self, path: Option<&str>) -> Result<()> {
        match path {
            Some(path) => self.storage.delete(path).await,
            None => Ok(()),
        }
    }

    /// Deletes one backup record and its artifact. Running records are refused.
    pub async fn delete_backup(&self, id: &str) -> Result<BackupRecord> {
        let record = self
            .catalog
            .get_backup(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("backup record {}", id)))?;
        if record.status == RecordStatus::Running {
            return Err(AppError::Busy(format!("backup {} is still running", id)));
        }
        self.delete_artifact(record.storage_path.as_deref()).await?;

        let group = GroupKey::Target(record.target_id.clone());
        let _guard = self.catalog.lock_group(&group).await;
        let removed = self
            .catalog
            .remove_backups(&[id.to_string()])
            .await
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("backup record {}", id)))?;
        self.observers.emit(backup_deleted(&removed));
        info!(record_id = %id, target_id = %removed.target_id, "Backup deleted");
        Ok(removed)
    }

    /// Deletes one package record and its archive. Running records are refused.
    pub async fn delete_package(&self, id: &str) -> Result<PackageRecord> {
        let record = self
            .catalog
            .get_package(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("package record {}", id)))?;
        if record.status == RecordStatus::Running {
            return Err(AppError::Busy(format!("package {} is still being built", id)));
        }
        self.delete_artifact(record.storage_path.as_deref()).await?;

        let _guard = self.catalog.lock_group(&GroupKey::Packages).await;
        let removed = self
            .catalog
            .remove_packages(&[id.to_string()])
            .await
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("package record {}", id)))?;
        self.observers.emit(package_deleted(&removed));
        info!(record_id = %id, "Package deleted");
        Ok(removed)
    }

    /// Deletes every finished package, oldest first. Stops at the first storage
    /// failure; that record and the ones after it are kept.
    pub async fn delete_all_packages(&self) -> RetentionReport {
        let mut report = RetentionReport::empty(GroupKey::Packages);
        let mut packages: Vec<PackageRecord> = self
            .catalog
            .list_packages()
            .await
            .into_iter()
            .filter(|p| p.status != RecordStatus::Running)
            .collect();
        packages.reverse();

        for package in packages {
            match self.delete_package(&package.id).await {
                Ok(removed) => report.deleted.push(removed.id),
                Err(AppError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(record_id = %package.id, error = %e, "Bulk package delete stopped");
                    report.failures.push(RetentionFailure {
                        record_id: package.id,
                        storage_path: package.storage_path,
                        error: FailureDetail::from(&e),
                    });
                    break;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Artifact, PackageFormat};
    use crate::storage::LocalStorage;
    use async_trait::async_trait;
    use std::time::Duration;

    fn completed(target: &str, created: DateTime<Utc>) -> BackupRecord {
        let mut record = BackupRecord::running(target, created);
        let stamp = created.timestamp_millis();
        record.finish(
            &Ok(Artifact {
                path: format!("backups/{}/{}.dump", target, stamp),
                size_bytes: 8,
                checksum: "00".repeat(32),
            }),
            created,
            Duration::ZERO,
        );
        record
    }

    fn days_ago(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
        now - ChronoDuration::days(days)
    }

    #[test]
    fn age_then_count_keeps_most_recent() {
        let now = Utc::now();
        // created on relative days 1, 3, 5 and 9; "now" is day 9
        let records: Vec<BackupRecord> = [8, 6, 4, 0]
            .iter()
            .map(|d| completed("t1", days_ago(now, *d)))
            .collect();
        let policy = RetentionPolicy::new(Some(7), Some(3)).unwrap();

        let victims = plan(&records, &policy, now);
        assert_eq!(victims, vec![records[0].id.clone()]);

        let survivors: Vec<BackupRecord> = records
            .iter()
            .filter(|r| !victims.contains(&r.id))
            .cloned()
            .collect();
        assert!(plan(&survivors, &policy, now).is_empty());
    }

    #[test]
    fn count_pass_trims_oldest_survivors() {
        let now = Utc::now();
        let records: Vec<BackupRecord> = (0..6).map(|d| completed("t1", days_ago(now, d))).collect();
        let policy = RetentionPolicy::new(Some(4), Some(2)).unwrap();
        // day 5 is older than 4 days; of the rest (4,3,2,1,0) only 1 and 0 remain
        let mut victims = plan(&records, &policy, now);
        victims.sort();
        let mut expected: Vec<String> = records[2..].iter().map(|r| r.id.clone()).collect();
        expected.sort();
        assert_eq!(victims, expected);
    }

    #[test]
    fn running_and_failed_records_are_never_victims() {
        let now = Utc::now();
        let mut records = vec![completed("t1", days_ago(now, 1))];
        records.push(BackupRecord::running("t1", days_ago(now, 30)));
        let mut failed = BackupRecord::running("t1", days_ago(now, 40));
        failed.finish(&Err(AppError::Connection("refused".into())), now, Duration::ZERO);
        records.push(failed);

        let policy = RetentionPolicy::new(Some(1), Some(1)).unwrap();
        assert!(plan(&records, &policy, now).is_empty());
    }

    #[test]
    fn newest_record_survives_even_when_expired() {
        let now = Utc::now();
        let records = vec![completed("t1", days_ago(now, 20)), completed("t1", days_ago(now, 10))];
        let policy = RetentionPolicy::new(Some(7), None).unwrap();
        assert_eq!(plan(&records, &policy, now), vec![records[0].id.clone()]);
    }

    /// Local storage whose deletes fail for paths containing `poison`.
    struct FailingDeletes {
        inner: LocalStorage,
        poison: String,
    }

    #[async_trait]
    impl StorageBackend for FailingDeletes {
        async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
            self.inner.put(path, bytes).await
        }
        async fn get(&self, path: &str) -> Result<Vec<u8>> {
            self.inner.get(path).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }
        async fn delete(&self, path: &str) -> Result<()> {
            if path.contains(&self.poison) {
                return Err(AppError::Storage(format!("permission denied: {}", path)));
            }
            self.inner.delete(path).await
        }
    }

    async fn seed(catalog: &Catalog, storage: &dyn StorageBackend, record: BackupRecord) -> anyhow::Result<()> {
        if let Some(path) = &record.storage_path {
            storage.put(path, b"dump".to_vec()).await?;
        }
        catalog.insert_backup(record).await;
        Ok(())
    }

    fn target(policy: RetentionPolicy) -> Target {
        Target {
            id: "t1".into(),
            name: "t1".into(),
            engine: crate::model::Engine::Postgres,
            connection: crate::model::ConnectionParams {
                host: "localhost".into(),
                port: 5432,
                username: "u".into(),
                password: "p".into(),
                database_name: "app".into(),
            },
            schedule: None,
            retention: policy,
            compression: crate::model::Compression::None,
            package: false,
        }
    }

    #[tokio::test]
    async fn failed_artifact_delete_keeps_record() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let now = Utc::now();
        let oldest = completed("t1", days_ago(now, 3));
        let middle = completed("t1", days_ago(now, 2));
        let newest = completed("t1", days_ago(now, 1));

        let poison = oldest.storage_path.clone().unwrap_or_default();
        let storage = Arc::new(FailingDeletes {
            inner: LocalStorage::new(dir.path()),
            poison,
        });
        let catalog = Arc::new(Catalog::in_memory());
        for record in [oldest.clone(), middle.clone(), newest.clone()] {
            seed(&catalog, storage.as_ref(), record).await?;
        }

        let enforcer = RetentionEnforcer::new(catalog.clone(), storage.clone(), ObserverSet::new());
        let report = enforcer
            .enforce_target(&target(RetentionPolicy::new(None, Some(1))?))
            .await;

        assert_eq!(report.deleted, vec![middle.id.clone()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].record_id, oldest.id);
        assert!(catalog.get_backup(&oldest.id).await.is_some());
        assert!(catalog.get_backup(&middle.id).await.is_none());
        assert!(storage.get(middle.storage_path.as_deref().unwrap_or_default()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn sweep_twice_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let now = Utc::now();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let catalog = Arc::new(Catalog::in_memory());
        for days in [10, 6, 4, 2, 0] {
            seed(&catalog, storage.as_ref(), completed("t1", days_ago(now, days))).await?;
        }
        let enforcer = RetentionEnforcer::new(catalog.clone(), storage.clone(), ObserverSet::new());
        let target = target(RetentionPolicy::new(Some(7), Some(3))?);

        let first = enforcer.enforce_target(&target).await;
        assert_eq!(first.deleted.len(), 2);
        let second = enforcer.enforce_target(&target).await;
        assert!(second.deleted.is_empty() && second.is_clean());
        assert_eq!(catalog.completed_backups("t1").await.len(), 3);
        assert_eq!(storage.list("backups/t1/").await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn explicit_delete_refuses_running_record() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let catalog = Arc::new(Catalog::in_memory());
        let running = BackupRecord::running("t1", Utc::now());
        let running_id = running.id.clone();
        catalog.insert_backup(running).await;
        let enforcer = RetentionEnforcer::new(catalog.clone(), storage, ObserverSet::new());

        assert!(matches!(enforcer.delete_backup(&running_id).await, Err(AppError::Busy(_))));
        assert!(matches!(enforcer.delete_backup("bkp_nope").await, Err(AppError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn delete_all_packages_removes_finished_ones() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let catalog = Arc::new(Catalog::in_memory());
        for minutes in [3, 2] {
            let at = Utc::now() - ChronoDuration::minutes(minutes);
            let mut record = PackageRecord::running(PackageFormat::Zip, at);
            let path = format!("packages/package_{}.zip", minutes);
            storage.put(&path, b"PK".to_vec()).await?;
            record.finish(
                &Ok(crate::model::PackageBuild {
                    artifact: Artifact {
                        path,
                        size_bytes: 2,
                        checksum: "00".repeat(32),
                    },
                    sources: vec![],
                    skipped_targets: vec![],
                }),
                at,
                Duration::ZERO,
            );
            catalog.insert_package(record).await;
        }
        catalog
            .insert_package(PackageRecord::running(PackageFormat::Zip, Utc::now()))
            .await;

        let enforcer = RetentionEnforcer::new(catalog.clone(), storage.clone(), ObserverSet::new());
        let report = enforcer.delete_all_packages().await;
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(catalog.list_packages().await.len(), 1);
        assert!(storage.list("packages/").await?.is_empty());
        Ok(())
    }
}
