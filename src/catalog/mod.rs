// dbvault/src/catalog/mod.rs
//! Backup and package records, with per-group locks.
//!
//! A group is one Target's record set, or the package group. Retention holds a
//! group lock while it reads or commits a record set; job completion and
//! packaging reads take the same lock, so nobody observes a half-pruned set.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{info, warn};

use crate::errors::{AppError, Result};
use crate::model::{BackupRecord, PackageRecord, RecordStatus, TargetId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Target(TargetId),
    Packages,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    backups: Vec<BackupRecord>,
    packages: Vec<PackageRecord>,
}

#[derive(Debug, Default)]
struct Records {
    backups: HashMap<String, BackupRecord>,
    packages: HashMap<String, PackageRecord>,
}

#[derive(Debug, Default)]
pub struct Catalog {
    records: RwLock<Records>,
    groups: Mutex<HashMap<GroupKey, Arc<tokio::sync::Mutex<()>>>>,
    state_file: Option<PathBuf>,
}

fn interrupted<T>() -> Result<T> {
    Err(AppError::Cancelled("interrupted by process restart".to_string()))
}

fn newest_first<T, F: Fn(&T) -> (chrono::DateTime<Utc>, &str)>(items: &mut [T], key: F) {
    items.sort_by(|a, b| {
        let (ta, ia) = key(a);
        let (tb, ib) = key(b);
        tb.cmp(&ta).then_with(|| ib.cmp(ia))
    });
}

impl Catalog {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads records from `state_file` (if it exists) and keeps it updated.
    ///
    /// Records still `running` in the file belonged to a process that died
    /// mid-job; they are finalized as failed.
    pub async fn open(state_file: &Path) -> Result<Self> {
        let mut records = Records::default();
        match tokio::fs::read(state_file).await {
            Ok(content) => {
                let snapshot: Snapshot = serde_json::from_slice(&content)?;
                let now = Utc::now();
                for mut backup in snapshot.backups {
                    backup.finish(&interrupted(), now, Duration::ZERO);
                    records.backups.insert(backup.id.clone(), backup);
                }
                for mut package in snapshot.packages {
                    package.finish(&interrupted(), now, Duration::ZERO);
                    records.packages.insert(package.id.clone(), package);
                }
                info!(
                    path = %state_file.display(),
                    backups = records.backups.len(),
                    packages = records.packages.len(),
                    "Loaded record catalog"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %state_file.display(), "No record catalog yet, starting empty");
            }
            Err(e) => return Err(AppError::Io(e)),
        }

        Ok(Self {
            records: RwLock::new(records),
            groups: Mutex::new(HashMap::new()),
            state_file: Some(state_file.to_path_buf()),
        })
    }

    /// Exclusive access to one group's record set.
    pub async fn lock_group(&self, key: &GroupKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut groups = match self.groups.lock() {
                Ok(groups) => groups,
                Err(poisoned) => poisoned.into_inner(),
            };
            groups.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn persist(&self, records: &Records) {
        let Some(path) = &self.state_file else {
            return;
        };
        let snapshot = Snapshot {
            backups: records.backups.values().cloned().collect(),
            packages: records.packages.values().cloned().collect(),
        };
        let result = async {
            let content = serde_json::to_vec_pretty(&snapshot)?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let staging = path.with_extension("json.tmp");
            tokio::fs::write(&staging, content).await?;
            tokio::fs::rename(&staging, path).await?;
            Ok::<_, AppError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to persist record catalog");
        }
    }

    pub async fn insert_backup(&self, record: BackupRecord) {
        let mut records = self.records.write().await;
        records.backups.insert(record.id.clone(), record);
        self.persist(&records).await;
    }

    /// Applies `f` to the record and returns its result, or `None` if unknown.
    pub async fn update_backup<T>(&self, id: &str, f: impl FnOnce(&mut BackupRecord) -> T) -> Option<T> {
        let mut records = self.records.write().await;
        let result = records.backups.get_mut(id).map(f);
        if result.is_some() {
            self.persist(&records).await;
        }
        result
    }

    pub async fn get_backup(&self, id: &str) -> Option<BackupRecord> {
        self.records.read().await.backups.get(id).cloned()
    }

    /// All backup records, optionally for one target, newest first.
    pub async fn list_backups(&self, target_id: Option<&str>) -> Vec<BackupRecord> {
        let records = self.records.read().await;
        let mut list: Vec<BackupRecord> = records
            .backups
            .values()
            .filter(|r| target_id.is_none_or(|t| r.target_id == t))
            .cloned()
            .collect();
        newest_first(&mut list, |r| (r.created_at, r.id.as_str()));
        list
    }

    /// Completed backups of one target, newest first.
    pub async fn completed_backups(&self, target_id: &str) -> Vec<BackupRecord> {
        self.list_backups(Some(target_id))
            .await
            .into_iter()
            .filter(|r| r.status == RecordStatus::Completed)
            .collect()
    }

    pub async fn latest_completed_backup(&self, target_id: &str) -> Option<BackupRecord> {
        self.completed_backups(target_id).await.into_iter().next()
    }

    /// Removes the given records in one step and returns the ones that existed.
    pub async fn remove_backups(&self, ids: &[String]) -> Vec<BackupRecord> {
        let mut records = self.records.write().await;
        let removed: Vec<BackupRecord> = ids
            .iter()
            .filter_map(|id| records.backups.remove(id))
            .collect();
        if !removed.is_empty() {
            self.persist(&records).await;
        }
        removed
    }

    pub async fn insert_package(&self, record: PackageRecord) {
        let mut records = self.records.write().await;
        records.packages.insert(record.id.clone(), record);
        self.persist(&records).await;
    }

    pub async fn update_package<T>(&self, id: &str, f: impl FnOnce(&mut PackageRecord) -> T) -> Option<T> {
        let mut records = self.records.write().await;
        let result = records.packages.get_mut(id).map(f);
        if result.is_some() {
            self.persist(&records).await;
        }
        result
    }

    pub async fn get_package(&self, id: &str) -> Option<PackageRecord> {
        self.records.read().await.packages.get(id).cloned()
    }

    /// All package records, newest first.
    pub async fn list_packages(&self) -> Vec<PackageRecord> {
        let records = self.records.read().await;
        let mut list: Vec<PackageRecord> = records.packages.values().cloned().collect();
        newest_first(&mut list, |r| (r.created_at, r.id.as_str()));
        list
    }

    pub async fn completed_packages(&self) -> Vec<PackageRecord> {
        self.list_packages()
            .await
            .into_iter()
            .filter(|r| r.status == RecordStatus::Completed)
            .collect()
    }

    pub async fn remove_packages(&self, ids: &[String]) -> Vec<PackageRecord> {
        let mut records = self.records.write().await;
        let removed: Vec<PackageRecord> = ids
            .iter()
            .filter_map(|id| records.packages.remove(id))
            .collect();
        if !removed.is_empty() {
            self.persist(&records).await;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Artifact;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    fn completed(target: &str, days_ago: i64) -> BackupRecord {
        let created = Utc::now() - ChronoDuration::days(days_ago);
        let mut record = BackupRecord::running(target, created);
        record.finish(
            &Ok(Artifact {
                path: format!("backups/{}/{}.dump", target, days_ago),
                size_bytes: 1,
                checksum: "00".repeat(32),
            }),
            created,
            Duration::ZERO,
        );
        record
    }

    #[tokio::test]
    async fn lists_newest_first_and_filters_by_target() {
        let catalog = Catalog::in_memory();
        catalog.insert_backup(completed("t1", 5)).await;
        catalog.insert_backup(completed("t1", 1)).await;
        catalog.insert_backup(completed("t2", 3)).await;
        catalog.insert_backup(BackupRecord::running("t1", Utc::now())).await;

        let t1 = catalog.list_backups(Some("t1")).await;
        assert_eq!(t1.len(), 3);
        assert_eq!(t1[0].status, RecordStatus::Running);

        let done = catalog.completed_backups("t1").await;
        assert_eq!(done.len(), 2);
        assert!(done[0].created_at > done[1].created_at);
        assert_eq!(t1.iter().filter(|r| r.status == RecordStatus::Running).count(), 1);
        assert_eq!(catalog.list_backups(None).await.len(), 4);
    }

    #[tokio::test]
    async fn state_file_round_trips_and_fails_interrupted_jobs() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state").join("catalog.json");
        {
            let catalog = Catalog::open(&path).await?;
            catalog.insert_backup(completed("t1", 2)).await;
            catalog.insert_backup(BackupRecord::running("t1", Utc::now())).await;
        }

        let reopened = Catalog::open(&path).await?;
        let records = reopened.list_backups(Some("t1")).await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status != RecordStatus::Running));
        let interrupted = records
            .iter()
            .find(|r| r.status == RecordStatus::Failed)
            .and_then(|r| r.error.clone());
        assert!(interrupted.is_some_and(|e| e.message.contains("restart")));
        Ok(())
    }

    #[tokio::test]
    async fn remove_backups_returns_only_existing() {
        let catalog = Catalog::in_memory();
        let record = completed("t1", 1);
        let id = record.id.clone();
        catalog.insert_backup(record).await;
        let removed = catalog
            .remove_backups(&[id.clone(), "bkp_missing".to_string()])
            .await;
        assert_eq!(removed.len(), 1);
        assert!(catalog.get_backup(&id).await.is_none());
    }
}
