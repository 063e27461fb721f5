// dbvault/src/observer/mod.rs
//! Passive observers for job completions and retention deletions.
//!
//! Observers are called synchronously and cannot fail; a sink that needs I/O
//! should hand the event off to its own task.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::model::{JobKind, RecordStatus, TargetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BackupFinished,
    PackageFinished,
    BackupDeleted,
    PackageDeleted,
}

impl EventKind {
    pub fn for_job(kind: JobKind) -> Self {
        match kind {
            JobKind::Backup => EventKind::BackupFinished,
            JobKind::Package => EventKind::PackageFinished,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub record_id: String,
    pub target_id: Option<TargetId>,
    pub status: RecordStatus,
    pub duration: Option<Duration>,
    pub size_bytes: Option<u64>,
}

pub trait Observer: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Fan-out to every registered observer.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn Observer>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn emit(&self, event: Event) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &Event) {
        let target_id = event.target_id.as_deref().unwrap_or("-");
        let duration_ms = event.duration.map(|d| d.as_millis() as u64);
        match event.status {
            RecordStatus::Failed => warn!(
                kind = ?event.kind,
                record_id = %event.record_id,
                target_id,
                duration_ms,
                "job failed"
            ),
            _ => info!(
                kind = ?event.kind,
                record_id = %event.record_id,
                target_id,
                status = event.status.as_str(),
                duration_ms,
                size_bytes = event.size_bytes,
                "event"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetStats {
    pub completed: u64,
    pub failed: u64,
    pub deleted: u64,
    pub last_size_bytes: Option<u64>,
    pub last_duration: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub targets: HashMap<TargetId, TargetStats>,
    pub packages_total: u64,
    pub packages_size_bytes: u64,
    pub packages_failed: u64,
}

/// In-process counters per target plus package totals.
#[derive(Debug, Default)]
pub struct StatsObserver {
    stats: Mutex<Stats>,
}

impl StatsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Stats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Observer for StatsObserver {
    fn on_event(&self, event: &Event) {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        match event.kind {
            EventKind::BackupFinished | EventKind::BackupDeleted => {
                let Some(target_id) = &event.target_id else {
                    return;
                };
                let entry = stats.targets.entry(target_id.clone()).or_default();
                match (event.kind, event.status) {
                    (EventKind::BackupDeleted, _) => entry.deleted += 1,
                    (_, RecordStatus::Completed) => {
                        entry.completed += 1;
                        entry.last_size_bytes = event.size_bytes;
                        entry.last_duration = event.duration;
                    }
                    (_, RecordStatus::Failed) => {
                        entry.failed += 1;
                        entry.last_duration = event.duration;
                    }
                    (_, RecordStatus::Running) => {}
                }
            }
            EventKind::PackageFinished => match event.status {
                RecordStatus::Completed => {
                    stats.packages_total += 1;
                    stats.packages_size_bytes += event.size_bytes.unwrap_or(0);
                }
                RecordStatus::Failed => stats.packages_failed += 1,
                RecordStatus::Running => {}
            },
            EventKind::PackageDeleted => {
                stats.packages_total = stats.packages_total.saturating_sub(1);
                stats.packages_size_bytes = stats
                    .packages_size_bytes
                    .saturating_sub(event.size_bytes.unwrap_or(0));
            }
        }
    }
}
