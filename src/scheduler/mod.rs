// dbvault/src/scheduler/mod.rs
pub mod cron;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use crate::errors::{AppError, Result};
use crate::model::TargetId;

pub use cron::{CronExpr, CronField};

/// Something that runs on a cron schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScheduleKey {
    Target(TargetId),
    Package,
    RetentionSweep,
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleKey::Target(id) => write!(f, "target:{}", id),
            ScheduleKey::Package => f.write_str("package"),
            ScheduleKey::RetentionSweep => f.write_str("retention-sweep"),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    expr: CronExpr,
    /// Instants at or before this point are never fired.
    checked_until: DateTime<Utc>,
}

/// Cron bookkeeping. Pure state: the caller supplies `now` and acts on what
/// [`Scheduler::due`] returns.
///
/// Every due instant fires once. Instants that passed while the process was
/// down, or before an entry was registered, are skipped; several instants
/// missed between two ticks collapse into one firing.
#[derive(Debug, Default)]
pub struct Scheduler {
    entries: BTreeMap<ScheduleKey, Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the schedule for `key`, effective from `now`.
    /// Re-registering the same expression keeps the entry's state.
    pub fn register(&mut self, key: ScheduleKey, expr: &str, now: DateTime<Utc>) -> Result<()> {
        let expr = CronExpr::parse(expr)?;
        if expr.next_after(now).is_none() {
            return Err(AppError::Configuration(format!(
                "cron expression '{}' for {} never fires",
                expr, key
            )));
        }
        if let Some(existing) = self.entries.get(&key) {
            if existing.expr.source() == expr.source() {
                return Ok(());
            }
        }
        info!(schedule = %key, cron = %expr, next = ?expr.next_after(now), "Schedule registered");
        self.entries.insert(
            key,
            Entry {
                expr,
                checked_until: now,
            },
        );
        Ok(())
    }

    /// Returns whether an entry was removed. Jobs already submitted keep running.
    pub fn unregister(&mut self, key: &ScheduleKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            info!(schedule = %key, "Schedule removed");
        }
        removed
    }

    /// Keys whose next instant after the last evaluation has arrived by `now`.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<ScheduleKey> {
        let mut due = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if now <= entry.checked_until {
                continue;
            }
            if let Some(next) = entry.expr.next_after(entry.checked_until) {
                if next <= now {
                    debug!(schedule = %key, instant = %next, "Schedule due");
                    due.push(key.clone());
                }
            }
            entry.checked_until = now;
        }
        due
    }

    pub fn next_fire(&self, key: &ScheduleKey) -> Option<DateTime<Utc>> {
        self.entries
            .get(key)
            .and_then(|e| e.expr.next_after(e.checked_until))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
