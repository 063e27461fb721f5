// dbvault/src/lib.rs
//! Scheduled database backups with bounded concurrency, retention and
//! packaging.
//!
//! [`service::BackupService`] is the entry point: it owns the registered
//! targets and the cron scheduler, and hands work to the
//! [`executor::BoundedExecutor`], which runs backups through a
//! [`backup::BackupRunner`], builds packages and applies retention after each
//! successful job.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod executor;
pub mod model;
pub mod observer;
pub mod packager;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod utils;

pub use backup::{ArtifactPlan, BackupRunner, DumpRunner};
pub use catalog::Catalog;
pub use config::AppConfig;
pub use errors::{AppError, ErrorKind, Result};
pub use executor::BoundedExecutor;
pub use model::{
    BackupRecord, Engine, Job, JobKind, PackageFormat, PackageRecord, RecordStatus, Target,
};
pub use retention::{RetentionEnforcer, RetentionReport};
pub use service::BackupService;
pub use storage::StorageBackend;
