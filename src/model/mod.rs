// dbvault/src/model/mod.rs
//! Targets, records and jobs shared by every part of the orchestration core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{AppError, ErrorKind, Result};

pub type TargetId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Engine {
    #[serde(rename = "postgres")]
    Postgres,
    #[serde(rename = "mongodb")]
    MongoDb,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::MongoDb => "mongodb",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Engine::Postgres),
            "mongodb" | "mongo" => Ok(Engine::MongoDb),
            other => Err(AppError::Configuration(format!(
                "Unsupported database engine: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl FromStr for Compression {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            other => Err(AppError::Configuration(format!(
                "Unsupported compression mode: {}",
                other
            ))),
        }
    }
}

/// Archive container for packages. Chosen per package group, never per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PackageFormat {
    #[default]
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz")]
    TarGz,
}

impl PackageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PackageFormat::Zip => "zip",
            PackageFormat::TarGz => "tar.gz",
        }
    }
}

impl FromStr for PackageFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zip" => Ok(PackageFormat::Zip),
            "tar.gz" | "tgz" => Ok(PackageFormat::TarGz),
            other => Err(AppError::Configuration(format!(
                "Unsupported package format: {}",
                other
            ))),
        }
    }
}

/// Fully-resolved connection parameters. `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database_name: String,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database_name", &self.database_name)
            .finish()
    }
}

/// Dual age/count retention. `None` on an axis means no limit on that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_age_days: Option<u32>,
    pub max_count: Option<usize>,
}

impl RetentionPolicy {
    pub fn new(max_age_days: Option<u32>, max_count: Option<usize>) -> Result<Self> {
        if max_count == Some(0) {
            return Err(AppError::Configuration(
                "max count must be at least 1 when set".to_string(),
            ));
        }
        Ok(Self {
            max_age_days,
            max_count,
        })
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_age_days.is_none() && self.max_count.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub engine: Engine,
    pub connection: ConnectionParams,
    pub schedule: Option<String>,
    pub retention: RetentionPolicy,
    pub compression: Compression,
    pub package: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Running,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Running => "running",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }
}

/// Structured error detail attached to a failed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&AppError> for FailureDetail {
    fn from(err: &AppError) -> Self {
        FailureDetail {
            kind: err.kind(),
            message: err.to_string(),
            hint: err.hint().map(str::to_string),
        }
    }
}

/// A stored, verified artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub size_bytes: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub target_id: TargetId,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RecordStatus,
    pub storage_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub duration_ms: Option<u64>,
    pub error: Option<FailureDetail>,
}

impl BackupRecord {
    pub fn running(target_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: format!("bkp_{}", Uuid::new_v4().simple()),
            target_id: target_id.to_string(),
            created_at,
            finished_at: None,
            status: RecordStatus::Running,
            storage_path: None,
            size_bytes: None,
            checksum: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Moves a running record to its terminal state. Returns `false` if the
    /// record had already been finalized, in which case nothing changes.
    pub fn finish(
        &mut self,
        outcome: &Result<Artifact>,
        finished_at: DateTime<Utc>,
        duration: Duration,
    ) -> bool {
        if self.status != RecordStatus::Running {
            return false;
        }
        self.finished_at = Some(finished_at);
        self.duration_ms = Some(duration.as_millis() as u64);
        match outcome {
            Ok(artifact) => {
                self.status = RecordStatus::Completed;
                self.storage_path = Some(artifact.path.clone());
                self.size_bytes = Some(artifact.size_bytes);
                self.checksum = Some(artifact.checksum.clone());
            }
            Err(err) => {
                self.status = RecordStatus::Failed;
                self.error = Some(FailureDetail::from(err));
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RecordStatus,
    pub format: PackageFormat,
    pub storage_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub duration_ms: Option<u64>,
    /// Backup record ids bundled into the archive.
    pub sources: Vec<String>,
    /// Eligible targets that had nothing to contribute.
    pub skipped_targets: Vec<TargetId>,
    pub error: Option<FailureDetail>,
}

/// What a successful package build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageBuild {
    pub artifact: Artifact,
    pub sources: Vec<String>,
    pub skipped_targets: Vec<TargetId>,
}

impl PackageRecord {
    pub fn running(format: PackageFormat, created_at: DateTime<Utc>) -> Self {
        Self {
            id: format!("pkg_{}", Uuid::new_v4().simple()),
            created_at,
            finished_at: None,
            status: RecordStatus::Running,
            format,
            storage_path: None,
            size_bytes: None,
            checksum: None,
            duration_ms: None,
            sources: Vec::new(),
            skipped_targets: Vec::new(),
            error: None,
        }
    }

    pub fn finish(
        &mut self,
        outcome: &Result<PackageBuild>,
        finished_at: DateTime<Utc>,
        duration: Duration,
    ) -> bool {
        if self.status != RecordStatus::Running {
            return false;
        }
        self.finished_at = Some(finished_at);
        self.duration_ms = Some(duration.as_millis() as u64);
        match outcome {
            Ok(build) => {
                self.status = RecordStatus::Completed;
                self.storage_path = Some(build.artifact.path.clone());
                self.size_bytes = Some(build.artifact.size_bytes);
                self.checksum = Some(build.artifact.checksum.clone());
                self.sources = build.sources.clone();
                self.skipped_targets = build.skipped_targets.clone();
            }
            Err(err) => {
                self.status = RecordStatus::Failed;
                self.error = Some(FailureDetail::from(err));
            }
        }
        true
    }
}

/// Common view over backup and package records used by retention.
pub trait Retainable {
    fn record_id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn status(&self) -> RecordStatus;
    fn storage_path(&self) -> Option<&str>;
}

impl Retainable for BackupRecord {
    fn record_id(&self) -> &str {
        &self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn status(&self) -> RecordStatus {
        self.status
    }
    fn storage_path(&self) -> Option<&str> {
        self.storage_path.as_deref()
    }
}

impl Retainable for PackageRecord {
    fn record_id(&self) -> &str {
        &self.id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn status(&self) -> RecordStatus {
        self.status
    }
    fn storage_path(&self) -> Option<&str> {
        self.storage_path.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Package,
}

/// An in-flight unit of work. Its id is the id of the record it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub target_id: Option<TargetId>,
    pub submitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> Artifact {
        Artifact {
            path: "backups/t1/postgres_app_20260101T000000Z.dump".into(),
            size_bytes: 42,
            checksum: "ab".repeat(32),
        }
    }

    #[test]
    fn checksum_present_only_when_completed() {
        let now = Utc::now();
        let mut ok = BackupRecord::running("t1", now);
        assert!(ok.checksum.is_none());
        assert!(ok.finish(&Ok(artifact()), now, Duration::from_millis(1500)));
        assert_eq!(ok.status, RecordStatus::Completed);
        assert!(ok.checksum.is_some());
        assert_eq!(ok.duration_ms, Some(1500));

        let mut failed = BackupRecord::running("t1", now);
        let err = AppError::Connection("connection refused".into());
        assert!(failed.finish(&Err(err), now, Duration::ZERO));
        assert_eq!(failed.status, RecordStatus::Failed);
        assert!(failed.checksum.is_none());
        assert!(failed.storage_path.is_none());
        assert_eq!(
            failed.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Connection)
        );
    }

    #[test]
    fn finish_applies_exactly_once() {
        let now = Utc::now();
        let mut record = BackupRecord::running("t1", now);
        assert!(record.finish(&Ok(artifact()), now, Duration::ZERO));
        let timeout = AppError::Timeout(Duration::from_secs(1));
        assert!(!record.finish(&Err(timeout), now, Duration::ZERO));
        assert_eq!(record.status, RecordStatus::Completed);
        assert!(record.error.is_none());
    }

    #[test]
    fn engine_and_format_parse() -> anyhow::Result<()> {
        assert_eq!("Postgres".parse::<Engine>()?, Engine::Postgres);
        assert_eq!("mongodb".parse::<Engine>()?, Engine::MongoDb);
        assert!(matches!(
            "oracle".parse::<Engine>(),
            Err(AppError::Configuration(_))
        ));
        assert_eq!("tar.gz".parse::<PackageFormat>()?, PackageFormat::TarGz);
        assert_eq!("none".parse::<Compression>()?, Compression::None);
        Ok(())
    }

    #[test]
    fn zero_max_count_is_rejected() {
        assert!(RetentionPolicy::new(Some(7), Some(0)).is_err());
        assert!(RetentionPolicy::new(None, None).map(|p| p.is_unbounded()).unwrap_or(false));
    }

    #[test]
    fn connection_debug_redacts_password() {
        let params = ConnectionParams {
            host: "db".into(),
            port: 5432,
            username: "app".into(),
            password: "hunter2".into(),
            database_name: "app".into(),
        };
        let rendered = format!("{:?}", params);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
