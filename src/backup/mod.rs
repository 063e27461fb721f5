// dbvault/src/backup/mod.rs
pub mod archive;
pub mod db_dump;
pub mod verification;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::{AppError, Result};
use crate::model::{Artifact, Compression, Engine, PackageFormat, Target};
use crate::storage::StorageBackend;
use crate::utils::{artifact_timestamp, sanitize_filename, validate_logical_path};

use self::db_dump::{DumpInvocation, preflight};

pub const BACKUPS_PREFIX: &str = "backups";
pub const PACKAGES_PREFIX: &str = "packages";
pub const DEFAULT_PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a job's artifact goes. Decided by the executor before the job starts,
/// so a failed or timed-out job can have its partial artifact discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPlan {
    pub path: String,
}

impl ArtifactPlan {
    /// `backups/<target-id>/<engine>_<database>_<timestamp>.<ext>`
    pub fn for_backup(target: &Target, at: DateTime<Utc>) -> Self {
        let database = sanitize_filename(&target.connection.database_name);
        let database = if database.is_empty() { "db".to_string() } else { database };
        Self {
            path: format!(
                "{}/{}/{}_{}_{}.{}",
                BACKUPS_PREFIX,
                target.id,
                target.engine,
                database,
                artifact_timestamp(at),
                backup_extension(target.engine, target.compression)
            ),
        }
    }

    /// `packages/package_<timestamp>.<zip|tar.gz>`
    pub fn for_package(format: PackageFormat, at: DateTime<Utc>) -> Self {
        Self {
            path: format!(
                "{}/package_{}.{}",
                PACKAGES_PREFIX,
                artifact_timestamp(at),
                format.extension()
            ),
        }
    }

    /// Final path segment, used as the entry name inside packages.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

fn backup_extension(engine: Engine, compression: Compression) -> &'static str {
    match (engine, compression) {
        (Engine::Postgres, Compression::None) => "dump",
        (Engine::Postgres, Compression::Gzip) => "dump.gz",
        (Engine::MongoDb, Compression::None) => "archive",
        (Engine::MongoDb, Compression::Gzip) => "archive.gz",
    }
}

/// Produces one verified artifact for one target.
///
/// Engines differ only in the external dump invocation; naming, checksum and
/// the storage write are shared through [`store_artifact`].
#[async_trait]
pub trait BackupRunner: Send + Sync {
    async fn run(&self, target: &Target, plan: &ArtifactPlan) -> Result<Artifact>;
}

/// Runs `pg_dump` / `mongodump` into a scratch directory, compresses the
/// result and writes it to storage.
#[derive(Clone)]
pub struct DumpRunner {
    storage: Arc<dyn StorageBackend>,
    scratch_root: Option<PathBuf>,
    preflight_timeout: Duration,
}

impl DumpRunner {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            scratch_root: None,
            preflight_timeout: DEFAULT_PREFLIGHT_TIMEOUT,
        }
    }

    /// Parent directory for per-job scratch directories. Defaults to the
    /// system temp dir.
    pub fn with_scratch_root(mut self, root: Option<PathBuf>) -> Self {
        self.scratch_root = root;
        self
    }

    pub fn with_preflight_timeout(mut self, preflight_timeout: Duration) -> Self {
        self.preflight_timeout = preflight_timeout;
        self
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let dir = match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                tempfile::Builder::new().prefix("dbvault-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("dbvault-").tempdir()?,
        };
        Ok(dir)
    }
}

#[async_trait]
impl BackupRunner for DumpRunner {
    async fn run(&self, target: &Target, plan: &ArtifactPlan) -> Result<Artifact> {
        info!(target_id = %target.id, engine = %target.engine, "Checking connection to {}", target.name);
        preflight(target, self.preflight_timeout).await?;

        // Removed on drop, including when the job is cancelled by its timeout.
        let scratch = self.scratch_dir()?;
        let raw_path = scratch.path().join(format!("{}.raw", target.id));
        let invocation = DumpInvocation::for_target(target, &raw_path)?;
        info!(target_id = %target.id, tool = %invocation.tool, "Dumping database {}", target.connection.database_name);
        invocation.execute().await?;

        let compression = target.compression;
        let bytes = tokio::task::spawn_blocking(move || archive::compress_file(&raw_path, compression))
            .await
            .map_err(|e| AppError::Io(std::io::Error::other(e)))??;
        debug!(target_id = %target.id, size_bytes = bytes.len(), "Dump read into memory");

        store_artifact(self.storage.as_ref(), &plan.path, bytes).await
    }
}

/// Checksums `bytes`, writes them to `path` and reads them back to confirm the
/// stored content matches.
pub async fn store_artifact(
    storage: &dyn StorageBackend,
    path: &str,
    bytes: Vec<u8>,
) -> Result<Artifact> {
    validate_logical_path(path)?;
    let checksum = verification::checksum(&bytes);
    let size_bytes = bytes.len() as u64;
    storage.put(path, bytes).await?;
    verification::verify_stored(storage, path, &checksum).await?;
    info!(path, size_bytes, "✓ Artifact stored and verified");
    Ok(Artifact {
        path: path.to_string(),
        size_bytes,
        checksum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionParams, RetentionPolicy};
    use crate::storage::LocalStorage;
    use chrono::TimeZone;

    fn target(engine: Engine, compression: Compression, port: u16) -> Target {
        Target {
            id: "orders".into(),
            name: "Orders".into(),
            engine,
            connection: ConnectionParams {
                host: "127.0.0.1".into(),
                port,
                username: "app".into(),
                password: "secret".into(),
                database_name: "Orders_Prod".into(),
            },
            schedule: None,
            retention: RetentionPolicy::default(),
            compression,
            package: false,
        }
    }

    #[test]
    fn test_backup_plan_naming() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let plan = ArtifactPlan::for_backup(&target(Engine::Postgres, Compression::Gzip, 5432), at);
        assert_eq!(plan.path, "backups/orders/postgres_orders-prod_20260304T050607000Z.dump.gz");
        assert_eq!(plan.file_name(), "postgres_orders-prod_20260304T050607000Z.dump.gz");

        let plan = ArtifactPlan::for_backup(&target(Engine::MongoDb, Compression::None, 27017), at);
        assert_eq!(plan.path, "backups/orders/mongodb_orders-prod_20260304T050607000Z.archive");

        let plan = ArtifactPlan::for_package(PackageFormat::TarGz, at);
        assert_eq!(plan.path, "packages/package_20260304T050607000Z.tar.gz");
    }

    #[tokio::test]
    async fn test_store_artifact_checksums_stored_bytes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::new(dir.path());
        let artifact = store_artifact(&storage, "backups/t1/a.dump", b"dump bytes".to_vec()).await?;
        assert_eq!(artifact.size_bytes, 10);
        assert_eq!(artifact.checksum, verification::checksum(&storage.get("backups/t1/a.dump").await?));
        Ok(())
    }

    #[tokio::test]
    async fn test_store_artifact_rejects_escaping_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::new(dir.path());
        let result = store_artifact(&storage, "../outside.dump", b"x".to_vec()).await;
        assert!(matches!(result, Err(AppError::Storage(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_before_dump() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let runner = DumpRunner::new(storage.clone()).with_preflight_timeout(Duration::from_secs(2));
        let target = target(Engine::MongoDb, Compression::None, port);
        let plan = ArtifactPlan::for_backup(&target, Utc::now());
        let result = runner.run(&target, &plan).await;

        assert!(matches!(result, Err(AppError::Connection(_))));
        assert!(storage.list("backups").await?.is_empty());
        Ok(())
    }
}
