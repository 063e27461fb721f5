// dbvault/src/config/mod.rs
pub mod secrets;

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::errors::{AppError, Result};
use crate::model::{Compression, Engine, PackageFormat, RetentionPolicy};

pub use secrets::{Credentials, EnvSecretResolver, SecretResolver};

pub const DEFAULT_MAX_PARALLEL_JOBS: usize = 2;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RETENTION_SWEEP_SCHEDULE: &str = "0 1 * * *";
const DEFAULT_LOCAL_BASE_PATH: &str = "data";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonExecutorConfig {
    pub max_parallel_jobs: Option<usize>,
    pub job_timeout_secs: Option<u64>,
    pub tick_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JsonStorageConfig {
    Local { base_path: Option<PathBuf> },
    S3(JsonS3StorageConfig),
}

/// Defaults applied to every database entry that does not set them itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonGlobalDefaults {
    pub schedule: Option<String>,
    pub compression: Option<String>,
    pub retention_days: Option<u32>,
    pub max_backups: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDatabaseConfig {
    pub id: Option<String>,
    pub name: Option<String>,
    pub engine: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub username_var: Option<String>,
    pub password_var: Option<String>,
    pub schedule: Option<String>,
    pub retention_days: Option<u32>,
    pub max_backups: Option<usize>,
    pub compression: Option<String>,
    pub package: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonPackageConfig {
    pub schedule: Option<String>,
    pub format: Option<String>,
    pub retention_days: Option<u32>,
    pub max_packages: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub executor: Option<JsonExecutorConfig>,
    pub storage: Option<JsonStorageConfig>,
    pub global: Option<JsonGlobalDefaults>,
    #[serde(default)]
    pub databases: Vec<JsonDatabaseConfig>,
    pub package: Option<JsonPackageConfig>,
    pub retention_sweep_schedule: Option<String>,
    pub state_file: Option<PathBuf>,
    pub temp_dump_root: Option<PathBuf>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local { base_path: PathBuf },
    S3(SpacesConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub max_parallel_jobs: usize,
    pub job_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_parallel_jobs: DEFAULT_MAX_PARALLEL_JOBS,
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
        }
    }
}

/// Package group configuration: one schedule, one format, one retention policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageSettings {
    pub schedule: Option<String>,
    pub format: PackageFormat,
    pub retention: RetentionPolicy,
}

/// A target as configured, before its credentials are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub id: String,
    pub name: String,
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub credentials: Credentials,
    pub schedule: Option<String>,
    pub retention: RetentionPolicy,
    pub compression: Compression,
    pub package: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub executor: ExecutorSettings,
    pub storage: StorageConfig,
    pub targets: Vec<TargetSpec>,
    pub package: PackageSettings,
    pub retention_sweep_schedule: String,
    pub state_file: Option<PathBuf>,
    pub temp_dump_root: Option<PathBuf>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> anyhow::Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_json_str(&config_content).with_context(|| {
            format!(
                "Failed to load configuration from {}",
                config_path.display()
            )
        })
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: RawJsonConfig = serde_json::from_str(content)?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let executor = load_executor_settings(raw.executor.unwrap_or_default())?;
        let storage = load_storage_config(raw.storage)?;
        let targets = load_target_specs(raw.global.unwrap_or_default(), raw.databases)?;
        let package = load_package_settings(raw.package.unwrap_or_default())?;

        Ok(AppConfig {
            executor,
            storage,
            targets,
            package,
            retention_sweep_schedule: raw
                .retention_sweep_schedule
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_RETENTION_SWEEP_SCHEDULE.to_string()),
            state_file: raw.state_file,
            temp_dump_root: raw.temp_dump_root,
        })
    }
}

fn load_executor_settings(raw: JsonExecutorConfig) -> Result<ExecutorSettings> {
    let defaults = ExecutorSettings::default();
    let max_parallel_jobs = raw.max_parallel_jobs.unwrap_or(defaults.max_parallel_jobs);
    if max_parallel_jobs == 0 {
        return Err(AppError::Configuration(
            "executor.max_parallel_jobs must be at least 1".to_string(),
        ));
    }
    let job_timeout = raw
        .job_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.job_timeout);
    let tick_interval = raw
        .tick_interval_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.tick_interval);
    if job_timeout.is_zero() || tick_interval.is_zero() {
        return Err(AppError::Configuration(
            "executor.job_timeout_secs and executor.tick_interval_secs must be positive"
                .to_string(),
        ));
    }
    Ok(ExecutorSettings {
        max_parallel_jobs,
        job_timeout,
        tick_interval,
    })
}

fn load_storage_config(raw: Option<JsonStorageConfig>) -> Result<StorageConfig> {
    match raw {
        None => Ok(StorageConfig::Local {
            base_path: PathBuf::from(DEFAULT_LOCAL_BASE_PATH),
        }),
        Some(JsonStorageConfig::Local { base_path }) => {
            let base_path = base_path.unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_BASE_PATH));
            if base_path.to_string_lossy().is_empty() {
                return Err(AppError::Configuration(
                    "storage.base_path cannot be empty".to_string(),
                ));
            }
            Ok(StorageConfig::Local { base_path })
        }
        Some(JsonStorageConfig::S3(s3_raw)) => {
            let required = |field: &Option<String>, name: &str| -> Result<String> {
                field
                    .as_ref()
                    .filter(|s| !s.is_empty())
                    .cloned()
                    .ok_or_else(|| {
                        AppError::Configuration(format!(
                            "storage.{} must be set for s3 storage",
                            name
                        ))
                    })
            };
            Ok(StorageConfig::S3(SpacesConfig {
                bucket_name: required(&s3_raw.bucket_name, "bucket_name")?,
                region: required(&s3_raw.region, "region")?,
                access_key_id: required(&s3_raw.access_key_id, "access_key_id")?,
                secret_access_key: required(&s3_raw.secret_access_key, "secret_access_key")?,
                endpoint_url: required(&s3_raw.endpoint_url, "endpoint_url")?,
                folder_prefix: s3_raw.folder_prefix.filter(|s| !s.is_empty()),
            }))
        }
    }
}

fn load_target_specs(
    global: JsonGlobalDefaults,
    databases: Vec<JsonDatabaseConfig>,
) -> Result<Vec<TargetSpec>> {
    // Pre-validate for duplicate IDs
    let mut seen = HashSet::new();
    let mut duplicates: Vec<&str> = databases
        .iter()
        .filter_map(|db| db.id.as_deref())
        .filter(|id| !seen.insert(*id))
        .collect();
    if !duplicates.is_empty() {
        duplicates.sort_unstable();
        duplicates.dedup();
        return Err(AppError::Configuration(format!(
            "Duplicate IDs found in configuration: {:?}",
            duplicates
        )));
    }

    let mut specs = Vec::new();
    for db in databases {
        let Some(id) = db.id.clone().filter(|id| !id.trim().is_empty()) else {
            warn!(
                name = db.name.as_deref().unwrap_or("N/A"),
                "Skipping a database configuration because it is missing the required 'id' field"
            );
            continue;
        };
        specs.push(load_target_spec(id, db, &global)?);
    }
    Ok(specs)
}

fn load_target_spec(
    id: String,
    db: JsonDatabaseConfig,
    global: &JsonGlobalDefaults,
) -> Result<TargetSpec> {
    let missing =
        |field: &str| AppError::Configuration(format!("database '{}' is missing '{}'", id, field));

    let engine: Engine = db.engine.as_deref().ok_or_else(|| missing("engine"))?.parse()?;
    let host = db.host.clone().filter(|h| !h.is_empty()).ok_or_else(|| missing("host"))?;
    let database_name = db
        .database_name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| missing("database_name"))?;
    let port = db.port.unwrap_or(match engine {
        Engine::Postgres => 5432,
        Engine::MongoDb => 27017,
    });

    let compression: Compression = db
        .compression
        .as_deref()
        .or(global.compression.as_deref())
        .unwrap_or("none")
        .parse()?;
    let retention = RetentionPolicy::new(
        db.retention_days.or(global.retention_days),
        db.max_backups.or(global.max_backups),
    )
    .map_err(|e| AppError::Configuration(format!("database '{}': {}", id, e)))?;

    let credentials = Credentials {
        username: db.username.clone(),
        password: db.password.clone(),
        username_var: db.username_var.clone(),
        password_var: db.password_var.clone(),
    };

    Ok(TargetSpec {
        name: db.name.clone().unwrap_or_else(|| id.clone()),
        id,
        engine,
        host,
        port,
        database_name,
        credentials,
        schedule: db
            .schedule
            .or_else(|| global.schedule.clone())
            .filter(|s| !s.trim().is_empty()),
        retention,
        compression,
        package: db.package.unwrap_or(false),
    })
}

fn load_package_settings(raw: JsonPackageConfig) -> Result<PackageSettings> {
    let format: PackageFormat = raw.format.as_deref().unwrap_or("zip").parse()?;
    let retention = RetentionPolicy::new(raw.retention_days, raw.max_packages)
        .map_err(|e| AppError::Configuration(format!("package: {}", e)))?;
    Ok(PackageSettings {
        schedule: raw.schedule.filter(|s| !s.trim().is_empty()),
        format,
        retention,
    })
}
