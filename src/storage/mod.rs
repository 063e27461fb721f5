// dbvault/src/storage/mod.rs
pub mod local;
pub mod s3;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::errors::Result;

pub use local::LocalStorage;
pub use s3::S3Storage;

/// Named byte blobs addressed by logical `/`-separated paths.
///
/// Every implementation must honor the same contract:
/// - `put` replaces any existing blob atomically; readers never see a partial blob.
/// - `get` of a missing path is `AppError::NotFound`.
/// - `list` returns paths sorted ascending, so artifact names sort chronologically.
/// - `delete` of a missing path succeeds.
/// - `discard` removes `path` and anything an interrupted `put` to it left behind.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, path: &str) -> Result<()>;

    async fn discard(&self, path: &str) -> Result<()> {
        self.delete(path).await
    }
}

/// Builds the configured backend.
pub async fn from_config(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Local { base_path } => Ok(Arc::new(LocalStorage::new(base_path.clone()))),
        StorageConfig::S3(spaces) => Ok(Arc::new(S3Storage::connect(spaces.clone()).await?)),
    }
}
