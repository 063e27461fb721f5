// dbvault/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use tracing::{debug, info, warn};

use super::StorageBackend;
use crate::config::SpacesConfig;
use crate::errors::{AppError, Result};
use crate::utils::validate_logical_path;

/// Object storage on an S3-compatible service (AWS, DigitalOcean Spaces, MinIO).
pub struct S3Storage {
    client: s3::Client,
    config: SpacesConfig,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("endpoint_url", &self.config.endpoint_url)
            .field("bucket_name", &self.config.bucket_name)
            .field("folder_prefix", &self.config.folder_prefix)
            .finish()
    }
}

impl S3Storage {
    /// Builds a client and checks that the target bucket is reachable.
    pub async fn connect(config: SpacesConfig) -> Result<Self> {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        let client = s3::Client::new(&sdk_config);

        match client.head_bucket().bucket(&config.bucket_name).send().await {
            Ok(_) => info!(bucket = %config.bucket_name, "✓ S3 bucket is accessible"),
            Err(e) => {
                // PutObject can still be allowed when HeadBucket is denied.
                warn!(
                    bucket = %config.bucket_name,
                    error = %e,
                    "Could not verify S3 bucket with HEAD request"
                );
            }
        }

        Ok(Self { client, config })
    }

    fn key_for(&self, path: &str) -> Result<String> {
        validate_logical_path(path)?;
        Ok(match &self.config.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), path),
            None => path.to_string(),
        })
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> Option<&'a str> {
        match &self.config.folder_prefix {
            Some(prefix) => key
                .strip_prefix(prefix.trim_end_matches('/'))
                .and_then(|rest| rest.strip_prefix('/')),
            None => Some(key),
        }
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let key = self.key_for(path)?;
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(&key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "Failed to upload to S3 bucket {} with key {}: {}",
                    self.config.bucket_name, key, e
                ))
            })?;
        debug!(bucket = %self.config.bucket_name, key = %key, size, "uploaded object");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let key = self.key_for(path)?;
        let object = self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    AppError::NotFound(format!("s3://{}/{}", self.config.bucket_name, key))
                } else {
                    AppError::Storage(format!(
                        "Failed to get object s3://{}/{}: {}",
                        self.config.bucket_name, key, e
                    ))
                }
            })?;

        let body = object.body.collect().await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to read object body s3://{}/{}: {}",
                self.config.bucket_name, key, e
            ))
        })?;
        Ok(body.into_bytes().to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = match &self.config.folder_prefix {
            Some(folder) => format!("{}/{}", folder.trim_end_matches('/'), prefix),
            None => prefix.to_string(),
        };

        let mut paths = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket_name)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    AppError::Storage(format!(
                        "Failed to list s3://{}/{}: {}",
                        self.config.bucket_name, full_prefix, e
                    ))
                })?;

            for object in page.contents() {
                if let Some(path) = object.key().and_then(|k| self.strip_prefix(k)) {
                    paths.push(path.to_string());
                }
            }

            match (page.is_truncated(), page.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        paths.sort();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.key_for(path)?;
        self.client
            .delete_object()
            .bucket(&self.config.bucket_name)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "Failed to delete s3://{}/{}: {}",
                    self.config.bucket_name, key, e
                ))
            })?;
        Ok(())
    }
}
