// dbvault/src/storage/local.rs
use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use super::StorageBackend;
use crate::errors::{AppError, Result};
use crate::utils::validate_logical_path;

const PARTIAL_MARKER: &str = ".partial-";

/// Local-filesystem storage rooted at `base_path`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        validate_logical_path(path)?;
        Ok(path
            .split('/')
            .fold(self.base_path.clone(), |acc, seg| acc.join(seg)))
    }
}

fn staging_prefix(full_path: &Path) -> String {
    let file_name = full_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    format!("{}{}", file_name, PARTIAL_MARKER)
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::Storage(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        // Write next to the destination and rename, so a crash never leaves a
        // truncated artifact under the final name.
        let staging = full_path.with_file_name(format!(
            "{}{}",
            staging_prefix(&full_path),
            Uuid::new_v4().simple()
        ));
        if let Err(e) = tokio::fs::write(&staging, &bytes).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(AppError::Storage(format!(
                "Failed to write {}: {}",
                full_path.display(),
                e
            )));
        }
        if let Err(e) = tokio::fs::rename(&staging, &full_path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(AppError::Storage(format!(
                "Failed to move {} into place: {}",
                full_path.display(),
                e
            )));
        }
        debug!(path, size = bytes.len(), "stored blob on local disk");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve(path)?;
        tokio::fs::read(&full_path).await.map_err(|e| match e.kind() {
            IoErrorKind::NotFound => AppError::NotFound(format!("blob {}", path)),
            _ => AppError::Storage(format!("Failed to read {}: {}", full_path.display(), e)),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.base_path.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !base.exists() {
                return Ok(Vec::new());
            }
            let mut paths = Vec::new();
            for entry in WalkDir::new(&base) {
                let entry = entry.map_err(|e| {
                    AppError::Storage(format!("Failed to walk {}: {}", base.display(), e))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&base) else {
                    continue;
                };
                let logical = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if logical.contains(PARTIAL_MARKER) || !logical.starts_with(&prefix) {
                    continue;
                }
                paths.push(logical);
            }
            paths.sort();
            Ok(paths)
        })
        .await
        .map_err(|e| AppError::Storage(format!("Listing task failed: {}", e)))?
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve(path)?;
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!(
                "Failed to delete {}: {}",
                full_path.display(),
                e
            ))),
        }
    }

    /// Deletes `path` and any staging files a cancelled `put` to it left behind.
    async fn discard(&self, path: &str) -> Result<()> {
        self.delete(path).await?;
        let full_path = self.resolve(path)?;
        let Some(parent) = full_path.parent() else {
            return Ok(());
        };
        let prefix = staging_prefix(&full_path);
        let mut entries = match tokio::fs::read_dir(parent).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(AppError::Storage(format!(
                    "Failed to scan {}: {}",
                    parent.display(),
                    e
                )));
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => debug!(path = %entry.path().display(), "removed stale staging file"),
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => {
                    return Err(AppError::Storage(format!(
                        "Failed to delete {}: {}",
                        entry.path().display(),
                        e
                    )));
                }
            }
        }
        Ok(())
    }
}
