// dbvault/src/packager/mod.rs
use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::archive::{self, ArchiveEntry};
use crate::backup::{ArtifactPlan, store_artifact};
use crate::catalog::{Catalog, GroupKey};
use crate::errors::{AppError, Result};
use crate::model::{PackageBuild, PackageFormat, Target};
use crate::storage::StorageBackend;

/// Bundles the latest completed backup of every package-eligible target into
/// one archive. The archive holds copies of the dumps, so source backups can
/// be pruned later without breaking it.
#[derive(Clone)]
pub struct Packager {
    catalog: Arc<Catalog>,
    storage: Arc<dyn StorageBackend>,
}

impl Packager {
    pub fn new(catalog: Arc<Catalog>, storage: Arc<dyn StorageBackend>) -> Self {
        Self { catalog, storage }
    }

    /// Builds and stores a package.
    ///
    /// # Arguments
    /// * `targets` - Registered targets; only those with the package flag contribute.
    /// * `format` - Archive container for the whole package.
    /// * `plan` - Destination path of the archive.
    pub async fn build(
        &self,
        targets: &[Target],
        format: PackageFormat,
        plan: &ArtifactPlan,
    ) -> Result<PackageBuild> {
        let mut entries = Vec::new();
        let mut sources = Vec::new();
        let mut skipped_targets = Vec::new();

        for target in targets.iter().filter(|t| t.package) {
            let latest = {
                let _guard = self.catalog.lock_group(&GroupKey::Target(target.id.clone())).await;
                self.catalog.latest_completed_backup(&target.id).await
            };
            let Some(record) = latest else {
                info!(target_id = %target.id, "No completed backup, skipping target in package");
                skipped_targets.push(target.id.clone());
                continue;
            };
            let Some(path) = record.storage_path.as_deref() else {
                skipped_targets.push(target.id.clone());
                continue;
            };

            match self.storage.get(path).await {
                Ok(bytes) => {
                    let file_name = path.rsplit('/').next().unwrap_or(path);
                    entries.push(ArchiveEntry {
                        name: format!("{}/{}", target.id, file_name),
                        bytes,
                    });
                    sources.push(record.id.clone());
                }
                // pruned between the catalog read and the download
                Err(AppError::NotFound(_)) => {
                    warn!(target_id = %target.id, record_id = %record.id, "Backup artifact vanished, skipping target in package");
                    skipped_targets.push(target.id.clone());
                }
                Err(e) => return Err(e),
            }
        }

        if entries.is_empty() {
            return Err(AppError::NotFound(
                "no package-eligible target has a completed backup".to_string(),
            ));
        }

        let expected: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let bytes = archive::bundle(&entries, format)?;
            let names: Vec<String> = archive::read_entries(&bytes, format)?
                .into_iter()
                .map(|e| e.name)
                .collect();
            if names != expected {
                return Err(AppError::Archive(format!(
                    "package lists {:?}, expected {:?}",
                    names, expected
                )));
            }
            Ok(bytes)
        })
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))??;

        let artifact = store_artifact(self.storage.as_ref(), &plan.path, bytes).await?;
        info!(
            path = %artifact.path,
            sources = sources.len(),
            skipped = skipped_targets.len(),
            "✓ Package built"
        );
        Ok(PackageBuild {
            artifact,
            sources,
            skipped_targets,
        })
    }
}
