// dbvault/src/backup/verification.rs
use sha2::{Digest, Sha256};

use crate::errors::{AppError, Result};
use crate::storage::StorageBackend;

/// Lowercase hex SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Reads an artifact back from storage and compares it with the checksum
/// computed before the write.
///
/// # Arguments
/// * `storage` - Backend the artifact was written to.
/// * `path` - Logical path of the artifact.
/// * `expected` - Checksum of the bytes that were handed to `put`.
pub async fn verify_stored(storage: &dyn StorageBackend, path: &str, expected: &str) -> Result<()> {
    let stored = storage.get(path).await?;
    let actual = checksum(&stored);
    if actual != expected {
        return Err(AppError::Verification(format!(
            "checksum mismatch for {}: expected {}, found {}",
            path, expected, actual
        )));
    }
    Ok(())
}
