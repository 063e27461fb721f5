// dbvault/src/backup/archive.rs
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use tar::{Builder, Header};

use crate::errors::{AppError, Result};
use crate::model::{Compression, PackageFormat};

/// One file inside a package archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Reads a dump file, applying the target's compression mode.
pub fn compress_file(path: &Path, compression: Compression) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    match compression {
        Compression::None => {
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            Ok(bytes)
        }
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
            std::io::copy(&mut file, &mut encoder)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Bundles `entries` into a single archive.
///
/// Entry names are used verbatim as paths inside the archive.
pub fn bundle(entries: &[ArchiveEntry], format: PackageFormat) -> Result<Vec<u8>> {
    match format {
        PackageFormat::TarGz => bundle_tar_gz(entries),
        PackageFormat::Zip => bundle_zip(entries),
    }
}

fn bundle_tar_gz(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let enc = GzEncoder::new(Vec::new(), GzLevel::default());
    let mut tar_builder = Builder::new(enc);
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;

    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_size(entry.bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_cksum();
        tar_builder
            .append_data(&mut header, &entry.name, entry.bytes.as_slice())
            .map_err(|e| {
                AppError::Archive(format!("Failed to append {} to archive: {}", entry.name, e))
            })?;
    }

    let encoder = tar_builder
        .into_inner()
        .map_err(|e| AppError::Archive(format!("Failed to finish tar stream: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| AppError::Archive(format!("Failed to finish Gzip encoding: {}", e)))
}

fn bundle_zip(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(entries.iter().any(|e| e.bytes.len() as u64 >= u32::MAX as u64));

    for entry in entries {
        writer.start_file(entry.name.as_str(), options)?;
        writer.write_all(&entry.bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Opens an archive produced by [`bundle`] and returns its entries in order.
pub fn read_entries(bytes: &[u8], format: PackageFormat) -> Result<Vec<ArchiveEntry>> {
    let mut entries = Vec::new();
    match format {
        PackageFormat::TarGz => {
            let mut archive = tar::Archive::new(GzDecoder::new(bytes));
            let iter = archive
                .entries()
                .map_err(|e| AppError::Archive(format!("Failed to read tar archive: {}", e)))?;
            for entry in iter {
                let mut entry =
                    entry.map_err(|e| AppError::Archive(format!("Corrupt tar entry: {}", e)))?;
                let name = entry
                    .path()
                    .map_err(|e| AppError::Archive(format!("Invalid tar entry path: {}", e)))?
                    .to_string_lossy()
                    .to_string();
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                entries.push(ArchiveEntry { name, bytes: content });
            }
        }
        PackageFormat::Zip => {
            let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
            for index in 0..archive.len() {
                let mut file = archive.by_index(index)?;
                let name = file.name().to_string();
                let mut content = Vec::new();
                file.read_to_end(&mut content)?;
                entries.push(ArchiveEntry { name, bytes: content });
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entries() -> Vec<ArchiveEntry> {
        vec![
            ArchiveEntry {
                name: "t1/postgres_app_20260101T000000Z.dump".into(),
                bytes: b"PGDMP fake dump".to_vec(),
            },
            ArchiveEntry {
                name: "t2/mongodb_events_20260101T000000Z.archive.gz".into(),
                bytes: vec![0u8; 4096],
            },
        ]
    }

    #[test]
    fn test_bundle_tar_gz_keeps_names_and_content() -> anyhow::Result<()> {
        let entries = sample_entries();
        let archive = bundle(&entries, PackageFormat::TarGz)?;
        assert_eq!(&archive[..2], &[0x1f, 0x8b]);
        assert_eq!(read_entries(&archive, PackageFormat::TarGz)?, entries);
        Ok(())
    }

    #[test]
    fn test_bundle_zip_keeps_names_and_content() -> anyhow::Result<()> {
        let entries = sample_entries();
        let archive = bundle(&entries, PackageFormat::Zip)?;
        assert_eq!(&archive[..2], b"PK");
        assert_eq!(read_entries(&archive, PackageFormat::Zip)?, entries);
        Ok(())
    }

    #[test]
    fn test_compress_file_gzip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("dump.raw");
        std::fs::write(&path, b"some dump bytes")?;

        let plain = compress_file(&path, Compression::None)?;
        assert_eq!(plain, b"some dump bytes");

        let gz = compress_file(&path, Compression::Gzip)?;
        let mut decoded = Vec::new();
        GzDecoder::new(gz.as_slice()).read_to_end(&mut decoded)?;
        assert_eq!(decoded, b"some dump bytes");
        Ok(())
    }

    #[test]
    fn test_corrupt_archive_is_rejected() {
        let result = read_entries(b"definitely not a zip", PackageFormat::Zip);
        assert!(matches!(result, Err(AppError::Archive(_))));
    }
}
