// dbvault/src/utils/mod.rs
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use which::which;

use crate::errors::{AppError, Result};

/// Timestamp layout used in artifact names, UTC with milliseconds.
/// Lexicographic order equals chronological order.
pub const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

pub fn artifact_timestamp(at: DateTime<Utc>) -> String {
    at.format(ARTIFACT_TIMESTAMP_FORMAT).to_string()
}

fn separators() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s_.]+").ok()).as_ref()
}

/// Makes a database name safe for use inside an artifact file name.
///
/// Lowercases, turns whitespace/underscores/dots into hyphens, drops anything
/// that is not ASCII alphanumeric or a hyphen, and trims stray hyphens.
pub fn sanitize_filename(name: &str) -> String {
    let lowered = name.to_lowercase();
    let hyphenated = match separators() {
        Some(re) => re.replace_all(&lowered, "-").into_owned(),
        None => lowered,
    };
    let mut cleaned = String::with_capacity(hyphenated.len());
    for c in hyphenated.chars() {
        if c.is_ascii_alphanumeric() {
            cleaned.push(c);
        } else if c == '-' && !cleaned.is_empty() && !cleaned.ends_with('-') {
            cleaned.push(c);
        }
    }
    cleaned.trim_end_matches('-').to_string()
}

/// Logical storage paths are relative, `/`-separated and never escape the root.
pub fn validate_logical_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(AppError::Storage("storage path cannot be empty".to_string()));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(AppError::Storage(format!(
            "storage path must be relative and '/'-separated: {}",
            path
        )));
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(AppError::Storage(format!(
            "storage path contains an invalid segment: {}",
            path
        )));
    }
    Ok(())
}

/// Finds a dump tool in PATH. A missing tool is a configuration problem, not a
/// transient one.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| {
        AppError::Configuration(format!(
            "{} executable not found in PATH. Please ensure the database client tools are installed and in your PATH.",
            name
        ))
    })
}
