//! Append-only JSONL primitives shared by every store in this crate.
//!
//! One complete JSON record per line. Blank lines are tolerated on read
//! (a crash between the newline and the next record leaves one). A missing
//! file reads as empty — stores create their file on first append.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{JournalError, Result};

/// Append one record as a single line, fsync'd before returning so a
/// journaled transition is durable once the caller observes success.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

/// Read every record, in file order. Blank lines are skipped; a malformed
/// line is an error carrying its line number so the operator can find it.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| JournalError::CorruptRecord {
            path: path.display().to_string(),
            line: idx + 1,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}
