use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::io(format!("failed to create dir {}: {e}", p.display())))
}

// Write-then-rename so readers never observe a partially written document.
pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::io(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::io(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        Error::io(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| Error::parse(format!("json encode error: {e}")))?;
    atomic_write_text(path, &body)
}

// Treat "the file vanished while we were working" as a benign race: a list
// operation may run concurrently with a prune pass.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(format!(
            "failed to remove {}: {e}",
            path.display()
        ))),
    }
}
