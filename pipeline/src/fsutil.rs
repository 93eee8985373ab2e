//! Filesystem helpers shared by every durable writer.

use crate::errors::{PipelineError, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// Replace `path` with `data` so readers see either the old or the new file.
///
/// Writes to a uniquely named temp file in the same directory, fsyncs it and
/// renames it over the target. Two writers racing on the same path never share
/// a temp file; the last rename wins.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| PipelineError::Config(format!("Not a file path: {}", path.display())))?
        .to_string_lossy();

    fs::create_dir_all(parent).map_err(|e| {
        tracing::error!(path = %parent.display(), error = %e, "Failed to create directory");
        e
    })?;

    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));
    let written = File::create(&temp_path).and_then(|mut f| {
        f.write_all(data)?;
        f.sync_all()
    });
    if let Err(e) = written {
        tracing::error!(path = %temp_path.display(), error = %e, "Failed to write temp file");
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        tracing::error!(
            from = %temp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    // Persist the rename itself.
    #[cfg(unix)]
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
