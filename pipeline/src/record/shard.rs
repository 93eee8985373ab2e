//! Per-device append-only result shards
//!
//! Each device worker owns exactly one shard per run, so no locking is needed
//! between workers. Rows are encoded to a buffer first and appended with a
//! single write, then synced, so a crash leaves at most one torn final line,
//! which readers drop.

use super::row::{encode_header, encode_row, MeasurementRow};
use crate::errors::Result;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Append handle for one shard file
#[derive(Debug)]
pub struct ShardWriter {
    path: PathBuf,
    file: File,
    rows_written: usize,
}

impl ShardWriter {
    /// Open (or create) a shard for appending.
    ///
    /// A header is written only when the file is new or empty.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(&encode_header()?)?;
            file.sync_data()?;
        }

        debug!(path = %path.display(), "Shard opened");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            rows_written: 0,
        })
    }

    /// Append one completed measurement
    pub fn append(&mut self, row: &MeasurementRow) -> Result<()> {
        let line = encode_row(row)?;
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        self.rows_written += 1;

        debug!(
            path = %self.path.display(),
            variant = %row.variant,
            rows_written = self.rows_written,
            "Row appended to shard"
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended through this handle
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }
}

/// List unmerged shard files in `dir`, sorted by name.
///
/// A missing directory has no shards.
pub fn list_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut shards = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == "csv").unwrap_or(false) {
            shards.push(path);
        }
    }
    shards.sort();
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::super::row::decode_rows;
    use super::*;
    use tempfile::TempDir;

    fn row(variant: &str) -> MeasurementRow {
        MeasurementRow {
            variant: variant.parse().unwrap(),
            gib: 2.0,
            kl_div: 0.1,
            ppl: 11.0,
            device: 0,
            measured_at_ms: 1,
        }
    }

    #[test]
    fn test_append_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.dev0.csv");

        let mut shard = ShardWriter::open(&path).unwrap();
        shard.append(&row("2")).unwrap();
        drop(shard);

        // Reopening an existing shard appends without a second header
        let mut shard = ShardWriter::open(&path).unwrap();
        shard.append(&row("3")).unwrap();
        assert_eq!(shard.rows_written(), 1);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("variant,").count(), 1);

        let decoded = decode_rows(text.as_bytes(), &path);
        assert_eq!(decoded.rows.len(), 2);
    }

    #[test]
    fn test_list_shards_only_csv_sorted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.csv"), "").unwrap();
        fs::write(dir.path().join("a.csv"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir(dir.path().join("merged")).unwrap();

        let shards = list_shards(dir.path()).unwrap();
        let names: Vec<_> = shards
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);
    }

    #[test]
    fn test_list_shards_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert!(list_shards(&dir.path().join("absent")).unwrap().is_empty());
    }
}
