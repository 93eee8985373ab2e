//! Shard merger
//!
//! Folds the canonical record and every unmerged shard into one mapping keyed
//! by variant, then atomically replaces the canonical file. Merging the same
//! inputs again yields the same file, so the coordinator merges after every
//! completed measurement and once more when the stage ends.

use super::canonical::{CanonicalRecord, Fold};
use super::row::decode_rows;
use super::shard::list_shards;
use crate::errors::{PipelineError, Result};
use crate::layout::ModelLayout;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What happens to shards once a final merge is durable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardRetention {
    /// Move into the archive dir, where they are never re-folded
    #[default]
    Archive,
    /// Remove them
    Delete,
}

/// Summary of one merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Shards folded
    pub shards: usize,
    /// Rows in the canonical record after the merge
    pub rows: usize,
    /// Keys that were new
    pub inserted: usize,
    /// Key collisions resolved in favour of the newer row
    pub replaced: usize,
    /// Key collisions resolved in favour of the existing row
    pub kept: usize,
    /// Shard lines that could not be decoded
    pub skipped_lines: usize,
    /// Whether the canonical file was rewritten
    pub written: bool,
}

/// Merge `shards` into the canonical record at `canonical_path`.
///
/// # Errors
///
/// Returns `PipelineError::Merge` if the canonical record or a shard cannot be
/// read, or the new record cannot be written. The previous canonical file is
/// untouched in every error case.
pub fn merge(canonical_path: &Path, shards: &[PathBuf]) -> Result<MergeReport> {
    let mut record = CanonicalRecord::load(canonical_path).map_err(|e| {
        PipelineError::Merge(format!(
            "Failed to load canonical record {}: {}",
            canonical_path.display(),
            e
        ))
    })?;

    let mut report = MergeReport {
        shards: shards.len(),
        ..Default::default()
    };

    for shard in shards {
        let bytes = fs::read(shard).map_err(|e| {
            PipelineError::Merge(format!("Failed to read shard {}: {}", shard.display(), e))
        })?;
        let decoded = decode_rows(&bytes, shard);
        report.skipped_lines += decoded.skipped;

        for row in decoded.rows {
            let variant = row.variant;
            match record.fold(row) {
                Fold::Inserted => report.inserted += 1,
                Fold::Unchanged => {}
                Fold::Replaced => {
                    report.replaced += 1;
                    warn!(
                        variant = %variant,
                        shard = %shard.display(),
                        "Duplicate variant, newer row replaces existing"
                    );
                }
                Fold::Kept => {
                    report.kept += 1;
                    warn!(
                        variant = %variant,
                        shard = %shard.display(),
                        "Duplicate variant, keeping newer existing row"
                    );
                }
            }
        }
    }

    report.rows = record.len();
    let changed = report.inserted + report.replaced > 0;
    let missing = !canonical_path.exists();

    if changed || (missing && !record.is_empty()) {
        record.write_atomic(canonical_path).map_err(|e| {
            PipelineError::Merge(format!(
                "Failed to write canonical record {}: {}",
                canonical_path.display(),
                e
            ))
        })?;
        report.written = true;
    }

    debug!(
        shards = report.shards,
        rows = report.rows,
        inserted = report.inserted,
        replaced = report.replaced,
        written = report.written,
        "Merge complete"
    );

    Ok(report)
}

/// Merger bound to one model's layout
#[derive(Debug, Clone)]
pub struct ShardMerger {
    canonical_path: PathBuf,
    shard_dir: PathBuf,
    archive_dir: PathBuf,
}

impl ShardMerger {
    pub fn new(layout: &ModelLayout) -> Self {
        Self {
            canonical_path: layout.canonical_path(),
            shard_dir: layout.shard_dir(),
            archive_dir: layout.archive_dir(),
        }
    }

    pub fn canonical_path(&self) -> &Path {
        &self.canonical_path
    }

    /// Merge every unmerged shard
    pub fn merge(&self) -> Result<MergeReport> {
        let shards = list_shards(&self.shard_dir)?;
        merge(&self.canonical_path, &shards)
    }

    /// Merge every unmerged shard, then retire exactly the shards folded.
    ///
    /// Shards are only retired after the canonical write succeeded, so a
    /// crash at any point leaves them in place for the next merge.
    pub fn finalize(&self, retention: ShardRetention) -> Result<MergeReport> {
        let shards = list_shards(&self.shard_dir)?;
        let report = merge(&self.canonical_path, &shards)?;
        let retired = self.retire(&shards, retention);

        info!(
            rows = report.rows,
            shards = report.shards,
            retired = retired,
            retention = ?retention,
            path = %self.canonical_path.display(),
            "Canonical record finalized"
        );
        Ok(report)
    }

    /// Archive or delete shards. Failures are logged; a shard left behind is
    /// simply folded again next time.
    fn retire(&self, shards: &[PathBuf], retention: ShardRetention) -> usize {
        let mut retired = 0;

        for shard in shards {
            let result = match retention {
                ShardRetention::Delete => fs::remove_file(shard),
                ShardRetention::Archive => {
                    fs::create_dir_all(&self.archive_dir).and_then(|_| match shard.file_name() {
                        Some(name) => fs::rename(shard, self.archive_dir.join(name)),
                        None => Ok(()),
                    })
                }
            };

            match result {
                Ok(()) => retired += 1,
                Err(e) => warn!(shard = %shard.display(), error = %e, "Failed to retire shard"),
            }
        }

        retired
    }
}
