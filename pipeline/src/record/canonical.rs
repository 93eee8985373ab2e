//! Canonical measurement record: one row per variant, sorted by variant.

use super::row::{decode_rows, encode_header, encode_row, MeasurementRow};
use crate::errors::Result;
use crate::fsutil::write_atomic;
use crate::work::VariantKey;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Outcome of folding one row into the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    /// Key was not present
    Inserted,
    /// Key was present with different values and the new row won
    Replaced,
    /// Key was present and the existing row was kept
    Kept,
    /// Exact same row was already present
    Unchanged,
}

/// In-memory image of the canonical record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRecord {
    rows: BTreeMap<VariantKey, MeasurementRow>,
}

impl CanonicalRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the record from disk. A missing file is an empty record.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };

        let mut record = Self::new();
        for row in decode_rows(&bytes, path).rows {
            if record.fold(row) == Fold::Replaced {
                warn!(path = %path.display(), "Canonical record had a duplicate key");
            }
        }
        Ok(record)
    }

    /// Fold a row in with last-write-wins on key collision.
    ///
    /// The row with the later `measured_at_ms` wins; on equal timestamps the
    /// incoming row wins. Folding a row that is already present is a no-op.
    pub fn fold(&mut self, row: MeasurementRow) -> Fold {
        match self.rows.get(&row.variant) {
            None => {
                self.rows.insert(row.variant, row);
                Fold::Inserted
            }
            Some(existing) if same_row(existing, &row) => Fold::Unchanged,
            Some(existing) if row.measured_at_ms >= existing.measured_at_ms => {
                self.rows.insert(row.variant, row);
                Fold::Replaced
            }
            Some(_) => Fold::Kept,
        }
    }

    pub fn contains(&self, variant: &VariantKey) -> bool {
        self.rows.contains_key(variant)
    }

    pub fn get(&self, variant: &VariantKey) -> Option<&MeasurementRow> {
        self.rows.get(variant)
    }

    /// Rows in variant order
    pub fn rows(&self) -> impl Iterator<Item = &MeasurementRow> {
        self.rows.values()
    }

    pub fn variants(&self) -> impl Iterator<Item = &VariantKey> {
        self.rows.keys()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Serialized form: header plus rows sorted by variant
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut bytes = encode_header()?;
        for row in self.rows.values() {
            bytes.extend(encode_row(row)?);
        }
        Ok(bytes)
    }

    /// Atomically replace the file at `path` with this record
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_csv()?)
    }
}

/// Row equality that treats NaN metrics as equal to themselves
fn same_row(a: &MeasurementRow, b: &MeasurementRow) -> bool {
    a.variant == b.variant
        && a.device == b.device
        && a.measured_at_ms == b.measured_at_ms
        && a.gib.to_bits() == b.gib.to_bits()
        && a.kl_div.to_bits() == b.kl_div.to_bits()
        && a.ppl.to_bits() == b.ppl.to_bits()
}
