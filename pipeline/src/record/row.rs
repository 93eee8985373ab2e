//! Measurement rows and their CSV encoding.

use crate::errors::Result;
use crate::work::VariantKey;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Column order of every shard and of the canonical record
pub const COLUMNS: [&str; 6] = ["variant", "gib", "kl_div", "ppl", "device", "measured_at_ms"];

/// Metrics for one measured variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRow {
    /// Variant this row describes
    pub variant: VariantKey,

    /// On-disk size of the variant's weights (GiB)
    pub gib: f64,

    /// KL divergence against the base model (0 for the base itself)
    pub kl_div: f64,

    /// Perplexity
    pub ppl: f64,

    /// Device that produced the row
    pub device: u32,

    /// Completion time, used to order rows for the same variant
    pub measured_at_ms: u64,
}

fn writer_builder() -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder.terminator(csv::Terminator::Any(b'\n'));
    builder
}

/// Encode the header line
pub fn encode_header() -> Result<Vec<u8>> {
    let mut wtr = writer_builder().has_headers(false).from_writer(vec![]);
    wtr.write_record(COLUMNS)?;
    wtr.into_inner()
        .map_err(|e| crate::errors::PipelineError::Serialization(e.to_string()))
}

/// Encode one row as a single newline-terminated line
pub fn encode_row(row: &MeasurementRow) -> Result<Vec<u8>> {
    let mut wtr = writer_builder().has_headers(false).from_writer(vec![]);
    wtr.serialize(row)?;
    wtr.into_inner()
        .map_err(|e| crate::errors::PipelineError::Serialization(e.to_string()))
}

/// Result of decoding a row file
#[derive(Debug, Default)]
pub struct DecodedRows {
    pub rows: Vec<MeasurementRow>,

    /// Lines that could not be decoded (including a torn final line)
    pub skipped: usize,
}

/// Decode rows from CSV bytes.
///
/// A final line without its newline is a torn append from a crashed writer and
/// is ignored. Other undecodable lines are skipped with a warning.
pub fn decode_rows(bytes: &[u8], source: &Path) -> DecodedRows {
    let mut decoded = DecodedRows::default();

    let complete = match bytes.iter().rposition(|&b| b == b'\n') {
        Some(pos) => &bytes[..=pos],
        None => &bytes[..0],
    };
    if complete.len() < bytes.len() {
        warn!(path = %source.display(), "Ignoring torn trailing row");
        decoded.skipped += 1;
    }

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(complete);

    for (idx, result) in rdr.deserialize::<MeasurementRow>().enumerate() {
        match result {
            Ok(row) => decoded.rows.push(row),
            Err(e) => {
                warn!(
                    path = %source.display(),
                    line = idx + 2,
                    error = %e,
                    "Skipping unreadable row"
                );
                decoded.skipped += 1;
            }
        }
    }

    decoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(variant: &str, ppl: f64) -> MeasurementRow {
        MeasurementRow {
            variant: variant.parse().unwrap(),
            gib: 4.25,
            kl_div: 0.031,
            ppl,
            device: 1,
            measured_at_ms: 1_700_000_000_000,
        }
    }

    fn file(rows: &[MeasurementRow]) -> Vec<u8> {
        let mut bytes = encode_header().unwrap();
        for r in rows {
            bytes.extend(encode_row(r).unwrap());
        }
        bytes
    }

    #[test]
    fn test_header_column_order() {
        let header = String::from_utf8(encode_header().unwrap()).unwrap();
        assert_eq!(header, "variant,gib,kl_div,ppl,device,measured_at_ms\n");
    }

    #[test]
    fn test_row_is_one_line() {
        let line = String::from_utf8(encode_row(&row("2.5", 9.5)).unwrap()).unwrap();
        assert!(line.starts_with("2.5,4.25,0.031,9.5,1,"));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_decode_reads_all_rows() {
        let bytes = file(&[row("bf16", 7.1), row("4", 7.9)]);
        let decoded = decode_rows(&bytes, Path::new("shard.csv"));
        assert_eq!(decoded.rows.len(), 2);
        assert_eq!(decoded.rows[0].variant, VariantKey::Base);
        assert_eq!(decoded.skipped, 0);
    }

    #[test]
    fn test_decode_ignores_torn_final_line() {
        let mut bytes = file(&[row("2", 12.0)]);
        let torn = encode_row(&row("3", 10.0)).unwrap();
        bytes.extend(&torn[..torn.len() / 2]);

        let decoded = decode_rows(&bytes, Path::new("shard.csv"));
        assert_eq!(decoded.rows.len(), 1);
        assert_eq!(decoded.rows[0].variant, "2".parse().unwrap());
        assert_eq!(decoded.skipped, 1);
    }

    #[test]
    fn test_decode_skips_garbage_lines() {
        let mut bytes = file(&[row("2", 12.0)]);
        bytes.extend(b"not,a,row\n");
        bytes.extend(encode_row(&row("3", 10.0)).unwrap());

        let decoded = decode_rows(&bytes, Path::new("shard.csv"));
        assert_eq!(decoded.rows.len(), 2);
        assert_eq!(decoded.skipped, 1);
    }

    #[test]
    fn test_decode_empty_and_header_only() {
        assert!(decode_rows(b"", Path::new("x")).rows.is_empty());
        let header = encode_header().unwrap();
        let decoded = decode_rows(&header, Path::new("x"));
        assert!(decoded.rows.is_empty());
        assert_eq!(decoded.skipped, 0);
    }

    #[test]
    fn test_non_finite_metrics_survive() {
        let mut r = row("2", f64::INFINITY);
        r.kl_div = f64::NAN;
        let bytes = file(&[r]);
        let decoded = decode_rows(&bytes, Path::new("x"));
        assert!(decoded.rows[0].ppl.is_infinite());
        assert!(decoded.rows[0].kl_div.is_nan());
    }
}
