//! Configuration fingerprints
//!
//! A fingerprint records the parameters a quantized variant was built with.
//! Resuming into an output built with different parameters must re-run it, so
//! completeness requires the stored digest to equal the digest of the
//! parameters requested now.

use crate::errors::Result;
use crate::fsutil::{now_ms, write_atomic};
use crate::work::{Stage, VariantKey, WorkItem};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

const DIGEST_VERSION: &str = "quantpipe-fp-v1";

/// Parameters a variant's artifacts were produced with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub stage: Stage,
    pub model_id: String,
    pub variant: VariantKey,
    pub passthrough: Vec<String>,

    /// Hex SHA-256 over the fields above
    pub digest: String,

    /// When the fingerprint was written (Unix ms)
    #[serde(default)]
    pub created_at_ms: u64,
}

impl Fingerprint {
    /// Fingerprint of the parameters an item would be produced with
    pub fn for_item(item: &WorkItem) -> Self {
        let digest = compute_digest(
            item.stage,
            &item.model_id,
            &item.variant,
            &item.params.passthrough,
        );
        Self {
            stage: item.stage,
            model_id: item.model_id.clone(),
            variant: item.variant,
            passthrough: item.params.passthrough.clone(),
            digest,
            created_at_ms: now_ms(),
        }
    }

    /// Whether the stored digest still agrees with the stored fields
    pub fn is_intact(&self) -> bool {
        self.digest == compute_digest(self.stage, &self.model_id, &self.variant, &self.passthrough)
    }

    /// Whether this fingerprint describes the same parameters as `other`
    pub fn matches(&self, other: &Fingerprint) -> bool {
        self.digest == other.digest
    }

    /// Read a fingerprint file. `Ok(None)` if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Write atomically to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }
}

fn compute_digest(stage: Stage, model_id: &str, variant: &VariantKey, passthrough: &[String]) -> String {
    let variant = variant.to_string();
    let mut hasher = Sha256::new();
    for field in [DIGEST_VERSION, stage.as_str(), model_id, variant.as_str()] {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    for arg in passthrough {
        hasher.update(arg.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
