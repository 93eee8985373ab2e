//! Result records
//!
//! Workers never touch the canonical record. Each appends to its own shard
//! and the coordinator folds shards into the canonical file.
//!
//! ```text
//! worker dev0 ──append──▶ .shards/M.dev0.<run>.csv ─┐
//! worker dev1 ──append──▶ .shards/M.dev1.<run>.csv ─┼─▶ ShardMerger ──rename──▶ MMeasured.csv
//!                           MMeasured.csv (prior) ───┘
//! ```

pub mod canonical;
pub mod merger;
pub mod row;
pub mod shard;

pub use canonical::{CanonicalRecord, Fold};
pub use merger::{merge, MergeReport, ShardMerger, ShardRetention};
pub use row::{MeasurementRow, COLUMNS};
pub use shard::{list_shards, ShardWriter};
