//! Work item model: what a job is and how it is identified.

mod item;
mod variant;

pub use item::{ItemId, Stage, VariantParams, WorkItem};
pub use variant::{parse_variant_list, BitsPerWeight, VariantKey};
