//! Normalization of validated raw records into the unified record schema.

pub mod frequency;
pub mod normalizer;

pub use frequency::infer_frequency;
pub use normalizer::{dataset_id, ItemContext, NormalizationError, Normalizer};
