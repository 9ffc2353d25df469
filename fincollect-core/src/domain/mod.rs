//! Domain types shared by every pipeline stage.

pub mod dataset;
pub mod normalized;
pub mod record;

pub use dataset::DatasetType;
pub use normalized::{Frequency, NormalizedRecord, RecordValues};
pub use record::{parse_numeric, FieldValue, Provenance, RawRecord};
