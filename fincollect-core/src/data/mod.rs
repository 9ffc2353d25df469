//! Source clients, fetch pacing and Parquet storage.

pub mod circuit_breaker;
pub mod csv_source;
pub mod http_source;
pub mod retry;
pub mod source;
pub mod store;
pub mod throttle;

pub use circuit_breaker::CircuitBreaker;
pub use csv_source::CsvSource;
pub use http_source::{HttpJsonConfig, HttpJsonSource};
pub use retry::RetryPolicy;
pub use source::{DateRange, FetchError, SourceClient};
pub use store::{partition_key, ParquetStore, PartitionMeta, PartitionStatus, StorageError, WriteResult};
pub use throttle::Throttle;
