//! fincollect core: the ingestion pipeline shared by every collector.
//!
//! - Raw and normalized record types
//! - Schema contracts, period parsing and record validation
//! - Field mappings and the normalizer
//! - Batch quality scoring
//! - Source clients (CSV, HTTP JSON), retry policy, throttle, circuit breaker
//! - Parquet partition store

pub mod data;
pub mod domain;
pub mod normalize;
pub mod quality;
pub mod schema;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: types handed across rayon workers are Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::RawRecord>();
        require_sync::<domain::RawRecord>();
        require_send::<domain::NormalizedRecord>();
        require_sync::<domain::NormalizedRecord>();
        require_send::<schema::Validator>();
        require_sync::<schema::Validator>();
        require_send::<normalize::Normalizer>();
        require_sync::<normalize::Normalizer>();
        require_send::<quality::QualityReport>();
        require_sync::<quality::QualityReport>();

        require_send::<data::ParquetStore>();
        require_sync::<data::ParquetStore>();
        require_send::<data::Throttle>();
        require_sync::<data::Throttle>();
        require_send::<data::CircuitBreaker>();
        require_sync::<data::CircuitBreaker>();
        require_send::<data::CsvSource>();
        require_sync::<data::CsvSource>();
        require_send::<data::HttpJsonSource>();
        require_sync::<data::HttpJsonSource>();
        require_send::<data::FetchError>();
        require_sync::<data::StorageError>();
    }
}
