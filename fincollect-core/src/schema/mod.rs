//! Schema contracts, field mappings, period parsing and record validation.

pub mod contract;
pub mod mapping;
pub mod period;
pub mod validator;

pub use contract::{ContractError, ContractSpec, CrossCheck, FieldKind, FieldRule, RangeRule, SchemaContract};
pub use mapping::{FieldMapping, MappingError, MappingTable};
pub use period::{detect_frequency, parse_period, parse_timestamp};
pub use validator::{validate, Rule, ValidationError, ValidationResult, Validator, Violation};
