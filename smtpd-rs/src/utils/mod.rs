//! Utility modules
//!
//! - [`address`]: envelope path parsing and validation (RFC 5321)

pub mod address;

pub use address::{dedup_key, domain_of, parse_path, validate_address};
