//! Core types shared by the TB-CSPN crates.
//!
//! Holds the low-level error taxonomy used when reading definition
//! documents (schemas, processes, engine configuration) and the helpers
//! that load those documents from JSON, YAML or TOML files.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod document;
pub mod error;
pub mod result;

pub use document::{load_document, parse_document, DocumentFormat};
pub use error::Error;
pub use result::{Result, ResultExt};
