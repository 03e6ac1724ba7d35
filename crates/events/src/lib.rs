//! Provenance for TB-CSPN workflow runs.
//!
//! Every check the engine performs on a token (schema validation, guard
//! evaluation, join release, firing, sub-process call) produces a
//! [`ProvenanceEntry`]. Entries are delivered to a [`ProvenanceSink`] before
//! any error derived from the check is surfaced to the caller, so an audit
//! trail exists even for runs that fail.
//!
//! # Example
//!
//! ```ignore
//! use tbcspn_events::{
//!     CheckKind, InMemoryProvenanceSink, ProvenanceEntry, ProvenanceSink, TraceId,
//! };
//!
//! let sink = InMemoryProvenanceSink::new();
//! let trace = TraceId::new();
//! sink.record(ProvenanceEntry::passed(0, trace, "triage", CheckKind::Firing)).await?;
//! assert_eq!(sink.entries_for_trace(trace).await?.len(), 1);
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod provenance;
pub mod sink;
pub mod types;

pub use error::{Error, Result};
pub use provenance::{CheckKind, Outcome, ProvenanceEntry, Stage};
pub use sink::{InMemoryProvenanceSink, ProvenanceSink, TracingProvenanceSink};
pub use types::{EntryId, TaskId, TokenId, TraceId};
