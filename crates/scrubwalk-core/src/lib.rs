//! Core types for scrubwalk.
//!
//! This crate provides the data structures shared by the scrub scheduler and
//! its collaborators: namespace entries, job headers, verification outcomes,
//! configuration, and errors.

mod config;
mod error;
mod header;
mod node;
mod outcome;

pub use config::{ScrubConfig, ScrubConfigBuilder};
pub use error::ScrubError;
pub use header::ScrubHeader;
pub use node::{FragmentId, NamespaceEntry, ObjectId, ObjectKind};
pub use outcome::{DamageKind, DamageRecord, ScrubOutcome, VerifyOutcome};
