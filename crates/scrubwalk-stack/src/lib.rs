//! Depth-first scrub scheduling engine for scrubwalk.
//!
//! This crate walks a hierarchical namespace and verifies every object it
//! visits without blocking the thread that owns the namespace.
//!
//! # Overview
//!
//! - **Scrub stack** - ordered pending entries; the top is always serviced
//!   first, and a directory's children are pushed above it so one subtree
//!   drains before its siblings or other jobs
//! - **Node state machine** - files get a single verify; directories walk
//!   their fragments, push child directories, verify child files, and finally
//!   verify themselves
//! - **Async fetch bridge** - [`ScrubBackend`] calls return [`Fetch::Ready`]
//!   or [`Fetch::Pending`]; pending results come back through a
//!   [`Completer`] on a later turn, never on the caller's stack
//! - **Pinning** - every queued entry pins its object in a shared [`PinTable`]
//!
//! # Example
//!
//! ```rust,ignore
//! use scrubwalk_stack::{NamespaceEntry, ObjectId, ScrubStack};
//!
//! let mut stack = ScrubStack::new(backend);
//! let root = NamespaceEntry::directory("/", ObjectId::new(1));
//! stack.enqueue_top(root, true, true, "nightly", |_stack, outcome| {
//!     println!("passed: {}, mismatches: {}", outcome.passed(), outcome.mismatches);
//! });
//!
//! // Inside the owning task:
//! stack.run_until_idle().await;
//! ```

mod bridge;
mod deferred;
mod entry;
mod pin;
mod progress;
mod stack;
mod walk;

pub use bridge::{Completer, Completion, Fetch, FragmentContents, ScrubBackend};
pub use deferred::{Deferred, OpToken, ScrubHandle};
pub use entry::EntryId;
pub use pin::PinTable;
pub use progress::ScrubProgress;
pub use stack::{JobStatus, OnFinish, ScrubStack, ScrubStatus};

// Re-export core types for convenience
pub use scrubwalk_core::{
    DamageKind, DamageRecord, FragmentId, NamespaceEntry, ObjectId, ObjectKind, ScrubConfig,
    ScrubError, ScrubHeader, ScrubOutcome, VerifyOutcome,
};
