//! Scrub job descriptor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NamespaceEntry;

/// Externally supplied parameters of one scrub job.
///
/// Created once per enqueue and shared read-only by every entry visited in
/// that job's subtree walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubHeader {
    /// Tag stamped on every verified object. Empty means no stamping.
    pub tag: String,

    /// Entry the job started from.
    pub origin: NamespaceEntry,

    /// Scrub the entire hierarchy under the origin.
    pub recursive: bool,

    /// Scrub the origin's direct children without recursing further.
    pub include_children: bool,

    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
}

impl ScrubHeader {
    /// Create a header for a job rooted at `origin`.
    pub fn new(
        tag: impl Into<String>,
        origin: NamespaceEntry,
        recursive: bool,
        include_children: bool,
    ) -> Self {
        Self {
            tag: tag.into(),
            origin,
            recursive,
            include_children,
            created_at: Utc::now(),
        }
    }

    /// Check if this job stamps a tag on verified objects.
    pub fn has_tag(&self) -> bool {
        !self.tag.is_empty()
    }
}
