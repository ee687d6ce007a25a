//! Verification results and aggregate scrub outcomes.

use serde::{Deserialize, Serialize};

/// Result of verifying a single object against its stored representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyOutcome {
    /// Stored and computed state agree.
    Match,
    /// Stored and computed state disagree.
    Mismatch {
        /// Human-readable description of the difference.
        detail: String,
    },
}

impl VerifyOutcome {
    /// Create a mismatch outcome.
    pub fn mismatch(detail: impl Into<String>) -> Self {
        Self::Mismatch {
            detail: detail.into(),
        }
    }

    /// Check if the object verified cleanly.
    pub fn is_match(&self) -> bool {
        matches!(self, VerifyOutcome::Match)
    }
}

/// Kind of damage found during a scrub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DamageKind {
    /// Object state disagrees with its stored representation.
    Mismatch,
    /// A directory fragment could not be fetched.
    FetchFailed,
    /// The verify call itself failed.
    VerifyFailed,
}

impl std::fmt::Display for DamageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mismatch => write!(f, "mismatch"),
            Self::FetchFailed => write!(f, "fetch failed"),
            Self::VerifyFailed => write!(f, "verify failed"),
        }
    }
}

/// One piece of damage found during a scrub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageRecord {
    /// Namespace path of the damaged object.
    pub path: String,
    /// What went wrong.
    pub kind: DamageKind,
    /// Diagnostic detail from the verifier or fetcher.
    pub detail: String,
}

impl DamageRecord {
    /// Create a new damage record.
    pub fn new(path: impl Into<String>, kind: DamageKind, detail: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            detail: detail.into(),
        }
    }
}

/// Aggregate outcome of scrubbing an entry and, if recursive, its subtree.
///
/// Counters are exact. The damage list keeps at most `limit` records per
/// outcome; anything beyond is counted in `damage_dropped`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubOutcome {
    /// Objects whose verify reached a result (match or mismatch).
    pub objects_verified: u64,
    /// Objects whose stored state disagreed with computed state.
    pub mismatches: u64,
    /// Fetch or verify failures.
    pub errors: u64,
    /// Damage details, in discovery order.
    pub damage: Vec<DamageRecord>,
    /// Damage records discarded because the list was full.
    pub damage_dropped: u64,
}

impl ScrubOutcome {
    /// Create an empty (passing) outcome.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no mismatches or failures were found.
    pub fn passed(&self) -> bool {
        self.mismatches == 0 && self.errors == 0
    }

    /// Total number of problems found.
    pub fn problem_count(&self) -> u64 {
        self.mismatches + self.errors
    }

    /// Fold one verify result into this outcome.
    pub fn record_verify(&mut self, path: &str, outcome: VerifyOutcome, limit: usize) {
        self.objects_verified += 1;
        if let VerifyOutcome::Mismatch { detail } = outcome {
            self.mismatches += 1;
            self.push_damage(DamageRecord::new(path, DamageKind::Mismatch, detail), limit);
        }
    }

    /// Record a failed fetch or verify.
    pub fn record_failure(
        &mut self,
        path: &str,
        kind: DamageKind,
        detail: impl Into<String>,
        limit: usize,
    ) {
        self.errors += 1;
        self.push_damage(DamageRecord::new(path, kind, detail), limit);
    }

    /// Merge a child outcome into this one.
    pub fn merge(&mut self, other: ScrubOutcome, limit: usize) {
        self.objects_verified += other.objects_verified;
        self.mismatches += other.mismatches;
        self.errors += other.errors;
        self.damage_dropped += other.damage_dropped;
        for record in other.damage {
            self.push_damage(record, limit);
        }
    }

    fn push_damage(&mut self, record: DamageRecord, limit: usize) {
        if self.damage.len() < limit {
            self.damage.push(record);
        } else {
            self.damage_dropped += 1;
        }
    }
}
