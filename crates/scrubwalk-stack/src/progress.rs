//! Scrub progress reporting.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Progress information for a scrub stack.
#[derive(Debug, Clone, Serialize)]
pub struct ScrubProgress {
    /// Entries popped off the stack so far.
    pub entries_completed: u64,
    /// Objects whose verify reached a result.
    pub objects_verified: u64,
    /// Mismatches found so far.
    pub mismatches: u64,
    /// Fetch or verify failures so far.
    pub errors: u64,
    /// Async operations currently outstanding.
    pub in_flight: usize,
    /// Entries currently on the stack.
    pub stack_depth: usize,
    /// Time since the stack was created.
    pub elapsed: Duration,
}

impl ScrubProgress {
    /// Create initial progress state.
    pub fn new() -> Self {
        Self {
            entries_completed: 0,
            objects_verified: 0,
            mismatches: 0,
            errors: 0,
            in_flight: 0,
            stack_depth: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Calculate verify rate in objects per second.
    pub fn objects_per_second(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            self.objects_verified as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Check if the stack had nothing left to do at snapshot time.
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.stack_depth == 0
    }
}

impl Default for ScrubProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Internal progress tracker with timing.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    start_time: Instant,
    entries_completed: u64,
    objects_verified: u64,
    mismatches: u64,
    errors: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            entries_completed: 0,
            objects_verified: 0,
            mismatches: 0,
            errors: 0,
        }
    }

    pub fn record_entry(&mut self) {
        self.entries_completed += 1;
    }

    pub fn record_verify(&mut self, mismatch: bool) {
        self.objects_verified += 1;
        if mismatch {
            self.mismatches += 1;
        }
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn snapshot(&self, in_flight: usize, stack_depth: usize) -> ScrubProgress {
        ScrubProgress {
            entries_completed: self.entries_completed,
            objects_verified: self.objects_verified,
            mismatches: self.mismatches,
            errors: self.errors,
            in_flight,
            stack_depth,
            elapsed: self.start_time.elapsed(),
        }
    }
}
