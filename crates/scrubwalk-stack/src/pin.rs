//! Pin counts for objects referenced by queued scrub entries.

use std::sync::Arc;

use dashmap::DashMap;
use scrubwalk_core::ObjectId;

/// Tracks which objects are pinned by the scrub stack.
///
/// The stack pins an entry's target when it is pushed and unpins it when it
/// is popped. Clones share the same table, so an eviction path on another
/// thread can consult [`PinTable::is_pinned`] before dropping an object.
#[derive(Debug, Clone, Default)]
pub struct PinTable {
    counts: Arc<DashMap<ObjectId, usize>>,
}

impl PinTable {
    /// Create an empty pin table.
    pub fn new() -> Self {
        Self {
            counts: Arc::new(DashMap::new()),
        }
    }

    /// Take a pin on an object. Returns the new pin count.
    pub fn pin(&self, object: ObjectId) -> usize {
        let mut count = self.counts.entry(object).or_insert(0);
        *count += 1;
        *count
    }

    /// Release a pin. Returns the remaining pin count.
    ///
    /// # Panics
    ///
    /// Panics if the object is not pinned; an unbalanced unpin means the
    /// stack's bookkeeping is corrupt.
    pub fn unpin(&self, object: ObjectId) -> usize {
        let remaining = {
            let Some(mut count) = self.counts.get_mut(&object) else {
                panic!("unpin of object {object} which is not pinned");
            };
            *count -= 1;
            *count
        };
        if remaining == 0 {
            self.counts.remove_if(&object, |_, count| *count == 0);
        }
        remaining
    }

    /// Check if an object may not be evicted.
    pub fn is_pinned(&self, object: ObjectId) -> bool {
        self.counts.contains_key(&object)
    }

    /// Number of distinct pinned objects.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Check if nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
