//! Scrub entries and their per-node state.

use std::sync::Arc;

use scrubwalk_core::{FragmentId, NamespaceEntry, ScrubHeader, ScrubOutcome};

use crate::deferred::OpToken;

/// Arena index of an entry on the scrub stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an entry is in its scrub.
#[derive(Debug)]
pub(crate) enum EntryState {
    /// Not visited yet.
    Pending,
    /// File: waiting for its verify.
    Verifying,
    /// Directory: walking fragments and children.
    Walking(DirWalk),
    /// Directory: waiting for its own verify.
    Finalizing,
    /// Own verify and every descendant are finished.
    Complete,
}

/// One namespace entry being scrubbed.
#[derive(Debug)]
pub(crate) struct ScrubEntry {
    pub entry: NamespaceEntry,
    /// Namespace path, for damage records and logging.
    pub path: String,
    pub header: Arc<ScrubHeader>,
    pub parent: Option<EntryId>,
    pub state: EntryState,
    pub outcome: ScrubOutcome,
    /// Outstanding async operation. At most one per entry.
    pub awaiting: Option<OpToken>,
}

impl ScrubEntry {
    pub fn new(
        entry: NamespaceEntry,
        path: String,
        header: Arc<ScrubHeader>,
        parent: Option<EntryId>,
    ) -> Self {
        Self {
            entry,
            path,
            header,
            parent,
            state: EntryState::Pending,
            outcome: ScrubOutcome::new(),
            awaiting: None,
        }
    }

    /// Whether the walk should look at this directory's children at all.
    ///
    /// The job's starting directory honors both flags. Below it only
    /// `recursive` descends; otherwise child directories verify themselves.
    pub fn descends(&self) -> bool {
        match self.parent {
            None => self.header.recursive || self.header.include_children,
            Some(_) => self.header.recursive,
        }
    }

    pub fn walk_mut(&mut self) -> Option<&mut DirWalk> {
        match &mut self.state {
            EntryState::Walking(walk) => Some(walk),
            _ => None,
        }
    }
}

/// What the fragment walk should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WalkStep {
    /// The next fragment must be fetched.
    Fetch(FragmentId),
    /// The next child of the loaded fragment.
    Child(NamespaceEntry),
    /// A fetch is outstanding.
    Waiting,
    /// Every fragment has been walked.
    Exhausted,
}

#[derive(Debug)]
enum FragmentCursor {
    Idle,
    Fetching(FragmentId),
    Loaded {
        children: Vec<NamespaceEntry>,
        next: usize,
    },
}

/// Cursor over a directory's fragments and the children inside them.
#[derive(Debug)]
pub(crate) struct DirWalk {
    fragments: Vec<FragmentId>,
    next_fragment: usize,
    cursor: FragmentCursor,
    /// Child entries pushed onto the stack that have not popped yet.
    pub children_pending: usize,
}

impl DirWalk {
    pub fn new(fragments: Vec<FragmentId>) -> Self {
        Self {
            fragments,
            next_fragment: 0,
            cursor: FragmentCursor::Idle,
            children_pending: 0,
        }
    }

    /// Look at the next step without consuming it.
    pub fn peek(&mut self) -> WalkStep {
        loop {
            match &self.cursor {
                FragmentCursor::Fetching(_) => return WalkStep::Waiting,
                FragmentCursor::Loaded { children, next } => {
                    if let Some(child) = children.get(*next) {
                        return WalkStep::Child(child.clone());
                    }
                    self.cursor = FragmentCursor::Idle;
                }
                FragmentCursor::Idle => {
                    return match self.fragments.get(self.next_fragment) {
                        Some(frag) => WalkStep::Fetch(*frag),
                        None => WalkStep::Exhausted,
                    };
                }
            }
        }
    }

    /// Consume the child returned by the last `peek`.
    pub fn consume_child(&mut self) {
        if let FragmentCursor::Loaded { next, .. } = &mut self.cursor {
            *next += 1;
        }
    }

    /// Consume the fragment returned by the last `peek` and mark it in flight.
    pub fn begin_fetch(&mut self, frag: FragmentId) {
        self.next_fragment += 1;
        self.cursor = FragmentCursor::Fetching(frag);
    }

    /// Install the contents of the fragment being fetched.
    pub fn load(&mut self, children: Vec<NamespaceEntry>) {
        self.cursor = FragmentCursor::Loaded { children, next: 0 };
    }

    /// Give up on the fragment being fetched and move on.
    pub fn skip_fragment(&mut self) {
        self.cursor = FragmentCursor::Idle;
    }

    /// Fragment currently being fetched, if any.
    pub fn fetching(&self) -> Option<FragmentId> {
        match self.cursor {
            FragmentCursor::Fetching(frag) => Some(frag),
            _ => None,
        }
    }
}
