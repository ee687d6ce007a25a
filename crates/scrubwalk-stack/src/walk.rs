//! Node scrub state machine and the fragment walk inside directories.

use tracing::{debug, warn};

use scrubwalk_core::{DamageKind, FragmentId, NamespaceEntry, ScrubError, VerifyOutcome};

use crate::bridge::{Fetch, ScrubBackend};
use crate::entry::{DirWalk, EntryId, EntryState, ScrubEntry, WalkStep};
use crate::stack::{InFlight, PendingOp, ScrubStack, fragment_path};

/// What one pass over a directory entry achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirProgress {
    /// Child entries were pushed on top of the stack.
    pub added_children: bool,
    /// No descendants remain to be started.
    pub is_terminal: bool,
    /// The directory's children have all finished; it can be finalized.
    pub done: bool,
}

impl DirProgress {
    const WAITING: Self = Self {
        added_children: false,
        is_terminal: false,
        done: false,
    };

    const ADDED: Self = Self {
        added_children: true,
        is_terminal: false,
        done: false,
    };
}

impl<B: ScrubBackend> ScrubStack<B> {
    /// Scrub a file entry. Returns true once its verify has a result.
    pub(crate) fn scrub_file_entry(&mut self, id: EntryId) -> bool {
        let state = &self.entry(id).state;
        if matches!(state, EntryState::Complete) {
            return true;
        }
        if !matches!(state, EntryState::Pending) || !self.has_capacity() {
            return false;
        }

        let entry = self.entry(id);
        let target = entry.entry.clone();
        let tag = entry.header.tag.clone();
        let path = entry.path.clone();
        match self.start_verify(id, &target, &tag, PendingOp::VerifySelf) {
            Some(result) => {
                self.record_verify_result(id, &path, result);
                self.entry_mut(id).state = EntryState::Complete;
                true
            }
            None => {
                debug!(entry = %id, path = %path, "File verify pending");
                self.entry_mut(id).state = EntryState::Verifying;
                false
            }
        }
    }

    /// Make progress on a directory entry and its children.
    ///
    /// Starts the fragment walk on first visit, then drives it until it
    /// pushes a child, has to wait, or runs out of fragments.
    pub(crate) fn scrub_dir_entry(&mut self, id: EntryId) -> DirProgress {
        let state = &self.entry(id).state;
        if matches!(state, EntryState::Verifying | EntryState::Finalizing) {
            return DirProgress {
                added_children: false,
                is_terminal: true,
                done: false,
            };
        }
        if matches!(state, EntryState::Complete) {
            return DirProgress {
                added_children: false,
                is_terminal: true,
                done: true,
            };
        }
        if matches!(state, EntryState::Pending) {
            self.begin_dir_walk(id);
        }
        self.scrub_dirfrag(id)
    }

    fn begin_dir_walk(&mut self, id: EntryId) {
        let entry = self.entry(id);
        let fragments = if entry.descends() {
            let dir = entry.entry.clone();
            let path = entry.path.clone();
            match self.backend.fragments(&dir) {
                Ok(fragments) => fragments,
                Err(err) => {
                    warn!(path = %path, error = %err, "Could not list directory fragments");
                    self.record_fetch_failure(id, &path, &err);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        debug!(entry = %id, fragments = fragments.len(), "Starting directory walk");
        self.entry_mut(id).state = EntryState::Walking(DirWalk::new(fragments));
    }

    /// Walk the current fragment: push the next child directory, verify the
    /// next child file, or move on to the next fragment.
    ///
    /// With nothing left to start and children still running, reports no
    /// progress so the scheduler moves on.
    fn scrub_dirfrag(&mut self, id: EntryId) -> DirProgress {
        loop {
            let step = match self.entry_mut(id).walk_mut() {
                Some(walk) => walk.peek(),
                None => return DirProgress::WAITING,
            };

            match step {
                WalkStep::Waiting => return DirProgress::WAITING,
                WalkStep::Exhausted => {
                    let entry = self.entry_mut(id);
                    let awaiting = entry.awaiting.is_some();
                    let children_pending = entry.walk_mut().map_or(0, |w| w.children_pending);
                    return DirProgress {
                        added_children: false,
                        is_terminal: true,
                        done: children_pending == 0 && !awaiting,
                    };
                }
                WalkStep::Fetch(frag) => {
                    if !self.has_capacity() || !self.get_next_fragment(id, frag) {
                        return DirProgress::WAITING;
                    }
                }
                WalkStep::Child(child) if child.is_dir() => {
                    self.push_child(id, child);
                    return DirProgress::ADDED;
                }
                WalkStep::Child(child) => {
                    if !self.has_capacity() {
                        return DirProgress::WAITING;
                    }
                    let entry = self.entry_mut(id);
                    if let Some(walk) = entry.walk_mut() {
                        walk.consume_child();
                    }
                    let path = child.child_path(&entry.path);
                    let tag = entry.header.tag.clone();
                    let op = PendingOp::VerifyChild { path: path.clone() };
                    match self.start_verify(id, &child, &tag, op) {
                        Some(result) => self.record_verify_result(id, &path, result),
                        None => return DirProgress::WAITING,
                    }
                }
            }
        }
    }

    /// Load the next fragment of a directory.
    ///
    /// Returns false if the fetch went async; the continuation re-enters the
    /// scheduler once the fragment is resident.
    fn get_next_fragment(&mut self, id: EntryId, frag: FragmentId) -> bool {
        let entry = self.entry_mut(id);
        let dir = entry.entry.clone();
        let path = entry.path.clone();
        if let Some(walk) = entry.walk_mut() {
            walk.begin_fetch(frag);
        }

        let completer = self.deferred.completer();
        let token = completer.token();
        match self.backend.fetch_fragment(&dir, frag, completer) {
            Fetch::Ready(Ok(children)) => {
                debug!(path = %path, ?frag, children = children.len(), "Fragment resident");
                if let Some(walk) = self.entry_mut(id).walk_mut() {
                    walk.load(children);
                }
                true
            }
            Fetch::Ready(Err(err)) => {
                warn!(path = %path, ?frag, error = %err, "Fragment fetch failed");
                if let Some(walk) = self.entry_mut(id).walk_mut() {
                    walk.skip_fragment();
                }
                self.record_fetch_failure(id, &fragment_path(&path, Some(frag)), &err);
                true
            }
            Fetch::Pending => {
                debug!(path = %path, ?frag, token, "Fragment fetch pending");
                self.track(id, token, PendingOp::Fragment);
                false
            }
        }
    }

    /// Push a child directory on top of the stack, inheriting the job header.
    fn push_child(&mut self, parent_id: EntryId, child: NamespaceEntry) {
        let parent = self.entry_mut(parent_id);
        if let Some(walk) = parent.walk_mut() {
            walk.consume_child();
            walk.children_pending += 1;
        }
        let path = child.child_path(&parent.path);
        let header = parent.header.clone();

        debug!(parent = %parent_id, path = %path, "Pushing child directory");
        let entry = ScrubEntry::new(child, path, header, Some(parent_id));
        let id = self.insert_entry(entry);
        self.push_entry(id);
    }

    /// Verify a directory's own object once all of its children are done.
    ///
    /// Returns true once that verify has a result.
    pub(crate) fn scrub_dir_entry_final(&mut self, id: EntryId) -> bool {
        let state = &self.entry(id).state;
        if matches!(state, EntryState::Complete) {
            return true;
        }
        if !matches!(state, EntryState::Walking(_)) || !self.has_capacity() {
            return false;
        }

        let entry = self.entry(id);
        let target = entry.entry.clone();
        let tag = entry.header.tag.clone();
        let path = entry.path.clone();
        match self.start_verify(id, &target, &tag, PendingOp::VerifySelf) {
            Some(result) => {
                self.record_verify_result(id, &path, result);
                self.entry_mut(id).state = EntryState::Complete;
                true
            }
            None => {
                debug!(entry = %id, path = %path, "Directory verify pending");
                self.entry_mut(id).state = EntryState::Finalizing;
                false
            }
        }
    }

    /// Issue a verify; `None` means it went async and the entry now waits.
    fn start_verify(
        &mut self,
        id: EntryId,
        target: &NamespaceEntry,
        tag: &str,
        op: PendingOp,
    ) -> Option<Result<VerifyOutcome, ScrubError>> {
        let completer = self.deferred.completer();
        let token = completer.token();
        match self.backend.verify(target, tag, completer) {
            Fetch::Ready(result) => Some(result),
            Fetch::Pending => {
                self.track(id, token, op);
                None
            }
        }
    }

    fn track(&mut self, id: EntryId, token: u64, op: PendingOp) {
        self.in_flight.insert(token, InFlight { entry: id, op });
        self.entry_mut(id).awaiting = Some(token);
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.config.has_capacity(self.in_flight.len())
    }

    /// Fold a verify result into the entry's outcome.
    pub(crate) fn record_verify_result(
        &mut self,
        id: EntryId,
        path: &str,
        result: Result<VerifyOutcome, ScrubError>,
    ) {
        let limit = self.config.max_damage_records;
        match result {
            Ok(outcome) => {
                let mismatch = !outcome.is_match();
                if let VerifyOutcome::Mismatch { detail } = &outcome {
                    warn!(path = %path, detail = %detail, "Scrub mismatch");
                }
                self.entry_mut(id).outcome.record_verify(path, outcome, limit);
                self.tracker.record_verify(mismatch);
            }
            Err(err) => {
                warn!(path = %path, error = %err, "Verify failed");
                self.entry_mut(id)
                    .outcome
                    .record_failure(path, DamageKind::VerifyFailed, err.to_string(), limit);
                self.tracker.record_error();
            }
        }
    }

    fn record_fetch_failure(&mut self, id: EntryId, path: &str, err: &ScrubError) {
        let limit = self.config.max_damage_records;
        self.entry_mut(id)
            .outcome
            .record_failure(path, DamageKind::FetchFailed, err.to_string(), limit);
        self.tracker.record_error();
    }
}
