//! The scrub stack: ordered pending entries and the scheduling loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use scrubwalk_core::{
    DamageKind, NamespaceEntry, ObjectKind, ScrubConfig, ScrubHeader, ScrubOutcome,
};

use crate::bridge::ScrubBackend;
use crate::deferred::{Deferred, DeferredQueue, OpToken, ScrubHandle};
use crate::entry::{EntryId, EntryState, ScrubEntry};
use crate::pin::PinTable;
use crate::progress::{ProgressTracker, ScrubProgress};

/// Callback fired exactly once when an enqueued entry (and, if recursive,
/// its whole subtree) has finished scrubbing.
///
/// It receives the stack, so it may enqueue follow-up work; any scheduling
/// pass it triggers runs on the next turn rather than re-entering the
/// current one.
pub type OnFinish<B> = Box<dyn FnOnce(&mut ScrubStack<B>, ScrubOutcome) + Send>;

/// What one outstanding async operation was for.
#[derive(Debug)]
pub(crate) enum PendingOp {
    /// Fragment fetch for a directory entry.
    Fragment,
    /// Verify of the entry's own object.
    VerifySelf,
    /// Verify of a file child found by a directory's fragment walk.
    VerifyChild { path: String },
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub entry: EntryId,
    pub op: PendingOp,
}

/// Result of advancing one entry by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advance {
    /// New children were pushed on top; rescan from the top.
    Pushed,
    /// The entry finished and was popped.
    Popped,
    /// No progress possible until an async result or a child arrives.
    ///
    /// `terminal` entries have nothing left to start, so the pass may look
    /// at the entry below. A non-terminal entry ends the pass.
    Blocked { terminal: bool },
}

/// Snapshot of one live scrub job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// Tag of the job.
    pub tag: String,
    /// Path the job started from.
    pub origin_path: String,
    /// Whether the job descends the whole hierarchy.
    pub recursive: bool,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Entries of this job on the stack.
    pub entries: usize,
}

/// Snapshot of the whole stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubStatus {
    /// Entries on the stack.
    pub stack_depth: usize,
    /// Outstanding async operations.
    pub in_flight: usize,
    /// Live jobs, top-most first.
    pub jobs: Vec<JobStatus>,
}

/// Depth-first scrub scheduler.
///
/// Entries pushed at the top are serviced before anything below them;
/// entries pushed at the bottom run only after everything above has drained.
/// All mutation happens on the owning thread; async results come back through
/// the deferred queue and are applied by [`ScrubStack::process_deferred`] or
/// [`ScrubStack::run_until_idle`].
///
/// Dropping a stack that still has queued entries or outstanding operations
/// panics.
pub struct ScrubStack<B: ScrubBackend> {
    pub(crate) backend: B,
    pub(crate) config: ScrubConfig,
    /// Front is the top of the stack.
    pub(crate) stack: VecDeque<EntryId>,
    pub(crate) entries: HashMap<EntryId, ScrubEntry>,
    finishers: HashMap<EntryId, OnFinish<B>>,
    pub(crate) in_flight: HashMap<OpToken, InFlight>,
    pub(crate) deferred: DeferredQueue,
    pins: PinTable,
    pub(crate) tracker: ProgressTracker,
    progress_tx: broadcast::Sender<ScrubProgress>,
    next_entry: u64,
    kicking: bool,
}

impl<B: ScrubBackend> ScrubStack<B> {
    /// Create a stack with the default configuration.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, ScrubConfig::default())
    }

    /// Create a stack with a custom configuration.
    pub fn with_config(backend: B, config: ScrubConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(config.progress_channel_size.max(1));
        Self {
            backend,
            config,
            stack: VecDeque::new(),
            entries: HashMap::new(),
            finishers: HashMap::new(),
            in_flight: HashMap::new(),
            deferred: DeferredQueue::new(),
            pins: PinTable::new(),
            tracker: ProgressTracker::new(),
            progress_tx,
            next_entry: 0,
            kicking: false,
        }
    }

    /// Put an entry on top of the stack so it is the highest priority.
    ///
    /// Other jobs already on the stack do not advance past their current
    /// suspension point until this one completes.
    pub fn enqueue_top<F>(
        &mut self,
        entry: NamespaceEntry,
        recursive: bool,
        include_children: bool,
        tag: &str,
        on_finish: F,
    ) -> EntryId
    where
        F: FnOnce(&mut ScrubStack<B>, ScrubOutcome) + Send + 'static,
    {
        self.enqueue(entry, recursive, include_children, tag, Box::new(on_finish), true)
    }

    /// Like [`ScrubStack::enqueue_top`], but the entry starts only after
    /// everything already queued has drained.
    pub fn enqueue_bottom<F>(
        &mut self,
        entry: NamespaceEntry,
        recursive: bool,
        include_children: bool,
        tag: &str,
        on_finish: F,
    ) -> EntryId
    where
        F: FnOnce(&mut ScrubStack<B>, ScrubOutcome) + Send + 'static,
    {
        self.enqueue(entry, recursive, include_children, tag, Box::new(on_finish), false)
    }

    fn enqueue(
        &mut self,
        entry: NamespaceEntry,
        recursive: bool,
        include_children: bool,
        tag: &str,
        on_finish: OnFinish<B>,
        top: bool,
    ) -> EntryId {
        let path = entry.name.to_string();
        let header = Arc::new(ScrubHeader::new(
            tag,
            entry.clone(),
            recursive,
            include_children,
        ));
        info!(
            tag = %header.tag,
            path = %path,
            recursive,
            include_children,
            stamping = header.has_tag(),
            top,
            "Enqueueing scrub"
        );

        let scrub_entry = ScrubEntry::new(entry, path, header, None);
        let id = self.insert_entry(scrub_entry);
        self.finishers.insert(id, on_finish);
        if top {
            self.push_entry(id);
        } else {
            self.push_entry_bottom(id);
        }

        self.kick_off_scrubs();
        id
    }

    /// Advance as many entries as possible without waiting.
    ///
    /// Works from the top of the stack down. An entry that is blocked with
    /// nothing left to start (or that waits on a child file's verify) lets the
    /// loop move to the entry below it, but never across into a different
    /// job. An entry still waiting on its own fragment fetch, or on free
    /// capacity, ends the pass. Calling this while a pass is already running
    /// (from an `on_finish` callback) queues a pass for the next turn instead.
    pub fn kick_off_scrubs(&mut self) {
        if self.kicking {
            debug!("Scrub pass already running, deferring kick");
            self.deferred.post(Deferred::Kick);
            return;
        }
        self.kicking = true;

        let mut index = 0;
        let mut blocked_job: Option<Arc<ScrubHeader>> = None;
        while let Some(&id) = self.stack.get(index) {
            let header = self.entry(id).header.clone();
            if let Some(job) = &blocked_job {
                if !Arc::ptr_eq(job, &header) {
                    break;
                }
            }

            match self.advance(id) {
                Advance::Pushed | Advance::Popped => {
                    index = 0;
                    blocked_job = None;
                }
                Advance::Blocked { terminal: true } => {
                    blocked_job.get_or_insert(header);
                    index += 1;
                }
                Advance::Blocked { terminal: false } => break,
            }
        }

        self.kicking = false;
    }

    /// Apply every queued completion, then run one scheduling pass.
    ///
    /// Returns the number of deferred messages consumed.
    pub fn process_deferred(&mut self) -> usize {
        let mut handled = 0;
        while let Some(message) = self.deferred.try_next() {
            self.apply_deferred(message);
            handled += 1;
        }
        self.kick_off_scrubs();
        handled
    }

    /// Drive the stack until it is empty and nothing is in flight.
    ///
    /// # Panics
    ///
    /// Panics if entries remain with nothing in flight to wake them.
    pub async fn run_until_idle(&mut self) {
        loop {
            self.process_deferred();
            if self.is_idle() {
                break;
            }
            assert!(
                !self.in_flight.is_empty(),
                "scrub stack stalled: {} entries queued with nothing in flight",
                self.stack.len()
            );
            match self.deferred.next().await {
                Some(message) => self.apply_deferred(message),
                None => break,
            }
        }
    }

    /// Check if the stack is empty with nothing outstanding.
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty() && self.in_flight.is_empty()
    }

    /// Number of async operations currently outstanding.
    pub fn scrubs_in_progress(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of entries on the stack.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Check if the stack has no entries.
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Shared view of the objects pinned by queued entries.
    pub fn pins(&self) -> PinTable {
        self.pins.clone()
    }

    /// Handle for requesting scheduling passes from other threads.
    pub fn handle(&self) -> ScrubHandle {
        self.deferred.handle()
    }

    /// Subscribe to progress snapshots, sent each time an entry pops.
    pub fn subscribe(&self) -> broadcast::Receiver<ScrubProgress> {
        self.progress_tx.subscribe()
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> ScrubProgress {
        self.tracker.snapshot(self.in_flight.len(), self.stack.len())
    }

    /// Describe the live jobs on the stack, top-most first.
    pub fn status(&self) -> ScrubStatus {
        let mut jobs: Vec<(Arc<ScrubHeader>, JobStatus)> = Vec::new();
        for id in &self.stack {
            let entry = self.entry(*id);
            match jobs.iter_mut().find(|(h, _)| Arc::ptr_eq(h, &entry.header)) {
                Some((_, job)) => job.entries += 1,
                None => jobs.push((
                    entry.header.clone(),
                    JobStatus {
                        tag: entry.header.tag.clone(),
                        origin_path: entry.header.origin.name.to_string(),
                        recursive: entry.header.recursive,
                        enqueued_at: entry.header.created_at,
                        entries: 1,
                    },
                )),
            }
        }
        ScrubStatus {
            stack_depth: self.stack.len(),
            in_flight: self.in_flight.len(),
            jobs: jobs.into_iter().map(|(_, job)| job).collect(),
        }
    }

    /// The backend this stack scrubs through.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Advance one entry by one step of its state machine.
    fn advance(&mut self, id: EntryId) -> Advance {
        let entry = self.entry(id);
        if entry.awaiting.is_some() {
            return self.blocked(id, false);
        }

        let kind = entry.entry.kind;
        let (finished, is_terminal) = match kind {
            ObjectKind::File => (self.scrub_file_entry(id), false),
            ObjectKind::Directory => {
                let progress = self.scrub_dir_entry(id);
                if progress.done {
                    (self.scrub_dir_entry_final(id), false)
                } else if progress.added_children {
                    return Advance::Pushed;
                } else {
                    if progress.is_terminal {
                        debug!(entry = %id, "Directory waiting on children");
                    }
                    (false, progress.is_terminal)
                }
            }
        };

        if finished {
            self.pop_entry(id);
            Advance::Popped
        } else {
            self.blocked(id, is_terminal)
        }
    }

    /// Classify an entry that cannot progress.
    ///
    /// Waiting on a verify counts as terminal: a file or finalizing directory
    /// has nothing else to start, and a directory waiting on one child file
    /// resumes its walk from the same position. Waiting on a fragment fetch
    /// or on capacity does not.
    fn blocked(&self, id: EntryId, is_terminal: bool) -> Advance {
        let waiting_on = self
            .entry(id)
            .awaiting
            .and_then(|token| self.in_flight.get(&token));
        let terminal = match waiting_on {
            Some(op) => !matches!(op.op, PendingOp::Fragment),
            None => is_terminal,
        };
        Advance::Blocked { terminal }
    }

    pub(crate) fn insert_entry(&mut self, entry: ScrubEntry) -> EntryId {
        let id = EntryId(self.next_entry);
        self.next_entry += 1;
        self.entries.insert(id, entry);
        id
    }

    /// Push an entry on top of the stack, pinning its object.
    pub(crate) fn push_entry(&mut self, id: EntryId) {
        self.pin_entry(id);
        self.stack.push_front(id);
    }

    /// Push an entry to the bottom of the stack, pinning its object.
    pub(crate) fn push_entry_bottom(&mut self, id: EntryId) {
        self.pin_entry(id);
        self.stack.push_back(id);
    }

    fn pin_entry(&mut self, id: EntryId) {
        let object = self.entry(id).entry.object;
        self.pins.pin(object);
        self.backend.pin(object);
    }

    /// Pop a finished entry, unpin it, and report it to its parent or caller.
    fn pop_entry(&mut self, id: EntryId) {
        let Some(position) = self.stack.iter().position(|e| *e == id) else {
            panic!("scrub entry {id} popped but not on the stack");
        };
        self.stack.remove(position);

        let Some(entry) = self.entries.remove(&id) else {
            panic!("scrub entry {id} missing from arena");
        };
        assert!(
            entry.awaiting.is_none(),
            "scrub entry {id} popped with an operation outstanding"
        );
        self.pins.unpin(entry.entry.object);
        self.backend.unpin(entry.entry.object);
        self.tracker.record_entry();

        debug!(
            entry = %id,
            path = %entry.path,
            verified = entry.outcome.objects_verified,
            problems = entry.outcome.problem_count(),
            "Scrub entry complete"
        );

        let ScrubEntry {
            path,
            header,
            parent,
            outcome,
            ..
        } = entry;

        let finished_job = match parent {
            Some(parent_id) => {
                let limit = self.config.max_damage_records;
                let parent = self.entry_mut(parent_id);
                parent.outcome.merge(outcome, limit);
                match parent.walk_mut() {
                    Some(walk) => walk.children_pending -= 1,
                    None => panic!("scrub entry {id} finished under parent {parent_id} that is not walking"),
                }
                None
            }
            None => Some(outcome),
        };

        let _ = self.progress_tx.send(self.progress());

        if let Some(outcome) = finished_job {
            info!(
                tag = %header.tag,
                path = %path,
                passed = outcome.passed(),
                verified = outcome.objects_verified,
                mismatches = outcome.mismatches,
                errors = outcome.errors,
                "Scrub finished"
            );
            if let Some(on_finish) = self.finishers.remove(&id) {
                on_finish(self, outcome);
            }
        }
    }

    /// Apply one deferred message. Completions for unknown tokens belong to
    /// operations that already returned synchronously and are ignored.
    pub(crate) fn apply_deferred(&mut self, message: Deferred) {
        match message {
            Deferred::Kick => {}
            Deferred::FragmentLoaded { token, result } => {
                let Some(op) = self.in_flight.remove(&token) else {
                    debug!(token, "Ignoring completion for settled fetch");
                    return;
                };
                let limit = self.config.max_damage_records;
                let entry = self.entry_mut(op.entry);
                entry.awaiting = None;
                let path = entry.path.clone();
                let Some(walk) = entry.walk_mut() else {
                    panic!("fragment completion for entry {} that is not walking", op.entry);
                };
                let frag = walk.fetching();
                match result {
                    Ok(children) => {
                        debug!(path = %path, ?frag, children = children.len(), "Fragment loaded");
                        walk.load(children);
                    }
                    Err(err) => {
                        walk.skip_fragment();
                        warn!(path = %path, ?frag, error = %err, "Fragment fetch failed");
                        entry.outcome.record_failure(
                            &fragment_path(&path, frag),
                            DamageKind::FetchFailed,
                            err.to_string(),
                            limit,
                        );
                        self.tracker.record_error();
                    }
                }
            }
            Deferred::Verified { token, result } => {
                let Some(op) = self.in_flight.remove(&token) else {
                    debug!(token, "Ignoring completion for settled verify");
                    return;
                };
                let entry = self.entry_mut(op.entry);
                entry.awaiting = None;
                let path = match op.op {
                    PendingOp::VerifyChild { path } => path,
                    PendingOp::VerifySelf => {
                        entry.state = EntryState::Complete;
                        entry.path.clone()
                    }
                    PendingOp::Fragment => {
                        panic!("verify completion for fragment fetch of entry {}", op.entry)
                    }
                };
                self.record_verify_result(op.entry, &path, result);
            }
        }
    }

    pub(crate) fn entry(&self, id: EntryId) -> &ScrubEntry {
        self.entries
            .get(&id)
            .unwrap_or_else(|| panic!("scrub entry {id} missing from arena"))
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> &mut ScrubEntry {
        self.entries
            .get_mut(&id)
            .unwrap_or_else(|| panic!("scrub entry {id} missing from arena"))
    }
}

impl<B: ScrubBackend> Drop for ScrubStack<B> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        assert!(
            self.stack.is_empty(),
            "scrub stack dropped with {} entries queued",
            self.stack.len()
        );
        assert!(
            self.in_flight.is_empty(),
            "scrub stack dropped with {} scrubs in progress",
            self.in_flight.len()
        );
    }
}

/// Display path of a fragment for damage records.
pub(crate) fn fragment_path(dir_path: &str, frag: Option<scrubwalk_core::FragmentId>) -> String {
    match frag {
        Some(frag) => format!("{dir_path}#frag{}", frag.0),
        None => dir_path.to_string(),
    }
}
