use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use scrubwalk_stack::{
    Completer, DamageKind, Fetch, FragmentContents, FragmentId, NamespaceEntry, ObjectId,
    ScrubBackend, ScrubConfig, ScrubError, ScrubOutcome, ScrubStack, VerifyOutcome,
};

/// In-memory namespace with scriptable sync/async behavior.
#[derive(Default)]
struct MemBackend {
    /// Directory object -> fragments -> children.
    dirs: HashMap<ObjectId, Vec<Vec<NamespaceEntry>>>,
    mismatches: HashSet<ObjectId>,
    verify_errors: HashSet<ObjectId>,
    fetch_errors: HashSet<(ObjectId, u32)>,
    async_verify: HashSet<ObjectId>,
    async_fetch: HashSet<(ObjectId, u32)>,
    /// Complete pending operations before returning `Pending`.
    complete_inline: bool,
    parked_verifies: Vec<(ObjectId, Completer<VerifyOutcome>)>,
    parked_fetches: Vec<(ObjectId, FragmentId, Completer<FragmentContents>)>,
    verified: Vec<(ObjectId, String)>,
    fetched: Vec<(ObjectId, FragmentId)>,
    pins: Vec<ObjectId>,
    unpins: Vec<ObjectId>,
}

impl MemBackend {
    fn new() -> Self {
        Self::default()
    }

    fn dir(mut self, id: u64, fragments: Vec<Vec<NamespaceEntry>>) -> Self {
        self.dirs.insert(ObjectId(id), fragments);
        self
    }

    fn verify_outcome(&self, object: ObjectId) -> Result<VerifyOutcome, ScrubError> {
        if self.verify_errors.contains(&object) {
            Err(ScrubError::other("EIO"))
        } else if self.mismatches.contains(&object) {
            Ok(VerifyOutcome::mismatch("backtrace differs"))
        } else {
            Ok(VerifyOutcome::Match)
        }
    }

    fn fragment(&self, dir: ObjectId, frag: FragmentId) -> Result<FragmentContents, ScrubError> {
        if self.fetch_errors.contains(&(dir, frag.0)) {
            return Err(ScrubError::other("fragment unreadable"));
        }
        self.dirs
            .get(&dir)
            .and_then(|frags| frags.get(frag.0 as usize))
            .cloned()
            .ok_or_else(|| ScrubError::other("no such fragment"))
    }

    /// Complete every parked operation.
    fn release(&mut self) -> usize {
        let verifies = std::mem::take(&mut self.parked_verifies);
        let fetches = std::mem::take(&mut self.parked_fetches);
        let count = verifies.len() + fetches.len();
        for (object, completer) in verifies {
            completer.complete(self.verify_outcome(object));
        }
        for (dir, frag, completer) in fetches {
            completer.complete(self.fragment(dir, frag));
        }
        count
    }

    /// Complete one parked operation, chosen by `pick`.
    fn release_one(&mut self, pick: usize) -> bool {
        let total = self.parked_verifies.len() + self.parked_fetches.len();
        if total == 0 {
            return false;
        }
        let index = pick % total;
        if index < self.parked_verifies.len() {
            let (object, completer) = self.parked_verifies.remove(index);
            completer.complete(self.verify_outcome(object));
        } else {
            let index = index - self.parked_verifies.len();
            let (dir, frag, completer) = self.parked_fetches.remove(index);
            completer.complete(self.fragment(dir, frag));
        }
        true
    }

    fn verified_ids(&self) -> Vec<u64> {
        self.verified.iter().map(|(id, _)| id.0).collect()
    }
}

impl ScrubBackend for MemBackend {
    fn fragments(&mut self, dir: &NamespaceEntry) -> Result<Vec<FragmentId>, ScrubError> {
        let count = self.dirs.get(&dir.object).map_or(0, Vec::len);
        Ok((0..count as u32).map(FragmentId).collect())
    }

    fn fetch_fragment(
        &mut self,
        dir: &NamespaceEntry,
        frag: FragmentId,
        completer: Completer<FragmentContents>,
    ) -> Fetch<Result<FragmentContents, ScrubError>> {
        self.fetched.push((dir.object, frag));
        if self.async_fetch.contains(&(dir.object, frag.0)) {
            if self.complete_inline {
                completer.complete(self.fragment(dir.object, frag));
            } else {
                self.parked_fetches.push((dir.object, frag, completer));
            }
            Fetch::Pending
        } else {
            Fetch::Ready(self.fragment(dir.object, frag))
        }
    }

    fn verify(
        &mut self,
        target: &NamespaceEntry,
        tag: &str,
        completer: Completer<VerifyOutcome>,
    ) -> Fetch<Result<VerifyOutcome, ScrubError>> {
        self.verified.push((target.object, tag.to_string()));
        if self.async_verify.contains(&target.object) {
            if self.complete_inline {
                completer.complete(self.verify_outcome(target.object));
            } else {
                self.parked_verifies.push((target.object, completer));
            }
            Fetch::Pending
        } else {
            Fetch::Ready(self.verify_outcome(target.object))
        }
    }

    fn pin(&mut self, object: ObjectId) {
        self.pins.push(object);
    }

    fn unpin(&mut self, object: ObjectId) {
        self.unpins.push(object);
    }
}

type Finished = Arc<Mutex<Vec<(String, ScrubOutcome)>>>;

fn recorder(finished: &Finished, label: &str) -> impl FnOnce(&mut ScrubStack<MemBackend>, ScrubOutcome) + Send + 'static {
    let finished = finished.clone();
    let label = label.to_string();
    move |_, outcome| finished.lock().unwrap().push((label, outcome))
}

fn file(name: &str, id: u64) -> NamespaceEntry {
    NamespaceEntry::file(name, ObjectId(id))
}

fn dir(name: &str, id: u64) -> NamespaceEntry {
    NamespaceEntry::directory(name, ObjectId(id))
}

/// Release parked work and run passes until the stack drains.
fn drain(stack: &mut ScrubStack<MemBackend>) {
    for _ in 0..1000 {
        if stack.is_idle() {
            return;
        }
        stack.backend_mut().release();
        stack.process_deferred();
    }
    panic!("stack did not drain");
}

#[test]
fn test_single_file_entry() {
    let finished = Finished::default();
    let mut stack = ScrubStack::new(MemBackend::new());

    stack.enqueue_top(file("/f", 2), false, false, "t1", recorder(&finished, "f"));

    assert!(stack.is_idle());
    assert_eq!(stack.backend().verified, vec![(ObjectId(2), "t1".to_string())]);

    let finished = finished.lock().unwrap();
    assert_eq!(finished.len(), 1);
    let outcome = &finished[0].1;
    assert!(outcome.passed());
    assert_eq!(outcome.objects_verified, 1);
}

#[test]
fn test_directory_children_verified_before_finalize() {
    let finished = Finished::default();
    let backend = MemBackend::new().dir(1, vec![vec![file("a", 2), file("b", 3)]]);
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/data", 1), true, true, "", recorder(&finished, "d"));

    assert!(stack.is_idle());
    assert_eq!(stack.backend().verified_ids(), vec![2, 3, 1]);

    let finished = finished.lock().unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].1.objects_verified, 3);
    assert!(finished[0].1.passed());
}

#[test]
fn test_bottom_job_waits_for_top_subtree() {
    let finished = Finished::default();
    let mut backend = MemBackend::new()
        .dir(10, vec![vec![dir("sub", 12), file("x", 11)]])
        .dir(12, vec![vec![file("y", 13)]]);
    backend.async_verify.extend([ObjectId(11), ObjectId(13)]);
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/a", 10), true, true, "", recorder(&finished, "A"));
    stack.enqueue_bottom(file("/b", 20), false, false, "", recorder(&finished, "B"));

    assert!(!stack.backend().verified_ids().contains(&20));
    drain(&mut stack);

    let order = stack.backend().verified_ids();
    let pos = |id| order.iter().position(|v| *v == id).unwrap();
    assert!(pos(10) < pos(20));
    assert!(pos(13) < pos(20));
    assert!(pos(11) < pos(20));

    let labels: Vec<_> = finished.lock().unwrap().iter().map(|(l, _)| l.clone()).collect();
    assert_eq!(labels, vec!["A", "B"]);
}

#[test]
fn test_top_job_preempts_waiting_job() {
    let finished = Finished::default();
    let mut backend = MemBackend::new().dir(10, vec![vec![file("x", 11), file("z", 14)]]);
    backend.async_verify.insert(ObjectId(11));
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/a", 10), true, true, "", recorder(&finished, "A"));
    assert_eq!(stack.scrubs_in_progress(), 1);

    stack.enqueue_top(file("/c", 30), false, false, "", recorder(&finished, "C"));
    assert_eq!(finished.lock().unwrap().len(), 1);
    assert_eq!(finished.lock().unwrap()[0].0, "C");
    // A's sibling file has not been started while it waits.
    assert!(!stack.backend().verified_ids().contains(&14));

    drain(&mut stack);
    let labels: Vec<_> = finished.lock().unwrap().iter().map(|(l, _)| l.clone()).collect();
    assert_eq!(labels, vec!["C", "A"]);
}

#[test]
fn test_top_job_blocks_lower_job_until_done() {
    let finished = Finished::default();
    let mut backend = MemBackend::new()
        .dir(10, vec![vec![file("x", 11), file("z", 14)]])
        .dir(40, vec![vec![file("q", 41)]]);
    backend.async_verify.extend([ObjectId(11), ObjectId(41)]);
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/a", 10), true, true, "", recorder(&finished, "A"));
    stack.enqueue_top(dir("/d", 40), true, true, "", recorder(&finished, "D"));

    // Both have one verify outstanding; release only A's.
    let parked = std::mem::take(&mut stack.backend_mut().parked_verifies);
    for (object, completer) in parked {
        if object == ObjectId(11) {
            completer.complete(Ok(VerifyOutcome::Match));
        } else {
            stack.backend_mut().parked_verifies.push((object, completer));
        }
    }
    stack.process_deferred();

    // A's result is recorded, but A does not advance to its next child while D runs.
    assert!(!stack.backend().verified_ids().contains(&14));

    drain(&mut stack);
    let labels: Vec<_> = finished.lock().unwrap().iter().map(|(l, _)| l.clone()).collect();
    assert_eq!(labels, vec!["D", "A"]);
}

#[test]
fn test_wide_directory_walks_one_child_at_a_time() {
    let finished = Finished::default();
    let children: Vec<_> = (2..12).map(|id| dir(&format!("d{id}"), id)).collect();
    let mut backend = MemBackend::new().dir(1, vec![children]);
    for id in 2..12 {
        backend = backend.dir(id, vec![vec![file("f", id + 100)]]);
        backend.async_fetch.insert((ObjectId(id), 0));
    }
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/", 1), true, true, "", recorder(&finished, "root"));

    // The first child waits on its fragment; its siblings are not started.
    assert_eq!(stack.scrubs_in_progress(), 1);
    assert_eq!(stack.len(), 2);

    for _ in 0..100 {
        if stack.is_idle() {
            break;
        }
        assert!(stack.scrubs_in_progress() <= 1);
        assert!(stack.len() <= 2);
        stack.backend_mut().release();
        stack.process_deferred();
    }
    assert!(stack.is_idle());

    let fetched: Vec<u64> = stack.backend().fetched.iter().map(|(d, _)| d.0).collect();
    assert_eq!(fetched, (1..12).collect::<Vec<_>>());

    let mut expected = Vec::new();
    for id in 2..12 {
        expected.extend([id + 100, id]);
    }
    expected.push(1);
    assert_eq!(stack.backend().verified_ids(), expected);
    assert_eq!(finished.lock().unwrap()[0].1.objects_verified, 21);
}

/// Small deterministic generator so the sequence test needs no extra crates.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as usize
    }
}

struct JobRecord {
    job: u64,
    top: bool,
    /// Verify calls issued before this job was enqueued.
    enqueued_at: usize,
    /// Jobs still unfinished when this one was enqueued.
    live_before: Vec<u64>,
}

/// Register job `job`'s namespace under object ids `job * 100 ..` and
/// return its starting entry.
fn add_job_tree(backend: &mut MemBackend, job: u64, shape: usize) -> NamespaceEntry {
    let base = job * 100;
    match shape % 3 {
        0 => {
            backend.async_verify.insert(ObjectId(base));
            file(&format!("/j{job}"), base)
        }
        1 => {
            backend
                .dirs
                .insert(ObjectId(base), vec![vec![file("a", base + 1), dir("sub", base + 2)]]);
            backend
                .dirs
                .insert(ObjectId(base + 2), vec![vec![file("b", base + 3)]]);
            backend.async_verify.extend([ObjectId(base + 1), ObjectId(base + 3)]);
            backend.async_fetch.insert((ObjectId(base + 2), 0));
            dir(&format!("/j{job}"), base)
        }
        _ => {
            backend.dirs.insert(
                ObjectId(base),
                vec![vec![file("a", base + 1)], vec![file("b", base + 2)]],
            );
            backend.async_verify.extend([ObjectId(base + 2), ObjectId(base)]);
            backend.async_fetch.insert((ObjectId(base), 1));
            dir(&format!("/j{job}"), base)
        }
    }
}

#[test]
fn test_stack_discipline_over_random_sequences() {
    for seed in 1..=25u64 {
        let mut rng = Lcg(seed);
        let finish_at: Arc<Mutex<HashMap<u64, usize>>> = Arc::default();
        let mut stack = ScrubStack::new(MemBackend::new());
        let mut jobs: Vec<JobRecord> = Vec::new();

        for _ in 0..40 {
            match rng.next() % 4 {
                choice @ (0 | 1) if jobs.len() < 12 => {
                    let job = jobs.len() as u64 + 1;
                    let entry = add_job_tree(stack.backend_mut(), job, rng.next());
                    let live_before: Vec<u64> = {
                        let done = finish_at.lock().unwrap();
                        jobs.iter()
                            .map(|j| j.job)
                            .filter(|j| !done.contains_key(j))
                            .collect()
                    };
                    jobs.push(JobRecord {
                        job,
                        top: choice == 0,
                        enqueued_at: stack.backend().verified.len(),
                        live_before,
                    });

                    let finish_at = finish_at.clone();
                    let on_finish = move |stack: &mut ScrubStack<MemBackend>, _: ScrubOutcome| {
                        let at = stack.backend().verified.len();
                        let previous = finish_at.lock().unwrap().insert(job, at);
                        assert!(previous.is_none(), "job {job} finished twice");
                    };
                    if choice == 0 {
                        stack.enqueue_top(entry, true, true, "", on_finish);
                    } else {
                        stack.enqueue_bottom(entry, true, true, "", on_finish);
                    }
                }
                _ => {
                    let pick = rng.next();
                    if stack.backend_mut().release_one(pick) {
                        stack.process_deferred();
                    }
                }
            }
        }
        drain(&mut stack);

        let verified_jobs: Vec<u64> = stack.backend().verified_ids().iter().map(|id| id / 100).collect();
        let finish_at = finish_at.lock().unwrap();
        assert_eq!(finish_at.len(), jobs.len(), "seed {seed}: every job finishes");

        for record in &jobs {
            let finished = finish_at[&record.job];
            if record.top {
                // Nothing already queued issues a verify until this job is done.
                for older in &record.live_before {
                    assert!(
                        !verified_jobs[record.enqueued_at..finished].contains(older),
                        "seed {seed}: job {older} advanced while top job {} ran",
                        record.job
                    );
                }
            } else {
                let Some(first) = verified_jobs.iter().position(|j| *j == record.job) else {
                    panic!("seed {seed}: job {} never verified", record.job);
                };
                for older in &record.live_before {
                    assert!(
                        first >= finish_at[older],
                        "seed {seed}: bottom job {} started before job {older} finished",
                        record.job
                    );
                }
            }
        }
    }
}

#[test]
fn test_pending_fragment_fetch_resumes_on_continuation() {
    let finished = Finished::default();
    let mut backend = MemBackend::new().dir(1, vec![vec![file("a", 2)]]);
    backend.async_fetch.insert((ObjectId(1), 0));
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/d", 1), true, true, "", recorder(&finished, "d"));

    assert!(!stack.is_idle());
    assert_eq!(stack.scrubs_in_progress(), 1);
    assert!(stack.backend().verified.is_empty());

    // Nothing has completed, so further passes are no-ops.
    stack.kick_off_scrubs();
    assert_eq!(stack.process_deferred(), 0);
    assert!(stack.backend().verified.is_empty());
    assert!(finished.lock().unwrap().is_empty());

    assert_eq!(stack.backend_mut().release(), 1);
    stack.process_deferred();

    assert!(stack.is_idle());
    assert_eq!(stack.backend().verified_ids(), vec![2, 1]);
    assert_eq!(finished.lock().unwrap().len(), 1);
}

#[test]
fn test_child_mismatch_fails_directory_only() {
    let finished = Finished::default();
    let mut backend = MemBackend::new().dir(1, vec![vec![file("bad", 2), file("good", 3)]]);
    backend.mismatches.insert(ObjectId(2));
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/data", 1), true, true, "", recorder(&finished, "d"));
    stack.enqueue_top(file("/data/good", 3), false, false, "", recorder(&finished, "good"));

    let finished = finished.lock().unwrap();
    let outcome_of = |label: &str| {
        finished
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, o)| o.clone())
            .unwrap()
    };

    let dir_outcome = outcome_of("d");
    assert!(!dir_outcome.passed());
    assert_eq!(dir_outcome.mismatches, 1);
    assert_eq!(dir_outcome.objects_verified, 3);
    assert_eq!(dir_outcome.damage[0].path, "/data/bad");
    assert_eq!(dir_outcome.damage[0].kind, DamageKind::Mismatch);

    assert!(outcome_of("good").passed());
}

#[test]
fn test_nested_mismatch_aggregates_to_root() {
    let finished = Finished::default();
    let mut backend = MemBackend::new()
        .dir(1, vec![vec![dir("left", 2), dir("right", 3)]])
        .dir(2, vec![vec![file("l1", 4)]])
        .dir(3, vec![vec![file("r1", 5)], vec![file("r2", 6)]]);
    backend.mismatches.insert(ObjectId(6));
    backend.async_verify.extend([ObjectId(4), ObjectId(5)]);
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/", 1), true, true, "", recorder(&finished, "root"));
    drain(&mut stack);

    let finished = finished.lock().unwrap();
    assert_eq!(finished.len(), 1);
    let outcome = &finished[0].1;
    assert_eq!(outcome.objects_verified, 6);
    assert_eq!(outcome.mismatches, 1);
    assert_eq!(outcome.damage[0].path, "/right/r2");

    // Every descendant is verified before the root finalizes.
    assert_eq!(stack.backend().verified_ids().last(), Some(&1));
}

#[test]
fn test_inline_completion_is_not_applied_reentrantly() {
    let finished = Finished::default();
    let mut backend = MemBackend::new();
    backend.async_verify.insert(ObjectId(2));
    backend.complete_inline = true;
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(file("/f", 2), false, false, "", recorder(&finished, "f"));

    // The result is queued, not applied inside the verify call.
    assert!(finished.lock().unwrap().is_empty());
    assert_eq!(stack.scrubs_in_progress(), 1);

    assert_eq!(stack.process_deferred(), 1);
    assert!(stack.is_idle());
    assert_eq!(finished.lock().unwrap().len(), 1);
}

#[test]
fn test_pins_held_while_queued_and_released_once() {
    let finished = Finished::default();
    let mut backend = MemBackend::new()
        .dir(1, vec![vec![dir("sub", 2), file("a", 3)]])
        .dir(2, vec![vec![file("b", 4)]]);
    backend.async_verify.insert(ObjectId(4));
    let mut stack = ScrubStack::new(backend);
    let pins = stack.pins();

    stack.enqueue_top(dir("/", 1), true, true, "", recorder(&finished, "root"));
    assert!(pins.is_pinned(ObjectId(1)));
    assert!(pins.is_pinned(ObjectId(2)));

    drain(&mut stack);
    assert!(pins.is_empty());

    let mut pinned = stack.backend().pins.clone();
    let mut unpinned = stack.backend().unpins.clone();
    pinned.sort();
    unpinned.sort();
    assert_eq!(pinned, vec![ObjectId(1), ObjectId(2)]);
    assert_eq!(pinned, unpinned);
}

#[test]
fn test_include_children_without_recursion() {
    let finished = Finished::default();
    let backend = MemBackend::new()
        .dir(1, vec![vec![file("a", 2), dir("sub", 3)]])
        .dir(3, vec![vec![file("deep", 4)]]);
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/", 1), false, true, "", recorder(&finished, "root"));

    assert!(stack.is_idle());
    let verified = stack.backend().verified_ids();
    assert_eq!(verified, vec![2, 3, 1]);
    assert!(!stack.backend().fetched.iter().any(|(d, _)| *d == ObjectId(3)));
}

#[test]
fn test_directory_without_children_flags_verifies_itself_only() {
    let finished = Finished::default();
    let backend = MemBackend::new().dir(1, vec![vec![file("a", 2)]]);
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/", 1), false, false, "", recorder(&finished, "root"));

    assert_eq!(stack.backend().verified_ids(), vec![1]);
    assert!(stack.backend().fetched.is_empty());
    assert_eq!(finished.lock().unwrap().len(), 1);
}

#[test]
fn test_fragment_failure_does_not_stop_siblings() {
    let finished = Finished::default();
    let mut backend = MemBackend::new().dir(1, vec![vec![file("a", 2)], vec![file("b", 3)]]);
    backend.fetch_errors.insert((ObjectId(1), 0));
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/d", 1), true, true, "", recorder(&finished, "d"));

    assert_eq!(stack.backend().verified_ids(), vec![3, 1]);
    let finished = finished.lock().unwrap();
    let outcome = &finished[0].1;
    assert_eq!(outcome.errors, 1);
    assert_eq!(outcome.damage[0].kind, DamageKind::FetchFailed);
    assert_eq!(outcome.damage[0].path, "/d#frag0");
    assert_eq!(outcome.objects_verified, 2);
}

#[test]
fn test_verify_error_is_recorded() {
    let finished = Finished::default();
    let mut backend = MemBackend::new().dir(1, vec![vec![file("a", 2), file("b", 3)]]);
    backend.verify_errors.insert(ObjectId(2));
    backend.async_verify.insert(ObjectId(2));
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/d", 1), true, true, "", recorder(&finished, "d"));
    drain(&mut stack);

    let finished = finished.lock().unwrap();
    let outcome = &finished[0].1;
    assert_eq!(outcome.errors, 1);
    assert_eq!(outcome.damage[0].kind, DamageKind::VerifyFailed);
    assert_eq!(outcome.objects_verified, 2);
}

#[test]
fn test_abandoned_continuation_fails_entry() {
    let finished = Finished::default();
    let mut backend = MemBackend::new();
    backend.async_verify.insert(ObjectId(2));
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(file("/f", 2), false, false, "", recorder(&finished, "f"));
    stack.backend_mut().parked_verifies.clear();
    stack.process_deferred();

    assert!(stack.is_idle());
    let finished = finished.lock().unwrap();
    assert_eq!(finished[0].1.errors, 1);
    assert!(finished[0].1.damage[0].detail.contains("abandoned"));
}

#[test]
fn test_in_flight_cap() {
    let finished = Finished::default();
    let mut backend = MemBackend::new()
        .dir(1, vec![vec![dir("a", 2), dir("b", 3)]])
        .dir(2, vec![vec![file("a1", 4), file("a2", 5)]])
        .dir(3, vec![vec![file("b1", 6)]]);
    backend.async_verify.extend([ObjectId(4), ObjectId(5), ObjectId(6), ObjectId(2)]);
    let config = ScrubConfig::builder().max_in_flight(1usize).build().unwrap();
    let mut stack = ScrubStack::with_config(backend, config);

    stack.enqueue_top(dir("/", 1), true, true, "", recorder(&finished, "root"));
    for _ in 0..100 {
        assert!(stack.scrubs_in_progress() <= 1);
        if stack.is_idle() {
            break;
        }
        stack.backend_mut().release();
        stack.process_deferred();
    }

    assert!(stack.is_idle());
    assert_eq!(finished.lock().unwrap()[0].1.objects_verified, 6);
}

#[test]
fn test_on_finish_can_enqueue_follow_up() {
    let finished = Finished::default();
    let backend = MemBackend::new().dir(1, vec![vec![file("a", 2)]]);
    let mut stack = ScrubStack::new(backend);

    let follow_up = recorder(&finished, "follow-up");
    let first = recorder(&finished, "first");
    stack.enqueue_top(dir("/", 1), true, true, "", move |stack, outcome| {
        first(&mut *stack, outcome);
        stack.enqueue_bottom(file("/later", 9), false, false, "again", follow_up);
    });
    stack.process_deferred();

    assert!(stack.is_idle());
    let labels: Vec<_> = finished.lock().unwrap().iter().map(|(l, _)| l.clone()).collect();
    assert_eq!(labels, vec!["first", "follow-up"]);
    assert!(stack.backend().verified.contains(&(ObjectId(9), "again".to_string())));
}

#[test]
fn test_status_lists_jobs() {
    let finished = Finished::default();
    let mut backend = MemBackend::new().dir(1, vec![vec![file("a", 2)]]);
    backend.async_verify.extend([ObjectId(2), ObjectId(5)]);
    let mut stack = ScrubStack::new(backend);

    stack.enqueue_top(dir("/", 1), true, true, "nightly", recorder(&finished, "root"));
    stack.enqueue_bottom(file("/x", 5), false, false, "adhoc", recorder(&finished, "x"));

    let status = stack.status();
    assert_eq!(status.stack_depth, 2);
    assert_eq!(status.in_flight, 1);
    assert_eq!(status.jobs.len(), 2);
    assert_eq!(status.jobs[0].tag, "nightly");
    assert_eq!(status.jobs[1].origin_path, "/x");
    assert!(status.jobs[0].recursive);
    assert!(!status.jobs[1].recursive);
    assert!(status.jobs[0].enqueued_at <= chrono::Utc::now());

    drain(&mut stack);
    assert!(stack.status().jobs.is_empty());
}

#[test]
fn test_progress_broadcast() {
    let finished = Finished::default();
    let backend = MemBackend::new().dir(1, vec![vec![file("a", 2)]]);
    let mut stack = ScrubStack::new(backend);
    let mut rx = stack.subscribe();

    stack.enqueue_top(dir("/", 1), true, true, "", recorder(&finished, "root"));

    let progress = rx.try_recv().unwrap();
    assert_eq!(progress.entries_completed, 1);
    assert_eq!(progress.objects_verified, 2);
    assert!(progress.is_idle());
}

#[test]
fn test_idle_kick_is_noop() {
    let mut stack = ScrubStack::new(MemBackend::new());
    stack.kick_off_scrubs();
    stack.kick_off_scrubs();
    assert_eq!(stack.process_deferred(), 0);
    assert!(stack.is_idle());
}

#[test]
#[should_panic(expected = "dropped with")]
fn test_drop_with_queued_entries_panics() {
    let mut backend = MemBackend::new();
    backend.async_verify.insert(ObjectId(2));
    let mut stack = ScrubStack::new(backend);
    stack.enqueue_top(file("/f", 2), false, false, "", |_, _| {});
    drop(stack);
}

#[tokio::test]
async fn test_run_until_idle_with_spawned_completions() {
    struct SpawningBackend {
        inner: MemBackend,
    }

    impl ScrubBackend for SpawningBackend {
        fn fragments(&mut self, dir: &NamespaceEntry) -> Result<Vec<FragmentId>, ScrubError> {
            self.inner.fragments(dir)
        }

        fn fetch_fragment(
            &mut self,
            dir: &NamespaceEntry,
            frag: FragmentId,
            completer: Completer<FragmentContents>,
        ) -> Fetch<Result<FragmentContents, ScrubError>> {
            let result = self.inner.fragment(dir.object, frag);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                completer.complete(result);
            });
            Fetch::Pending
        }

        fn verify(
            &mut self,
            target: &NamespaceEntry,
            _tag: &str,
            completer: Completer<VerifyOutcome>,
        ) -> Fetch<Result<VerifyOutcome, ScrubError>> {
            self.inner.verified.push((target.object, String::new()));
            let result = self.inner.verify_outcome(target.object);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                completer.complete(result);
            });
            Fetch::Pending
        }
    }

    let finished = Finished::default();
    let mut inner = MemBackend::new()
        .dir(1, vec![vec![dir("a", 2), file("f", 3)], vec![file("g", 4)]])
        .dir(2, vec![vec![file("h", 5)], vec![]]);
    inner.mismatches.insert(ObjectId(5));
    let mut stack = ScrubStack::new(SpawningBackend { inner });

    stack.enqueue_top(dir("/", 1), true, true, "", {
        let finished = finished.clone();
        move |_, outcome| finished.lock().unwrap().push(("root".to_string(), outcome))
    });
    stack.run_until_idle().await;

    assert!(stack.is_idle());
    assert_eq!(stack.scrubs_in_progress(), 0);
    let finished = finished.lock().unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].1.objects_verified, 5);
    assert_eq!(finished[0].1.mismatches, 1);
}
