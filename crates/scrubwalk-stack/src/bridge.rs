//! The async fetch bridge between the scheduler and the namespace store.

use std::marker::PhantomData;

use tokio::sync::mpsc;

use scrubwalk_core::{FragmentId, NamespaceEntry, ObjectId, ScrubError, VerifyOutcome};

use crate::deferred::{Deferred, OpToken};

/// Children of one directory fragment.
pub type FragmentContents = Vec<NamespaceEntry>;

/// Result of a bridge call: available now, or delivered later through the
/// [`Completer`] handed to the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch<T> {
    /// The result is available synchronously.
    Ready(T),
    /// The result will arrive through the completer.
    Pending,
}

/// Payload types a [`Completer`] can deliver.
pub trait Completion: Send + Sized + 'static {
    #[doc(hidden)]
    fn into_deferred(token: OpToken, result: Result<Self, ScrubError>) -> Deferred;
}

impl Completion for FragmentContents {
    fn into_deferred(token: OpToken, result: Result<Self, ScrubError>) -> Deferred {
        Deferred::FragmentLoaded { token, result }
    }
}

impl Completion for VerifyOutcome {
    fn into_deferred(token: OpToken, result: Result<Self, ScrubError>) -> Deferred {
        Deferred::Verified { token, result }
    }
}

/// One-shot continuation for a pending fetch or verify.
///
/// Completing never runs scheduler code: the result is queued and applied on
/// the scheduler's next turn. A completer dropped without completing delivers
/// [`ScrubError::Abandoned`]. Completers whose call returned
/// [`Fetch::Ready`] are ignored by the scheduler when dropped.
#[derive(Debug)]
pub struct Completer<T: Completion> {
    token: OpToken,
    tx: Option<mpsc::UnboundedSender<Deferred>>,
    _payload: PhantomData<fn(T)>,
}

impl<T: Completion> Completer<T> {
    pub(crate) fn new(token: OpToken, tx: mpsc::UnboundedSender<Deferred>) -> Self {
        Self {
            token,
            tx: Some(tx),
            _payload: PhantomData,
        }
    }

    /// Token identifying the operation this completer belongs to.
    pub fn token(&self) -> OpToken {
        self.token
    }

    /// Deliver the result of the pending operation.
    pub fn complete(mut self, result: Result<T, ScrubError>) {
        self.send(result);
    }

    /// Answer the call synchronously, disarming the completer.
    pub fn ready(mut self, result: Result<T, ScrubError>) -> Fetch<Result<T, ScrubError>> {
        self.tx = None;
        Fetch::Ready(result)
    }

    fn send(&mut self, result: Result<T, ScrubError>) {
        if let Some(tx) = self.tx.take() {
            // A closed channel means the scheduler is gone; nothing to resume.
            let _ = tx.send(T::into_deferred(self.token, result));
        }
    }
}

impl<T: Completion> Drop for Completer<T> {
    fn drop(&mut self) {
        self.send(Err(ScrubError::Abandoned));
    }
}

/// Collaborator interface the scheduler consumes.
///
/// Every method is called from the scheduler's own thread. Pending results
/// must be delivered through the completer, never by calling back into the
/// scheduler.
pub trait ScrubBackend {
    /// List the fragments of a resident directory, in a stable order.
    fn fragments(&mut self, dir: &NamespaceEntry) -> Result<Vec<FragmentId>, ScrubError>;

    /// Fetch the children of one directory fragment.
    fn fetch_fragment(
        &mut self,
        dir: &NamespaceEntry,
        frag: FragmentId,
        completer: Completer<FragmentContents>,
    ) -> Fetch<Result<FragmentContents, ScrubError>>;

    /// Verify one object, stamping `tag` on its record when non-empty.
    fn verify(
        &mut self,
        target: &NamespaceEntry,
        tag: &str,
        completer: Completer<VerifyOutcome>,
    ) -> Fetch<Result<VerifyOutcome, ScrubError>>;

    /// Keep `object` resident until the matching `unpin`.
    fn pin(&mut self, _object: ObjectId) {}

    /// Release a pin taken by `pin`.
    fn unpin(&mut self, _object: ObjectId) {}
}
