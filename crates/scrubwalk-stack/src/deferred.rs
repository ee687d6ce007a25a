//! Deferred execution: continuations delivered on a later scheduler turn.

use tokio::sync::mpsc;

use scrubwalk_core::{NamespaceEntry, ScrubError, VerifyOutcome};

use crate::bridge::{Completer, Completion};

/// Identifier of one outstanding fetch or verify.
pub type OpToken = u64;

/// A message for the scheduler, consumed only from its own loop.
#[derive(Debug)]
pub enum Deferred {
    /// Run `kick_off_scrubs` again.
    Kick,
    /// A pending fragment fetch finished.
    FragmentLoaded {
        token: OpToken,
        result: Result<Vec<NamespaceEntry>, ScrubError>,
    },
    /// A pending verify finished.
    Verified {
        token: OpToken,
        result: Result<VerifyOutcome, ScrubError>,
    },
}

/// Cloneable handle for requesting scheduler work from any thread.
#[derive(Debug, Clone)]
pub struct ScrubHandle {
    tx: mpsc::UnboundedSender<Deferred>,
}

impl ScrubHandle {
    /// Ask the scheduler to run another pass on its next turn.
    ///
    /// Returns `false` if the scheduler has been dropped.
    pub fn kick(&self) -> bool {
        self.tx.send(Deferred::Kick).is_ok()
    }
}

/// The queue between completions (producers) and the scheduler (consumer).
#[derive(Debug)]
pub(crate) struct DeferredQueue {
    tx: mpsc::UnboundedSender<Deferred>,
    rx: mpsc::UnboundedReceiver<Deferred>,
    next_token: OpToken,
}

impl DeferredQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            next_token: 1,
        }
    }

    /// Queue a message for a later turn.
    pub fn post(&self, message: Deferred) {
        // The receiver lives as long as self, so send cannot fail here.
        let _ = self.tx.send(message);
    }

    /// Mint a continuation for a new operation.
    pub fn completer<T: Completion>(&mut self) -> Completer<T> {
        let token = self.next_token;
        self.next_token += 1;
        Completer::new(token, self.tx.clone())
    }

    /// Take the next queued message without waiting.
    pub fn try_next(&mut self) -> Option<Deferred> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next queued message.
    pub async fn next(&mut self) -> Option<Deferred> {
        self.rx.recv().await
    }

    pub fn handle(&self) -> ScrubHandle {
        ScrubHandle {
            tx: self.tx.clone(),
        }
    }
}
