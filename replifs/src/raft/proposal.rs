use tokio::sync::oneshot;

use crate::error::FsError;

/// Outcome delivered through a [`Completion`].
pub type Outcome = Result<(), FsError>;

/// Single-shot handoff between the admission path and the consensus loop.
///
/// Fired exactly once: by the apply path when the entry commits, or early
/// when the proposal is rejected. Consuming `self` enforces notify-once.
pub struct Completion {
    tx: oneshot::Sender<Outcome>,
}

impl Completion {
    pub fn fire(self, outcome: Outcome) {
        // the waiter may have timed out and gone away
        let _ = self.tx.send(outcome);
    }
}

/// One mutating command on its way into the log.
pub struct Proposal {
    pub data: Vec<u8>,
    /// Leader term observed at admission. A different term at propose time
    /// rejects the task instead of replicating it under the new term.
    pub expected_term: u64,
    /// Log index assigned when the entry was accepted into the log.
    pub proposed: u64,
    /// Raft term at propose time, used to detect overwritten entries.
    pub term: u64,
    pub completion: Option<Completion>,
}

impl Proposal {
    pub fn mutation(data: Vec<u8>, expected_term: u64) -> (Proposal, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Proposal {
                data,
                expected_term,
                proposed: 0,
                term: 0,
                completion: Some(Completion { tx }),
            },
            rx,
        )
    }

    /// Resolves the proposal before it reaches the log.
    pub fn reject(mut self, err: FsError) {
        if let Some(completion) = self.completion.take() {
            completion.fire(Err(err));
        }
    }
}
