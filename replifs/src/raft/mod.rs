//! Consensus plumbing: the state-machine trait, the node event loop, its
//! file-backed log storage and the peer transport.

pub mod node;
pub mod proposal;
mod segment;
mod storage;
pub mod transport;

use crate::error::FsError;

/// Callbacks a replicated state machine registers with the consensus node.
///
/// `on_apply` runs on every replica in log order. The leadership and
/// following callbacks run wherever the local node's view of the cluster
/// changes.
pub trait StateMachine {
    /// Applies one committed entry. The outcome is carried back to the
    /// submitting client's completion on the leader; on every other replica
    /// it is only logged.
    fn on_apply(&mut self, index: u64, data: &[u8]) -> Result<(), FsError>;

    /// Captures the current state as an opaque snapshot payload.
    fn on_snapshot_save(&mut self) -> Result<Vec<u8>, FsError>;

    /// Replaces the current state with the given snapshot payload.
    fn on_snapshot_load(
        &mut self,
        last_index: u64,
        last_term: u64,
        data: &[u8],
    ) -> Result<(), FsError>;

    fn on_leader_start(&mut self, term: u64);
    fn on_leader_stop(&mut self);
    fn on_error(&mut self, error: &raft::Error);
    fn on_configuration_committed(&mut self, voters: &[u64]);
    fn on_start_following(&mut self, leader_id: u64, term: u64);
    fn on_stop_following(&mut self, leader_id: u64, term: u64);
}
