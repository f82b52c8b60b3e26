use std::collections::VecDeque;
use std::path::Path;

use protobuf::Message as PbMessage;
use raft::prelude::*;
use raft::StateRole;
use slog::{o, Drain};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{Duration, Instant};

use crate::error::FsError;
use crate::raft::proposal::{Outcome, Proposal};
use crate::raft::storage::DiskStorage;
use crate::raft::StateMachine;

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const LOGGER_CHANNEL_SIZE: usize = 4096;
const MAILBOX_SIZE: usize = 1024;

fn raft_config(id: u64, election_timeout_ms: u64) -> Config {
    Config {
        id,
        election_tick: (election_timeout_ms / TICK_INTERVAL.as_millis() as u64).max(10) as usize,
        heartbeat_tick: 3,
        ..Default::default()
    }
}

/// The consensus event loop: steps inbound messages, admits proposals,
/// drives the ready/advance cycle and applies committed entries to the
/// registered state machine.
pub struct Node<S: StateMachine> {
    raft_group: RawNode<DiskStorage>,
    out_mailbox: Sender<Message>,
    my_mailbox: Receiver<Message>,
    state_machine: S,
    proposals: Receiver<Proposal>,
    proposed: VecDeque<Proposal>,
    snapshot_interval: Duration,
    last_role: StateRole,
    last_leader: u64,
}

impl<S: StateMachine + Send + 'static> Node<S> {
    /// Starts the node task. Returns the outbound mailbox the transport
    /// drains to reach peers; the loop runs until the proposal channel
    /// closes.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        id: u64,
        voters: Vec<u64>,
        raft_root: &Path,
        election_timeout_ms: u64,
        snapshot_interval_s: u64,
        my_mailbox: Receiver<Message>,
        proposals: Receiver<Proposal>,
        state_machine: S,
    ) -> Result<Receiver<Message>, FsError> {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        let logger = slog::Logger::root(drain, o!("node" => id));

        let cfg = raft_config(id, election_timeout_ms);
        let storage =
            DiskStorage::open(raft_root, &voters).map_err(|e| FsError::Raft(e.to_string()))?;
        let raft_group =
            RawNode::new(&cfg, storage, &logger).map_err(|e| FsError::Raft(e.to_string()))?;

        let (tx, out_mailbox) = mpsc::channel(MAILBOX_SIZE);
        let mut node = Node {
            raft_group,
            out_mailbox: tx,
            my_mailbox,
            state_machine,
            proposals,
            proposed: VecDeque::new(),
            snapshot_interval: Duration::from_secs(snapshot_interval_s),
            last_role: StateRole::Follower,
            last_leader: 0,
        };
        tokio::spawn(async move {
            node.run().await;
        });
        Ok(out_mailbox)
    }

    async fn run(&mut self) {
        let mut last_tick = Instant::now();
        let mut last_snapshot = Instant::now();
        let mut last_snapshot_index = self.raft_group.raft.raft_log.applied();

        loop {
            tokio::select! {
                maybe_msg = self.my_mailbox.recv() => {
                    let Some(msg) = maybe_msg else {
                        log::info!("peer mailbox closed, consensus loop exiting");
                        return;
                    };
                    self.step(msg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        self.step(msg);
                    }
                }
                maybe_proposal = self.proposals.recv() => {
                    let Some(proposal) = maybe_proposal else {
                        log::info!("proposal channel closed, consensus loop exiting");
                        return;
                    };
                    self.propose(proposal);
                    while let Ok(proposal) = self.proposals.try_recv() {
                        self.propose(proposal);
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.raft_group.tick();
                last_tick = Instant::now();
            }

            if self.snapshot_interval.as_secs() > 0
                && last_snapshot.elapsed() >= self.snapshot_interval
                && last_snapshot_index < self.raft_group.raft.raft_log.applied()
            {
                self.save_snapshot();
                last_snapshot = Instant::now();
                last_snapshot_index = self.raft_group.raft.raft_log.applied();
            }

            self.on_ready();
            self.observe_transitions();
        }
    }

    fn step(&mut self, msg: Message) {
        if let Err(e) = self.raft_group.step(msg) {
            self.state_machine.on_error(&e);
        }
    }

    /// Accepts one proposal into the log, or resolves it immediately when
    /// the node cannot take it.
    fn propose(&mut self, mut proposal: Proposal) {
        if self.raft_group.raft.state != StateRole::Leader {
            proposal.reject(FsError::Raft(
                "leadership lost before proposal".to_string(),
            ));
            return;
        }
        if self.raft_group.raft.term != proposal.expected_term {
            let expected_term = proposal.expected_term;
            let current_term = self.raft_group.raft.term;
            proposal.reject(FsError::Raft(format!(
                "term changed from {} to {}",
                expected_term, current_term
            )));
            return;
        }

        let index = self.raft_group.raft.raft_log.last_index() + 1;
        let data = std::mem::take(&mut proposal.data);
        if let Err(e) = self.raft_group.propose(vec![], data) {
            proposal.reject(FsError::Raft(e.to_string()));
            return;
        }
        if self.raft_group.raft.raft_log.last_index() + 1 == index {
            proposal.reject(FsError::Raft("proposal dropped by the log".to_string()));
        } else {
            proposal.proposed = index;
            proposal.term = self.raft_group.raft.term;
            self.proposed.push_back(proposal);
        }
    }

    fn on_ready(&mut self) {
        if !self.raft_group.has_ready() {
            return;
        }
        let mut ready = self.raft_group.ready();

        if !ready.messages().is_empty() {
            Self::forward(&self.out_mailbox, ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            self.install_snapshot(&ready);
        }

        self.apply_entries(ready.take_committed_entries());

        self.persist(&ready);
        if !ready.persisted_messages().is_empty() {
            Self::forward(&self.out_mailbox, ready.take_persisted_messages());
        }

        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raft_group.raft.raft_log.store.set_commit(commit);
        }
        Self::forward(&self.out_mailbox, light_rd.take_messages());
        self.apply_entries(light_rd.take_committed_entries());
        self.raft_group.advance_apply();
    }

    fn forward(out: &Sender<Message>, messages: Vec<Message>) {
        for msg in messages {
            if let Err(e) = out.try_send(msg) {
                log::warn!("outbound raft message dropped ({e}), raft will retry");
            }
        }
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            let outcome: Outcome = if entry.data.is_empty() {
                // a new leader's no-op barrier entry
                Ok(())
            } else if entry.get_entry_type() == EntryType::EntryConfChange {
                self.apply_conf_change(&entry);
                Ok(())
            } else {
                let result = self.state_machine.on_apply(entry.index, entry.data.as_ref());
                if let Err(ref e) = result {
                    log::error!("apply failed at index {}: {e}", entry.index);
                }
                result
            };
            self.resolve_proposals(entry.index, entry.term, outcome);
        }
    }

    fn apply_conf_change(&mut self, entry: &Entry) {
        let mut cc = ConfChange::default();
        if let Err(e) = cc.merge_from_bytes(entry.data.as_ref()) {
            log::error!("failed to decode conf change at index {}: {e}", entry.index);
            return;
        }
        match self.raft_group.apply_conf_change(&cc) {
            Ok(cs) => {
                self.state_machine.on_configuration_committed(&cs.voters);
                self.raft_group.raft.raft_log.store.set_conf_state(cs);
            }
            Err(e) => log::error!("failed to apply conf change: {e}"),
        }
    }

    /// Fires the completion of every local proposal settled by the entry at
    /// `index`. A proposal whose slot was taken by another leader's entry
    /// gets a raft error instead of a false success.
    fn resolve_proposals(&mut self, index: u64, term: u64, outcome: Outcome) {
        let mut outcome = Some(outcome);
        while let Some(front) = self.proposed.front() {
            if front.proposed > index {
                break;
            }
            let mut proposal = self.proposed.pop_front().expect("front exists");
            let settled_here = proposal.proposed == index && proposal.term == term;
            if let Some(completion) = proposal.completion.take() {
                if settled_here {
                    completion.fire(outcome.take().unwrap_or(Ok(())));
                } else {
                    completion.fire(Err(FsError::Raft(
                        "log entry superseded by a newer leader".to_string(),
                    )));
                }
            }
        }
    }

    fn install_snapshot(&mut self, ready: &Ready) {
        let snapshot = ready.snapshot().clone();
        let metadata = snapshot.get_metadata().clone();

        let store = &mut self.raft_group.raft.raft_log.store;
        if let Err(e) = store.apply_snapshot(&snapshot) {
            log::error!("failed to persist incoming snapshot: {e:?}");
            return;
        }

        if let Err(e) =
            self.state_machine
                .on_snapshot_load(metadata.index, metadata.term, snapshot.get_data())
        {
            log::error!("failed to load snapshot state: {e}");
        }
    }

    fn save_snapshot(&mut self) {
        let data = match self.state_machine.on_snapshot_save() {
            Ok(data) => data,
            Err(e) => {
                log::error!("snapshot capture failed: {e}");
                return;
            }
        };
        let applied = self.raft_group.raft.raft_log.applied();
        let store = &mut self.raft_group.raft.raft_log.store;
        match store.save_snapshot(data, applied) {
            Ok(()) => log::info!("saved snapshot at index {applied}"),
            Err(e) => log::error!("failed to persist snapshot: {e:?}"),
        }
    }

    fn persist(&mut self, ready: &Ready) {
        let store = &mut self.raft_group.raft.raft_log.store;
        if let Err(e) = store.append_entries(ready.entries()) {
            log::error!("failed to persist raft log: {e:?}");
            return;
        }
        if let Some(hs) = ready.hs() {
            store.set_hardstate(hs.clone());
        }
    }

    /// Translates raw role / leader-id changes into the state machine's
    /// leadership callbacks.
    fn observe_transitions(&mut self) {
        let role = self.raft_group.raft.state;
        let leader = self.raft_group.raft.leader_id;
        let term = self.raft_group.raft.term;
        let own_id = self.raft_group.raft.id;

        if role != self.last_role {
            if role == StateRole::Leader {
                self.state_machine.on_leader_start(term);
            } else if self.last_role == StateRole::Leader {
                self.state_machine.on_leader_stop();
            }
            self.last_role = role;
        }

        if leader != self.last_leader {
            if self.last_leader != 0 && self.last_leader != own_id {
                self.state_machine.on_stop_following(self.last_leader, term);
            }
            if leader != 0 && leader != own_id {
                self.state_machine.on_start_following(leader, term);
            }
            self.last_leader = leader;
        }
    }
}
