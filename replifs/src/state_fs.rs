//! The replicated filesystem state machine and its admission façade.
//!
//! [`StateFs`] is what the consensus node drives: it decodes committed log
//! entries and executes them against the local engine under per-path write
//! locks. [`FsHandle`] is the other half of the hinge, used by the RPC
//! layer: it gates mutations on leadership, pushes them through the log and
//! waits on their completions; reads bypass the log entirely.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use tokio::time::{timeout, Duration};

use crate::command::{self, Command, CommandType, MAX_MESSAGE_SIZE};
use crate::error::FsError;
use crate::lock_table::LockTable;
use crate::metrics;
use crate::path;
use crate::raft::proposal::Proposal;
use crate::raft::StateMachine;
use crate::storage::{FileInfo, LocalStorage};

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Leadership view shared between the consensus loop and the admission
/// path. Written only by the state machine's leadership callbacks.
#[derive(Default)]
pub struct LeaderState {
    is_leader: AtomicBool,
    leader_term: AtomicU64,
    leader_id: AtomicU64,
}

impl LeaderState {
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn leader_term(&self) -> u64 {
        self.leader_term.load(Ordering::Acquire)
    }

    pub fn leader_id(&self) -> u64 {
        self.leader_id.load(Ordering::Acquire)
    }
}

/// One file or directory of the data root inside a snapshot archive.
#[derive(Serialize, Deserialize)]
struct TreeEntry {
    path: String,
    is_dir: bool,
    contents: Vec<u8>,
}

/// The deterministic executor registered with the consensus node.
pub struct StateFs {
    node_id: u64,
    storage: Arc<LocalStorage>,
    locks: Arc<LockTable>,
    shared: Arc<LeaderState>,
}

impl StateFs {
    pub fn new(
        node_id: u64,
        storage: Arc<LocalStorage>,
        locks: Arc<LockTable>,
        shared: Arc<LeaderState>,
    ) -> StateFs {
        StateFs {
            node_id,
            storage,
            locks,
            shared,
        }
    }

    fn execute(&self, cmd: &Command) -> Result<(), FsError> {
        let key = path::validate(&cmd.path)?;
        match cmd.op {
            CommandType::CreateFile => {
                let _guard = self.locks.write(&key);
                self.storage.create_file(&cmd.path)
            }
            CommandType::WriteFile => {
                let _guard = self.locks.write(&key);
                self.storage.write_file(&cmd.path, &cmd.payload)
            }
            CommandType::AppendFile => {
                let _guard = self.locks.write(&key);
                self.storage.append_file(&cmd.path, &cmd.payload)
            }
            CommandType::DeleteFile => {
                let _guard = self.locks.write(&key);
                self.storage.delete_file(&cmd.path)
            }
            CommandType::CreateDir => {
                let _guard = self.locks.write(&key);
                self.storage.create_directory(&cmd.path)
            }
            CommandType::DeleteDir => {
                let _guard = self.locks.write(&key);
                self.storage.delete_directory(&cmd.path)
            }
            CommandType::Rename => {
                let new_key = path::validate(&cmd.new_path)?;
                let _guards = self.locks.write_pair(&key, &new_key);
                self.storage.rename(&cmd.path, &cmd.new_path)
            }
            CommandType::ReadFile | CommandType::ListDir => {
                log::warn!("read-only command in the replicated log: {:?}", cmd.op);
                Ok(())
            }
        }
    }
}

impl StateMachine for StateFs {
    fn on_apply(&mut self, index: u64, data: &[u8]) -> Result<(), FsError> {
        let cmd = command::decode_log_entry(data)?;
        log::debug!("applying {:?} path={} at index {index}", cmd.op, cmd.path);
        let started = Instant::now();
        let result = self.execute(&cmd);
        metrics::APPLY_HISTOGRAM_VEC
            .with_label_values(&[cmd.op.name()])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    fn on_snapshot_save(&mut self) -> Result<Vec<u8>, FsError> {
        let mut entries = Vec::new();
        collect_tree(self.storage.root(), "", &mut entries)?;
        log::info!("captured snapshot of {} tree entries", entries.len());
        bincode::serialize(&entries).map_err(|e| FsError::Serialization(e.to_string()))
    }

    fn on_snapshot_load(
        &mut self,
        last_index: u64,
        last_term: u64,
        data: &[u8],
    ) -> Result<(), FsError> {
        if data.is_empty() {
            // founding snapshots carry no tree
            return Ok(());
        }
        let entries: Vec<TreeEntry> =
            bincode::deserialize(data).map_err(|e| FsError::Serialization(e.to_string()))?;
        clear_tree(self.storage.root())?;
        for entry in &entries {
            let full = self.storage.root().join(&entry.path);
            if entry.is_dir {
                fs::create_dir_all(&full)?;
            } else {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&full, &entry.contents)?;
            }
        }
        log::info!(
            "restored snapshot at index {last_index} term {last_term}: {} tree entries",
            entries.len()
        );
        Ok(())
    }

    fn on_leader_start(&mut self, term: u64) {
        self.shared.leader_term.store(term, Ordering::Release);
        self.shared.leader_id.store(self.node_id, Ordering::Release);
        self.shared.is_leader.store(true, Ordering::Release);
        log::info!("became leader at term {term}");
    }

    fn on_leader_stop(&mut self) {
        self.shared.is_leader.store(false, Ordering::Release);
        log::info!("stepped down from leadership");
    }

    fn on_error(&mut self, error: &raft::Error) {
        log::error!("raft error: {error}");
    }

    fn on_configuration_committed(&mut self, voters: &[u64]) {
        log::info!("configuration committed: voters {voters:?}");
    }

    fn on_start_following(&mut self, leader_id: u64, term: u64) {
        self.shared.is_leader.store(false, Ordering::Release);
        self.shared.leader_id.store(leader_id, Ordering::Release);
        log::info!("following leader {leader_id} at term {term}");
    }

    fn on_stop_following(&mut self, leader_id: u64, term: u64) {
        self.shared.leader_id.store(0, Ordering::Release);
        log::info!("stopped following leader {leader_id} at term {term}");
    }
}

fn collect_tree(root: &Path, logical: &str, out: &mut Vec<TreeEntry>) -> Result<(), FsError> {
    let dir = if logical.is_empty() {
        root.to_path_buf()
    } else {
        root.join(logical)
    };
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let child = if logical.is_empty() {
            name
        } else {
            format!("{logical}/{name}")
        };
        let meta = entry.metadata()?;
        if meta.is_dir() {
            out.push(TreeEntry {
                path: child.clone(),
                is_dir: true,
                contents: Vec::new(),
            });
            collect_tree(root, &child, out)?;
        } else {
            let contents = fs::read(entry.path())?;
            out.push(TreeEntry {
                path: child,
                is_dir: false,
                contents,
            });
        }
    }
    Ok(())
}

fn clear_tree(root: &Path) -> Result<(), FsError> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.metadata()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Clonable façade the RPC layer talks to.
#[derive(Clone)]
pub struct FsHandle {
    proposals: Sender<Proposal>,
    shared: Arc<LeaderState>,
    peers: Arc<HashMap<u64, String>>,
    storage: Arc<LocalStorage>,
    locks: Arc<LockTable>,
}

impl FsHandle {
    pub fn new(
        proposals: Sender<Proposal>,
        shared: Arc<LeaderState>,
        peers: Arc<HashMap<u64, String>>,
        storage: Arc<LocalStorage>,
        locks: Arc<LockTable>,
    ) -> FsHandle {
        FsHandle {
            proposals,
            shared,
            peers,
            storage,
            locks,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.shared.is_leader()
    }

    /// The current leader's `ip:port:index` identity, if one is known.
    pub fn leader(&self) -> Option<String> {
        let id = self.shared.leader_id();
        if id == 0 {
            None
        } else {
            self.peers.get(&id).cloned()
        }
    }

    /// Admits one mutation: leadership gate, encode, propose, wait for the
    /// completion the apply loop fires.
    async fn submit(&self, cmd: Command) -> Result<(), FsError> {
        if !self.shared.is_leader() {
            return Err(match self.leader() {
                Some(leader) => FsError::NotLeader { leader },
                None => FsError::NoLeader,
            });
        }
        if cmd.payload.len() > MAX_MESSAGE_SIZE {
            return Err(FsError::TooLarge(format!(
                "payload of {} bytes for {}",
                cmd.payload.len(),
                cmd.path
            )));
        }
        // refuse bad paths before they cost a log entry
        path::validate(&cmd.path)?;
        if cmd.op == CommandType::Rename {
            path::validate(&cmd.new_path)?;
        }

        let encoded = command::encode_log_entry(&cmd);
        let (proposal, waiter) = Proposal::mutation(encoded, self.shared.leader_term());
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| FsError::Raft("consensus node is shut down".to_string()))?;

        match timeout(SUBMIT_TIMEOUT, waiter).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(FsError::Raft("completion dropped".to_string())),
            Err(_) => Err(FsError::Timeout(format!(
                "{} {}",
                cmd.op.name(),
                cmd.path
            ))),
        }
    }

    pub async fn create_file(&self, path: &str) -> Result<(), FsError> {
        self.submit(Command::new(CommandType::CreateFile, path)).await
    }

    pub async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<(), FsError> {
        self.submit(Command::with_payload(CommandType::WriteFile, path, data))
            .await
    }

    pub async fn append_file(&self, path: &str, data: Vec<u8>) -> Result<(), FsError> {
        self.submit(Command::with_payload(CommandType::AppendFile, path, data))
            .await
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), FsError> {
        self.submit(Command::new(CommandType::DeleteFile, path)).await
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), FsError> {
        self.submit(Command::new(CommandType::CreateDir, path)).await
    }

    pub async fn delete_directory(&self, path: &str) -> Result<(), FsError> {
        self.submit(Command::new(CommandType::DeleteDir, path)).await
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        self.submit(Command::rename(old_path, new_path)).await
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let key = path::validate(path)?;
        let _guard = self.locks.read(&key);
        self.storage.read_file(path)
    }

    pub fn list_directory(&self, path: &str) -> Result<Vec<String>, FsError> {
        let key = path::validate(path)?;
        let _guard = self.locks.read(&key);
        self.storage.list_directory(path)
    }

    pub fn stat(&self, path: &str) -> Result<FileInfo, FsError> {
        let key = path::validate(path)?;
        let _guard = self.locks.read(&key);
        self.storage.stat(path)
    }

    pub fn exists(&self, path: &str) -> Result<bool, FsError> {
        self.storage.exists(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> StateFs {
        let storage = Arc::new(LocalStorage::new(dir.path().join("root")));
        storage.init().unwrap();
        StateFs::new(
            1,
            storage,
            Arc::new(LockTable::new()),
            Arc::new(LeaderState::default()),
        )
    }

    fn apply(fs: &mut StateFs, cmd: &Command) -> Result<(), FsError> {
        fs.on_apply(1, &command::encode_log_entry(cmd))
    }

    #[test]
    fn applies_commands_from_log_bytes() {
        let dir = TempDir::new().unwrap();
        let mut fs = state(&dir);
        apply(&mut fs, &Command::new(CommandType::CreateDir, "d")).unwrap();
        apply(
            &mut fs,
            &Command::with_payload(CommandType::WriteFile, "d/a", b"v1".to_vec()),
        )
        .unwrap();
        apply(
            &mut fs,
            &Command::with_payload(CommandType::AppendFile, "d/a", b"+v2".to_vec()),
        )
        .unwrap();
        assert_eq!(fs.storage.read_file("d/a").unwrap(), b"v1+v2");

        apply(&mut fs, &Command::rename("d/a", "d/b")).unwrap();
        assert!(!fs.storage.exists("d/a").unwrap());
        assert_eq!(fs.storage.read_file("d/b").unwrap(), b"v1+v2");
    }

    #[test]
    fn garbage_log_bytes_do_not_poison_the_machine() {
        let dir = TempDir::new().unwrap();
        let mut fs = state(&dir);
        assert!(matches!(
            fs.on_apply(1, b"\xffgarbage"),
            Err(FsError::Serialization(_))
        ));
        // the machine keeps applying afterwards
        apply(&mut fs, &Command::new(CommandType::CreateFile, "ok")).unwrap();
        assert!(fs.storage.exists("ok").unwrap());
    }

    #[test]
    fn read_commands_in_the_log_are_ignored() {
        let dir = TempDir::new().unwrap();
        let mut fs = state(&dir);
        apply(&mut fs, &Command::new(CommandType::ReadFile, "ghost")).unwrap();
        apply(&mut fs, &Command::new(CommandType::ListDir, "ghost")).unwrap();
    }

    #[test]
    fn snapshot_round_trip_restores_the_tree() {
        let dir = TempDir::new().unwrap();
        let mut fs = state(&dir);
        apply(&mut fs, &Command::new(CommandType::CreateDir, "projects")).unwrap();
        apply(&mut fs, &Command::new(CommandType::CreateDir, "projects/empty")).unwrap();
        apply(
            &mut fs,
            &Command::with_payload(CommandType::WriteFile, "projects/a.txt", b"hello\n".to_vec()),
        )
        .unwrap();
        apply(
            &mut fs,
            &Command::with_payload(CommandType::WriteFile, "top", vec![0u8, 1, 2]),
        )
        .unwrap();

        let archive = fs.on_snapshot_save().unwrap();

        // wipe and scribble over the tree, then restore
        clear_tree(fs.storage.root()).unwrap();
        fs.storage.write_file("stray", b"junk").unwrap();
        fs.on_snapshot_load(10, 2, &archive).unwrap();

        assert_eq!(fs.storage.read_file("projects/a.txt").unwrap(), b"hello\n");
        assert_eq!(fs.storage.read_file("top").unwrap(), vec![0u8, 1, 2]);
        assert!(fs.storage.stat("projects/empty").unwrap().is_directory);
        assert!(!fs.storage.exists("stray").unwrap());
        let mut top = fs.storage.list_directory("").unwrap();
        top.sort();
        assert_eq!(top, vec!["projects".to_string(), "top".to_string()]);
    }

    #[test]
    fn leadership_callbacks_update_the_shared_view() {
        let dir = TempDir::new().unwrap();
        let mut fs = state(&dir);
        let shared = fs.shared.clone();

        assert!(!shared.is_leader());
        fs.on_leader_start(3);
        assert!(shared.is_leader());
        assert_eq!(shared.leader_term(), 3);
        assert_eq!(shared.leader_id(), 1);

        fs.on_leader_stop();
        assert!(!shared.is_leader());

        fs.on_start_following(2, 4);
        assert_eq!(shared.leader_id(), 2);
        fs.on_stop_following(2, 4);
        assert_eq!(shared.leader_id(), 0);
    }
}
