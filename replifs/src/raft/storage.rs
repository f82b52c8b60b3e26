//! File-backed raft storage.
//!
//! Serves reads from an in-memory `MemStorage` mirror while keeping every
//! entry, the hard state and the latest snapshot on disk. Layout under the
//! raft root: `log/` holds entry segments, `raft_meta/` the hard state,
//! `snapshot/` the most recent snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Result, Storage};

use super::segment::LogSegment;

const SEGMENT_SPAN: u64 = 4096;

fn store_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> raft::Error {
    raft::Error::Store(raft::StorageError::Other(Box::new(e)))
}

pub struct DiskStorage {
    mem: MemStorage,
    segments: BTreeMap<u64, LogSegment>,
    log_dir: PathBuf,
    meta_dir: PathBuf,
    snapshot_dir: PathBuf,
}

impl DiskStorage {
    /// Opens (or seeds) the raft state under `raft_root`. A node starting
    /// from nothing installs a founding snapshot at index 1 whose conf
    /// state lists every voter, so all peers begin from identical state.
    pub fn open<P: AsRef<Path>>(raft_root: P, voters: &[u64]) -> Result<DiskStorage> {
        let root = raft_root.as_ref();
        let log_dir = root.join("log");
        let meta_dir = root.join("raft_meta");
        let snapshot_dir = root.join("snapshot");
        for dir in [&log_dir, &meta_dir, &snapshot_dir] {
            fs::create_dir_all(dir)?;
        }

        let mem = MemStorage::new();

        let snapshot_path = snapshot_dir.join("snapshot");
        let mut snapshot_index = 1u64;
        if snapshot_path.exists() {
            let bytes = fs::read(&snapshot_path)?;
            let mut snapshot = Snapshot::default();
            snapshot.merge_from_bytes(&bytes).map_err(store_err)?;
            snapshot_index = snapshot.get_metadata().index;
            mem.wl().apply_snapshot(snapshot)?;
        } else {
            let mut snapshot = Snapshot::default();
            snapshot.mut_metadata().index = 1;
            snapshot.mut_metadata().term = 1;
            snapshot.mut_metadata().mut_conf_state().voters = voters.to_vec();
            mem.wl().apply_snapshot(snapshot)?;
        }

        let hard_state_path = meta_dir.join("hard_state");
        if hard_state_path.exists() {
            let bytes = fs::read(&hard_state_path)?;
            let mut hs = HardState::default();
            hs.merge_from_bytes(&bytes).map_err(store_err)?;
            if hs.commit < snapshot_index {
                hs.set_commit(snapshot_index);
            }
            mem.wl().set_hardstate(hs);
        }

        let mut storage = DiskStorage {
            mem,
            segments: BTreeMap::new(),
            log_dir,
            meta_dir,
            snapshot_dir,
        };
        storage.load_segments()?;
        Ok(storage)
    }

    fn load_segments(&mut self) -> Result<()> {
        let mut spans = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(span) = name
                .strip_prefix("segment_")
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                spans.push(span);
            }
        }
        spans.sort_unstable();

        let last_known = self.mem.last_index()?;
        let mut entries = Vec::new();
        for span in spans {
            let mut segment = LogSegment::open(self.segment_path(span)).map_err(store_err)?;
            if let (Some(first), Some(last)) = (segment.first_index(), segment.last_index()) {
                for index in first..=last {
                    let bytes = segment.read(index).map_err(store_err)?;
                    let mut entry = Entry::default();
                    entry.merge_from_bytes(&bytes).map_err(store_err)?;
                    if entry.index > last_known {
                        entries.push(entry);
                    }
                }
            }
            self.segments.insert(span, segment);
        }
        if !entries.is_empty() {
            self.mem.wl().append(&entries)?;
        }
        Ok(())
    }

    fn segment_span(index: u64) -> u64 {
        (index / SEGMENT_SPAN) * SEGMENT_SPAN
    }

    fn segment_path(&self, span: u64) -> PathBuf {
        self.log_dir.join(format!("segment_{span}.log"))
    }

    fn segment_for(&mut self, span: u64) -> Result<&mut LogSegment> {
        if !self.segments.contains_key(&span) {
            let segment = LogSegment::open(self.segment_path(span)).map_err(store_err)?;
            self.segments.insert(span, segment);
        }
        Ok(self.segments.get_mut(&span).expect("just inserted"))
    }

    /// Removes `from` and everything after it from the on-disk log, so a
    /// conflicting suffix can be overwritten by a newer leader's entries.
    fn truncate_disk_from(&mut self, from: u64) -> Result<()> {
        let mut doomed = Vec::new();
        for (&span, segment) in self.segments.iter_mut() {
            match segment.first_index() {
                Some(first) if first >= from => doomed.push(span),
                Some(_) => {
                    if segment.last_index().map_or(false, |last| last >= from) {
                        segment.truncate_from(from).map_err(store_err)?;
                    }
                }
                None => {}
            }
        }
        for span in doomed {
            if let Some(segment) = self.segments.remove(&span) {
                segment.delete().map_err(store_err)?;
            }
        }
        Ok(())
    }

    /// Appends entries to memory and disk, truncating any conflicting
    /// suffix first.
    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem.wl().append(entries)?;
        self.truncate_disk_from(entries[0].index)?;
        for entry in entries {
            let bytes = entry.write_to_bytes().map_err(store_err)?;
            let segment = self.segment_for(Self::segment_span(entry.index))?;
            segment.append(entry.index, &bytes).map_err(store_err)?;
        }
        Ok(())
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) {
        self.mem.wl().set_conf_state(conf_state);
    }

    pub fn set_hardstate(&mut self, hs: HardState) {
        self.mem.wl().set_hardstate(hs.clone());
        if let Err(e) = self.persist_hard_state(&hs) {
            log::error!("failed to persist hard state: {e}");
        }
    }

    pub fn set_commit(&mut self, commit: u64) {
        self.mem.wl().mut_hard_state().set_commit(commit);
    }

    fn persist_hard_state(&self, hs: &HardState) -> Result<()> {
        let bytes = hs.write_to_bytes().map_err(store_err)?;
        let target = self.meta_dir.join("hard_state");
        let temp = self.meta_dir.join("hard_state.tmp");
        fs::write(&temp, &bytes)?;
        fs::rename(&temp, &target)?;
        Ok(())
    }

    fn persist_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = snapshot.write_to_bytes().map_err(store_err)?;
        let target = self.snapshot_dir.join("snapshot");
        let temp = self.snapshot_dir.join("snapshot.tmp");
        fs::write(&temp, &bytes)?;
        fs::rename(&temp, &target)?;
        Ok(())
    }

    /// Installs a snapshot received from the leader.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.persist_snapshot(snapshot)?;
        self.mem.wl().apply_snapshot(snapshot.clone())?;
        self.purge_through(snapshot.get_metadata().index)?;
        Ok(())
    }

    /// Captures a snapshot of the state machine payload at `applied` and
    /// compacts the log behind it.
    pub fn save_snapshot(&mut self, data: Vec<u8>, applied: u64) -> Result<()> {
        let mut snapshot = self.mem.snapshot(applied, 0)?;
        snapshot.set_data(data.into());
        self.persist_snapshot(&snapshot)?;
        let index = snapshot.get_metadata().index;
        self.mem.wl().compact(index)?;
        self.purge_through(index)?;
        Ok(())
    }

    fn purge_through(&mut self, index: u64) -> Result<()> {
        let doomed: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, segment)| segment.last_index().map_or(true, |last| last <= index))
            .map(|(&span, _)| span)
            .collect();
        for span in doomed {
            if let Some(segment) = self.segments.remove(&span) {
                segment.delete().map_err(store_err)?;
            }
        }
        Ok(())
    }
}

impl Storage for DiskStorage {
    fn initial_state(&self) -> Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> Result<Snapshot> {
        // the in-memory mirror drops snapshot payloads, so lagging peers
        // are served from the persisted copy
        let path = self.snapshot_dir.join("snapshot");
        if path.exists() {
            let bytes = fs::read(&path)?;
            let mut snapshot = Snapshot::default();
            snapshot.merge_from_bytes(&bytes).map_err(store_err)?;
            if snapshot.get_metadata().index >= request_index {
                return Ok(snapshot);
            }
        }
        self.mem.snapshot(request_index, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry.set_data(data.to_vec().into());
        entry
    }

    #[test]
    fn creates_the_three_raft_directories() {
        let dir = TempDir::new().unwrap();
        let _storage = DiskStorage::open(dir.path(), &[1]).unwrap();
        assert!(dir.path().join("log").is_dir());
        assert!(dir.path().join("raft_meta").is_dir());
        assert!(dir.path().join("snapshot").is_dir());
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = DiskStorage::open(dir.path(), &[1]).unwrap();
            storage
                .append_entries(&[entry(2, 1, b"two"), entry(3, 1, b"three")])
                .unwrap();
        }
        let storage = DiskStorage::open(dir.path(), &[1]).unwrap();
        assert_eq!(storage.last_index().unwrap(), 3);
        let got = storage
            .entries(2, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(&got[0].data[..], b"two");
        assert_eq!(&got[1].data[..], b"three");
    }

    #[test]
    fn hard_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = DiskStorage::open(dir.path(), &[1]).unwrap();
            let mut hs = HardState::default();
            hs.set_term(5);
            hs.set_vote(1);
            hs.set_commit(1);
            storage.set_hardstate(hs);
        }
        let storage = DiskStorage::open(dir.path(), &[1]).unwrap();
        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state.term, 5);
        assert_eq!(state.hard_state.vote, 1);
    }

    #[test]
    fn conflicting_suffix_is_overwritten() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = DiskStorage::open(dir.path(), &[1]).unwrap();
            storage
                .append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b"), entry(4, 1, b"c")])
                .unwrap();
            storage
                .append_entries(&[entry(3, 2, b"b2"), entry(4, 2, b"c2")])
                .unwrap();
        }
        let storage = DiskStorage::open(dir.path(), &[1]).unwrap();
        let got = storage
            .entries(3, 5, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got[0].term, 2);
        assert_eq!(&got[0].data[..], b"b2");
        assert_eq!(&got[1].data[..], b"c2");
    }

    #[test]
    fn snapshot_compacts_the_log() {
        let dir = TempDir::new().unwrap();
        let mut storage = DiskStorage::open(dir.path(), &[1]).unwrap();
        let entries: Vec<Entry> = (2..=10).map(|i| entry(i, 1, b"x")).collect();
        storage.append_entries(&entries).unwrap();
        storage.set_commit(10);

        storage.save_snapshot(b"tree archive".to_vec(), 10).unwrap();
        assert!(dir.path().join("snapshot/snapshot").is_file());
        assert_eq!(storage.first_index().unwrap(), 11);

        let reopened = DiskStorage::open(dir.path(), &[1]).unwrap();
        let snapshot = reopened.snapshot(0, 0).unwrap();
        assert_eq!(snapshot.get_data(), &b"tree archive"[..]);
        assert_eq!(snapshot.get_metadata().index, 10);
    }
}
