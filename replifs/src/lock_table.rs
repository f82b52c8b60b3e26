//! Per-path reader/writer locks.
//!
//! Serializes overlapping requests touching the same logical path on this
//! replica: readers share, a writer excludes everyone. Cluster-wide ordering
//! comes from the log, not from here. Entries are dropped once idle so the
//! table stays bounded by the number of in-flight operations.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct PathState {
    readers: u32,
    writer: bool,
}

#[derive(Default)]
pub struct LockTable {
    paths: Mutex<HashMap<String, PathState>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> LockTable {
        LockTable::default()
    }

    /// Blocks while a writer holds `path`.
    pub fn read(&self, path: &str) -> ReadGuard<'_> {
        let mut paths = self.paths.lock().unwrap();
        loop {
            let state = paths.entry(path.to_string()).or_default();
            if !state.writer {
                state.readers += 1;
                break;
            }
            paths = self.released.wait(paths).unwrap();
        }
        ReadGuard {
            table: self,
            path: path.to_string(),
        }
    }

    /// Blocks while any reader or writer holds `path`.
    pub fn write(&self, path: &str) -> WriteGuard<'_> {
        let mut paths = self.paths.lock().unwrap();
        loop {
            let state = paths.entry(path.to_string()).or_default();
            if !state.writer && state.readers == 0 {
                state.writer = true;
                break;
            }
            paths = self.released.wait(paths).unwrap();
        }
        WriteGuard {
            table: self,
            path: path.to_string(),
        }
    }

    /// Write-locks both paths of a two-path operation. Acquisition is
    /// ordered lexicographically so concurrent pair locks cannot deadlock.
    pub fn write_pair<'a>(&'a self, a: &str, b: &str) -> (WriteGuard<'a>, Option<WriteGuard<'a>>) {
        if a == b {
            return (self.write(a), None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first_guard = self.write(first);
        let second_guard = self.write(second);
        (first_guard, Some(second_guard))
    }

    fn release_read(&self, path: &str) {
        let mut paths = self.paths.lock().unwrap();
        if let Some(state) = paths.get_mut(path) {
            state.readers -= 1;
            if state.readers == 0 && !state.writer {
                paths.remove(path);
            }
        }
        drop(paths);
        self.released.notify_all();
    }

    fn release_write(&self, path: &str) {
        let mut paths = self.paths.lock().unwrap();
        paths.remove(path);
        drop(paths);
        self.released.notify_all();
    }

    #[cfg(test)]
    fn live_paths(&self) -> usize {
        self.paths.lock().unwrap().len()
    }
}

/// Shared hold on one path; released on drop.
pub struct ReadGuard<'a> {
    table: &'a LockTable,
    path: String,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.table.release_read(&self.path);
    }
}

/// Exclusive hold on one path; released on drop.
pub struct WriteGuard<'a> {
    table: &'a LockTable,
    path: String,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.table.release_write(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_a_path() {
        let table = LockTable::new();
        let r1 = table.read("a");
        let r2 = table.read("a");
        drop(r1);
        drop(r2);
        assert_eq!(table.live_paths(), 0);
    }

    #[test]
    fn writer_excludes_readers() {
        let table = Arc::new(LockTable::new());
        let guard = table.write("a");
        let (tx, rx) = mpsc::channel();

        let worker = {
            let table = table.clone();
            thread::spawn(move || {
                let _read = table.read("a");
                tx.send(()).unwrap();
            })
        };

        // the reader cannot get through while the writer is live
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        worker.join().unwrap();
    }

    #[test]
    fn readers_block_writers() {
        let table = Arc::new(LockTable::new());
        let read = table.read("a");
        let (tx, rx) = mpsc::channel();

        let worker = {
            let table = table.clone();
            thread::spawn(move || {
                let _write = table.write("a");
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(read);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        worker.join().unwrap();
    }

    #[test]
    fn distinct_paths_do_not_interfere() {
        let table = LockTable::new();
        let _w1 = table.write("a");
        let _w2 = table.write("b");
        let _r = table.read("c");
    }

    #[test]
    fn pair_lock_orders_and_deduplicates() {
        let table = Arc::new(LockTable::new());
        {
            let (_g, extra) = table.write_pair("same", "same");
            assert!(extra.is_none());
        }
        assert_eq!(table.live_paths(), 0);

        // opposing acquisition orders on the same pair must not deadlock
        let mut workers = Vec::new();
        for flip in [false, true] {
            let table = table.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..100 {
                    let (a, b) = if flip { ("x", "y") } else { ("y", "x") };
                    let _guards = table.write_pair(a, b);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(table.live_paths(), 0);
    }

    #[test]
    fn table_shrinks_when_idle() {
        let table = LockTable::new();
        {
            let _r = table.read("a");
            let _w = table.write("b");
            assert_eq!(table.live_paths(), 2);
        }
        assert_eq!(table.live_paths(), 0);
    }
}
