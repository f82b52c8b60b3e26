//! Local storage engine.
//!
//! The deterministic executor behind the replicated log: every replica runs
//! the same mutations against its data root and must end up with the same
//! tree. Creates and deletes are idempotent so the log can replay them, and
//! every content write reaches disk before the operation reports success.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::command::MAX_MESSAGE_SIZE;
use crate::error::FsError;
use crate::path;

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

/// Metadata returned by [`LocalStorage::stat`].
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
    pub mtime: u64,
}

/// On-disk executor rooted at the replica's data directory. All paths are
/// logical paths relative to that root.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> LocalStorage {
        LocalStorage {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensures the data root exists and is a directory.
    pub fn init(&self) -> Result<(), FsError> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => {
                log::info!("storage initialized at existing directory {}", self.root.display());
                Ok(())
            }
            Ok(_) => Err(FsError::NotDirectory(self.root.display().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                DirBuilder::new()
                    .recursive(true)
                    .mode(DIR_MODE)
                    .create(&self.root)?;
                log::info!("storage initialized at new directory {}", self.root.display());
                Ok(())
            }
            Err(e) => Err(FsError::Io(e)),
        }
    }

    fn resolve(&self, logical: &str) -> Result<PathBuf, FsError> {
        let clean = path::validate(logical)?;
        if clean.is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(clean))
        }
    }

    pub fn create_file(&self, logical: &str) -> Result<(), FsError> {
        let full = self.resolve(logical)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(FILE_MODE)
            .open(&full)
        {
            Ok(_) => {
                log::debug!("created file {logical}");
                Ok(())
            }
            // replaying the log must not fail on an existing target
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(FsError::from_io(logical, e)),
        }
    }

    pub fn create_directory(&self, logical: &str) -> Result<(), FsError> {
        let full = self.resolve(logical)?;
        match DirBuilder::new().mode(DIR_MODE).create(&full) {
            Ok(()) => {
                log::debug!("created directory {logical}");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(FsError::from_io(logical, e)),
        }
    }

    pub fn write_file(&self, logical: &str, data: &[u8]) -> Result<(), FsError> {
        let full = self.resolve(logical)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&full)
            .map_err(|e| FsError::from_io(logical, e))?;
        file.write_all(data)?;
        file.sync_all()?;
        log::debug!("wrote {} bytes to {logical}", data.len());
        Ok(())
    }

    pub fn append_file(&self, logical: &str, data: &[u8]) -> Result<(), FsError> {
        let full = self.resolve(logical)?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(FILE_MODE)
            .open(&full)
            .map_err(|e| FsError::from_io(logical, e))?;
        file.write_all(data)?;
        file.sync_all()?;
        log::debug!("appended {} bytes to {logical}", data.len());
        Ok(())
    }

    pub fn delete_file(&self, logical: &str) -> Result<(), FsError> {
        let full = self.resolve(logical)?;
        match fs::remove_file(&full) {
            Ok(()) => {
                log::debug!("deleted file {logical}");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::from_io(logical, e)),
        }
    }

    /// Deletes an empty directory. A populated directory is an error; the
    /// replicated engine never deletes recursively.
    pub fn delete_directory(&self, logical: &str) -> Result<(), FsError> {
        let full = self.resolve(logical)?;
        match fs::remove_dir(&full) {
            Ok(()) => {
                log::debug!("deleted directory {logical}");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::from_io(logical, e)),
        }
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        let full_old = self.resolve(old)?;
        let full_new = self.resolve(new)?;
        fs::rename(&full_old, &full_new).map_err(|e| FsError::from_io(old, e))?;
        log::debug!("renamed {old} to {new}");
        Ok(())
    }

    pub fn read_file(&self, logical: &str) -> Result<Vec<u8>, FsError> {
        let full = self.resolve(logical)?;
        let mut file = File::open(&full).map_err(|e| FsError::from_io(logical, e))?;
        let meta = file.metadata()?;
        if meta.len() > MAX_MESSAGE_SIZE as u64 {
            return Err(FsError::TooLarge(format!(
                "{logical} is {} bytes",
                meta.len()
            )));
        }
        let mut contents = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut contents)?;
        log::debug!("read {} bytes from {logical}", contents.len());
        Ok(contents)
    }

    /// Lists entry names, excluding `.` and `..`. Order is unspecified.
    pub fn list_directory(&self, logical: &str) -> Result<Vec<String>, FsError> {
        let full = self.resolve(logical)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&full).map_err(|e| FsError::from_io(logical, e))? {
            let entry = entry?;
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(entries)
    }

    pub fn stat(&self, logical: &str) -> Result<FileInfo, FsError> {
        let clean = path::validate(logical)?;
        let full = if clean.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&clean)
        };
        let meta = fs::metadata(&full).map_err(|e| FsError::from_io(logical, e))?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Ok(FileInfo {
            name: clean.rsplit('/').next().unwrap_or("").to_string(),
            size: meta.len(),
            is_directory: meta.is_dir(),
            mtime,
        })
    }

    pub fn exists(&self, logical: &str) -> Result<bool, FsError> {
        let full = self.resolve(logical)?;
        Ok(full.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (TempDir, LocalStorage) {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().join("root"));
        storage.init().unwrap();
        (dir, storage)
    }

    #[test]
    fn init_rejects_file_at_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::write(&root, b"not a directory").unwrap();
        let storage = LocalStorage::new(&root);
        assert!(matches!(storage.init(), Err(FsError::NotDirectory(_))));
    }

    #[test]
    fn create_file_is_idempotent() {
        let (_dir, storage) = engine();
        storage.create_file("a.txt").unwrap();
        storage.create_file("a.txt").unwrap();
        assert!(storage.exists("a.txt").unwrap());
    }

    #[test]
    fn create_directory_is_idempotent() {
        let (_dir, storage) = engine();
        storage.create_directory("d").unwrap();
        storage.create_directory("d").unwrap();
        assert!(storage.stat("d").unwrap().is_directory);
    }

    #[test]
    fn delete_file_is_idempotent() {
        let (_dir, storage) = engine();
        storage.create_file("a.txt").unwrap();
        storage.delete_file("a.txt").unwrap();
        storage.delete_file("a.txt").unwrap();
        assert!(!storage.exists("a.txt").unwrap());
    }

    #[test]
    fn delete_directory_rejects_populated_directories() {
        let (_dir, storage) = engine();
        storage.create_directory("d").unwrap();
        storage.create_file("d/a.txt").unwrap();
        assert!(matches!(
            storage.delete_directory("d"),
            Err(FsError::NotEmpty(_))
        ));
        storage.delete_file("d/a.txt").unwrap();
        storage.delete_directory("d").unwrap();
        storage.delete_directory("d").unwrap();
    }

    #[test]
    fn write_replaces_and_append_extends() {
        let (_dir, storage) = engine();
        storage.write_file("k", b"v1").unwrap();
        assert_eq!(storage.read_file("k").unwrap(), b"v1");
        storage.write_file("k", b"v2").unwrap();
        assert_eq!(storage.read_file("k").unwrap(), b"v2");
        storage.append_file("k", b"+more").unwrap();
        assert_eq!(storage.read_file("k").unwrap(), b"v2+more");
    }

    #[test]
    fn append_creates_missing_files() {
        let (_dir, storage) = engine();
        storage.append_file("fresh.log", b"line\n").unwrap();
        assert_eq!(storage.read_file("fresh.log").unwrap(), b"line\n");
    }

    #[test]
    fn rename_moves_contents() {
        let (_dir, storage) = engine();
        storage.write_file("old", b"data").unwrap();
        storage.rename("old", "new").unwrap();
        assert!(matches!(
            storage.read_file("old"),
            Err(FsError::NotFound(_))
        ));
        assert_eq!(storage.read_file("new").unwrap(), b"data");
    }

    #[test]
    fn rename_of_missing_source_is_not_found() {
        let (_dir, storage) = engine();
        assert!(matches!(
            storage.rename("ghost", "new"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn list_excludes_dot_entries() {
        let (_dir, storage) = engine();
        storage.create_directory("d").unwrap();
        storage.create_file("d/a").unwrap();
        storage.create_file("d/b").unwrap();
        let mut entries = storage.list_directory("d").unwrap();
        entries.sort();
        assert_eq!(entries, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn traversal_is_rejected_without_touching_disk() {
        let (dir, storage) = engine();
        fs::write(dir.path().join("outside"), b"secret").unwrap();
        for op in [
            storage.create_file("../outside2"),
            storage.write_file("../outside", b"clobber").map(|_| ()),
            storage.delete_file("../outside"),
            storage.read_file("../outside").map(|_| ()),
            storage.list_directory("..").map(|_| ()),
        ] {
            assert!(matches!(op, Err(FsError::InvalidPath(_))));
        }
        assert_eq!(fs::read(dir.path().join("outside")).unwrap(), b"secret");
        assert!(!dir.path().join("outside2").exists());
    }

    #[test]
    fn stat_reports_size_and_kind() {
        let (_dir, storage) = engine();
        storage.write_file("d1", b"12345").unwrap();
        let info = storage.stat("d1").unwrap();
        assert_eq!(info.name, "d1");
        assert_eq!(info.size, 5);
        assert!(!info.is_directory);
        assert!(matches!(storage.stat("ghost"), Err(FsError::NotFound(_))));
    }
}
