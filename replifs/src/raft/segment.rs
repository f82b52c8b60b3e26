use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// frame layout: [index:u64 le][len:u32 le][bytes]
const FRAME_HEADER_LEN: u64 = 12;

/// One append-only log file holding a contiguous run of entries. Entry
/// positions are indexed in memory and rebuilt by scanning on open; a
/// trailing partial frame from a crash is dropped at that point.
pub struct LogSegment {
    file: File,
    path: PathBuf,
    offsets: BTreeMap<u64, u64>,
}

impl LogSegment {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<LogSegment> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut segment = LogSegment {
            file,
            path: path.as_ref().to_path_buf(),
            offsets: BTreeMap::new(),
        };
        segment.index_entries()?;
        Ok(segment)
    }

    fn index_entries(&mut self) -> io::Result<()> {
        self.offsets.clear();
        let len = self.file.metadata()?.len();
        let mut pos = 0u64;
        while pos + FRAME_HEADER_LEN <= len {
            self.file.seek(SeekFrom::Start(pos))?;
            let mut header = [0u8; FRAME_HEADER_LEN as usize];
            self.file.read_exact(&mut header)?;
            let index = u64::from_le_bytes(header[..8].try_into().expect("8 bytes"));
            let frame_len = u64::from(u32::from_le_bytes(header[8..].try_into().expect("4 bytes")));
            if pos + FRAME_HEADER_LEN + frame_len > len {
                // incomplete tail write, discard it
                self.file.set_len(pos)?;
                break;
            }
            self.offsets.insert(index, pos);
            pos += FRAME_HEADER_LEN + frame_len;
        }
        Ok(())
    }

    pub fn first_index(&self) -> Option<u64> {
        self.offsets.keys().next().copied()
    }

    pub fn last_index(&self) -> Option<u64> {
        self.offsets.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Appends one entry. Indexes must arrive in ascending order without
    /// gaps; conflicting suffixes are removed with [`truncate_from`] first.
    pub fn append(&mut self, index: u64, data: &[u8]) -> io::Result<()> {
        if let Some(last) = self.last_index() {
            if index != last + 1 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("non-contiguous append: {index} after {last}"),
                ));
            }
        }
        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + data.len());
        frame.extend_from_slice(&index.to_le_bytes());
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(data);
        self.file.write_all(&frame)?;
        // entries must hit disk before the node acknowledges them
        self.file.sync_data()?;
        self.offsets.insert(index, pos);
        Ok(())
    }

    pub fn read(&mut self, index: u64) -> io::Result<Vec<u8>> {
        let pos = *self.offsets.get(&index).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("entry {index} not in segment"),
            )
        })?;
        self.file.seek(SeekFrom::Start(pos))?;
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        self.file.read_exact(&mut header)?;
        let len = u32::from_le_bytes(header[8..].try_into().expect("4 bytes")) as usize;
        let mut data = vec![0u8; len];
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Drops `index` and everything after it.
    pub fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        if let Some(&pos) = self.offsets.get(&index) {
            self.file.set_len(pos)?;
            self.offsets.split_off(&index);
        }
        Ok(())
    }

    /// Removes the backing file.
    pub fn delete(self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn segment_path(dir: &TempDir) -> PathBuf {
        dir.path().join("segment_0.log")
    }

    #[test]
    fn fresh_segment_is_empty() {
        let dir = TempDir::new().unwrap();
        let segment = LogSegment::open(segment_path(&dir)).unwrap();
        assert!(segment.is_empty());
        assert_eq!(segment.first_index(), None);
    }

    #[test]
    fn append_then_read_back() {
        let dir = TempDir::new().unwrap();
        let mut segment = LogSegment::open(segment_path(&dir)).unwrap();
        segment.append(5, b"first entry").unwrap();
        segment.append(6, b"second entry").unwrap();

        assert_eq!(segment.first_index(), Some(5));
        assert_eq!(segment.last_index(), Some(6));
        assert_eq!(segment.read(5).unwrap(), b"first entry");
        assert_eq!(segment.read(6).unwrap(), b"second entry");
        assert!(segment.read(7).is_err());
    }

    #[test]
    fn rejects_gapped_appends() {
        let dir = TempDir::new().unwrap();
        let mut segment = LogSegment::open(segment_path(&dir)).unwrap();
        segment.append(1, b"one").unwrap();
        assert!(segment.append(3, b"three").is_err());
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut segment = LogSegment::open(segment_path(&dir)).unwrap();
            segment.append(1, b"one").unwrap();
            segment.append(2, b"two").unwrap();
        }
        let mut segment = LogSegment::open(segment_path(&dir)).unwrap();
        assert_eq!(segment.last_index(), Some(2));
        assert_eq!(segment.read(1).unwrap(), b"one");
        assert_eq!(segment.read(2).unwrap(), b"two");
    }

    #[test]
    fn truncate_drops_the_suffix() {
        let dir = TempDir::new().unwrap();
        let mut segment = LogSegment::open(segment_path(&dir)).unwrap();
        segment.append(1, b"one").unwrap();
        segment.append(2, b"two").unwrap();
        segment.append(3, b"three").unwrap();

        segment.truncate_from(2).unwrap();
        assert_eq!(segment.last_index(), Some(1));
        assert_eq!(segment.read(1).unwrap(), b"one");
        assert!(segment.read(2).is_err());

        segment.append(2, b"two again").unwrap();
        assert_eq!(segment.read(2).unwrap(), b"two again");
    }

    #[test]
    fn discards_torn_tail_on_open() {
        let dir = TempDir::new().unwrap();
        let path = segment_path(&dir);
        {
            let mut segment = LogSegment::open(&path).unwrap();
            segment.append(1, b"whole").unwrap();
        }
        // simulate a crash mid-frame
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&2u64.to_le_bytes()).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);

        let mut segment = LogSegment::open(&path).unwrap();
        assert_eq!(segment.last_index(), Some(1));
        assert_eq!(segment.read(1).unwrap(), b"whole");
    }
}
