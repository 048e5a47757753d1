//! Random-access file cache for a single URL.
//!
//! One instance maps to exactly one file on disk. Reads and writes share a
//! single handle and are mutually exclusive; distinct instances operate
//! independently. Closing is idempotent: afterwards reads return empty and
//! writes are no-ops.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::key::cache_file_name;

pub struct FileCache {
    url: String,
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileCache {
    /// Open (or create) the cache file for `url` under `cache_dir`.
    pub fn open(url: &str, cache_dir: &Path) -> io::Result<Self> {
        let path = cache_dir.join(cache_file_name(url));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        debug!(url = %url, path = %path.display(), "opened cache file");
        Ok(Self {
            url: url.to_owned(),
            path,
            file: Mutex::new(Some(file)),
        })
    }

    /// Write `data` at `position`, extending the file sparsely when the
    /// position lies beyond the current end. No-op once closed.
    pub fn write(&self, data: &[u8], position: u64) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap();
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        file.seek(SeekFrom::Start(position))?;
        file.write_all(data)
    }

    /// Read up to `len` bytes from `position`. The buffer is truncated at
    /// end-of-file, never padded. Empty once closed.
    pub fn read(&self, position: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut guard = self.file.lock().unwrap();
        let Some(file) = guard.as_mut() else {
            return Ok(Vec::new());
        };
        file.seek(SeekFrom::Start(position))?;
        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let read = file.read(&mut buffer[filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Reset the file to zero length, keeping the handle usable.
    pub fn truncate(&self) -> io::Result<()> {
        let guard = self.file.lock().unwrap();
        let Some(file) = guard.as_ref() else {
            return Ok(());
        };
        file.set_len(0)
    }

    /// Close the handle and remove the file from disk.
    pub fn discard(&self) -> io::Result<()> {
        self.close();
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Idempotent close. Subsequent reads return empty, writes are no-ops.
    pub fn close(&self) {
        let mut guard = self.file.lock().unwrap();
        *guard = None;
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Current on-disk size, 0 when the file is gone.
    pub fn length(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn cache_file(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> FileCache {
        FileCache::open("http://example.com/v.mp4", dir.path()).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.write(b"hello world", 0).unwrap();
        assert_eq!(cache.read(0, 5).unwrap(), b"hello");
        assert_eq!(cache.read(6, 5).unwrap(), b"world");
        assert_eq!(cache.length(), 11);
    }

    #[test]
    fn short_read_truncates_at_eof() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.write(b"abc", 0).unwrap();
        assert_eq!(cache.read(1, 100).unwrap(), b"bc");
        assert!(cache.read(3, 100).unwrap().is_empty());
    }

    #[test]
    fn sparse_write_extends_file() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.write(b"xy", 100).unwrap();
        assert_eq!(cache.length(), 102);
        assert_eq!(cache.read(100, 2).unwrap(), b"xy");
        assert_eq!(cache.read(0, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn close_is_idempotent_and_silences_io() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.write(b"data", 0).unwrap();
        cache.close();
        cache.close();
        assert!(cache.read(0, 4).unwrap().is_empty());
        cache.write(b"more", 4).unwrap();
        assert_eq!(cache.length(), 4);
    }

    #[test]
    fn truncate_resets_length() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.write(b"0123456789", 0).unwrap();
        cache.truncate().unwrap();
        assert_eq!(cache.length(), 0);
        cache.write(b"ab", 0).unwrap();
        assert_eq!(cache.read(0, 2).unwrap(), b"ab");
    }

    #[test]
    fn discard_removes_the_file() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.write(b"data", 0).unwrap();
        assert!(cache.exists());
        cache.discard().unwrap();
        assert!(!cache.exists());
        assert_eq!(cache.length(), 0);
    }
}
