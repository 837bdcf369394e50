// Copyright 2019 Fullstop000 <fullstop1005@gmail.com>.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! Thin abstraction over the filesystem so FL/VL/recorder files and the
//! database's whole-file lock can be exercised against a real directory
//! in production and against an in-memory double in unit tests, the same
//! split `disk_driver` makes between its file and memory backends.

use crate::options::OpenMode;
use crate::util::status::{AcdpError, Result, Status};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A single open data file, addressed by absolute byte offset.
pub trait File: Send + Sync {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    fn truncate(&self, len: u64) -> Result<()>;
    fn sync(&self) -> Result<()>;

    /// Appends `data` to the end of the file and returns the offset it
    /// was written at.
    fn append(&self, data: &[u8]) -> Result<u64> {
        let offset = self.len()?;
        self.write_at(offset, data)?;
        Ok(offset)
    }
}

/// Opens, creates, and removes named files rooted at a database
/// directory. `lock_file` backs the process-level exclusive/shared lock
/// of spec §4.7.
pub trait Storage: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<dyn File>>;
    fn create(&self, path: &Path) -> Result<Arc<dyn File>>;
    fn remove(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Acquires a whole-file advisory lock. `exclusive = false` requests
    /// a shared (write-protected-mode) lock; `true` requests exclusive.
    fn lock(&self, path: &Path, exclusive: bool) -> Result<Box<dyn FileLock>>;

    /// Tells the backend which §4.7 open mode governs idle handle
    /// lifetime for files opened from here on. A no-op for backends with
    /// nothing to pool, such as the in-memory double.
    fn set_open_mode(&self, _mode: OpenMode) {}
}

/// RAII guard for a lock acquired through `Storage::lock`. Dropping it
/// releases the lock; `close()` is the explicit, idempotent release.
pub trait FileLock: Send {
    fn close(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------
// POSIX-backed implementation
// ---------------------------------------------------------------------

/// Backs §4.7's open-mode handle pooling: rather than every `PosixFile`
/// holding a permanently-open `fs::File`, the storage tracks the mode
/// and each file reopens/idle-closes its own handle against it, the way
/// wickdb's `RandomAccessFile` pools leave reopen policy to the caller
/// instead of a shared cache.
pub struct PosixStorage {
    open_mode: Mutex<OpenMode>,
}

impl PosixStorage {
    pub fn new() -> Self {
        PosixStorage {
            open_mode: Mutex::new(OpenMode::KeepAllOpen),
        }
    }

    pub fn with_open_mode(mode: OpenMode) -> Self {
        PosixStorage {
            open_mode: Mutex::new(mode),
        }
    }

    fn current_open_mode(&self) -> OpenMode {
        *self.open_mode.lock().unwrap()
    }
}

impl Default for PosixStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// A lazily-(re)opened handle plus the timestamp of its last use, so
/// `PosixFile::with_handle` can decide whether `open_mode` says to close
/// it again once the caller is done.
struct PosixHandle {
    file: Option<fs::File>,
    last_used: Instant,
}

pub struct PosixFile {
    path: PathBuf,
    open_mode: OpenMode,
    inner: Mutex<PosixHandle>,
}

impl PosixFile {
    fn new(path: PathBuf, open_mode: OpenMode, file: fs::File) -> Self {
        PosixFile {
            path,
            open_mode,
            inner: Mutex::new(PosixHandle {
                file: Some(file),
                last_used: Instant::now(),
            }),
        }
    }

    fn reopen(&self) -> Result<fs::File> {
        Ok(OpenOptions::new().read(true).write(true).open(&self.path)?)
    }

    /// Runs `op` against an open handle, reopening it first if idle
    /// policy (or a prior op) had closed it, then closing it again
    /// immediately if the mode calls for that.
    fn with_handle<T>(&self, op: impl FnOnce(&mut fs::File) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock().map_err(|_| {
            AcdpError::new(Status::Durability, Some("file handle mutex poisoned"))
        })?;
        if let OpenMode::CloseIdleAfterMillis(ms) = self.open_mode {
            if guard.file.is_some() && guard.last_used.elapsed() >= Duration::from_millis(ms) {
                guard.file = None;
            }
        }
        if guard.file.is_none() {
            guard.file = Some(self.reopen()?);
        }
        let result = op(guard.file.as_mut().unwrap());
        guard.last_used = Instant::now();
        if matches!(self.open_mode, OpenMode::CloseIdleAggressively) {
            guard.file = None;
        }
        result
    }
}

impl File for PosixFile {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.with_handle(|f| {
            f.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; len];
            f.read_exact(&mut buf)?;
            Ok(buf)
        })
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.with_handle(|f| {
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(data)?;
            Ok(())
        })
    }

    fn len(&self) -> Result<u64> {
        self.with_handle(|f| Ok(f.metadata()?.len()))
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.with_handle(|f| {
            f.set_len(len)?;
            Ok(())
        })
    }

    fn sync(&self) -> Result<()> {
        self.with_handle(|f| {
            f.sync_all()?;
            Ok(())
        })
    }
}

impl Storage for PosixStorage {
    fn open(&self, path: &Path) -> Result<Arc<dyn File>> {
        let f = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Arc::new(PosixFile::new(
            path.to_path_buf(),
            self.current_open_mode(),
            f,
        )))
    }

    fn create(&self, path: &Path) -> Result<Arc<dyn File>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Arc::new(PosixFile::new(
            path.to_path_buf(),
            self.current_open_mode(),
            f,
        )))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn set_open_mode(&self, mode: OpenMode) {
        *self.open_mode.lock().unwrap() = mode;
    }

    fn lock(&self, path: &Path, exclusive: bool) -> Result<Box<dyn FileLock>> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH } | libc::LOCK_NB;
            let rc = unsafe { libc::flock(f.as_raw_fd(), op) };
            if rc != 0 {
                return Err(AcdpError::new(
                    Status::Durability,
                    Some("could not acquire whole-database file lock"),
                ));
            }
        }
        Ok(Box::new(PosixFileLock { file: Some(f) }))
    }
}

struct PosixFileLock {
    file: Option<fs::File>,
}

impl FileLock for PosixFileLock {
    fn close(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(f) = self.file.take() {
                use std::os::unix::io::AsRawFd;
                unsafe { libc::flock(f.as_raw_fd(), libc::LOCK_UN) };
            }
        }
        #[cfg(not(unix))]
        {
            self.file = None;
        }
        Ok(())
    }
}

impl Drop for PosixFileLock {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ---------------------------------------------------------------------
// In-memory implementation, for unit tests that don't need real files.
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct MemStorage {
    files: Mutex<HashMap<PathBuf, Arc<MemFile>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl File for MemFile {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let guard = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + len > guard.len() {
            return Err(AcdpError::new(
                Status::Corruption,
                Some("read past end of in-memory file"),
            ));
        }
        Ok(guard[offset..offset + len].to_vec())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + data.len() > guard.len() {
            guard.resize(offset + data.len(), 0);
        }
        guard[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.data.lock().unwrap().resize(len as usize, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

struct MemFileLock;
impl FileLock for MemFileLock {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Storage for MemStorage {
    fn open(&self, path: &Path) -> Result<Arc<dyn File>> {
        let mut guard = self.files.lock().unwrap();
        let f = guard
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(MemFile::default()))
            .clone();
        Ok(f as Arc<dyn File>)
    }

    fn create(&self, path: &Path) -> Result<Arc<dyn File>> {
        self.open(path)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut guard = self.files.lock().unwrap();
        if let Some(f) = guard.remove(from) {
            guard.insert(to.to_path_buf(), f);
        }
        Ok(())
    }

    fn lock(&self, _path: &Path, _exclusive: bool) -> Result<Box<dyn FileLock>> {
        Ok(Box::new(MemFileLock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn mem_storage_read_write_round_trip() {
        let storage = MemStorage::new();
        let path = PathBuf::from("t.fl");
        let f = storage.create(&path).unwrap();
        f.write_at(0, b"hello world").unwrap();
        assert_eq!(f.read_at(0, 5).unwrap(), b"hello");
        assert_eq!(f.len().unwrap(), 11);
    }

    #[test]
    fn mem_storage_write_past_end_grows_file() {
        let storage = MemStorage::new();
        let path = PathBuf::from("t.vl");
        let f = storage.create(&path).unwrap();
        f.write_at(10, b"x").unwrap();
        assert_eq!(f.len().unwrap(), 11);
    }

    #[test]
    fn posix_storage_survives_aggressive_idle_close() {
        let dir = std::env::temp_dir().join(format!("acdp-storage-test-{:?}", thread::current().id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.fl");
        let storage = PosixStorage::new();
        storage.set_open_mode(OpenMode::CloseIdleAggressively);
        let f = storage.create(&path).unwrap();
        f.write_at(0, b"hello").unwrap();
        // The handle was closed after the write above; a read must
        // transparently reopen it rather than seeing a stale File.
        assert_eq!(f.read_at(0, 5).unwrap(), b"hello");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn posix_storage_reopens_after_close_idle_millis_elapses() {
        let dir = std::env::temp_dir().join(format!("acdp-storage-test2-{:?}", thread::current().id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.fl");
        let storage = PosixStorage::with_open_mode(OpenMode::CloseIdleAfterMillis(10));
        let f = storage.create(&path).unwrap();
        f.write_at(0, b"hello").unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(f.read_at(0, 5).unwrap(), b"hello");
        let _ = fs::remove_dir_all(&dir);
    }
}
