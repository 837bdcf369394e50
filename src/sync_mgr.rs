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

//! Synchronisation manager (§4.4): the single coordination point between
//! writers (units), kamikaze writers, and read zones. Built the way
//! wickdb guards its shared mutable state — a `Mutex` protecting plain
//! data plus a `Condvar` for the threads waiting on it — rather than a
//! channel or an async primitive, since every caller here is a plain OS
//! thread blocking on disk I/O anyway.
//!
//! | class | excludes | admits |
//! |---|---|---|
//! | writer-in-unit | other writers, read zones | nested units, same thread |
//! | kamikaze writer | other writers, read zones | none |
//! | read zone | writers | other/nested read zones |
//!
//! Service-level operations (§4.4's L0-L3 classes) are not modeled as a
//! distinct primitive here: `compactVL`/`compactFL`/`forceWrite` acquire
//! a writer slot like any other exclusive operation, and zip-backup
//! (out of scope, per spec §1's RO-path exclusion) would acquire a read
//! zone. This collapses the six-row table into the three primitives
//! that the in-scope operations actually need.

use crate::util::status::{AcdpError, Result, Status};
use log::{trace, warn};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

struct State {
    writer_thread: Option<ThreadId>,
    writer_depth: u32,
    kamikaze_active: bool,
    read_zone_threads: HashMap<ThreadId, u32>,
    shutdown: bool,
}

impl State {
    fn writer_admissible(&self) -> bool {
        self.writer_thread.is_none() && !self.kamikaze_active && self.read_zone_threads.is_empty()
    }
}

pub struct SyncManager {
    state: Mutex<State>,
    cond: Condvar,
}

impl SyncManager {
    pub fn new() -> Self {
        SyncManager {
            state: Mutex::new(State {
                writer_thread: None,
                writer_depth: 0,
                kamikaze_active: false,
                read_zone_threads: HashMap::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn shutdown_err() -> AcdpError {
        warn!("sync_mgr: rejecting an acquisition, already shut down");
        AcdpError::new(Status::Concurrency, Some("sync manager is shut down"))
    }

    /// Acquires the writer slot for the current thread: blocks until no
    /// other writer, kamikaze writer, or read zone is active. Reentrant
    /// within the same thread (a nested `Unit::begin_nested` acquires
    /// again and `Unit::close` releases once per acquisition).
    pub fn acquire_writer(&self) -> Result<()> {
        let this = thread::current().id();
        let mut guard = self.state.lock().unwrap();
        if guard.shutdown {
            return Err(Self::shutdown_err());
        }
        if guard.writer_thread == Some(this) {
            guard.writer_depth += 1;
            return Ok(());
        }
        if guard.read_zone_threads.contains_key(&this) {
            return Err(AcdpError::new(
                Status::Concurrency,
                Some("cannot start a writer while the current thread holds a read zone"),
            ));
        }
        loop {
            if guard.shutdown {
                return Err(Self::shutdown_err());
            }
            if guard.writer_admissible() {
                guard.writer_thread = Some(this);
                guard.writer_depth = 1;
                trace!("sync_mgr: writer acquired by {:?}", this);
                return Ok(());
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Releases one level of writer acquisition for the current thread.
    pub fn release_writer(&self) {
        let this = thread::current().id();
        let mut guard = self.state.lock().unwrap();
        debug_assert_eq!(guard.writer_thread, Some(this));
        if guard.writer_depth > 0 {
            guard.writer_depth -= 1;
        }
        if guard.writer_depth == 0 {
            guard.writer_thread = None;
            trace!("sync_mgr: writer released by {:?}", this);
            self.cond.notify_all();
        }
    }

    /// Acquires a kamikaze write: excludes other writers, read zones,
    /// and other kamikaze writers. Non-reentrant — a thread already
    /// inside a unit has no business also taking a kamikaze write.
    pub fn acquire_kamikaze(&self) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        loop {
            if guard.shutdown {
                return Err(Self::shutdown_err());
            }
            if guard.writer_admissible() {
                guard.kamikaze_active = true;
                trace!("sync_mgr: kamikaze write acquired");
                return Ok(());
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }

    pub fn release_kamikaze(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.kamikaze_active = false;
        trace!("sync_mgr: kamikaze write released");
        self.cond.notify_all();
    }

    /// Acquires a read zone for the current thread: blocks until no
    /// writer or kamikaze writer is active, then admits. Reentrant and
    /// shared — other threads' read zones, and nested read zones on the
    /// same thread (including one opened while that thread already
    /// holds a unit), are all admitted concurrently.
    pub fn acquire_read_zone(&self) -> Result<()> {
        let this = thread::current().id();
        let mut guard = self.state.lock().unwrap();
        loop {
            if guard.shutdown {
                return Err(Self::shutdown_err());
            }
            let blocked_by_other_writer =
                guard.writer_thread.is_some() && guard.writer_thread != Some(this);
            if !blocked_by_other_writer && !guard.kamikaze_active {
                *guard.read_zone_threads.entry(this).or_insert(0) += 1;
                trace!("sync_mgr: read zone acquired by {:?}", this);
                return Ok(());
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }

    pub fn release_read_zone(&self) {
        let this = thread::current().id();
        let mut guard = self.state.lock().unwrap();
        if let Some(count) = guard.read_zone_threads.get_mut(&this) {
            *count -= 1;
            if *count == 0 {
                guard.read_zone_threads.remove(&this);
                trace!("sync_mgr: read zone released by {:?}", this);
            }
        }
        self.cond.notify_all();
    }

    /// Transitions to the rejecting state: every further acquisition
    /// (writer, kamikaze, read zone) fails immediately, including ones
    /// already blocked and waiting.
    pub fn shutdown(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.shutdown = true;
        self.cond.notify_all();
    }
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a read zone, released on drop; used by
/// `TableStore::iterator` callers per spec §4.6's "wrap the iteration in
/// a read zone" guidance.
pub struct ReadZoneGuard<'a> {
    sync: &'a SyncManager,
}

impl<'a> ReadZoneGuard<'a> {
    pub fn acquire(sync: &'a SyncManager) -> Result<Self> {
        sync.acquire_read_zone()?;
        Ok(ReadZoneGuard { sync })
    }
}

impl Drop for ReadZoneGuard<'_> {
    fn drop(&mut self) {
        self.sync.release_read_zone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn writer_is_reentrant_on_same_thread() {
        let sync = SyncManager::new();
        sync.acquire_writer().unwrap();
        sync.acquire_writer().unwrap();
        sync.release_writer();
        sync.release_writer();
    }

    #[test]
    fn writer_inside_read_zone_is_rejected() {
        let sync = SyncManager::new();
        sync.acquire_read_zone().unwrap();
        let err = sync.acquire_writer().unwrap_err();
        assert_eq!(err.status(), Status::Concurrency);
        sync.release_read_zone();
    }

    #[test]
    fn read_zone_nests_on_same_thread() {
        let sync = SyncManager::new();
        sync.acquire_read_zone().unwrap();
        sync.acquire_read_zone().unwrap();
        sync.release_read_zone();
        sync.release_read_zone();
    }

    #[test]
    fn shutdown_rejects_all_new_acquisitions() {
        let sync = SyncManager::new();
        sync.shutdown();
        assert!(sync.acquire_writer().is_err());
        assert!(sync.acquire_kamikaze().is_err());
        assert!(sync.acquire_read_zone().is_err());
    }

    #[test]
    fn writer_blocks_until_read_zone_releases() {
        let sync = Arc::new(SyncManager::new());
        sync.acquire_read_zone().unwrap();
        let sync2 = sync.clone();
        let handle = thread::spawn(move || {
            sync2.acquire_writer().unwrap();
            sync2.release_writer();
        });
        thread::sleep(Duration::from_millis(20));
        sync.release_read_zone();
        handle.join().unwrap();
    }
}
