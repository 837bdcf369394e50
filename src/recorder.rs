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

//! Before-image log (§4.3): every mutation FL/VL space managers make
//! while inside a unit is journaled here before it hits the data file,
//! so an uncommitted unit can be rolled back by replaying these
//! pre-images in reverse.
//!
//! The in-memory side of the journal (`units`, keyed by unit id) is the
//! source of truth for same-process rollback; the on-disk file exists
//! for crash recovery only (`recover`). Because `FlSpace`/`VlSpace`
//! rebuild their gap list and free-block index from a full file scan on
//! `open`/`rebuild`, rollback never needs to special-case those
//! in-memory structures: writing pre-image bytes back and rescanning is
//! sufficient and is the same code path whether rolling back in-process
//! or recovering after a crash. See DESIGN.md.

use crate::storage::File;
use crate::util::status::{AcdpError, Result, Status};
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum FileKind {
    Fl,
    Vl,
}

impl FileKind {
    fn tag(self) -> u8 {
        match self {
            FileKind::Fl => 0,
            FileKind::Vl => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(FileKind::Fl),
            1 => Ok(FileKind::Vl),
            _ => Err(AcdpError::new(Status::Corruption, Some("unknown file kind tag in recorder record"))),
        }
    }
}

/// What a record undoes: either a byte range that existed before and is
/// restored verbatim, or a file-growth event undone by truncation.
#[derive(Clone, Debug)]
pub enum RecordOp {
    Overwrite { before: Vec<u8> },
    Grow { old_len: u64 },
}

#[derive(Clone, Debug)]
pub struct Record {
    pub unit_id: u64,
    pub table_id: u32,
    pub kind: FileKind,
    pub offset: u64,
    pub op: RecordOp,
}

/// Implemented by whatever write scope is mutating FL/VL space: a real
/// `Unit` journals through the recorder, the kamikaze path discards the
/// pre-image entirely (§4.5: kamikaze writes never enter the recorder).
pub trait RecordSink {
    fn record(&self, kind: FileKind, table_id: u32, offset: u64, op: RecordOp) -> Result<()>;
}

/// The sink used for writes made outside any unit, and for low-level FSM
/// tests that don't exercise rollback.
pub struct NoRecordSink;

impl RecordSink for NoRecordSink {
    fn record(&self, _kind: FileKind, _table_id: u32, _offset: u64, _op: RecordOp) -> Result<()> {
        Ok(())
    }
}

struct UnitJournal {
    parent: Option<u64>,
    /// Unconfirmed-in-this-unit writes: member writes since the last
    /// `commit_unit`, plus any nested unit's committed-but-unpromoted
    /// writes appended at that nested unit's close.
    pending: Vec<Record>,
    /// Writes already confirmed by a `commit_unit` call on this unit;
    /// promoted wholesale into the parent's `pending` when this unit
    /// closes, or simply dropped (already durable) if this is the root.
    committed: Vec<Record>,
}

pub struct Recorder {
    file: Arc<dyn File>,
    force_write_commit: bool,
    next_unit_id: AtomicU64,
    units: Mutex<HashMap<u64, UnitJournal>>,
}

impl Recorder {
    pub fn open(file: Arc<dyn File>, force_write_commit: bool) -> Result<Self> {
        Ok(Recorder {
            file,
            force_write_commit,
            next_unit_id: AtomicU64::new(1),
            units: Mutex::new(HashMap::new()),
        })
    }

    pub fn begin_unit(&self, parent: Option<u64>) -> u64 {
        let id = self.next_unit_id.fetch_add(1, Ordering::SeqCst);
        self.units.lock().unwrap().insert(
            id,
            UnitJournal {
                parent,
                pending: vec![],
                committed: vec![],
            },
        );
        debug!("recorder: began unit {} (parent {:?})", id, parent);
        id
    }

    fn append_to_file(&self, rec: &Record) -> Result<()> {
        let mut buf = vec![];
        buf.extend_from_slice(&rec.unit_id.to_be_bytes());
        buf.push(rec.kind.tag());
        buf.extend_from_slice(&rec.table_id.to_be_bytes());
        buf.extend_from_slice(&rec.offset.to_be_bytes());
        match &rec.op {
            RecordOp::Overwrite { before } => {
                buf.push(0);
                buf.extend_from_slice(&(before.len() as u32).to_be_bytes());
                buf.extend_from_slice(before);
            }
            RecordOp::Grow { old_len } => {
                buf.push(1);
                buf.extend_from_slice(&old_len.to_be_bytes());
            }
        }
        let crc = CRC.checksum(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        let mut full = vec![];
        full.extend_from_slice(&(buf.len() as u32).to_be_bytes());
        full.extend_from_slice(&buf);
        self.file.append(&full)?;
        Ok(())
    }

    pub fn record(
        &self,
        unit_id: u64,
        kind: FileKind,
        table_id: u32,
        offset: u64,
        op: RecordOp,
    ) -> Result<()> {
        let rec = Record { unit_id, table_id, kind, offset, op };
        // Write-ahead: the pre-image reaches the recorder file before the
        // caller applies the corresponding data-file mutation.
        self.append_to_file(&rec).map_err(|e| {
            AcdpError::with_source(Status::Durability, "recorder append failed", e)
        })?;
        let mut units = self.units.lock().unwrap();
        let journal = units.get_mut(&unit_id).ok_or_else(|| {
            AcdpError::new(Status::Concurrency, Some("record on a unit id that is not active"))
        })?;
        journal.pending.push(rec);
        Ok(())
    }

    /// Commits every currently-pending write of this unit: they become
    /// immune to this unit's own rollback, but remain unconfirmed from
    /// any ancestor's point of view until that ancestor commits too.
    pub fn commit_unit(&self, unit_id: u64) -> Result<()> {
        let mut units = self.units.lock().unwrap();
        let journal = units.get_mut(&unit_id).ok_or_else(|| {
            AcdpError::new(Status::Concurrency, Some("commit on a unit id that is not active"))
        })?;
        journal.committed.append(&mut journal.pending);
        let is_root = journal.parent.is_none();
        drop(units);
        if is_root && self.force_write_commit {
            self.file.sync().map_err(|e| {
                AcdpError::with_source(Status::Durability, "recorder fsync on commit failed", e)
            })?;
        }
        Ok(())
    }

    /// Closes a unit: returns its still-unconfirmed writes for the
    /// caller to roll back (in reverse temporal order), and — if it has
    /// a parent — promotes its committed writes into the parent's
    /// pending list. Also reclaims the recorder file once no unit
    /// remains active, per §4.3's durability mode.
    pub fn rollback_and_close_unit(&self, unit_id: u64) -> Result<Vec<Record>> {
        let mut units = self.units.lock().unwrap();
        let journal = units.remove(&unit_id).ok_or_else(|| {
            AcdpError::new(Status::Concurrency, Some("close on a unit id that is not active"))
        })?;
        if let Some(parent_id) = journal.parent {
            if let Some(parent) = units.get_mut(&parent_id) {
                parent.pending.extend(journal.committed.clone());
            }
        }
        let is_idle = units.is_empty();
        drop(units);
        if is_idle {
            if let Err(e) = self.file.truncate(0) {
                warn!("recorder: failed to reclaim file at quiescence: {}", e);
            }
        }
        Ok(journal.pending)
    }

    pub fn force_write(&self) -> Result<()> {
        self.file.sync()
    }

    /// Truncates the recorder file to empty. Called once crash recovery
    /// has applied the inverse of every record a prior session left
    /// behind: nothing in the file is meaningful anymore.
    pub fn clear(&self) -> Result<()> {
        self.file.truncate(0)
    }

    /// Parses every well-formed record left in the file from a prior
    /// session (§4.3 recovery). A torn trailing record — one whose
    /// length prefix or declared length runs past EOF — is a legitimate
    /// artifact of a crash mid-append and is discarded silently. A
    /// length-complete record whose CRC fails to check out is a genuine
    /// corruption of previously-written bytes, not a torn write, and is
    /// propagated as an error instead of being discarded the same way.
    pub fn recover(&self) -> Result<Vec<Record>> {
        let len = self.file.len()?;
        let mut offset = 0u64;
        let mut records = vec![];
        while offset < len {
            if offset + 4 > len {
                return self.discard_torn_tail(offset, records);
            }
            let len_bytes = self.file.read_at(offset, 4)?;
            let rec_len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as u64;
            if offset + 4 + rec_len > len {
                return self.discard_torn_tail(offset, records);
            }
            let body = self.file.read_at(offset + 4, rec_len as usize)?;
            let rec = parse_record(&body).map_err(|e| {
                error!(
                    "recorder: record at offset {} is length-complete but failed its CRC check; database is corrupt",
                    offset
                );
                e
            })?;
            records.push(rec);
            offset += 4 + rec_len;
        }
        Ok(records)
    }

    fn discard_torn_tail(&self, offset: u64, records: Vec<Record>) -> Result<Vec<Record>> {
        if offset == 0 {
            // The very first record is torn: nothing to discard, nothing
            // to recover.
            return Ok(records);
        }
        warn!("recorder: discarding torn trailing record at offset {}", offset);
        Ok(records)
    }
}

fn parse_record(body: &[u8]) -> Result<Record> {
    if body.len() < 8 + 1 + 4 + 8 + 1 + 4 {
        return Err(AcdpError::new(Status::Corruption, Some("recorder record too short")));
    }
    let payload = &body[..body.len() - 4];
    let stored_crc = u32::from_be_bytes(body[body.len() - 4..].try_into().unwrap());
    if CRC.checksum(payload) != stored_crc {
        return Err(AcdpError::new(Status::Corruption, Some("recorder record failed CRC check")));
    }
    let mut pos = 0;
    let unit_id = u64::from_be_bytes(payload[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let kind = FileKind::from_tag(payload[pos])?;
    pos += 1;
    let table_id = u32::from_be_bytes(payload[pos..pos + 4].try_into().unwrap());
    pos += 4;
    let offset = u64::from_be_bytes(payload[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let op_tag = payload[pos];
    pos += 1;
    let op = match op_tag {
        0 => {
            let blen = u32::from_be_bytes(payload[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            let before = payload[pos..pos + blen].to_vec();
            RecordOp::Overwrite { before }
        }
        1 => {
            let old_len = u64::from_be_bytes(payload[pos..pos + 8].try_into().unwrap());
            RecordOp::Grow { old_len }
        }
        _ => return Err(AcdpError::new(Status::Corruption, Some("unknown recorder op tag"))),
    };
    Ok(Record { unit_id, table_id, kind, offset, op })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemStorage, Storage};
    use std::path::PathBuf;

    fn open_recorder(force: bool) -> Recorder {
        let storage = MemStorage::new();
        let file = storage.create(&PathBuf::from("t.rec")).unwrap();
        Recorder::open(file, force).unwrap()
    }

    #[test]
    fn rollback_returns_records_in_insertion_order_for_reverse_replay() {
        let rec = open_recorder(false);
        let u = rec.begin_unit(None);
        rec.record(u, FileKind::Fl, 0, 0, RecordOp::Overwrite { before: vec![1] }).unwrap();
        rec.record(u, FileKind::Fl, 0, 8, RecordOp::Overwrite { before: vec![2] }).unwrap();
        let pending = rec.rollback_and_close_unit(u).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].offset, 0);
        assert_eq!(pending[1].offset, 8);
    }

    #[test]
    fn commit_then_close_returns_no_pending_writes() {
        let rec = open_recorder(false);
        let u = rec.begin_unit(None);
        rec.record(u, FileKind::Fl, 0, 0, RecordOp::Overwrite { before: vec![1] }).unwrap();
        rec.commit_unit(u).unwrap();
        let pending = rec.rollback_and_close_unit(u).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn nested_unit_commit_promotes_to_parent_pending_on_close() {
        let rec = open_recorder(false);
        let parent = rec.begin_unit(None);
        let child = rec.begin_unit(Some(parent));
        rec.record(child, FileKind::Fl, 0, 0, RecordOp::Overwrite { before: vec![9] }).unwrap();
        rec.commit_unit(child).unwrap();
        let child_pending = rec.rollback_and_close_unit(child).unwrap();
        assert!(child_pending.is_empty());
        // Promoted into the parent: closing the parent without a commit
        // rolls it back.
        let parent_pending = rec.rollback_and_close_unit(parent).unwrap();
        assert_eq!(parent_pending.len(), 1);
        assert_eq!(parent_pending[0].unit_id, child);
    }

    #[test]
    fn recover_parses_records_written_in_a_prior_session() {
        let rec = open_recorder(false);
        let u = rec.begin_unit(None);
        rec.record(u, FileKind::Fl, 3, 16, RecordOp::Overwrite { before: vec![5, 6, 7] }).unwrap();
        let recovered = rec.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].table_id, 3);
        assert_eq!(recovered[0].offset, 16);
    }

    #[test]
    fn quiescence_after_last_unit_closes_truncates_the_file() {
        let rec = open_recorder(false);
        let u = rec.begin_unit(None);
        rec.record(u, FileKind::Fl, 0, 0, RecordOp::Overwrite { before: vec![1] }).unwrap();
        rec.rollback_and_close_unit(u).unwrap();
        assert_eq!(rec.file.len().unwrap(), 0);
    }
}
