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

//! FL space: the fixed-length row-slot file (§4.2).
//!
//! Every slot is `[refcount: nobsRefCount][payload: slot_size -
//! nobsRefCount]` — the literal layout, no extra per-slot tag. A gap is
//! marked by giving the refcount header its single reserved value, the
//! top of its range (`2^(8*nobsRefCount) - 1`), which `write_refcount`
//! therefore never lets a live row reach. This steals a bit pattern from
//! a field that already has to be there, the same idiom `fsm/vl.rs` uses
//! for its block headers' free/used bit — see DESIGN.md's "gap sentinel
//! lives in the refcount header" note. A live row's refcount spans the
//! rest of the range, including zero. `nobsRefCount == 0` (omitting the
//! header entirely) is therefore not supported: there would be nowhere
//! left to park the sentinel.

use crate::recorder::{FileKind, RecordOp, RecordSink};
use crate::storage::File;
use crate::util::coding::{decode_uint_be, encode_uint_be, max_value_for_width};
use crate::util::status::{AcdpError, Result, Status};
use log::debug;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

pub struct FlSpace {
    file: Arc<dyn File>,
    /// Total bytes per slot.
    slot_size: usize,
    nobs_row_ref: usize,
    nobs_ref_count: usize,
    gaps: Mutex<BTreeSet<u64>>,
}

/// The refcount header's reserved top value, marking a gap. A live row's
/// refcount is never allowed to reach this.
fn gap_sentinel(nobs_ref_count: usize) -> u64 {
    max_value_for_width(nobs_ref_count)
}

impl FlSpace {
    /// Total FL slot width for a table whose payload (null-bitmap plus
    /// column sections) is `payload_len` bytes: refcount header, then
    /// payload.
    pub fn slot_size_for(nobs_ref_count: usize, payload_len: usize) -> usize {
        nobs_ref_count + payload_len
    }

    /// Opens (or creates, if empty) the FL file and reconstructs the gap
    /// free list with a full scan, per §4.2.
    pub fn open(
        file: Arc<dyn File>,
        slot_size: usize,
        nobs_row_ref: usize,
        nobs_ref_count: usize,
    ) -> Result<Self> {
        let space = FlSpace {
            file,
            slot_size,
            nobs_row_ref,
            nobs_ref_count,
            gaps: Mutex::new(BTreeSet::new()),
        };
        space.rebuild()?;
        Ok(space)
    }

    /// Rebuilds the in-memory gap list from a full scan of the file.
    /// Called at `open` and after a unit rollback rewrites raw bytes,
    /// so the gap list never has to be patched incrementally to match
    /// an undo (see module docs on the recorder).
    pub fn rebuild(&self) -> Result<()> {
        let len = self.file.len()?;
        if len % self.slot_size as u64 != 0 {
            return Err(AcdpError::new(
                Status::Corruption,
                Some("FL file size is not a multiple of the slot size"),
            ));
        }
        let slot_count = len / self.slot_size as u64;
        let mut gaps = BTreeSet::new();
        if self.nobs_ref_count > 0 {
            let sentinel = gap_sentinel(self.nobs_ref_count);
            for i in 1..=slot_count {
                let bytes = self.file.read_at(Self::offset(i, self.slot_size), self.nobs_ref_count)?;
                if decode_uint_be(&bytes, self.nobs_ref_count) == sentinel {
                    gaps.insert(i);
                }
            }
        }
        *self.gaps.lock().unwrap() = gaps;
        Ok(())
    }

    #[inline]
    fn offset(index: u64, slot_size: usize) -> u64 {
        (index - 1) * slot_size as u64
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    pub fn slot_count(&self) -> Result<u64> {
        Ok(self.file.len()? / self.slot_size as u64)
    }

    pub fn payload_len(&self) -> usize {
        self.slot_size - self.nobs_ref_count
    }

    /// Writes the raw refcount header, bypassing the recorder (used only
    /// where the caller already journaled the whole slot's before-image).
    fn write_refcount_raw(&self, index: u64, value: u64) -> Result<()> {
        if self.nobs_ref_count == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; self.nobs_ref_count];
        encode_uint_be(value, self.nobs_ref_count, &mut buf)?;
        self.file.write_at(Self::offset(index, self.slot_size), &buf)
    }

    /// Allocates a slot: reuses the lowest-indexed gap if any, otherwise
    /// appends a fresh slot at the tail (§4.2, §8 boundary behaviours).
    pub fn alloc(&self, sink: &dyn RecordSink, table_id: u32) -> Result<u64> {
        let mut gaps = self.gaps.lock().unwrap();
        let index = if let Some(&lowest) = gaps.iter().next() {
            let off = Self::offset(lowest, self.slot_size);
            let before = self.file.read_at(off, self.slot_size)?;
            sink.record(FileKind::Fl, table_id, off, RecordOp::Overwrite { before })?;
            gaps.remove(&lowest);
            lowest
        } else {
            let next = self.slot_count()? + 1;
            if next > max_value_for_width(self.nobs_row_ref) {
                return Err(AcdpError::new(
                    Status::Capacity,
                    Some("FL slot count would exceed the configured nobsRowRef bound"),
                ));
            }
            let old_len = self.file.len()?;
            sink.record(FileKind::Fl, table_id, old_len, RecordOp::Grow { old_len })?;
            self.file
                .write_at(Self::offset(next, self.slot_size), &vec![0u8; self.slot_size])?;
            next
        };
        // A freshly grown slot is already all-zero, which already reads
        // as live with refcount 0. A reused gap slot still carries the
        // sentinel in its refcount header and must have it cleared.
        self.write_refcount_raw(index, 0)?;
        Ok(index)
    }

    pub fn check_ref_in_range(&self, index: u64) -> Result<()> {
        let count = self.slot_count()?;
        if index == 0 || index > count {
            return Err(AcdpError::reference(false, "slot index is out of range"));
        }
        Ok(())
    }

    pub fn is_gap(&self, index: u64) -> Result<bool> {
        self.check_ref_in_range(index)?;
        if self.nobs_ref_count == 0 {
            return Ok(false);
        }
        let bytes = self
            .file
            .read_at(Self::offset(index, self.slot_size), self.nobs_ref_count)?;
        Ok(decode_uint_be(&bytes, self.nobs_ref_count) == gap_sentinel(self.nobs_ref_count))
    }

    /// Validates that `index` names a live row, returning the
    /// distinguishing `Status::Reference` error otherwise.
    pub fn check_live(&self, index: u64) -> Result<()> {
        self.check_ref_in_range(index)?;
        if self.is_gap(index)? {
            return Err(AcdpError::reference(true, "reference targets a row gap"));
        }
        Ok(())
    }

    pub fn read_refcount(&self, index: u64) -> Result<u64> {
        if self.nobs_ref_count == 0 {
            return Ok(0);
        }
        let bytes = self
            .file
            .read_at(Self::offset(index, self.slot_size), self.nobs_ref_count)?;
        Ok(decode_uint_be(&bytes, self.nobs_ref_count))
    }

    pub fn write_refcount(
        &self,
        sink: &dyn RecordSink,
        table_id: u32,
        index: u64,
        value: u64,
    ) -> Result<()> {
        if self.nobs_ref_count == 0 {
            if value != 0 {
                return Err(AcdpError::new(
                    Status::Capacity,
                    Some("table has nobsRefCount=0 but received an incoming reference"),
                ));
            }
            return Ok(());
        }
        // The top value of the refcount's range is reserved as the gap
        // sentinel, so a live row's refcount tops out one below it.
        let max_usable = gap_sentinel(self.nobs_ref_count) - 1;
        if value > max_usable {
            return Err(AcdpError::new(
                Status::Capacity,
                Some("reference count exceeds the configured nobsRefCount bound"),
            ));
        }
        let off = Self::offset(index, self.slot_size);
        let before = self.file.read_at(off, self.nobs_ref_count)?;
        sink.record(FileKind::Fl, table_id, off, RecordOp::Overwrite { before })?;
        let mut buf = vec![0u8; self.nobs_ref_count];
        encode_uint_be(value, self.nobs_ref_count, &mut buf)?;
        self.file.write_at(off, &buf)
    }

    pub fn incr_refcount(&self, sink: &dyn RecordSink, table_id: u32, index: u64) -> Result<u64> {
        let next = self.read_refcount(index)? + 1;
        self.write_refcount(sink, table_id, index, next)?;
        Ok(next)
    }

    pub fn decr_refcount(&self, sink: &dyn RecordSink, table_id: u32, index: u64) -> Result<u64> {
        let cur = self.read_refcount(index)?;
        debug_assert!(cur > 0, "refcount underflow at slot {}", index);
        let next = cur.saturating_sub(1);
        self.write_refcount(sink, table_id, index, next)?;
        Ok(next)
    }

    /// Reads the payload region (everything after the refcount header).
    pub fn read_payload(&self, index: u64) -> Result<Vec<u8>> {
        self.file.read_at(
            Self::offset(index, self.slot_size) + self.nobs_ref_count as u64,
            self.payload_len(),
        )
    }

    pub fn write_payload(
        &self,
        sink: &dyn RecordSink,
        table_id: u32,
        index: u64,
        data: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(data.len(), self.payload_len());
        let off = Self::offset(index, self.slot_size) + self.nobs_ref_count as u64;
        let before = self.file.read_at(off, self.payload_len())?;
        sink.record(FileKind::Fl, table_id, off, RecordOp::Overwrite { before })?;
        self.file.write_at(off, data)
    }

    /// Reads a sub-range of the payload, relative to its start, without
    /// pulling the whole row. Used by `TableStore::update` to touch only
    /// the column(s) actually being changed.
    pub fn read_payload_range(&self, index: u64, rel_offset: usize, len: usize) -> Result<Vec<u8>> {
        let off = Self::offset(index, self.slot_size) + (self.nobs_ref_count + rel_offset) as u64;
        self.file.read_at(off, len)
    }

    /// Writes a sub-range of the payload, journaling only that range
    /// rather than the whole row.
    pub fn write_payload_range(
        &self,
        sink: &dyn RecordSink,
        table_id: u32,
        index: u64,
        rel_offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let off = Self::offset(index, self.slot_size) + (self.nobs_ref_count + rel_offset) as u64;
        let before = self.file.read_at(off, data.len())?;
        sink.record(FileKind::Fl, table_id, off, RecordOp::Overwrite { before })?;
        self.file.write_at(off, data)
    }

    /// Frees a slot: refcount must already be zero (checked by the
    /// caller, which owns the constraint-error semantics). Zeroes the
    /// whole slot and stamps the refcount header with the gap sentinel,
    /// rather than leaving the old payload behind.
    pub fn free(&self, sink: &dyn RecordSink, table_id: u32, index: u64) -> Result<()> {
        let off = Self::offset(index, self.slot_size);
        let before = self.file.read_at(off, self.slot_size)?;
        sink.record(FileKind::Fl, table_id, off, RecordOp::Overwrite { before })?;
        let mut buf = vec![0u8; self.slot_size];
        if self.nobs_ref_count > 0 {
            encode_uint_be(
                gap_sentinel(self.nobs_ref_count),
                self.nobs_ref_count,
                &mut buf[..self.nobs_ref_count],
            )?;
        }
        self.file.write_at(off, &buf)?;
        self.gaps.lock().unwrap().insert(index);
        Ok(())
    }

    pub fn gap_count(&self) -> usize {
        self.gaps.lock().unwrap().len()
    }

    /// Applies the inverse of a previously recorded mutation directly to
    /// the file, bypassing the gap list and the recorder itself — used
    /// by unit rollback and crash recovery to undo a `Record`. Callers
    /// must call `rebuild()` afterward; this does not touch `gaps`.
    pub fn apply_inverse(&self, offset: u64, op: &RecordOp) -> Result<()> {
        match op {
            RecordOp::Overwrite { before } => self.file.write_at(offset, before),
            RecordOp::Grow { old_len } => self.file.truncate(*old_len),
        }
    }

    pub fn iter_live_from(&self, start: u64) -> Result<Vec<u64>> {
        let count = self.slot_count()?;
        let gaps = self.gaps.lock().unwrap();
        Ok((start.max(1)..=count).filter(|i| !gaps.contains(i)).collect())
    }

    /// Removes every row and truncates the file to empty, per
    /// `TableStore::truncate` (§4.6). Caller is responsible for the
    /// "no inbound references" constraint check.
    pub fn truncate(&self) -> Result<()> {
        self.file.truncate(0)?;
        self.gaps.lock().unwrap().clear();
        Ok(())
    }

    /// FL compaction (§4.2): shifts live rows downward in slot order,
    /// removing every gap, and returns the `old -> new` index map so the
    /// caller can rewrite inbound references in every referencing table.
    /// Invalidates outstanding references once applied.
    pub fn compact(&self) -> Result<Vec<(u64, u64)>> {
        let count = self.slot_count()?;
        debug!("fsm/fl: compaction starting, {} slot(s) before", count);
        let mut moves = vec![];
        let mut write_at: u64 = 1;
        for read_at in 1..=count {
            if self.is_gap(read_at)? {
                continue;
            }
            if read_at != write_at {
                let full = self
                    .file
                    .read_at(Self::offset(read_at, self.slot_size), self.slot_size)?;
                self.file
                    .write_at(Self::offset(write_at, self.slot_size), &full)?;
                moves.push((read_at, write_at));
            }
            write_at += 1;
        }
        let new_count = write_at - 1;
        self.file.truncate(new_count * self.slot_size as u64)?;
        self.gaps.lock().unwrap().clear();
        debug!("fsm/fl: compaction done, {} -> {} slot(s)", count, new_count);
        Ok(moves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::NoRecordSink;
    use crate::storage::MemStorage;
    use crate::storage::Storage;
    use std::path::PathBuf;

    const SINK: NoRecordSink = NoRecordSink;

    fn open_space(slot_size: usize) -> FlSpace {
        let storage = MemStorage::new();
        let file = storage.create(&PathBuf::from("t.fl")).unwrap();
        FlSpace::open(file, slot_size, 3, 1).unwrap()
    }

    #[test]
    fn insert_into_empty_table_gets_index_one() {
        let fl = open_space(8);
        assert_eq!(fl.alloc(&SINK, 0).unwrap(), 1);
    }

    #[test]
    fn delete_then_insert_reuses_lowest_gap() {
        let fl = open_space(8);
        let r1 = fl.alloc(&SINK, 0).unwrap();
        let r2 = fl.alloc(&SINK, 0).unwrap();
        let _r3 = fl.alloc(&SINK, 0).unwrap();
        assert_eq!((r1, r2), (1, 2));
        fl.free(&SINK, 0, r2).unwrap();
        let r4 = fl.alloc(&SINK, 0).unwrap();
        assert_eq!(r4, r2);
    }

    #[test]
    fn refcount_round_trips() {
        let fl = open_space(8);
        let r = fl.alloc(&SINK, 0).unwrap();
        assert_eq!(fl.read_refcount(r).unwrap(), 0);
        assert_eq!(fl.incr_refcount(&SINK, 0, r).unwrap(), 1);
        assert_eq!(fl.incr_refcount(&SINK, 0, r).unwrap(), 2);
        assert_eq!(fl.decr_refcount(&SINK, 0, r).unwrap(), 1);
    }

    #[test]
    fn is_gap_reflects_free_state() {
        let fl = open_space(8);
        let r = fl.alloc(&SINK, 0).unwrap();
        assert!(!fl.is_gap(r).unwrap());
        fl.free(&SINK, 0, r).unwrap();
        assert!(fl.is_gap(r).unwrap());
    }

    #[test]
    fn reference_to_out_of_range_slot_is_not_a_gap_error() {
        let fl = open_space(8);
        let err = fl.check_live(1).unwrap_err();
        assert_eq!(err.status(), Status::Reference);
        assert!(!err.is_row_gap());
    }

    #[test]
    fn reference_to_freed_slot_is_a_gap_error() {
        let fl = open_space(8);
        let r = fl.alloc(&SINK, 0).unwrap();
        fl.free(&SINK, 0, r).unwrap();
        let err = fl.check_live(r).unwrap_err();
        assert!(err.is_row_gap());
    }

    #[test]
    fn nobs_row_ref_one_rejects_slot_256() {
        let fl = open_space(8);
        for _ in 0..255 {
            fl.alloc(&SINK, 0).unwrap();
        }
        // width-1 nobsRowRef bound is exercised at the table-store level
        // with width=1; here we exercise the general overflow path using
        // a table configured for width 1.
        let storage = MemStorage::new();
        let file = storage.create(&std::path::PathBuf::from("t2.fl")).unwrap();
        let narrow = FlSpace::open(file, 8, 1, 1).unwrap();
        for _ in 0..255 {
            narrow.alloc(&SINK, 0).unwrap();
        }
        assert!(narrow.alloc(&SINK, 0).is_err());
    }

    #[test]
    fn compact_removes_gaps_and_returns_move_map() {
        let fl = open_space(8);
        let r1 = fl.alloc(&SINK, 0).unwrap();
        let r2 = fl.alloc(&SINK, 0).unwrap();
        let r3 = fl.alloc(&SINK, 0).unwrap();
        fl.free(&SINK, 0, r2).unwrap();
        let moves = fl.compact().unwrap();
        assert_eq!(moves, vec![(r3, r2)]);
        assert_eq!(fl.slot_count().unwrap(), 2);
        let _ = r1;
    }
}
