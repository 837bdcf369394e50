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

//! VL space: the variable-length payload file (§4.2).
//!
//! Each block is `[header: 8 bytes big-endian][payload: capacity
//! bytes]`. The header's top bit is the free/used marker; the remaining
//! 63 bits are the block's payload capacity. A live block's capacity
//! always equals the encoded length of the value it holds exactly — the
//! §8 invariant that a block's recorded length matches the owning
//! column's inline `length` field depends on this never drifting, so
//! the allocator only ever reuses a free block when the leftover can
//! either vanish entirely (perfect fit) or become its own free block
//! (big enough to hold another header); see DESIGN.md.

use crate::recorder::{FileKind, RecordOp, RecordSink};
use crate::storage::File;
use crate::util::coding::max_value_for_width;
use crate::util::status::{AcdpError, Result, Status};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

const HEADER_WIDTH: u64 = 8;
const FREE_BIT: u64 = 1 << 63;
const CAPACITY_MASK: u64 = FREE_BIT - 1;

#[derive(Clone, Copy)]
struct Extent {
    capacity: u64,
    free: bool,
}

struct Index {
    /// offset -> extent, covering every block in the file with no gaps.
    extents: BTreeMap<u64, Extent>,
    /// capacity -> offsets, free blocks only.
    free_by_size: BTreeMap<u64, BTreeSet<u64>>,
}

pub struct VlSpace {
    file: Arc<dyn File>,
    nobs_outrow_ptr: usize,
    index: Mutex<Index>,
}

impl VlSpace {
    pub fn open(file: Arc<dyn File>, nobs_outrow_ptr: usize) -> Result<Self> {
        let space = VlSpace {
            file,
            nobs_outrow_ptr,
            index: Mutex::new(Index {
                extents: BTreeMap::new(),
                free_by_size: BTreeMap::new(),
            }),
        };
        space.rebuild()?;
        Ok(space)
    }

    /// Rebuilds the in-memory extent/free-size index from a full scan of
    /// the file. Called at `open` and after a unit rollback rewrites raw
    /// bytes, so the index never has to be patched incrementally to
    /// match an undo (see module docs on the recorder).
    pub fn rebuild(&self) -> Result<()> {
        let len = self.file.len()?;
        let mut extents = BTreeMap::new();
        let mut free_by_size: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        let mut offset = 0u64;
        while offset < len {
            let header = decode_header(&self.file.read_at(offset, HEADER_WIDTH as usize)?);
            extents.insert(offset, header);
            if header.free {
                free_by_size.entry(header.capacity).or_default().insert(offset);
            }
            offset += HEADER_WIDTH + header.capacity;
        }
        if offset != len {
            return Err(AcdpError::new(
                Status::Corruption,
                Some("VL file does not end on a block boundary"),
            ));
        }
        *self.index.lock().unwrap() = Index {
            extents,
            free_by_size,
        };
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    fn write_header(&self, offset: u64, extent: Extent) -> Result<()> {
        self.file.write_at(offset, &encode_header(extent))
    }

    fn check_ptr_fits(&self, offset: u64) -> Result<()> {
        if offset > max_value_for_width(self.nobs_outrow_ptr) {
            return Err(AcdpError::new(
                Status::Capacity,
                Some("VL offset exceeds the configured nobsOutrowPtr bound"),
            ));
        }
        Ok(())
    }

    /// Allocates a block of exactly `requested` payload bytes and
    /// returns its offset (the value to store as the inline pointer).
    pub fn alloc(&self, sink: &dyn RecordSink, table_id: u32, requested: u64) -> Result<u64> {
        let mut idx = self.index.lock().unwrap();
        if let Some(offset) = find_best_fit(&idx, requested) {
            let extent = *idx.extents.get(&offset).unwrap();
            let before = self
                .file
                .read_at(offset, (HEADER_WIDTH + extent.capacity) as usize)?;
            sink.record(FileKind::Vl, table_id, offset, RecordOp::Overwrite { before })?;
            remove_free(&mut idx, offset, extent.capacity);
            let remainder = extent.capacity - requested;
            if remainder > 0 {
                let remainder_offset = offset + HEADER_WIDTH + requested;
                let remainder_extent = Extent {
                    capacity: remainder - HEADER_WIDTH,
                    free: true,
                };
                idx.extents.insert(remainder_offset, remainder_extent);
                idx.free_by_size
                    .entry(remainder_extent.capacity)
                    .or_default()
                    .insert(remainder_offset);
                self.write_header(remainder_offset, remainder_extent)?;
            }
            let live = Extent {
                capacity: requested,
                free: false,
            };
            idx.extents.insert(offset, live);
            self.write_header(offset, live)?;
            self.check_ptr_fits(offset)?;
            return Ok(offset);
        }
        // (b) extend the file at the tail.
        let offset = self.file.len()?;
        self.check_ptr_fits(offset)?;
        sink.record(FileKind::Vl, table_id, offset, RecordOp::Grow { old_len: offset })?;
        let live = Extent {
            capacity: requested,
            free: false,
        };
        self.file
            .write_at(offset, &vec![0u8; (HEADER_WIDTH + requested) as usize])?;
        self.write_header(offset, live)?;
        idx.extents.insert(offset, live);
        Ok(offset)
    }

    pub fn read_payload(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.file.read_at(offset + HEADER_WIDTH, len as usize)
    }

    pub fn write_payload(
        &self,
        sink: &dyn RecordSink,
        table_id: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let before = self.file.read_at(offset + HEADER_WIDTH, data.len())?;
        sink.record(
            FileKind::Vl,
            table_id,
            offset + HEADER_WIDTH,
            RecordOp::Overwrite { before },
        )?;
        self.file.write_at(offset + HEADER_WIDTH, data)
    }

    pub fn recorded_length(&self, offset: u64) -> Result<u64> {
        let idx = self.index.lock().unwrap();
        let extent = idx.extents.get(&offset).ok_or_else(|| {
            AcdpError::new(Status::Corruption, Some("outrow pointer does not name a known VL block"))
        })?;
        if extent.free {
            return Err(AcdpError::new(
                Status::Corruption,
                Some("outrow pointer names a free VL block"),
            ));
        }
        Ok(extent.capacity)
    }

    /// Frees a block and coalesces with adjacent free neighbours.
    pub fn free(&self, sink: &dyn RecordSink, table_id: u32, offset: u64) -> Result<()> {
        let mut idx = self.index.lock().unwrap();
        let mut extent = *idx.extents.get(&offset).ok_or_else(|| {
            AcdpError::new(Status::Corruption, Some("freeing an unknown VL offset"))
        })?;
        extent.free = true;
        let mut start = offset;
        let original_capacity = extent.capacity;

        let left = idx
            .extents
            .range(..offset)
            .next_back()
            .map(|(&o, &e)| (o, e))
            .filter(|(o, e)| e.free && o + HEADER_WIDTH + e.capacity == offset);
        let right_off = offset + HEADER_WIDTH + original_capacity;
        let right = idx
            .extents
            .get(&right_off)
            .copied()
            .filter(|e| e.free)
            .map(|e| (right_off, e));

        // Record the pre-image spanning every header this call will
        // rewrite, before any of them change: the freed block itself
        // plus whichever neighbours it's about to swallow.
        let record_start = left.map(|(o, _)| o).unwrap_or(offset);
        let record_end = right
            .map(|(o, e)| o + HEADER_WIDTH + e.capacity)
            .unwrap_or(offset + HEADER_WIDTH + original_capacity);
        let before = self
            .file
            .read_at(record_start, (record_end - record_start) as usize)?;
        sink.record(FileKind::Vl, table_id, record_start, RecordOp::Overwrite { before })?;

        if let Some((left_off, left_extent)) = left {
            remove_free(&mut idx, left_off, left_extent.capacity);
            idx.extents.remove(&left_off);
            extent.capacity += HEADER_WIDTH + left_extent.capacity;
            start = left_off;
        }
        if let Some((right_off, right_extent)) = right {
            remove_free(&mut idx, right_off, right_extent.capacity);
            idx.extents.remove(&right_off);
            extent.capacity += HEADER_WIDTH + right_extent.capacity;
        }

        idx.extents.remove(&offset);
        idx.extents.insert(start, extent);
        idx.free_by_size.entry(extent.capacity).or_default().insert(start);
        self.write_header(start, extent)?;
        Ok(())
    }

    /// Resets the file to empty, per `TableStore::truncate` (§4.6).
    /// Caller is responsible for the "no inbound references" constraint
    /// check; this assumes the whole table is being wiped.
    pub fn truncate(&self) -> Result<()> {
        self.file.truncate(0)?;
        let mut idx = self.index.lock().unwrap();
        idx.extents.clear();
        idx.free_by_size.clear();
        Ok(())
    }

    /// Applies the inverse of a previously recorded mutation directly to
    /// the file, bypassing the extent index — used by unit rollback and
    /// crash recovery to undo a `Record`. Callers must call `rebuild()`
    /// afterward.
    pub fn apply_inverse(&self, offset: u64, op: &RecordOp) -> Result<()> {
        match op {
            RecordOp::Overwrite { before } => self.file.write_at(offset, before),
            RecordOp::Grow { old_len } => self.file.truncate(*old_len),
        }
    }

    pub fn unused_bytes(&self) -> u64 {
        let idx = self.index.lock().unwrap();
        idx.extents
            .values()
            .filter(|e| e.free)
            .map(|e| HEADER_WIDTH + e.capacity)
            .sum()
    }

    /// VL compaction (§4.2): relocates every live block to the next free
    /// file prefix in offset order and returns the `old_offset ->
    /// new_offset` map so the caller can patch the owning FL slot's
    /// inline pointer field, then truncates the file.
    pub fn compact(&self) -> Result<Vec<(u64, u64)>> {
        let mut idx = self.index.lock().unwrap();
        let before_len = self.file.len()?;
        let ordered: Vec<(u64, Extent)> = idx
            .extents
            .iter()
            .filter(|(_, e)| !e.free)
            .map(|(&o, &e)| (o, e))
            .collect();
        debug!("fsm/vl: compaction starting, {} byte(s), {} live block(s)", before_len, ordered.len());
        let mut moves = vec![];
        let mut write_at = 0u64;
        idx.extents.clear();
        idx.free_by_size.clear();
        for (old_offset, extent) in &ordered {
            if *old_offset != write_at {
                let bytes = self
                    .file
                    .read_at(*old_offset, (HEADER_WIDTH + extent.capacity) as usize)?;
                self.file.write_at(write_at, &bytes)?;
                moves.push((*old_offset, write_at));
            }
            idx.extents.insert(write_at, *extent);
            write_at += HEADER_WIDTH + extent.capacity;
        }
        self.file.truncate(write_at)?;
        debug!("fsm/vl: compaction done, {} -> {} byte(s)", before_len, write_at);
        Ok(moves)
    }
}

fn decode_header(bytes: &[u8]) -> Extent {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    let raw = u64::from_be_bytes(buf);
    Extent {
        capacity: raw & CAPACITY_MASK,
        free: raw & FREE_BIT != 0,
    }
}

fn encode_header(extent: Extent) -> Vec<u8> {
    let mut raw = extent.capacity & CAPACITY_MASK;
    if extent.free {
        raw |= FREE_BIT;
    }
    raw.to_be_bytes().to_vec()
}

fn remove_free(idx: &mut Index, offset: u64, capacity: u64) {
    if let Some(set) = idx.free_by_size.get_mut(&capacity) {
        set.remove(&offset);
        if set.is_empty() {
            idx.free_by_size.remove(&capacity);
        }
    }
}

/// Best-fit search with a lowest-offset tie-break, skipping any
/// candidate whose remainder would be too small to host its own header
/// (see module docs).
fn find_best_fit(idx: &Index, requested: u64) -> Option<u64> {
    for (&capacity, offsets) in idx.free_by_size.range(requested..) {
        let remainder = capacity - requested;
        if remainder == 0 || remainder >= HEADER_WIDTH {
            if let Some(&offset) = offsets.iter().next() {
                return Some(offset);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::NoRecordSink;
    use crate::storage::{MemStorage, Storage};
    use std::path::PathBuf;

    const SINK: NoRecordSink = NoRecordSink;

    fn open_space() -> VlSpace {
        let storage = MemStorage::new();
        let file = storage.create(&PathBuf::from("t.vl")).unwrap();
        VlSpace::open(file, 4).unwrap()
    }

    #[test]
    fn alloc_then_read_write_round_trips_payload() {
        let vl = open_space();
        let off = vl.alloc(&SINK, 0, 5).unwrap();
        vl.write_payload(&SINK, 0, off, b"hello").unwrap();
        assert_eq!(vl.read_payload(off, 5).unwrap(), b"hello");
        assert_eq!(vl.recorded_length(off).unwrap(), 5);
    }

    #[test]
    fn free_then_alloc_reuses_block_exactly() {
        let vl = open_space();
        let off = vl.alloc(&SINK, 0, 10).unwrap();
        vl.free(&SINK, 0, off).unwrap();
        assert_eq!(vl.unused_bytes(), 8 + 10);
        let off2 = vl.alloc(&SINK, 0, 10).unwrap();
        assert_eq!(off2, off);
        assert_eq!(vl.unused_bytes(), 0);
    }

    #[test]
    fn free_coalesces_adjacent_blocks() {
        let vl = open_space();
        let a = vl.alloc(&SINK, 0, 10).unwrap();
        let b = vl.alloc(&SINK, 0, 10).unwrap();
        let c = vl.alloc(&SINK, 0, 10).unwrap();
        vl.free(&SINK, 0, a).unwrap();
        vl.free(&SINK, 0, b).unwrap();
        // a and b should have coalesced into one free extent.
        let off = vl.alloc(&SINK, 0, 20).unwrap();
        assert_eq!(off, a);
        let _ = c;
    }

    #[test]
    fn compact_on_fully_used_file_is_a_no_op_on_contents() {
        let vl = open_space();
        let a = vl.alloc(&SINK, 0, 4).unwrap();
        vl.write_payload(&SINK, 0, a, b"abcd").unwrap();
        let moves = vl.compact().unwrap();
        assert!(moves.is_empty());
        assert_eq!(vl.read_payload(a, 4).unwrap(), b"abcd");
    }

    #[test]
    fn compact_relocates_live_blocks_and_drops_free_space() {
        let vl = open_space();
        let a = vl.alloc(&SINK, 0, 4).unwrap();
        let b = vl.alloc(&SINK, 0, 4).unwrap();
        vl.write_payload(&SINK, 0, a, b"AAAA").unwrap();
        vl.write_payload(&SINK, 0, b, b"BBBB").unwrap();
        vl.free(&SINK, 0, a).unwrap();
        let moves = vl.compact().unwrap();
        assert_eq!(moves.len(), 1);
        let (old, new) = moves[0];
        assert_eq!(old, b);
        assert_eq!(new, 0);
        assert_eq!(vl.read_payload(new, 4).unwrap(), b"BBBB");
        assert_eq!(vl.unused_bytes(), 0);
    }

    #[test]
    fn nobs_outrow_ptr_one_rejects_offset_beyond_255() {
        let storage = MemStorage::new();
        let file = storage.create(&PathBuf::from("narrow.vl")).unwrap();
        let vl = VlSpace::open(file, 1).unwrap();
        // Each 10-byte payload occupies an 18-byte block (8-byte header +
        // payload); allocate until the tail offset would exceed 255.
        let mut saw_capacity_error = false;
        for _ in 0..40 {
            if vl.alloc(&SINK, 0, 10).is_err() {
                saw_capacity_error = true;
                break;
            }
        }
        assert!(saw_capacity_error);
    }
}
