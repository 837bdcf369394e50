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

//! Table store (§4.6): composes the codec and the FSM to implement row
//! operations, and tracks incoming reference counters. A single table's
//! refcount header lives entirely on its own FL slot, so every
//! *local* invariant (delete-constraint, truncate-constraint) is
//! checkable without looking at any other table. Maintaining a
//! referenced row's counter when the reference lives in a *different*
//! table, and rewriting references after FL compaction, both require
//! routing through every open table — that's `Database`'s job, not
//! this module's, so the mutating operations here return the
//! [`RefChange`]s or reference-rewrite work the caller still owes.

use crate::codec::{ColumnType, Encoded, EncodeCtx, Value};
use crate::fsm::{FileSpaceManager, FlSpace};
use crate::layout::TableLayout;
use crate::recorder::{FileKind, RecordOp, RecordSink};
use crate::storage::Storage;
use crate::util::coding::{decode_uint_be, encode_uint_be};
use crate::util::status::{AcdpError, Result, Status};
use std::path::Path;

/// A reference-counter adjustment a caller owes to a *named* table
/// (which may be this same table, for self-referencing columns).
#[derive(Clone, Debug)]
pub struct RefChange {
    pub table: String,
    pub row: u64,
    pub incr: bool,
}

struct Column {
    name: String,
    ty: ColumnType,
    null_bit: Option<usize>,
    inline_offset: usize,
    inline_len: usize,
}

pub struct TableStore {
    pub name: String,
    pub table_id: u32,
    columns: Vec<Column>,
    bitmap_bytes: usize,
    ctx: EncodeCtx,
    fsm: FileSpaceManager,
}

impl TableStore {
    pub fn open(
        table_id: u32,
        layout: &TableLayout,
        storage: &dyn Storage,
        dir: &Path,
    ) -> Result<Self> {
        let ctx = EncodeCtx {
            nobs_row_ref: layout.store.nobs_row_ref,
            nobs_outrow_ptr: layout.store.nobs_outrow_ptr,
        };
        let mut columns = vec![];
        let mut nullable_seen = 0usize;
        let mut offset = 0usize; // patched below once bitmap_bytes is known
        for col in &layout.columns {
            let ty = col.resolve_type()?;
            let null_bit = if ty.nullable() {
                let bit = nullable_seen;
                nullable_seen += 1;
                Some(bit)
            } else {
                None
            };
            let inline_len = ty.inline_len(&ctx);
            columns.push(Column {
                name: col.name.clone(),
                ty,
                null_bit,
                inline_offset: offset,
                inline_len,
            });
            offset += inline_len;
        }
        let bitmap_bytes = (nullable_seen + 7) / 8;
        for c in columns.iter_mut() {
            c.inline_offset += bitmap_bytes;
        }

        let payload_len = bitmap_bytes + offset;
        let slot_size = FlSpace::slot_size_for(layout.store.nobs_ref_count, payload_len);
        let fl_path = dir.join(&layout.store.fl_data_file);
        let vl_name = layout
            .store
            .vl_data_file
            .clone()
            .unwrap_or_else(|| format!("{}.vl", layout.name));
        let vl_path = dir.join(vl_name);
        let fsm = FileSpaceManager::open(
            storage,
            &fl_path,
            &vl_path,
            slot_size,
            layout.store.nobs_row_ref,
            layout.store.nobs_outrow_ptr,
            layout.store.nobs_ref_count,
        )?;

        Ok(TableStore {
            name: layout.name.clone(),
            table_id,
            columns,
            bitmap_bytes,
            ctx,
            fsm,
        })
    }

    pub fn row_count(&self) -> Result<u64> {
        let total = self.fsm.fl.slot_count()?;
        Ok(total - self.fsm.fl.gap_count() as u64)
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| AcdpError::new(Status::Usage, Some(&format!("unknown column '{}'", name))))
    }

    fn set_null_bit(bitmap: &mut [u8], bit: usize, value: bool) {
        if value {
            bitmap[bit / 8] |= 1 << (bit % 8);
        } else {
            bitmap[bit / 8] &= !(1 << (bit % 8));
        }
    }

    fn get_null_bit(bitmap: &[u8], bit: usize) -> bool {
        bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// `values` must be in column-definition order and match the
    /// table's column count.
    pub fn insert(&self, sink: &dyn RecordSink, values: &[Value]) -> Result<(u64, Vec<RefChange>)> {
        if values.len() != self.columns.len() {
            return Err(AcdpError::new(
                Status::Usage,
                Some("value count does not match the table's column count"),
            ));
        }
        let mut bitmap = vec![0u8; self.bitmap_bytes];
        let mut inline = vec![0u8; self.columns.iter().map(|c| c.inline_len).sum()];
        let mut changes = vec![];

        for (col, value) in self.columns.iter().zip(values) {
            if matches!(value, Value::Null) {
                if let Some(bit) = col.null_bit {
                    Self::set_null_bit(&mut bitmap, bit, true);
                }
            }
            let rel = col.inline_offset - self.bitmap_bytes;
            match col.ty.encode(value, &self.ctx)? {
                Encoded::Inline(bytes) => {
                    inline[rel..rel + col.inline_len].copy_from_slice(&bytes);
                }
                Encoded::Outrow(bytes) => {
                    let ptr = self.fsm.vl.alloc(sink, self.table_id, bytes.len() as u64)?;
                    self.fsm.vl.write_payload(sink, self.table_id, ptr, &bytes)?;
                    self.write_outrow_pair(&mut inline, rel, col, bytes.len() as u64, ptr)?;
                }
            }
            if !matches!(value, Value::Null) {
                for target_row in ColumnType::references_in(value) {
                    if let Some(table) = col.ty.referenced_table() {
                        changes.push(RefChange {
                            table: table.to_owned(),
                            row: target_row,
                            incr: true,
                        });
                    }
                }
            }
        }

        let row = self.fsm.fl.alloc(sink, self.table_id)?;
        let mut payload = bitmap;
        payload.extend_from_slice(&inline);
        self.fsm.fl.write_payload(sink, self.table_id, row, &payload)?;
        Ok((row, changes))
    }

    fn write_outrow_pair(
        &self,
        inline: &mut [u8],
        rel: usize,
        col: &Column,
        len: u64,
        ptr: u64,
    ) -> Result<()> {
        let prefix_w = col.inline_len - self.ctx.nobs_outrow_ptr;
        encode_uint_be(len, prefix_w, &mut inline[rel..rel + prefix_w])?;
        encode_uint_be(ptr, self.ctx.nobs_outrow_ptr, &mut inline[rel + prefix_w..rel + col.inline_len])?;
        Ok(())
    }

    fn read_outrow_pair(&self, inline: &[u8], col: &Column) -> (u64, u64) {
        let prefix_w = col.inline_len - self.ctx.nobs_outrow_ptr;
        let len = decode_uint_be(&inline[..prefix_w], prefix_w);
        let ptr = decode_uint_be(&inline[prefix_w..], self.ctx.nobs_outrow_ptr);
        (len, ptr)
    }

    /// Reads and decodes every requested column (by index) of `row`.
    pub fn get(&self, row: u64, column_indices: &[usize]) -> Result<Vec<Value>> {
        self.fsm.fl.check_live(row)?;
        let payload = self.fsm.fl.read_payload(row)?;
        let bitmap = &payload[..self.bitmap_bytes];
        let mut out = vec![];
        for &idx in column_indices {
            let col = self.columns.get(idx).ok_or_else(|| {
                AcdpError::new(Status::Usage, Some("column index out of range"))
            })?;
            if let Some(bit) = col.null_bit {
                if Self::get_null_bit(bitmap, bit) {
                    out.push(Value::Null);
                    continue;
                }
            }
            let inline = &payload[col.inline_offset..col.inline_offset + col.inline_len];
            if col.ty.is_outrow() {
                let (len, ptr) = self.read_outrow_pair(inline, col);
                let bytes = self.fsm.vl.read_payload(ptr, len)?;
                out.push(col.ty.decode(inline, Some(&bytes), &self.ctx)?);
            } else {
                out.push(col.ty.decode(inline, None, &self.ctx)?);
            }
        }
        Ok(out)
    }

    pub fn get_by_name(&self, row: u64, columns: &[&str]) -> Result<Vec<Value>> {
        let indices = columns
            .iter()
            .map(|n| self.column_index(n))
            .collect::<Result<Vec<_>>>()?;
        self.get(row, &indices)
    }

    /// Deletes `row`. Fails with `Status::Constraint` if any other row
    /// still references it. Returns the `Decr` changes the caller owes
    /// to every table this row referenced.
    pub fn delete(&self, sink: &dyn RecordSink, row: u64) -> Result<Vec<RefChange>> {
        self.fsm.fl.check_live(row)?;
        if self.fsm.fl.read_refcount(row)? > 0 {
            return Err(AcdpError::new(
                Status::Constraint,
                Some("cannot delete a row with incoming references"),
            ));
        }
        let payload = self.fsm.fl.read_payload(row)?;
        let mut changes = vec![];
        for col in &self.columns {
            if let Some(bit) = col.null_bit {
                if Self::get_null_bit(&payload[..self.bitmap_bytes], bit) {
                    continue;
                }
            }
            let inline = &payload[col.inline_offset..col.inline_offset + col.inline_len];
            // Outrow columns need their VL payload read (for reference
            // decoding) before the block is freed.
            let outrow_payload = if col.ty.is_outrow() {
                let (len, ptr) = self.read_outrow_pair(inline, col);
                Some(self.fsm.vl.read_payload(ptr, len)?)
            } else {
                None
            };
            if let Some(table) = col.ty.referenced_table() {
                let value = col.ty.decode(inline, outrow_payload.as_deref(), &self.ctx)?;
                for target_row in ColumnType::references_in(&value) {
                    changes.push(RefChange {
                        table: table.to_owned(),
                        row: target_row,
                        incr: false,
                    });
                }
            }
            if col.ty.is_outrow() {
                let (_, ptr) = self.read_outrow_pair(inline, col);
                self.fsm.vl.free(sink, self.table_id, ptr)?;
            }
        }
        self.fsm.fl.free(sink, self.table_id, row)?;
        Ok(changes)
    }

    /// Updates a subset of `row`'s columns. `changes` is `(column_index,
    /// new_value)`. Returns the `RefChange`s the caller owes for the
    /// difference between old and new reference sets.
    pub fn update(
        &self,
        sink: &dyn RecordSink,
        row: u64,
        changes: &[(usize, Value)],
    ) -> Result<Vec<RefChange>> {
        self.fsm.fl.check_live(row)?;
        let mut ref_changes = vec![];
        for (idx, new_value) in changes {
            let col = self.columns.get(*idx).ok_or_else(|| {
                AcdpError::new(Status::Usage, Some("column index out of range"))
            })?;

            // Decode the old value first, to diff references and to
            // free its VL block if reallocating.
            let old_inline = self
                .fsm
                .fl
                .read_payload_range(row, col.inline_offset, col.inline_len)?;
            let old_bitmap_byte = self
                .fsm
                .fl
                .read_payload_range(row, col.null_bit.map(|b| b / 8).unwrap_or(0), 1)?;
            let old_is_null = col
                .null_bit
                .map(|b| Self::get_null_bit(&old_bitmap_byte, b % 8))
                .unwrap_or(false);
            let old_payload = if col.ty.is_outrow() && !old_is_null {
                let (len, ptr) = self.read_outrow_pair(&old_inline, col);
                Some(self.fsm.vl.read_payload(ptr, len)?)
            } else {
                None
            };
            let old_value = if old_is_null {
                Value::Null
            } else {
                col.ty.decode(&old_inline, old_payload.as_deref(), &self.ctx)?
            };

            if let Some(table) = col.ty.referenced_table() {
                for target_row in ColumnType::references_in(&old_value) {
                    ref_changes.push(RefChange { table: table.to_owned(), row: target_row, incr: false });
                }
            }

            // Write the null bit for this column, regardless of scheme.
            if let Some(bit) = col.null_bit {
                let mut byte = old_bitmap_byte.clone();
                Self::set_null_bit(&mut byte, bit % 8, matches!(new_value, Value::Null));
                self.fsm
                    .fl
                    .write_payload_range(sink, self.table_id, row, bit / 8, &byte)?;
            }

            match col.ty.encode(new_value, &self.ctx)? {
                Encoded::Inline(bytes) => {
                    // The only way an outrow-typed column encodes to
                    // Inline is a Null value (see codec::encode) — free
                    // the block it used to own so it isn't orphaned.
                    if col.ty.is_outrow() && !old_is_null {
                        let (_, old_ptr) = self.read_outrow_pair(&old_inline, col);
                        self.fsm.vl.free(sink, self.table_id, old_ptr)?;
                    }
                    self.fsm
                        .fl
                        .write_payload_range(sink, self.table_id, row, col.inline_offset, &bytes)?;
                }
                Encoded::Outrow(bytes) => {
                    let old_len = old_payload.as_ref().map(|p| p.len() as u64).unwrap_or(0);
                    let new_len = bytes.len() as u64;
                    let ptr = if !old_is_null && old_len == new_len {
                        // In-place rule: the new payload is exactly the
                        // same length as the block already holding it,
                        // so the existing VL block is reused untouched
                        // (a different length would violate the VL
                        // invariant that a live block's capacity equals
                        // its owner's inline length exactly; see
                        // DESIGN.md).
                        let (_, ptr) = self.read_outrow_pair(&old_inline, col);
                        ptr
                    } else {
                        if !old_is_null {
                            let (_, old_ptr) = self.read_outrow_pair(&old_inline, col);
                            self.fsm.vl.free(sink, self.table_id, old_ptr)?;
                        }
                        self.fsm.vl.alloc(sink, self.table_id, new_len)?
                    };
                    self.fsm.vl.write_payload(sink, self.table_id, ptr, &bytes)?;
                    let mut inline_buf = vec![0u8; col.inline_len];
                    self.write_outrow_pair(&mut inline_buf, 0, col, new_len, ptr)?;
                    self.fsm
                        .fl
                        .write_payload_range(sink, self.table_id, row, col.inline_offset, &inline_buf)?;
                }
            }

            if !matches!(new_value, Value::Null) {
                if let Some(table) = col.ty.referenced_table() {
                    for target_row in ColumnType::references_in(new_value) {
                        ref_changes.push(RefChange { table: table.to_owned(), row: target_row, incr: true });
                    }
                }
            }
        }
        Ok(ref_changes)
    }

    /// Every live row's slot index, from `start` onward (gaps skipped).
    pub fn live_refs_from(&self, start: u64) -> Result<Vec<u64>> {
        self.fsm.fl.iter_live_from(start)
    }

    /// A lazy sequence of `(row, values)` over every live row, gaps
    /// skipped, reading the requested columns one row at a time. The set
    /// of rows visited is fixed at creation; nothing is locked between
    /// `next()` calls, so a caller iterating alongside concurrent writers
    /// must wrap the whole iteration in a read zone itself.
    pub fn iterator(&self, columns: &[usize]) -> Result<RowIterator<'_>> {
        self.iterator_from(1, columns)
    }

    pub fn iterator_from(&self, start_ref: u64, columns: &[usize]) -> Result<RowIterator<'_>> {
        let refs = self.fsm.fl.iter_live_from(start_ref)?;
        Ok(RowIterator {
            table: self,
            refs: refs.into_iter(),
            columns: columns.to_vec(),
        })
    }

    /// Requires every row in the table to have `refcount == 0` (no
    /// inbound references from any other live row anywhere in the
    /// database — checkable locally because the refcount header lives
    /// on the row itself). Resets both files to empty.
    pub fn truncate(&self) -> Result<()> {
        for row in self.fsm.fl.iter_live_from(1)? {
            if self.fsm.fl.read_refcount(row)? > 0 {
                return Err(AcdpError::new(
                    Status::Constraint,
                    Some("cannot truncate a table with incoming references"),
                ));
            }
        }
        self.fsm.fl.truncate()?;
        self.fsm.vl.truncate()
    }

    /// VL compaction: relocates payload blocks and patches this table's
    /// own inline pointers. Entirely local — VL pointers never cross a
    /// table boundary.
    pub fn compact_vl(&self, sink: &dyn RecordSink) -> Result<()> {
        let moves = self.fsm.vl.compact()?;
        if moves.is_empty() {
            return Ok(());
        }
        for row in self.fsm.fl.iter_live_from(1)? {
            let payload = self.fsm.fl.read_payload(row)?;
            for col in &self.columns {
                if !col.ty.is_outrow() {
                    continue;
                }
                if let Some(bit) = col.null_bit {
                    if Self::get_null_bit(&payload[..self.bitmap_bytes], bit) {
                        continue;
                    }
                }
                let inline = &payload[col.inline_offset..col.inline_offset + col.inline_len];
                let (len, ptr) = self.read_outrow_pair(inline, col);
                if let Some(&(_, new_ptr)) = moves.iter().find(|(old, _)| *old == ptr) {
                    let mut buf = vec![0u8; col.inline_len];
                    self.write_outrow_pair(&mut buf, 0, col, len, new_ptr)?;
                    self.fsm
                        .fl
                        .write_payload_range(sink, self.table_id, row, col.inline_offset, &buf)?;
                }
            }
        }
        Ok(())
    }

    /// FL compaction: shifts rows down to remove gaps and returns the
    /// `old -> new` slot index map. Invalidates outstanding references;
    /// the caller (`Database`) must call `rewrite_references` on every
    /// table that references this one, including this table itself.
    pub fn compact_fl(&self) -> Result<Vec<(u64, u64)>> {
        self.fsm.fl.compact()
    }

    /// Rewrites every `Ref`/`RefArray` column of this table whose
    /// declared `refdTable == referenced_table` according to `moves`
    /// (produced by that table's `compact_fl`).
    pub fn rewrite_references(
        &self,
        sink: &dyn RecordSink,
        referenced_table: &str,
        moves: &[(u64, u64)],
    ) -> Result<()> {
        if moves.is_empty() {
            return Ok(());
        }
        for row in self.fsm.fl.iter_live_from(1)? {
            let payload = self.fsm.fl.read_payload(row)?;
            for col in &self.columns {
                if col.ty.referenced_table() != Some(referenced_table) {
                    continue;
                }
                if let Some(bit) = col.null_bit {
                    if Self::get_null_bit(&payload[..self.bitmap_bytes], bit) {
                        continue;
                    }
                }
                let inline = payload[col.inline_offset..col.inline_offset + col.inline_len].to_vec();
                let outrow_payload = if col.ty.is_outrow() {
                    let (len, ptr) = self.read_outrow_pair(&inline, col);
                    Some(self.fsm.vl.read_payload(ptr, len)?)
                } else {
                    None
                };
                let old_value = col.ty.decode(&inline, outrow_payload.as_deref(), &self.ctx)?;
                let rewrite = |r: u64| moves.iter().find(|(old, _)| *old == r).map(|(_, n)| *n).unwrap_or(r);
                let new_value = match old_value {
                    Value::Ref(r) => Value::Ref(rewrite(r)),
                    Value::RefArray(rs) => Value::RefArray(rs.into_iter().map(rewrite).collect()),
                    other => other,
                };
                match col.ty.encode(&new_value, &self.ctx)? {
                    Encoded::Inline(bytes) => {
                        self.fsm
                            .fl
                            .write_payload_range(sink, self.table_id, row, col.inline_offset, &bytes)?;
                    }
                    Encoded::Outrow(bytes) => {
                        // A RefArray's element count never changes from a
                        // reference rewrite, so the encoded length — and
                        // thus the existing VL block — stays the same;
                        // only its contents need rewriting.
                        let (_, ptr) = self.read_outrow_pair(&inline, col);
                        self.fsm.vl.write_payload(sink, self.table_id, ptr, &bytes)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn incr_refcount(&self, sink: &dyn RecordSink, row: u64) -> Result<()> {
        self.fsm.fl.check_live(row)?;
        self.fsm.fl.incr_refcount(sink, self.table_id, row)?;
        Ok(())
    }

    pub fn decr_refcount(&self, sink: &dyn RecordSink, row: u64) -> Result<()> {
        self.fsm.fl.check_live(row)?;
        self.fsm.fl.decr_refcount(sink, self.table_id, row)?;
        Ok(())
    }

    pub fn force_write(&self) -> Result<()> {
        self.fsm.force_write()
    }

    pub fn rebuild(&self) -> Result<()> {
        self.fsm.rebuild()
    }

    /// Undoes one recorder entry addressed at this table, for unit
    /// rollback and crash recovery. Does not rebuild the FSM index;
    /// callers batch many of these and call `rebuild()` once at the end.
    pub fn apply_inverse(&self, kind: FileKind, offset: u64, op: &RecordOp) -> Result<()> {
        self.fsm.apply_inverse(kind, offset, op)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Applies `colvals` to every live row in slot order (§4.6). A plain
    /// sequential scan: each row's update is independent, so a partial
    /// failure leaves earlier rows changed and later ones untouched
    /// unless the caller wraps the whole call in a unit.
    pub fn update_all(&self, sink: &dyn RecordSink, colvals: &[(usize, Value)]) -> Result<Vec<RefChange>> {
        let mut all = vec![];
        for row in self.fsm.fl.iter_live_from(1)? {
            all.extend(self.update(sink, row, colvals)?);
        }
        Ok(all)
    }

    /// Like `update_all`, but the new value for `column` is computed per
    /// row from its slot index rather than supplied once.
    pub fn update_all_supply_values(
        &self,
        sink: &dyn RecordSink,
        column: usize,
        supplier: &dyn Fn(u64) -> Value,
    ) -> Result<Vec<RefChange>> {
        let mut all = vec![];
        for row in self.fsm.fl.iter_live_from(1)? {
            let value = supplier(row);
            all.extend(self.update(sink, row, &[(column, value)])?);
        }
        Ok(all)
    }

    /// Like `update_all_supply_values`, but `changer` derives the new
    /// value from the row's current value in `column`. §9 recommends
    /// running this inside an implicit unit so a `changer` failure
    /// partway through the scan rolls back the rows already touched;
    /// `Unit::update_all_change_values` is where that wrapping happens.
    pub fn update_all_change_values(
        &self,
        sink: &dyn RecordSink,
        column: usize,
        changer: &dyn Fn(&Value) -> Result<Value>,
    ) -> Result<Vec<RefChange>> {
        let mut all = vec![];
        for row in self.fsm.fl.iter_live_from(1)? {
            let current = self.get(row, &[column])?.remove(0);
            let new_value = changer(&current)?;
            all.extend(self.update(sink, row, &[(column, new_value)])?);
        }
        Ok(all)
    }
}

/// Returned by [`TableStore::iterator`]/[`TableStore::iterator_from`].
pub struct RowIterator<'a> {
    table: &'a TableStore,
    refs: std::vec::IntoIter<u64>,
    columns: Vec<usize>,
}

impl Iterator for RowIterator<'_> {
    type Item = Result<(u64, Vec<Value>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.refs.next()?;
        Some(self.table.get(row, &self.columns).map(|values| (row, values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DatabaseLayout;
    use crate::recorder::NoRecordSink;
    use crate::storage::MemStorage;
    use std::path::PathBuf;

    const SINK: NoRecordSink = NoRecordSink;

    fn people_layout() -> TableLayout {
        let text = "name: t\nconsistencyNumber: 1\nrecFile: t.rec\ntables\n  people\n    columns\n      name\n        typeDesc: str:notnull:inrow:40:utf8\n      age\n        typeDesc: i1:null:inrow:0\n    store\n      flDataFile: people.fl\n      vlDataFile: people.vl\n      nobsRowRef: 3\n      nobsOutrowPtr: 3\n      nobsRefCount: 2\n";
        DatabaseLayout::parse(text).unwrap().tables.into_iter().next().unwrap()
    }

    fn open_store() -> TableStore {
        let storage = MemStorage::new();
        TableStore::open(0, &people_layout(), &storage, &PathBuf::from("/db")).unwrap()
    }

    #[test]
    fn insert_then_get_round_trips_values() {
        let store = open_store();
        let (row, changes) = store
            .insert(&SINK, &[Value::Str("alice".into()), Value::Int(30)])
            .unwrap();
        assert_eq!(row, 1);
        assert!(changes.is_empty());
        let got = store.get(row, &[0, 1]).unwrap();
        assert_eq!(got, vec![Value::Str("alice".into()), Value::Int(30)]);
    }

    #[test]
    fn null_age_round_trips_as_null() {
        let store = open_store();
        let (row, _) = store.insert(&SINK, &[Value::Str("bob".into()), Value::Null]).unwrap();
        let got = store.get(row, &[1]).unwrap();
        assert_eq!(got, vec![Value::Null]);
    }

    #[test]
    fn delete_then_insert_reuses_gap() {
        let store = open_store();
        let (r1, _) = store.insert(&SINK, &[Value::Str("a".into()), Value::Null]).unwrap();
        let (r2, _) = store.insert(&SINK, &[Value::Str("b".into()), Value::Null]).unwrap();
        store.delete(&SINK, r1).unwrap();
        let (r3, _) = store.insert(&SINK, &[Value::Str("c".into()), Value::Null]).unwrap();
        assert_eq!(r3, r1);
        let _ = r2;
    }

    #[test]
    fn update_changes_a_single_column_in_place() {
        let store = open_store();
        let (row, _) = store.insert(&SINK, &[Value::Str("a".into()), Value::Int(1)]).unwrap();
        store.update(&SINK, row, &[(1, Value::Int(2))]).unwrap();
        assert_eq!(store.get(row, &[1]).unwrap(), vec![Value::Int(2)]);
        assert_eq!(store.get(row, &[0]).unwrap(), vec![Value::Str("a".into())]);
    }

    #[test]
    fn update_all_touches_every_live_row() {
        let store = open_store();
        store.insert(&SINK, &[Value::Str("a".into()), Value::Int(1)]).unwrap();
        store.insert(&SINK, &[Value::Str("b".into()), Value::Int(2)]).unwrap();
        store.update_all(&SINK, &[(1, Value::Int(9))]).unwrap();
        assert_eq!(store.get(1, &[1]).unwrap(), vec![Value::Int(9)]);
        assert_eq!(store.get(2, &[1]).unwrap(), vec![Value::Int(9)]);
    }

    #[test]
    fn update_all_change_values_derives_from_current_value() {
        let store = open_store();
        store.insert(&SINK, &[Value::Str("a".into()), Value::Int(1)]).unwrap();
        store.insert(&SINK, &[Value::Str("b".into()), Value::Int(2)]).unwrap();
        store
            .update_all_change_values(
                &SINK,
                1,
                &|v| match v {
                    Value::Int(n) => Ok(Value::Int(n + 10)),
                    other => Ok(other.clone()),
                },
            )
            .unwrap();
        assert_eq!(store.get(1, &[1]).unwrap(), vec![Value::Int(11)]);
        assert_eq!(store.get(2, &[1]).unwrap(), vec![Value::Int(12)]);
    }

    #[test]
    fn iterator_skips_gaps_and_yields_requested_columns() {
        let store = open_store();
        store.insert(&SINK, &[Value::Str("a".into()), Value::Int(1)]).unwrap();
        let (r2, _) = store.insert(&SINK, &[Value::Str("b".into()), Value::Int(2)]).unwrap();
        store.insert(&SINK, &[Value::Str("c".into()), Value::Int(3)]).unwrap();
        store.delete(&SINK, r2).unwrap();

        let rows: Vec<(u64, Vec<Value>)> = store
            .iterator(&[1])
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![(1, vec![Value::Int(1)]), (3, vec![Value::Int(3)])]
        );
    }

    #[test]
    fn truncate_rejects_referenced_rows() {
        let text = "name: t\nconsistencyNumber: 1\nrecFile: t.rec\ntables\n  p\n    columns\n      next\n        typeDesc: ref:null:inrow:0\n        refdTable: p\n    store\n      flDataFile: p.fl\n      nobsRowRef: 2\n      nobsOutrowPtr: 2\n      nobsRefCount: 2\n";
        let layout = DatabaseLayout::parse(text).unwrap().tables.into_iter().next().unwrap();
        let storage = MemStorage::new();
        let store = TableStore::open(0, &layout, &storage, &PathBuf::from("/db")).unwrap();
        let (r1, _) = store.insert(&SINK, &[Value::Null]).unwrap();
        let (_, changes) = store.insert(&SINK, &[Value::Ref(r1)]).unwrap();
        assert_eq!(changes.len(), 1);
        store.incr_refcount(&SINK, r1).unwrap();
        assert!(store.truncate().is_err());
    }
}
