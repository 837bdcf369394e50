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

//! Unit (§4.5): the nested atomic write scope. A `Unit` is both the
//! [`RecordSink`] every table-level mutation journals through and the
//! handle a caller commits or lets roll back. Closing is idempotent —
//! once via an explicit `close()`/`Drop`, whichever comes first — and an
//! uncommitted unit rolls back its own writes without touching anything
//! an ancestor or a sibling already committed.

use crate::codec::Value;
use crate::db::Database;
use crate::recorder::{FileKind, RecordOp, RecordSink};
use crate::table::RefChange;
use crate::util::status::{Result, Status};
use log::{debug, warn};
use std::cell::Cell;
use std::collections::HashSet;

pub struct Unit<'a> {
    db: &'a Database,
    id: u64,
    closed: Cell<bool>,
}

impl<'a> Unit<'a> {
    /// Acquires the writer slot and begins a root unit. Only `Database`
    /// calls this; nested units go through `begin_nested`.
    pub(crate) fn begin_root(db: &'a Database) -> Result<Self> {
        db.sync_mgr().acquire_writer()?;
        let id = db.recorder().begin_unit(None);
        debug!("unit {}: began as root", id);
        Ok(Unit {
            db,
            id,
            closed: Cell::new(false),
        })
    }

    /// Begins a unit nested inside this one. Reentrant on the writer slot
    /// (same thread), so the nested unit can run freely while this one is
    /// still open.
    pub fn begin_nested(&self) -> Result<Unit<'a>> {
        self.db.sync_mgr().acquire_writer()?;
        let id = self.db.recorder().begin_unit(Some(self.id));
        debug!("unit {}: began nested under {}", id, self.id);
        Ok(Unit {
            db: self.db,
            id,
            closed: Cell::new(false),
        })
    }

    pub fn table(&self, name: &str) -> Result<&'a crate::table::TableStore> {
        self.db.table(name)
    }

    /// Inserts a row and applies the resulting reference-count deltas to
    /// whichever tables they target.
    pub fn insert(&self, table: &str, values: &[Value]) -> Result<u64> {
        let (row, changes) = self.db.table(table)?.insert(self, values)?;
        self.apply_ref_changes(&changes)?;
        Ok(row)
    }

    pub fn delete(&self, table: &str, row: u64) -> Result<()> {
        let changes = self.db.table(table)?.delete(self, row)?;
        self.apply_ref_changes(&changes)
    }

    pub fn update(&self, table: &str, row: u64, changes: &[(usize, Value)]) -> Result<()> {
        let ref_changes = self.db.table(table)?.update(self, row, changes)?;
        self.apply_ref_changes(&ref_changes)
    }

    pub fn update_all(&self, table: &str, colvals: &[(usize, Value)]) -> Result<()> {
        let changes = self.db.table(table)?.update_all(self, colvals)?;
        self.apply_ref_changes(&changes)
    }

    pub fn update_all_supply_values(
        &self,
        table: &str,
        column: usize,
        supplier: &dyn Fn(u64) -> Value,
    ) -> Result<()> {
        let changes = self.db.table(table)?.update_all_supply_values(self, column, supplier)?;
        self.apply_ref_changes(&changes)
    }

    /// Runs `update_all_change_values` inside its own nested unit: a
    /// `changer` failure partway through the scan rolls back only the
    /// rows this call touched, not the whole enclosing unit (§9's
    /// recommendation for this operation).
    pub fn update_all_change_values(
        &self,
        table: &str,
        column: usize,
        changer: &dyn Fn(&Value) -> Result<Value>,
    ) -> Result<()> {
        let nested = self.begin_nested()?;
        let outcome = (|| {
            let changes = nested.db.table(table)?.update_all_change_values(&nested, column, changer)?;
            nested.apply_ref_changes(&changes)
        })();
        match outcome {
            Ok(()) => {
                nested.commit()?;
                nested.close()
            }
            Err(e) => {
                let _ = nested.close();
                Err(e)
            }
        }
    }

    fn apply_ref_changes(&self, changes: &[RefChange]) -> Result<()> {
        for change in changes {
            let target = self.db.table(&change.table)?;
            if change.incr {
                target.incr_refcount(self, change.row)?;
            } else {
                target.decr_refcount(self, change.row)?;
            }
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        debug!("unit {}: committing", self.id);
        self.db.recorder().commit_unit(self.id).map_err(|e| {
            if e.status() == Status::Durability {
                self.db.mark_broken();
            }
            e
        })
    }

    /// Closes the unit: rolls back whatever is still pending (everything,
    /// unless `commit()` was called first), then releases the writer
    /// slot. Idempotent — a second call is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.replace(true) {
            return Ok(());
        }
        let pending = self.db.recorder().rollback_and_close_unit(self.id)?;
        if pending.is_empty() {
            debug!("unit {}: closed with nothing to roll back", self.id);
        } else {
            warn!("unit {}: rolling back {} uncommitted write(s)", self.id, pending.len());
        }
        let mut touched = HashSet::new();
        for rec in pending.iter().rev() {
            self.db.apply_inverse(rec)?;
            touched.insert(rec.table_id);
        }
        for table_id in touched {
            self.db.rebuild_table(table_id)?;
        }
        self.db.sync_mgr().release_writer();
        Ok(())
    }
}

impl RecordSink for Unit<'_> {
    fn record(&self, kind: FileKind, table_id: u32, offset: u64, op: RecordOp) -> Result<()> {
        self.db.recorder().record(self.id, kind, table_id, offset, op).map_err(|e| {
            if e.status() == Status::Durability {
                self.db.mark_broken();
            }
            e
        })
    }
}

impl Drop for Unit<'_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::options::DbOptions;
    use crate::storage::{MemStorage, Storage};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn layout_text() -> &'static str {
        "name: t\nconsistencyNumber: 1\nrecFile: t.rec\ntables\n  people\n    columns\n      name\n        typeDesc: str:notnull:inrow:40:utf8\n      age\n        typeDesc: i1:null:inrow:0\n    store\n      flDataFile: people.fl\n      vlDataFile: people.vl\n      nobsRowRef: 3\n      nobsOutrowPtr: 3\n      nobsRefCount: 2\n"
    }

    fn open_db() -> Database {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let layout_path = PathBuf::from("/db/t.layout");
        let f = storage.create(&layout_path).unwrap();
        f.write_at(0, layout_text().as_bytes()).unwrap();
        Database::open(&layout_path, storage, DbOptions::new()).unwrap()
    }

    #[test]
    fn commit_keeps_the_insert() {
        let db = open_db();
        let row;
        {
            let unit = db.begin_unit().unwrap();
            row = unit.insert("people", &[Value::Str("alice".into()), Value::Null]).unwrap();
            unit.commit().unwrap();
        }
        assert_eq!(
            db.table("people").unwrap().get(row, &[0]).unwrap(),
            vec![Value::Str("alice".into())]
        );
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let db = open_db();
        {
            let unit = db.begin_unit().unwrap();
            unit.insert("people", &[Value::Str("bob".into()), Value::Null]).unwrap();
        }
        assert_eq!(db.table("people").unwrap().row_count().unwrap(), 0);
    }

    #[test]
    fn nested_unit_partial_commit_only_keeps_committed_work() {
        let db = open_db();
        {
            let outer = db.begin_unit().unwrap();
            let r1 = outer.insert("people", &[Value::Str("a".into()), Value::Null]).unwrap();
            outer.commit().unwrap();
            {
                let inner = outer.begin_nested().unwrap();
                inner.insert("people", &[Value::Str("b".into()), Value::Null]).unwrap();
                // inner is dropped without commit: its insert rolls back.
            }
            let _ = r1;
        }
        assert_eq!(db.table("people").unwrap().row_count().unwrap(), 1);
    }
}
