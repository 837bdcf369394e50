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

//! Database lifecycle (§4.7): owns the process-level lock, the single
//! recorder, the sync manager, and one `TableStore` per table named in
//! the layout file. Opening a database also runs crash recovery: any
//! record left in the recorder file by a prior session cannot be proven
//! durably committed (the committed/pending distinction lives only in
//! memory, see `recorder` module docs), so `open` undoes every leftover
//! record before the database is usable, the same way `Unit::close`
//! undoes an uncommitted unit's writes.

use crate::cipher::{verify_challenge, CipherFactory};
use crate::codec::Value;
use crate::layout::DatabaseLayout;
use crate::logger::ensure_default_logger;
use crate::options::DbOptions;
use crate::recorder::{Record, Recorder};
use crate::storage::{FileLock, Storage};
use crate::sync_mgr::SyncManager;
use crate::table::TableStore;
use crate::unit::Unit;
use crate::util::coding::decode_hex;
use crate::util::status::{AcdpError, Result, Status};
use log::{error, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Hook for WR→RO conversion (§4.7). The RO file format itself is out of
/// scope, so `Database` only coordinates visiting every table's live rows,
/// in slot order, and handing them to whatever converter assembles the RO
/// file; it never writes RO bytes itself.
pub trait RoConverter {
    fn begin_table(&mut self, name: &str, columns: &[&str]) -> Result<()>;
    fn row(&mut self, row: u64, values: &[Value]) -> Result<()>;
    fn end_table(&mut self) -> Result<()>;
}

pub struct Database {
    layout: DatabaseLayout,
    storage: Arc<dyn Storage>,
    sync_mgr: SyncManager,
    recorder: Recorder,
    tables: Vec<TableStore>,
    table_index: HashMap<String, usize>,
    lock: Mutex<Option<Box<dyn FileLock>>>,
    read_only: bool,
    /// Set once recovery or a live operation hits a durability failure or
    /// genuine corruption. Every public operation refuses to run while
    /// this is set; the only way out is to drop this handle and reopen.
    broken: AtomicBool,
}

impl Database {
    /// Opens the database described by the layout file at `layout_path`.
    /// Every other path the layout names (`recFile`, each table's
    /// `flDataFile`/`vlDataFile`) is resolved relative to
    /// `layout_path`'s parent directory, per §6 (the layout file names
    /// no fixed convention for where it itself lives).
    pub fn open(layout_path: &Path, storage: Arc<dyn Storage>, options: DbOptions) -> Result<Self> {
        ensure_default_logger();
        storage.set_open_mode(options.open_mode);
        let dir = layout_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file = storage.open(layout_path).map_err(|e| {
            AcdpError::with_source(Status::Usage, "could not open layout file", e)
        })?;
        let len = file.len()?;
        let bytes = file.read_at(0, len as usize)?;
        let text = String::from_utf8(bytes).map_err(|_| {
            AcdpError::new(Status::Corruption, Some("layout file is not valid UTF-8"))
        })?;
        Self::open_layout(&text, &dir, storage, options)
    }

    fn open_layout(
        layout_text: &str,
        dir: &Path,
        storage: Arc<dyn Storage>,
        options: DbOptions,
    ) -> Result<Self> {
        let layout = DatabaseLayout::parse(layout_text)?;
        let read_only = options.open_mode.is_read_only();

        if let Some(expected) = options.expected_consistency_number {
            if expected != layout.consistency_number {
                return Err(AcdpError::new(
                    Status::Consistency,
                    Some(&format!(
                        "schema-supplied consistency number {} does not match the layout's persisted {}",
                        expected, layout.consistency_number
                    )),
                ));
            }
        }

        let lock_path = dir.join(format!("{}.lock", layout.name));
        let lock = storage.lock(&lock_path, !read_only)?;

        if let Some(class_name) = &layout.cipher_factory_class_name {
            let factory: Arc<dyn CipherFactory> = options.cipher_factory.clone().ok_or_else(|| {
                AcdpError::new(
                    Status::Usage,
                    Some("layout requires a cipher factory but none was supplied in DbOptions"),
                )
            })?;
            let persisted = decode_hex(layout.cipher_challenge.as_deref().unwrap_or(""))?;
            verify_challenge(factory.as_ref(), &persisted)?;
            info!("database '{}': cipher challenge verified ({})", layout.name, class_name);
        }

        let force_write_commit = options
            .force_write_commit_override
            .unwrap_or(layout.force_write_commit);
        let rec_path = dir.join(&layout.rec_file);
        let rec_file = storage.create(&rec_path)?;
        let recorder = Recorder::open(rec_file, force_write_commit)?;

        let mut tables = vec![];
        let mut table_index = HashMap::new();
        for (id, table_layout) in layout.tables.iter().enumerate() {
            let store = TableStore::open(id as u32, table_layout, storage.as_ref(), dir)?;
            table_index.insert(store.name.clone(), tables.len());
            tables.push(store);
        }

        let db = Database {
            layout,
            storage,
            sync_mgr: SyncManager::new(),
            recorder,
            tables,
            table_index,
            lock: Mutex::new(Some(lock)),
            read_only,
            broken: AtomicBool::new(false),
        };
        db.recover()?;
        info!("database '{}': opened ({} table(s))", db.layout.name, db.tables.len());
        Ok(db)
    }

    /// Crash recovery (§4.3, §9): every record left in the recorder file
    /// from a prior session is undone, in reverse order, since none of
    /// them can be proven to have been durably committed. Afterward every
    /// table's FSM is rebuilt from the (now recovered) files and the
    /// recorder file is cleared.
    fn recover(&self) -> Result<()> {
        let records = self.recorder.recover().map_err(|e| {
            if e.status() == Status::Corruption {
                self.mark_broken();
            }
            e
        })?;
        if records.is_empty() {
            return Ok(());
        }
        info!(
            "database '{}': replaying {} leftover recorder record(s) from a prior session",
            self.layout.name,
            records.len()
        );
        for rec in records.iter().rev() {
            self.apply_inverse(rec)?;
        }
        for table in &self.tables {
            table.rebuild()?;
        }
        self.recorder.clear()
    }

    /// Marks the database broken and forces it into a closed state: no
    /// public operation succeeds again until the caller reopens it.
    /// Idempotent; only logs and shuts down the sync manager the first
    /// time it flips.
    pub(crate) fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::SeqCst) {
            error!(
                "database '{}': marking broken after a durability failure or corrupt record, forcing closed",
                self.layout.name
            );
            self.sync_mgr.shutdown();
        }
    }

    fn check_broken(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(AcdpError::new(
                Status::Durability,
                Some("database is broken and refuses further operations; reopen to recover"),
            ));
        }
        Ok(())
    }

    pub(crate) fn sync_mgr(&self) -> &SyncManager {
        &self.sync_mgr
    }

    pub(crate) fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub(crate) fn apply_inverse(&self, rec: &Record) -> Result<()> {
        self.tables[rec.table_id as usize].apply_inverse(rec.kind, rec.offset, &rec.op)
    }

    pub(crate) fn rebuild_table(&self, table_id: u32) -> Result<()> {
        self.tables[table_id as usize].rebuild()
    }

    pub fn table(&self, name: &str) -> Result<&TableStore> {
        self.check_broken()?;
        let idx = self.table_index.get(name).ok_or_else(|| {
            AcdpError::new(Status::Usage, Some(&format!("unknown table '{}'", name)))
        })?;
        Ok(&self.tables[*idx])
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Begins a root write unit. Rejected for a read-only open.
    pub fn begin_unit(&self) -> Result<Unit<'_>> {
        self.check_broken()?;
        if self.read_only {
            return Err(AcdpError::new(
                Status::Usage,
                Some("cannot begin a write unit on a read-only database"),
            ));
        }
        Unit::begin_root(self)
    }

    /// Acquires a read zone for the current thread, held for as long as
    /// the returned guard lives. Wrap `get`/iteration calls in one to get
    /// a consistent view across several calls (§4.6).
    pub fn read_zone(&self) -> Result<crate::sync_mgr::ReadZoneGuard<'_>> {
        self.check_broken()?;
        crate::sync_mgr::ReadZoneGuard::acquire(&self.sync_mgr)
    }

    pub fn number_of_rows(&self) -> Result<u64> {
        let mut total = 0u64;
        for t in &self.tables {
            total += t.row_count()?;
        }
        Ok(total)
    }

    /// Flushes every table's data files and the recorder to durable
    /// storage.
    pub fn force_write(&self) -> Result<()> {
        self.check_broken()?;
        self.sync_mgr.acquire_writer()?;
        let result = (|| {
            for t in &self.tables {
                t.force_write()?;
            }
            self.recorder.force_write()
        })();
        self.sync_mgr.release_writer();
        if let Err(e) = &result {
            if e.status() == Status::Durability {
                self.mark_broken();
            }
        }
        result
    }

    /// Runs a one-shot WR→RO conversion (§4.7) under a read zone: every
    /// table's live rows, in slot order, are hand off to `converter` one
    /// table at a time. Admissible concurrently with other read zones,
    /// excluded from writers for its duration, same as zip-backup.
    pub fn convert_to_ro(&self, converter: &mut dyn RoConverter) -> Result<()> {
        self.check_broken()?;
        let _zone = self.read_zone()?;
        for table in &self.tables {
            let columns = table.column_names();
            converter.begin_table(&table.name, &columns)?;
            let indices: Vec<usize> = (0..columns.len()).collect();
            for entry in table.iterator(&indices)? {
                let (row, values) = entry?;
                converter.row(row, &values)?;
            }
            converter.end_table()?;
        }
        Ok(())
    }

    /// VL compaction for one table: entirely local, no cross-table
    /// reference rewriting needed since VL pointers never cross a table
    /// boundary.
    pub fn compact_vl(&self, table: &str) -> Result<()> {
        self.check_broken()?;
        self.sync_mgr.acquire_writer()?;
        let result = self.table(table).and_then(|t| t.compact_vl(&crate::recorder::NoRecordSink));
        self.sync_mgr.release_writer();
        result
    }

    /// FL compaction for one table: relocates its rows, then rewrites
    /// every table's inbound references to the compacted table,
    /// including the compacted table's own self-references.
    pub fn compact_fl(&self, table: &str) -> Result<()> {
        self.check_broken()?;
        self.sync_mgr.acquire_writer()?;
        let result = (|| {
            let moves = self.table(table)?.compact_fl()?;
            if moves.is_empty() {
                return Ok(());
            }
            for t in &self.tables {
                t.rewrite_references(&crate::recorder::NoRecordSink, table, &moves)?;
            }
            Ok(())
        })();
        self.sync_mgr.release_writer();
        result
    }

    /// Truncates one table. Irreversible: `FlSpace::truncate`/
    /// `VlSpace::truncate` don't journal through the recorder, the same
    /// way compaction doesn't, so this cannot be undone by closing a
    /// unit — see DESIGN.md.
    pub fn truncate(&self, table: &str) -> Result<()> {
        self.check_broken()?;
        self.sync_mgr.acquire_writer()?;
        let result = self.table(table).and_then(|t| t.truncate());
        self.sync_mgr.release_writer();
        result
    }

    /// Closes the database: shuts down the sync manager (rejecting any
    /// further acquisition) and releases the process-level lock.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        info!("database '{}': closing", self.layout.name);
        self.sync_mgr.shutdown();
        if let Some(mut lock) = self.lock.lock().unwrap().take() {
            lock.close()?;
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

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
    fn open_creates_every_table_named_in_the_layout() {
        let db = open_db();
        assert_eq!(db.table_names(), vec!["people"]);
    }

    #[test]
    fn number_of_rows_sums_across_tables() {
        let db = open_db();
        {
            let unit = db.begin_unit().unwrap();
            unit.insert("people", &[Value::Str("a".into()), Value::Null]).unwrap();
            unit.insert("people", &[Value::Str("b".into()), Value::Null]).unwrap();
            unit.commit().unwrap();
        }
        assert_eq!(db.number_of_rows().unwrap(), 2);
    }

    #[test]
    fn read_only_open_rejects_begin_unit() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let layout_path = PathBuf::from("/db/t.layout");
        let f = storage.create(&layout_path).unwrap();
        f.write_at(0, layout_text().as_bytes()).unwrap();
        let mut options = DbOptions::new();
        options.open_mode = crate::options::OpenMode::ReadOnly;
        let db = Database::open(&layout_path, storage, options).unwrap();
        assert!(db.begin_unit().is_err());
    }

    #[test]
    fn recovery_undoes_leftover_recorder_records_on_reopen() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let layout_path = PathBuf::from("/db/t.layout");
        let f = storage.create(&layout_path).unwrap();
        f.write_at(0, layout_text().as_bytes()).unwrap();

        let row;
        {
            let db = Database::open(&layout_path, storage.clone(), DbOptions::new()).unwrap();
            let unit = db.begin_unit().unwrap();
            row = unit.insert("people", &[Value::Str("a".into()), Value::Null]).unwrap();
            unit.commit().unwrap();
            unit.close().unwrap();

            // Simulate a crash mid-unit: begin a second unit, write, and
            // leak its recorder records by forgetting the Unit without
            // closing it (so neither commit nor rollback runs). `db`
            // itself still drops normally below; its own `close()` only
            // shuts down the sync manager and releases the process
            // lock, it never touches the leaked unit's pending records.
            let leaked = db.begin_unit().unwrap();
            leaked
                .insert("people", &[Value::Str("b".into()), Value::Null])
                .unwrap();
            std::mem::forget(leaked);
        }

        let db2 = Database::open(&layout_path, storage, DbOptions::new()).unwrap();
        // The leaked insert never committed, so recovery must have rolled
        // it back: only the first, committed row survives.
        assert_eq!(db2.number_of_rows().unwrap(), 1);
        assert_eq!(
            db2.table("people").unwrap().get(row, &[0]).unwrap(),
            vec![Value::Str("a".into())]
        );
    }

    fn open_self_referencing_db() -> Database {
        let text = "name: t\nconsistencyNumber: 1\nrecFile: t.rec\ntables\n  p\n    columns\n      next\n        typeDesc: ref:null:inrow:0\n        refdTable: p\n    store\n      flDataFile: p.fl\n      nobsRowRef: 2\n      nobsOutrowPtr: 2\n      nobsRefCount: 2\n";
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let layout_path = PathBuf::from("/db/p.layout");
        let f = storage.create(&layout_path).unwrap();
        f.write_at(0, text.as_bytes()).unwrap();
        Database::open(&layout_path, storage, DbOptions::new()).unwrap()
    }

    #[test]
    fn delete_is_blocked_until_every_reference_is_cleared() {
        let db = open_self_referencing_db();
        let unit = db.begin_unit().unwrap();
        let r1 = unit.insert("p", &[Value::Null]).unwrap();
        let r2 = unit.insert("p", &[Value::Ref(r1)]).unwrap();
        let r3 = unit.insert("p", &[Value::Ref(r1)]).unwrap();
        unit.commit().unwrap();

        let err = unit.delete("p", r1).unwrap_err();
        assert_eq!(err.status(), crate::util::status::Status::Constraint);

        unit.update("p", r2, &[(0, Value::Null)]).unwrap();
        unit.update("p", r3, &[(0, Value::Null)]).unwrap();
        unit.delete("p", r1).unwrap();
        unit.commit().unwrap();
    }

    #[test]
    fn vl_compaction_round_trips_every_row_and_reclaims_space() {
        let text = "name: t\nconsistencyNumber: 1\nrecFile: t.rec\ntables\n  s\n    columns\n      text\n        typeDesc: str:notnull:outrow:1000:utf8\n    store\n      flDataFile: s.fl\n      vlDataFile: s.vl\n      nobsRowRef: 3\n      nobsOutrowPtr: 4\n      nobsRefCount: 2\n";
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let layout_path = PathBuf::from("/db/s.layout");
        let f = storage.create(&layout_path).unwrap();
        f.write_at(0, text.as_bytes()).unwrap();
        let db = Database::open(&layout_path, storage, DbOptions::new()).unwrap();

        let rows = {
            let unit = db.begin_unit().unwrap();
            let mut rows = vec![];
            for _ in 0..50 {
                let row = unit.insert("s", &[Value::Str("x".repeat(100))]).unwrap();
                rows.push(row);
            }
            unit.commit().unwrap();
            rows
        };
        {
            let unit = db.begin_unit().unwrap();
            for &row in &rows {
                unit.update("s", row, &[(0, Value::Str("y".repeat(10)))]).unwrap();
            }
            unit.commit().unwrap();
        }

        db.compact_vl("s").unwrap();
        for &row in &rows {
            assert_eq!(
                db.table("s").unwrap().get(row, &[0]).unwrap(),
                vec![Value::Str("y".repeat(10))]
            );
        }
    }

    struct RecordingConverter {
        tables: Vec<(String, Vec<(u64, Vec<Value>)>)>,
    }

    impl RoConverter for RecordingConverter {
        fn begin_table(&mut self, name: &str, _columns: &[&str]) -> Result<()> {
            self.tables.push((name.to_owned(), vec![]));
            Ok(())
        }

        fn row(&mut self, row: u64, values: &[Value]) -> Result<()> {
            self.tables.last_mut().unwrap().1.push((row, values.to_vec()));
            Ok(())
        }

        fn end_table(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn convert_to_ro_visits_every_live_row_of_every_table() {
        let db = open_db();
        {
            let unit = db.begin_unit().unwrap();
            unit.insert("people", &[Value::Str("a".into()), Value::Null]).unwrap();
            let gone = unit.insert("people", &[Value::Str("b".into()), Value::Null]).unwrap();
            unit.delete("people", gone).unwrap();
            unit.insert("people", &[Value::Str("c".into()), Value::Null]).unwrap();
            unit.commit().unwrap();
        }

        let mut converter = RecordingConverter { tables: vec![] };
        db.convert_to_ro(&mut converter).unwrap();

        assert_eq!(converter.tables.len(), 1);
        let (name, rows) = &converter.tables[0];
        assert_eq!(name, "people");
        assert_eq!(
            rows.iter().map(|(_, v)| v[0].clone()).collect::<Vec<_>>(),
            vec![Value::Str("a".into()), Value::Str("c".into())]
        );
    }
}
