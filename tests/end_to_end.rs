//! End-to-end coverage of spec §8's scenarios against real files on disk,
//! exercised entirely through the public crate API (no module-internal
//! access, unlike the `#[cfg(test)]` blocks colocated with each module).

use acdp::{Database, DbOptions, OpenMode, PosixStorage, Storage, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn people_layout() -> &'static str {
    "name: t\n\
     consistencyNumber: 1\n\
     recFile: t.rec\n\
     tables\n\
     \x20\x20people\n\
     \x20\x20\x20\x20columns\n\
     \x20\x20\x20\x20\x20\x20name\n\
     \x20\x20\x20\x20\x20\x20\x20\x20typeDesc: str:notnull:inrow:40:utf8\n\
     \x20\x20\x20\x20\x20\x20age\n\
     \x20\x20\x20\x20\x20\x20\x20\x20typeDesc: i1:null:inrow:0\n\
     \x20\x20\x20\x20store\n\
     \x20\x20\x20\x20\x20\x20flDataFile: people.fl\n\
     \x20\x20\x20\x20\x20\x20vlDataFile: people.vl\n\
     \x20\x20\x20\x20\x20\x20nobsRowRef: 3\n\
     \x20\x20\x20\x20\x20\x20nobsOutrowPtr: 3\n\
     \x20\x20\x20\x20\x20\x20nobsRefCount: 2\n"
}

fn open(dir: &TempDir) -> (Database, PathBuf, Arc<dyn Storage>) {
    let storage: Arc<dyn Storage> = Arc::new(PosixStorage::new());
    let layout_path = dir.path().join("t.layout");
    let f = storage.create(&layout_path).unwrap();
    f.write_at(0, people_layout().as_bytes()).unwrap();
    let db = Database::open(&layout_path, storage.clone(), DbOptions::new()).unwrap();
    (db, layout_path, storage)
}

#[test]
fn insert_commit_then_get_under_a_read_zone() {
    let dir = TempDir::new().unwrap();
    let (db, _, _) = open(&dir);

    let row = {
        let unit = db.begin_unit().unwrap();
        let row = unit
            .insert("people", &[Value::Str("alice".into()), Value::Int(30)])
            .unwrap();
        unit.commit().unwrap();
        row
    };

    let _zone = db.read_zone().unwrap();
    assert_eq!(
        db.table("people").unwrap().get(row, &[0, 1]).unwrap(),
        vec![Value::Str("alice".into()), Value::Int(30)]
    );
}

#[test]
fn close_without_commit_leaves_the_table_empty() {
    let dir = TempDir::new().unwrap();
    let (db, _, _) = open(&dir);
    {
        let unit = db.begin_unit().unwrap();
        unit.insert("people", &[Value::Str("bob".into()), Value::Null]).unwrap();
    }
    assert_eq!(db.number_of_rows().unwrap(), 0);
}

#[test]
fn a_database_survives_a_reopen_across_process_boundaries() {
    let dir = TempDir::new().unwrap();
    let layout_path;
    let storage: Arc<dyn Storage> = Arc::new(PosixStorage::new());
    {
        let p = dir.path().join("t.layout");
        let f = storage.create(&p).unwrap();
        f.write_at(0, people_layout().as_bytes()).unwrap();
        layout_path = p;
    }
    {
        let db = Database::open(&layout_path, storage.clone(), DbOptions::new()).unwrap();
        let unit = db.begin_unit().unwrap();
        unit.insert("people", &[Value::Str("carol".into()), Value::Int(41)]).unwrap();
        unit.commit().unwrap();
    }
    let db2 = Database::open(&layout_path, storage, DbOptions::new()).unwrap();
    assert_eq!(db2.number_of_rows().unwrap(), 1);
    assert_eq!(
        db2.table("people").unwrap().get(1, &[0, 1]).unwrap(),
        vec![Value::Str("carol".into()), Value::Int(41)]
    );
}

#[test]
fn read_only_reopen_rejects_writes_but_allows_reads() {
    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(PosixStorage::new());
    let layout_path = dir.path().join("t.layout");
    let f = storage.create(&layout_path).unwrap();
    f.write_at(0, people_layout().as_bytes()).unwrap();
    {
        let db = Database::open(&layout_path, storage.clone(), DbOptions::new()).unwrap();
        let unit = db.begin_unit().unwrap();
        unit.insert("people", &[Value::Str("dana".into()), Value::Null]).unwrap();
        unit.commit().unwrap();
    }

    let mut ro_options = DbOptions::new();
    ro_options.open_mode = OpenMode::ReadOnly;
    let ro_db = Database::open(&layout_path, storage, ro_options).unwrap();
    assert!(ro_db.begin_unit().is_err());
    assert_eq!(
        ro_db.table("people").unwrap().get(1, &[0]).unwrap(),
        vec![Value::Str("dana".into())]
    );
}
