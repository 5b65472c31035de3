mod common;

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
};

use common::*;
use mini_db::{
    recovery::double_write::checksum,
    stmt::{Assignment, DeleteStmt, UpdateStmt},
    storage::page::{PAGE_CHECKSUM_SIZE, PAGE_SIZE},
    CacheKind, DbError, Engine, OpenMode, Options, Value,
};

/// Commit, clean close, reopen: the row comes back from disk alone.
#[test]
fn test_committed_data_survives_clean_restart() {
    let (engine, dir) = new_engine();
    create_student_table(&engine);

    let xid = engine.begin().unwrap();
    insert_student(&engine, xid, 1, "tom");
    engine
        .update(
            xid,
            &UpdateStmt {
                table_name: "student".to_string(),
                assignments: vec![Assignment {
                    column: "name".to_string(),
                    value: Value::Text("sam".to_string()),
                }],
                filter: id_eq(1),
            },
        )
        .unwrap();
    engine.commit(xid).unwrap();
    engine.close().unwrap();
    drop(engine);

    let engine = reopen(&dir);
    let rows = select_students(&engine, 0, id_eq(1));
    assert_eq!(rows, vec![student_row(1, "sam")]);
    // the dead version stayed dead across the restart
    assert_eq!(select_students(&engine, 0, None).len(), 1);
    engine.close().unwrap();
}

#[test]
fn test_delete_survives_restart() {
    let (engine, dir) = new_engine();
    create_student_table(&engine);

    insert_student(&engine, 0, 1, "tom");
    insert_student(&engine, 0, 2, "bob");
    engine
        .delete(
            0,
            &DeleteStmt {
                table_name: "student".to_string(),
                filter: id_eq(1),
            },
        )
        .unwrap();
    engine.close().unwrap();
    drop(engine);

    let engine = reopen(&dir);
    assert!(select_students(&engine, 0, id_eq(1)).is_empty());
    assert_eq!(select_students(&engine, 0, None), vec![student_row(2, "bob")]);
}

/// Kill the process with dirty pages still in cache: redo replay
/// restores every committed row, and rows of the transaction that
/// never committed stay invisible.
#[test]
fn test_redo_replay_after_crash() {
    let (engine, dir) = new_engine();
    create_student_table(&engine);

    let committed = engine.begin().unwrap();
    for i in 0..200i64 {
        insert_student(&engine, committed, i, &format!("name-{}", i));
    }
    engine.commit(committed).unwrap();

    let in_flight = engine.begin().unwrap();
    for i in 200..300i64 {
        insert_student(&engine, in_flight, i, &format!("name-{}", i));
    }
    // no commit, no close: the redo records were appended, the dirty
    // record pages never reached the data file
    drop(engine);

    let engine = reopen(&dir);
    let rows = select_students(&engine, 0, None);
    assert_eq!(rows.len(), 200);
    assert_eq!(
        select_students(&engine, 0, id_eq(42)),
        vec![student_row(42, "name-42")]
    );
    // the uncommitted tail is replayed as row versions but filtered
    // by visibility
    assert!(select_students(&engine, 0, id_eq(250)).is_empty());
    engine.close().unwrap();
}

/// A torn home page plus an intact double-write slot: roll-forward
/// heals the page before replay.
#[test]
fn test_double_write_heals_torn_page() {
    let (engine, dir) = new_engine();
    create_student_table(&engine);
    insert_student(&engine, 0, 1, "tom");
    insert_student(&engine, 0, 2, "bob");
    engine.close().unwrap();
    drop(engine);

    let data_path = dir.path().join("data.db");
    let page_num = 2u32; // first record page of the table

    // keep the good image, then tear the home copy
    let mut data = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&data_path)
        .unwrap();
    let mut good = vec![0u8; PAGE_SIZE];
    data.seek(SeekFrom::Start(page_num as u64 * PAGE_SIZE as u64))
        .unwrap();
    data.read_exact(&mut good).unwrap();

    data.seek(SeekFrom::Start(page_num as u64 * PAGE_SIZE as u64))
        .unwrap();
    data.write_all(&vec![0xddu8; PAGE_SIZE]).unwrap();
    data.sync_all().unwrap();

    // plant the image in double-write slot 0, checksum stamped
    let mut slot = good.clone();
    let sum = checksum(&slot[..PAGE_SIZE - PAGE_CHECKSUM_SIZE]);
    slot[PAGE_SIZE - PAGE_CHECKSUM_SIZE..].copy_from_slice(&sum);
    let mut dw = OpenOptions::new()
        .write(true)
        .open(dir.path().join("double_write.buf"))
        .unwrap();
    dw.write_all(&slot).unwrap();
    dw.sync_all().unwrap();

    // flip the clean flag so the reopen runs recovery
    let info_path = dir.path().join("recovery_info");
    let text = std::fs::read_to_string(&info_path).unwrap();
    std::fs::write(&info_path, text.replace("true", "false")).unwrap();

    let engine = reopen(&dir);
    let mut rows = select_students(&engine, 0, None);
    rows.sort_by_key(|row| match row[0] {
        Value::Int(id) => id,
        _ => unreachable!(),
    });
    assert_eq!(rows, vec![student_row(1, "tom"), student_row(2, "bob")]);
}

#[test]
fn test_version_mismatch_is_rejected() {
    let (engine, dir) = new_engine();
    create_student_table(&engine);
    engine.close().unwrap();
    drop(engine);

    // rewrite the version string inside the meta page
    let data_path = dir.path().join("data.db");
    let mut data = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&data_path)
        .unwrap();
    let mut page = vec![0u8; PAGE_SIZE];
    data.read_exact(&mut page).unwrap();
    let needle = b"mini-db 0.1";
    let pos = page
        .windows(needle.len())
        .position(|w| w == needle)
        .expect("version string in meta page");
    page[pos..pos + needle.len()].copy_from_slice(b"mini-db 9.9");
    data.seek(SeekFrom::Start(0)).unwrap();
    data.write_all(&page).unwrap();
    data.sync_all().unwrap();

    match Engine::open(Options::new(dir.path(), OpenMode::Open)) {
        Err(DbError::VersionMismatch { expected, found }) => {
            assert_eq!(expected, "mini-db 0.1");
            assert_eq!(found, "mini-db 9.9");
        }
        other => panic!("expected version mismatch, got ok={}", other.is_ok()),
    }
}

#[test]
fn test_mode_create_refuses_existing_and_open_refuses_missing() {
    setup();
    let dir = tempfile::TempDir::new().unwrap();

    // open on an empty directory fails
    assert!(Engine::open(Options::new(dir.path(), OpenMode::Open)).is_err());

    let engine = Engine::create(Options::new(dir.path(), OpenMode::Create)).unwrap();
    engine.close().unwrap();
    drop(engine);

    // create over an existing database fails
    assert!(Engine::create(Options::new(dir.path(), OpenMode::Create)).is_err());

    // start() dispatches on the configured mode
    let engine = Engine::start(Options::new(dir.path(), OpenMode::Open)).unwrap();
    engine.close().unwrap();
}

/// A tiny page cache forces evictions through the double-write
/// buffer, and cache misses re-read what eviction pushed out.
#[test]
fn test_small_cache_spills_through_double_write() {
    setup();
    let dir = tempfile::TempDir::new().unwrap();
    let opts = Options::new(dir.path(), OpenMode::Create).page_cache_capacity(4);
    let engine = Engine::create(opts).unwrap();
    create_student_table(&engine);

    let xid = engine.begin().unwrap();
    for i in 0..1000i64 {
        insert_student(&engine, xid, i, &format!("name-{}", i));
    }
    engine.commit(xid).unwrap();

    assert_eq!(select_students(&engine, 0, None).len(), 1000);
    assert_eq!(
        select_students(&engine, 0, id_eq(777)),
        vec![student_row(777, "name-777")]
    );

    engine.close().unwrap();
    drop(engine);

    let engine = reopen(&dir);
    assert_eq!(select_students(&engine, 0, None).len(), 1000);
    engine.close().unwrap();
}

#[test]
fn test_tiny_lfu_cache_variant() {
    setup();
    let dir = tempfile::TempDir::new().unwrap();
    let opts = Options::new(dir.path(), OpenMode::Create)
        .cache_kind(CacheKind::TinyLfu)
        .page_cache_capacity(8);
    let engine = Engine::create(opts).unwrap();
    create_student_table(&engine);

    for i in 0..500i64 {
        insert_student(&engine, 0, i, &format!("name-{}", i));
    }
    assert_eq!(select_students(&engine, 0, None).len(), 500);
    assert_eq!(
        select_students(&engine, 0, id_eq(123)),
        vec![student_row(123, "name-123")]
    );
    engine.close().unwrap();
}
