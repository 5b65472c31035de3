mod common;

use common::*;
use mini_db::{
    stmt::{ColumnSpec, CreateTableStmt, InsertStmt},
    storage::meta::ColumnType,
    Value,
};

/// 1000 rows through the primary index; equality probes descend the
/// tree instead of scanning.
#[test]
fn test_thousand_rows_probe_by_primary_key() {
    let (engine, _dir) = new_engine();
    engine
        .create_table(
            0,
            &CreateTableStmt {
                table_name: "student".to_string(),
                columns: vec![
                    ColumnSpec::new("id", ColumnType::Int),
                    ColumnSpec::new("name", ColumnType::Text),
                    ColumnSpec::new("score", ColumnType::Int),
                ],
            },
        )
        .unwrap();

    let xid = engine.begin().unwrap();
    for i in 0..1000i64 {
        engine
            .insert(
                xid,
                &InsertStmt {
                    table_name: "student".to_string(),
                    values: vec![
                        Value::Int(i),
                        Value::Text(format!("name-{}", i)),
                        Value::Int(i),
                    ],
                },
            )
            .unwrap();
    }
    engine.commit(xid).unwrap();

    let rows = select_students(&engine, 0, id_eq(500));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][1], Value::Text("name-500".to_string()));

    // probes across the key range, including both ends
    for id in [0i64, 1, 250, 595, 596, 999] {
        let rows = select_students(&engine, 0, id_eq(id));
        assert_eq!(rows.len(), 1, "id {} should have exactly one row", id);
        assert_eq!(rows[0][0], Value::Int(id));
    }

    // missing keys yield empty streams
    assert!(select_students(&engine, 0, id_eq(1000)).is_empty());
    assert!(select_students(&engine, 0, id_eq(-1)).is_empty());

    // and the full scan still sees everything once
    assert_eq!(select_students(&engine, 0, None).len(), 1000);
}

/// With 1000 keys and an order of 596 the root must have split; the
/// index keeps answering for every key it ever absorbed.
#[test]
fn test_lookup_after_root_split() {
    let (engine, _dir) = new_engine();
    create_student_table(&engine);

    let xid = engine.begin().unwrap();
    for i in 0..1000i64 {
        insert_student(&engine, xid, i, &format!("name-{}", i));
    }
    engine.commit(xid).unwrap();

    let tree = engine
        .data_manager()
        .index("student", "id")
        .unwrap()
        .expect("primary index exists");
    for id in [0i64, 299, 300, 700, 999] {
        let hits: Vec<_> = tree.search(&id.to_be_bytes()).collect();
        assert_eq!(hits.len(), 1, "key {} should be indexed once", id);
    }
}

/// Duplicate primary keys are legal at the storage layer: each insert
/// is its own row version.
#[test]
fn test_duplicate_keys_all_stream_out() {
    let (engine, _dir) = new_engine();
    create_student_table(&engine);

    insert_student(&engine, 0, 7, "first");
    insert_student(&engine, 0, 7, "second");
    insert_student(&engine, 0, 7, "third");

    let mut names: Vec<String> = select_students(&engine, 0, id_eq(7))
        .into_iter()
        .map(|row| match &row[1] {
            Value::Text(name) => name.clone(),
            other => panic!("unexpected value {:?}", other),
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["first", "second", "third"]);
}

/// Dropping a value stream mid-iteration cancels the producer; later
/// operations on the same tree keep working.
#[test]
fn test_dropped_stream_releases_the_tree() {
    let (engine, _dir) = new_engine();
    create_student_table(&engine);

    let xid = engine.begin().unwrap();
    for i in 0..200i64 {
        insert_student(&engine, xid, i % 10, &format!("name-{}", i));
    }
    engine.commit(xid).unwrap();

    let tree = engine
        .data_manager()
        .index("student", "id")
        .unwrap()
        .expect("primary index exists");

    {
        let mut stream = tree.search(&3i64.to_be_bytes());
        // take one value and walk away
        assert!(stream.next().is_some());
    }

    // producer cancellation left no latch behind
    insert_student(&engine, 0, 3, "late");
    let rows = select_students(&engine, 0, id_eq(3));
    assert_eq!(rows.len(), 21);
}
