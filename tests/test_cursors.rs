use arbordb::{Database, DbFlags, EnvFlags, Environment, Error, WriteFlags};
use std::sync::Arc;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new()
        .set_map_size(1 << 23)
        .set_max_dbs(8)
        .open(temp_dir.path().join("data.adb"), EnvFlags::empty())
        .unwrap();
    (temp_dir, env)
}

#[test]
fn test_scan_returns_keys_in_order() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();
    for key in [b"a" as &[u8], b"c", b"b"] {
        db.put(&txn, key, b"v", WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();
    let mut keys = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((key, _)) = entry {
        keys.push(key);
        entry = cursor.next().unwrap();
    }
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    // exhaustion is a sentinel, not an error
    assert!(cursor.next().unwrap().is_none());
    assert!(cursor.get_current().unwrap().is_none());
}

#[test]
fn test_backward_scan() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();
    for i in 0..10 {
        db.put(&txn, format!("k{i}").as_bytes(), b"v", WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();
    let mut keys = Vec::new();
    let mut entry = cursor.last().unwrap();
    while let Some((key, _)) = entry {
        keys.push(String::from_utf8(key).unwrap());
        entry = cursor.prev().unwrap();
    }
    assert_eq!(keys.len(), 10);
    assert_eq!(keys[0], "k9");
    assert_eq!(keys[9], "k0");
    assert!(cursor.prev().unwrap().is_none());
}

#[test]
fn test_seek_and_seek_range() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();
    for key in ["apple", "banana", "cherry"] {
        db.put(&txn, key.as_bytes(), key.as_bytes(), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();

    let (key, _) = cursor.seek(b"banana").unwrap().unwrap();
    assert_eq!(key, b"banana");
    assert!(cursor.seek(b"blueberry").unwrap().is_none());

    let (key, _) = cursor.seek_range(b"blueberry").unwrap().unwrap();
    assert_eq!(key, b"cherry");
    assert!(cursor.seek_range(b"zucchini").unwrap().is_none());

    // movement continues from the sought position
    let (key, _) = cursor.seek_range(b"apple").unwrap().unwrap();
    assert_eq!(key, b"apple");
    let (key, _) = cursor.next().unwrap().unwrap();
    assert_eq!(key, b"banana");
}

#[test]
fn test_duplicate_values_iterate_in_order() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();

    // inserted out of order; values come back sorted
    db.put(&txn, b"key", &[2], WriteFlags::empty()).unwrap();
    db.put(&txn, b"key", &[1], WriteFlags::empty()).unwrap();
    db.put(&txn, b"other", &[9], WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    // get returns the first duplicate
    assert_eq!(db.get(&txn, b"key").unwrap().unwrap(), vec![1]);

    let cursor = db.cursor(&txn).unwrap();
    let (key, value) = cursor.seek(b"key").unwrap().unwrap();
    assert_eq!((key.as_slice(), value.as_slice()), (&b"key"[..], &[1][..]));
    let (_, value) = cursor.next_dup().unwrap().unwrap();
    assert_eq!(value, vec![2]);
    // run exhausted: cursor stays, sentinel returned
    assert!(cursor.next_dup().unwrap().is_none());
    let (key, _) = cursor.next_nodup().unwrap().unwrap();
    assert_eq!(key, b"other");

    assert_eq!(db.stat(&txn).unwrap().entries, 3);
}

#[test]
fn test_duplicates_disabled_overwrites() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();
    db.put(&txn, b"key", &[1], WriteFlags::empty()).unwrap();
    db.put(&txn, b"key", &[2], WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"key").unwrap().unwrap(), vec![2]);
    assert_eq!(db.stat(&txn).unwrap().entries, 1);
}

#[test]
fn test_duplicate_pair_deletion() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();
    for v in [1u8, 2, 3] {
        db.put(&txn, b"key", &[v], WriteFlags::empty()).unwrap();
    }
    // exact pair delete
    db.del(&txn, b"key", Some(&[2])).unwrap();
    assert!(matches!(db.del(&txn, b"key", Some(&[2])), Err(Error::NotFound)));

    let cursor = db.cursor(&txn).unwrap();
    let mut values = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((_, value)) = entry {
        values.push(value[0]);
        entry = cursor.next().unwrap();
    }
    assert_eq!(values, vec![1, 3]);
    drop(cursor);

    // deleting the key removes the remaining duplicates
    db.del(&txn, b"key", None).unwrap();
    assert!(db.get(&txn, b"key").unwrap().is_none());
    assert_eq!(db.stat(&txn).unwrap().entries, 0);
}

#[test]
fn test_nodupdata_rejects_existing_pair() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();
    db.put(&txn, b"key", &[1], WriteFlags::empty()).unwrap();
    assert!(matches!(
        db.put(&txn, b"key", &[1], WriteFlags::NODUPDATA),
        Err(Error::KeyExist)
    ));
    // a different value under the same key is fine
    db.put(&txn, b"key", &[2], WriteFlags::NODUPDATA).unwrap();
}

#[test]
fn test_cursor_misuse() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();
    db.put(&txn, b"k", b"v", WriteFlags::empty()).unwrap();

    let cursor = db.cursor(&txn).unwrap();
    // reading an unpositioned cursor is misuse
    assert!(matches!(cursor.get_current(), Err(Error::CursorInvalid)));
    assert!(matches!(cursor.del(), Err(Error::CursorInvalid)));

    cursor.first().unwrap().unwrap();
    cursor.get_current().unwrap().unwrap();

    // a closed cursor rejects everything
    cursor.close();
    assert!(matches!(cursor.first(), Err(Error::CursorInvalid)));
    assert!(matches!(cursor.get_current(), Err(Error::CursorInvalid)));
}

#[test]
fn test_cursor_mutation_keeps_position() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();
    for i in 0..10 {
        db.put(&txn, format!("k{i}").as_bytes(), b"old", WriteFlags::empty()).unwrap();
    }

    let cursor = db.cursor(&txn).unwrap();
    let (key, _) = cursor.seek(b"k4").unwrap().unwrap();
    assert_eq!(key, b"k4");

    // delete through the cursor moves it to the next remaining entry
    cursor.del().unwrap();
    let (key, _) = cursor.get_current().unwrap().unwrap();
    assert_eq!(key, b"k5");

    // put through the cursor leaves it on the written entry
    cursor.put(b"k45", b"new", WriteFlags::empty()).unwrap();
    let (key, value) = cursor.get_current().unwrap().unwrap();
    assert_eq!((key.as_slice(), value.as_slice()), (&b"k45"[..], &b"new"[..]));
    let (key, _) = cursor.next().unwrap().unwrap();
    assert_eq!(key, b"k5");
}

#[test]
fn test_cursor_survives_external_mutation() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();
    for i in 0..20 {
        db.put(&txn, format!("k{i:02}").as_bytes(), b"v", WriteFlags::empty()).unwrap();
    }

    let cursor = db.cursor(&txn).unwrap();
    let (key, _) = cursor.seek(b"k10").unwrap().unwrap();
    assert_eq!(key, b"k10");

    // a put outside the cursor (possibly splitting pages) must not derail it
    for i in 0..200 {
        db.put(&txn, format!("z{i:03}").as_bytes(), &[0u8; 100], WriteFlags::empty()).unwrap();
    }
    let (key, _) = cursor.next().unwrap().unwrap();
    assert_eq!(key, b"k11");
}

#[test]
fn test_large_tree_splits_and_merges() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();

    // enough entries to force branch pages
    for i in 0..1500u32 {
        let key = format!("key{i:06}");
        let value = format!("value-{i}-{}", "x".repeat(40));
        db.put(&txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty()).unwrap();
    }
    let stat = db.stat(&txn).unwrap();
    assert_eq!(stat.entries, 1500);
    assert!(stat.depth >= 2, "expected a branched tree, depth {}", stat.depth);
    assert!(stat.branch_pages >= 1);
    txn.commit().unwrap();

    // scan the whole tree in order
    let txn = env.begin_ro_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();
    let mut count = 0u32;
    let mut prev: Option<Vec<u8>> = None;
    let mut entry = cursor.first().unwrap();
    while let Some((key, _)) = entry {
        if let Some(p) = &prev {
            assert!(p < &key, "scan out of order");
        }
        prev = Some(key);
        count += 1;
        entry = cursor.next().unwrap();
    }
    assert_eq!(count, 1500);
    drop(cursor);
    drop(txn);

    // delete most entries to force merges, then verify the rest
    let txn = env.begin_txn().unwrap();
    for i in 0..1500u32 {
        if i % 5 != 0 {
            db.del(&txn, format!("key{i:06}").as_bytes(), None).unwrap();
        }
    }
    assert_eq!(db.stat(&txn).unwrap().entries, 300);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    for i in 0..1500u32 {
        let got = db.get(&txn, format!("key{i:06}").as_bytes()).unwrap();
        if i % 5 == 0 {
            let expected = format!("value-{i}-{}", "x".repeat(40));
            assert_eq!(got.unwrap(), expected.as_bytes());
        } else {
            assert!(got.is_none());
        }
    }
    let stat = db.stat(&txn).unwrap();
    assert_eq!(stat.entries, 300);
}

#[test]
fn test_reverse_key_ordering() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, Some("rev"), DbFlags::CREATE | DbFlags::REVERSEKEY).unwrap();
    for key in [b"az" as &[u8], b"cx", b"by"] {
        db.put(&txn, key, b"v", WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();
    let mut keys = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((key, _)) = entry {
        keys.push(key);
        entry = cursor.next().unwrap();
    }
    // ordered by trailing byte: x < y < z
    assert_eq!(keys, vec![b"cx".to_vec(), b"by".to_vec(), b"az".to_vec()]);
}

#[test]
fn test_custom_comparator() {
    let (_dir, env) = setup_test_env();
    let descending = Arc::new(|a: &[u8], b: &[u8]| b.cmp(a));

    let txn = env.begin_txn().unwrap();
    let db = Database::open_with_comparator(
        &txn,
        Some("desc"),
        DbFlags::CREATE,
        descending,
    )
    .unwrap();
    for key in [b"a" as &[u8], b"c", b"b"] {
        db.put(&txn, key, b"v", WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let cursor = db.cursor(&txn).unwrap();
    let mut keys = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((key, _)) = entry {
        keys.push(key);
        entry = cursor.next().unwrap();
    }
    assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    // lookups agree with the injected order
    assert!(db.get(&txn, b"b").unwrap().is_some());
}
