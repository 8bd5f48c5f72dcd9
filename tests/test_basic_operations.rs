use arbordb::{Database, DbFlags, EnvFlags, Environment, Error, WriteFlags};
use tempfile::TempDir;

// Common test setup
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
fn test_database_open_close() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();

    // Opening the default database
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();
    assert_eq!(db.flags(&txn).unwrap(), DbFlags::empty());

    // Opening a named database
    let named = Database::open(&txn, Some("testdb"), DbFlags::CREATE).unwrap();
    assert_ne!(named.dbi(), db.dbi());
    txn.commit().unwrap();

    // The same name resolves to the same handle
    let txn = env.begin_ro_txn().unwrap();
    let again = Database::open(&txn, Some("testdb"), DbFlags::empty()).unwrap();
    assert_eq!(again.dbi(), named.dbi());
    drop(txn);

    env.close_db(named);
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();

    let key = b"test_key";
    let value = b"test_value";

    db.put(&txn, key, value, WriteFlags::empty()).unwrap();
    // a write transaction reads its own staged changes
    assert_eq!(db.get(&txn, key).unwrap().unwrap(), value);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, key).unwrap().unwrap(), value);
}

#[test]
fn test_delete_operations() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();

    let key = b"delete_key";
    db.put(&txn, key, b"delete_value", WriteFlags::empty()).unwrap();
    assert!(db.get(&txn, key).unwrap().is_some());

    db.del(&txn, key, None).unwrap();
    assert!(db.get(&txn, key).unwrap().is_none());

    // deleting an absent key reports NotFound
    assert!(matches!(db.del(&txn, key, None), Err(Error::NotFound)));
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert!(db.get(&txn, key).unwrap().is_none());
}

#[test]
fn test_database_stats() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();

    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.depth, 0);

    for i in 0..5 {
        let key = format!("key_{i}");
        let value = format!("value_{i}");
        db.put(&txn, key.as_bytes(), value.as_bytes(), WriteFlags::empty())
            .unwrap();
    }

    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 5);
    assert_eq!(stats.depth, 1);
    assert_eq!(stats.leaf_pages, 1);
    txn.commit().unwrap();

    let stats = env.stat();
    assert_eq!(stats.entries, 5);
}

#[test]
fn test_error_handling() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();

    assert!(db.get(&txn, b"nonexistent_key").unwrap().is_none());

    let key = b"unique_key";
    db.put(&txn, key, b"value1", WriteFlags::empty()).unwrap();
    let result = db.put(&txn, key, b"value2", WriteFlags::NOOVERWRITE);
    assert!(matches!(result, Err(Error::KeyExist)));

    // plain put overwrites
    db.put(&txn, key, b"value2", WriteFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, key).unwrap().unwrap(), b"value2");

    // oversized and empty keys are rejected
    let long_key = vec![b'k'; 4096];
    assert!(matches!(
        db.put(&txn, &long_key, b"v", WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
    assert!(matches!(
        db.put(&txn, b"", b"v", WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
}

#[test]
fn test_named_databases() {
    let (_dir, env) = setup_test_env();

    // opening a missing database without CREATE fails
    let txn = env.begin_txn().unwrap();
    assert!(matches!(
        Database::open(&txn, Some("users"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
    let users = Database::open(&txn, Some("users"), DbFlags::CREATE).unwrap();
    let posts = Database::open(&txn, Some("posts"), DbFlags::CREATE).unwrap();
    users.put(&txn, b"alice", b"1", WriteFlags::empty()).unwrap();
    posts.put(&txn, b"alice", b"2", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    // the two databases are independent
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(users.get(&txn, b"alice").unwrap().unwrap(), b"1");
    assert_eq!(posts.get(&txn, b"alice").unwrap().unwrap(), b"2");
    drop(txn);

    // reopening with conflicting persistent flags is rejected
    let txn = env.begin_txn().unwrap();
    assert!(matches!(
        Database::open(&txn, Some("users"), DbFlags::DUPSORT),
        Err(Error::Incompatible)
    ));
}

#[test]
fn test_append_mode() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();

    db.put(&txn, b"a", b"1", WriteFlags::APPEND).unwrap();
    db.put(&txn, b"b", b"2", WriteFlags::APPEND).unwrap();
    assert!(matches!(
        db.put(&txn, b"aa", b"3", WriteFlags::APPEND),
        Err(Error::KeyMismatch)
    ));
}

#[test]
fn test_overflow_values() {
    let (_dir, env) = setup_test_env();
    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, DbFlags::empty()).unwrap();
    db.put(&txn, b"big", &big, WriteFlags::empty()).unwrap();
    assert!(db.stat(&txn).unwrap().overflow_pages > 0);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap(), big);
    drop(txn);

    // overwriting with a small value releases the chain
    let txn = env.begin_txn().unwrap();
    db.put(&txn, b"big", b"small", WriteFlags::empty()).unwrap();
    assert_eq!(db.stat(&txn).unwrap().overflow_pages, 0);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap(), b"small");
}

#[test]
fn test_drop_database() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, Some("scratch"), DbFlags::CREATE).unwrap();
    for i in 0..50 {
        db.put(&txn, format!("k{i}").as_bytes(), b"v", WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    // emptying keeps the database around
    let txn = env.begin_txn().unwrap();
    db.drop(&txn, false).unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 0);
    txn.commit().unwrap();

    // deleting removes it from the catalog
    let txn = env.begin_txn().unwrap();
    db.drop(&txn, true).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_txn().unwrap();
    assert!(matches!(
        Database::open(&txn, Some("scratch"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
}

#[test]
fn test_environment_info() {
    let (_dir, env) = setup_test_env();
    let info = env.info();
    assert_eq!(info.num_readers, 0);
    assert_eq!(info.last_txnid, 0);

    let r = env.begin_ro_txn().unwrap();
    assert_eq!(env.info().num_readers, 1);
    assert_eq!(env.reader_list().len(), 1);
    drop(r);
    assert_eq!(env.info().num_readers, 0);

    let (major, minor, patch) = Environment::version();
    assert_eq!(
        Environment::version_string(),
        format!("{major}.{minor}.{patch}")
    );
}
