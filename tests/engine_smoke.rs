use lsm_engine::{Config, IndexOptions, SearchMode, SequenceNumberCounter};
use test_log::test;

#[test]
fn engine_insert_get_delete() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    let mut tx = env.begin();
    tx.replace(&index, 1u64.to_be_bytes(), "a")?;
    tx.replace(&index, 2u64.to_be_bytes(), "b")?;
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    assert_eq!(Some("a".as_bytes().into()), env.get(&index, &1u64.to_be_bytes())?);
    assert_eq!(Some("b".as_bytes().into()), env.get(&index, &2u64.to_be_bytes())?);
    assert_eq!(None, env.get(&index, &3u64.to_be_bytes())?);

    let mut tx = env.begin();
    tx.delete(&index, 1u64.to_be_bytes())?;
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    assert_eq!(None, env.get(&index, &1u64.to_be_bytes())?);

    // GE iteration from key 0 only sees (2, "b")
    let mut cursor = env.iter(&index, SearchMode::Ge, &0u64.to_be_bytes());

    let (key, value) = cursor.next()?.unwrap();
    assert_eq!(2u64.to_be_bytes().as_slice(), &*key);
    assert_eq!(b"b".as_slice(), &*value);

    assert!(cursor.next()?.is_none());

    Ok(())
}

#[test]
fn engine_read_own_writes() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;

    let mut tx = env.begin();
    tx.replace(&index, "k", "uncommitted")?;

    // Visible through the transaction, invisible outside
    assert_eq!(Some("uncommitted".as_bytes().into()), tx.get(&index, b"k")?);
    assert_eq!(None, env.get(&index, b"k")?);

    tx.delete(&index, "k")?;
    assert_eq!(None, tx.get(&index, b"k")?);

    env.rollback(tx);
    assert_eq!(None, env.get(&index, b"k")?);

    Ok(())
}

#[test]
fn engine_rollback_to_savepoint() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    let mut tx = env.begin();
    tx.replace(&index, "before", "1")?;

    let savepoint = tx.savepoint();

    tx.replace(&index, "after", "2")?;
    tx.delete(&index, "before")?;

    tx.rollback_to_savepoint(savepoint)?;

    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    // Only writes made before the savepoint survive
    assert_eq!(Some("1".as_bytes().into()), env.get(&index, b"before")?);
    assert_eq!(None, env.get(&index, b"after")?);

    Ok(())
}

#[test]
fn engine_range_scan_both_directions() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    let mut tx = env.begin();
    for i in 0u64..10 {
        tx.replace(&index, i.to_be_bytes(), i.to_string())?;
    }
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    let mut cursor = env.iter(&index, SearchMode::Gt, &3u64.to_be_bytes());
    let (key, _) = cursor.next()?.unwrap();
    assert_eq!(4u64.to_be_bytes().as_slice(), &*key);

    let mut cursor = env.iter(&index, SearchMode::Lt, &3u64.to_be_bytes());
    let (key, _) = cursor.next()?.unwrap();
    assert_eq!(2u64.to_be_bytes().as_slice(), &*key);

    let mut cursor = env.iter(&index, SearchMode::Le, &3u64.to_be_bytes());
    let mut seen = vec![];
    while let Some((key, _)) = cursor.next()? {
        seen.push(key.to_vec());
    }
    assert_eq!(4, seen.len());
    assert_eq!(3u64.to_be_bytes().to_vec(), *seen.first().unwrap());
    assert_eq!(0u64.to_be_bytes().to_vec(), *seen.last().unwrap());

    Ok(())
}

#[test]
fn engine_prefix_equality_scan() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions { part_count: 2, ..Default::default() })?;
    let lsn = SequenceNumberCounter::default();

    let mut tx = env.begin();
    tx.replace(&index, "aa1", "1")?;
    tx.replace(&index, "aa2", "2")?;
    tx.replace(&index, "ab1", "3")?;
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    // A partial key visits every key carrying the prefix
    let mut cursor = env.iter(&index, SearchMode::Eq, b"aa");
    let mut seen = vec![];
    while let Some((key, _)) = cursor.next()? {
        seen.push(key.to_vec());
    }

    assert_eq!(vec![b"aa1".to_vec(), b"aa2".to_vec()], seen);

    Ok(())
}

#[test]
fn engine_cursor_detaches_from_dead_tx() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    let mut tx = env.begin();
    tx.replace(&index, "a", "1")?;
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    let tx = env.begin();
    let mut cursor = tx.iter(&index, SearchMode::Ge, b"")?;
    env.rollback(tx);

    // A cursor of a destroyed transaction reads nothing
    assert!(cursor.next()?.is_none());

    Ok(())
}

#[test]
fn engine_drop_index() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("doomed", IndexOptions::default())?;

    assert!(env.index("doomed").is_some());
    assert!(!index.is_dropped());

    env.drop_index("doomed")?;

    assert!(env.index("doomed").is_none());
    assert!(index.is_dropped());

    Ok(())
}
