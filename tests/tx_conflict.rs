use lsm_engine::{Config, Error, IndexOptions, SequenceNumberCounter};
use test_log::test;

#[test]
fn tx_conflict_on_read_write_intersection() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    // A reads key 1 and finds nothing
    let mut tx_a = env.begin();
    assert_eq!(None, tx_a.get(&index, &1u64.to_be_bytes())?);

    // B writes key 1 and commits
    let mut tx_b = env.begin();
    tx_b.replace(&index, 1u64.to_be_bytes(), "x")?;
    env.prepare(&mut tx_b)?;
    env.commit(tx_b, lsn.next())?;

    // A's own write must now fail at prepare
    tx_a.replace(&index, 1u64.to_be_bytes(), "y")?;
    let result = env.prepare(&mut tx_a);
    assert!(matches!(result, Err(Error::Conflict)));

    env.rollback(tx_a);

    assert_eq!(Some("x".as_bytes().into()), env.get(&index, &1u64.to_be_bytes())?);
    assert!(env.tx_stats().tx_conflict.load(std::sync::atomic::Ordering::Acquire) > 0);

    Ok(())
}

#[test]
fn tx_gap_read_does_not_conflict_with_delete() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    // A reads key 1 and finds nothing (a gap read)
    let mut tx_a = env.begin();
    assert_eq!(None, tx_a.get(&index, &1u64.to_be_bytes())?);

    // B deletes key 1; deleting nothing does not invalidate A's read
    let mut tx_b = env.begin();
    tx_b.delete(&index, 1u64.to_be_bytes())?;
    env.prepare(&mut tx_b)?;
    env.commit(tx_b, lsn.next())?;

    // A's insert prepares fine
    tx_a.replace(&index, 1u64.to_be_bytes(), "y")?;
    env.prepare(&mut tx_a)?;
    env.commit(tx_a, lsn.next())?;

    assert_eq!(Some("y".as_bytes().into()), env.get(&index, &1u64.to_be_bytes())?);

    Ok(())
}

#[test]
fn tx_promoted_reader_view_is_pinned_at_the_preparing_tx() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    let mut tx = env.begin();
    tx.replace(&index, "k", "old")?;
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    // A reads "k"; B's prepare over it promotes A to a read view
    // pinned at B's commit
    let tx_a = env.begin();
    assert_eq!(Some("old".as_bytes().into()), tx_a.get(&index, b"k")?);

    let mut tx_b = env.begin();
    tx_b.replace(&index, "k", "b")?;
    env.prepare(&mut tx_b)?;
    env.commit(tx_b, lsn.next())?;

    // A later commit is beyond A's visibility ceiling
    let mut tx_c = env.begin();
    tx_c.replace(&index, "k", "c")?;
    env.prepare(&mut tx_c)?;
    env.commit(tx_c, lsn.next())?;

    assert_eq!(Some("b".as_bytes().into()), tx_a.get(&index, b"k")?);

    // While the global view sees the newest commit
    assert_eq!(Some("c".as_bytes().into()), env.get(&index, b"k")?);

    // A promoted transaction cannot prepare writes anymore
    let mut tx_a = tx_a;
    tx_a.replace(&index, "other", "x")?;
    assert!(matches!(env.prepare(&mut tx_a), Err(Error::Conflict)));
    env.rollback(tx_a);

    Ok(())
}

#[test]
fn tx_rollback_after_prepare_aborts_readers() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;

    // A reads the key
    let mut tx_a = env.begin();
    assert_eq!(None, tx_a.get(&index, b"k")?);

    // B prepares a write over it, then fails its WAL write
    let mut tx_b = env.begin();
    tx_b.replace(&index, "k", "doomed")?;
    env.prepare(&mut tx_b)?;
    env.rollback(tx_b);

    // The write never happened
    assert_eq!(None, env.get(&index, b"k")?);

    // A was reading through B's read view and is aborted with it
    tx_a.replace(&index, "k", "a")?;
    let result = env.prepare(&mut tx_a);
    assert!(result.is_err());
    env.rollback(tx_a);

    Ok(())
}

#[test]
fn tx_write_write_is_last_committer_wins() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    // Blind writes do not conflict; MVCC orders them by LSN
    let mut tx_a = env.begin();
    tx_a.replace(&index, "k", "a")?;

    let mut tx_b = env.begin();
    tx_b.replace(&index, "k", "b")?;

    env.prepare(&mut tx_a)?;
    env.commit(tx_a, lsn.next())?;

    env.prepare(&mut tx_b)?;
    env.commit(tx_b, lsn.next())?;

    assert_eq!(Some("b".as_bytes().into()), env.get(&index, b"k")?);

    Ok(())
}

#[test]
fn tx_aborted_tx_rejects_operations() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;

    let mut tx_a = env.begin();
    assert_eq!(None, tx_a.get(&index, b"k")?);

    // B's rollback-after-prepare moves A to ABORT
    let mut tx_b = env.begin();
    tx_b.replace(&index, "k", "x")?;
    env.prepare(&mut tx_b)?;
    env.rollback(tx_b);

    // Writes on an aborted transaction fail with a conflict
    assert!(matches!(
        tx_a.replace(&index, "other", "y"),
        Err(Error::Conflict)
    ));
    env.rollback(tx_a);

    Ok(())
}
