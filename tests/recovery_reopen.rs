use lsm_engine::{Config, IndexOptions, SearchMode, SequenceNumberCounter, Statement};
use nanoid::nanoid;
use test_log::test;

#[test]
fn reopen_yields_same_visible_state() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let lsn = SequenceNumberCounter::default();

    let keys = (0..1_000).map(|_| nanoid!()).collect::<Vec<_>>();
    let deleted = keys.get(7).unwrap();

    {
        let env = Config::new(folder.path()).open()?;
        let index = env.create_index("test", IndexOptions::default())?;

        let mut tx = env.begin();
        for (i, key) in keys.iter().enumerate() {
            tx.replace(&index, key.as_str(), i.to_string())?;
        }
        env.prepare(&mut tx)?;
        env.commit(tx, lsn.next())?;

        let mut tx = env.begin();
        tx.delete(&index, deleted.as_str())?;
        env.prepare(&mut tx)?;
        env.commit(tx, lsn.next())?;

        env.checkpoint(lsn.get())?;
    }

    // Re-open from the metadata log and the run files
    let env = Config::new(folder.path()).open()?;
    let index = env.index("test").expect("index is recovered");

    assert_eq!(None, env.get(&index, deleted.as_bytes())?);

    for (i, key) in keys.iter().enumerate() {
        if key == deleted {
            continue;
        }
        assert_eq!(
            Some(i.to_string().into_bytes().into()),
            env.get(&index, key.as_bytes())?,
            "key {key:?} after reopen"
        );
    }

    let mut cursor = env.iter(&index, SearchMode::Ge, b"");
    let mut count = 0;
    while cursor.next()?.is_some() {
        count += 1;
    }
    assert_eq!(999, count);

    Ok(())
}

#[test]
fn replay_skips_already_dumped_statements() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let lsn = SequenceNumberCounter::default();

    {
        let env = Config::new(folder.path()).open()?;
        let index = env.create_index("test", IndexOptions::default())?;

        let mut tx = env.begin();
        tx.replace(&index, "dumped", "disk")?;
        env.prepare(&mut tx)?;
        env.commit(tx, lsn.next())?;

        env.checkpoint(lsn.get())?;
    }

    let dumped_lsn = lsn.get();

    // The host replays its WAL through the recovery handle
    let recovery = Config::new(folder.path()).begin_recovery()?;
    let index = recovery.index("test").expect("index is recovered");

    // At or below the run's max LSN: already dumped, skipped
    recovery.replay(&index, Statement::replace("dumped", "wal-stale", dumped_lsn))?;

    // Beyond it: applied
    recovery.replay(&index, Statement::replace("fresh", "wal", dumped_lsn + 1))?;

    let env = recovery.finish()?;
    let index = env.index("test").unwrap();

    assert_eq!(Some("disk".as_bytes().into()), env.get(&index, b"dumped")?);
    assert_eq!(Some("wal".as_bytes().into()), env.get(&index, b"fresh")?);
    assert_eq!(dumped_lsn + 1, env.last_lsn());

    Ok(())
}

#[test]
fn reopen_empty_folder_is_a_fresh_environment() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;

    let env = Config::new(folder.path()).open()?;
    assert!(env.index("anything").is_none());
    assert_eq!(lsm_engine::Status::Online, env.status());

    Ok(())
}

#[test]
fn dropped_index_stays_dropped_after_reopen() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let lsn = SequenceNumberCounter::default();

    {
        let env = Config::new(folder.path()).open()?;
        let keep = env.create_index("keep", IndexOptions::default())?;
        env.create_index("doomed", IndexOptions { space_id: 1, ..Default::default() })?;

        let mut tx = env.begin();
        tx.replace(&keep, "k", "v")?;
        env.prepare(&mut tx)?;
        env.commit(tx, lsn.next())?;

        env.drop_index("doomed")?;
    }

    let env = Config::new(folder.path()).open()?;

    assert!(env.index("doomed").is_none());

    let keep = env.index("keep").expect("surviving index is recovered");
    assert_eq!(Some("v".as_bytes().into()), env.get(&keep, b"k")?);

    Ok(())
}
