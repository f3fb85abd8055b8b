use lsm_engine::{
    Config, IndexOptions, MetadataRecord, SearchMode, SequenceNumberCounter,
};
use rand::seq::SliceRandom;
use std::time::{Duration, Instant};
use test_log::test;

const KEY_COUNT: u64 = 10_000;

fn value_of(i: u64) -> Vec<u8> {
    format!("value-{i}").into_bytes()
}

fn fill(env: &lsm_engine::Environment, index: &std::sync::Arc<lsm_engine::Index>, lsn: &SequenceNumberCounter) -> lsm_engine::Result<()> {
    // Insertion order should not matter to the sorted runs
    let mut keys = (0..KEY_COUNT).collect::<Vec<_>>();
    keys.shuffle(&mut rand::rng());

    for chunk in keys.chunks(500) {
        let mut tx = env.begin();
        for &i in chunk {
            tx.replace(index, i.to_be_bytes(), value_of(i))?;
        }
        env.prepare(&mut tx)?;
        env.commit(tx, lsn.next())?;
    }
    Ok(())
}

fn verify_all(env: &lsm_engine::Environment, index: &std::sync::Arc<lsm_engine::Index>) -> lsm_engine::Result<()> {
    for i in 0..KEY_COUNT {
        let value = env.get(index, &i.to_be_bytes())?;
        assert_eq!(
            Some(value_of(i).into()),
            value,
            "key {i} lost its value"
        );
    }
    Ok(())
}

#[test]
fn dump_round_trip_and_log_accounting() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let lsn = SequenceNumberCounter::default();

    {
        let env = Config::new(folder.path())
            .page_size(4_096)
            .open()?;
        let index = env.create_index("test", IndexOptions::default())?;

        fill(&env, &index, &lsn)?;

        // Force everything to disk
        env.checkpoint(lsn.get())?;

        assert!(env.stats().dump_count.load(std::sync::atomic::Ordering::Acquire) > 0);

        // Reads go through the runs now
        verify_all(&env, &index)?;
    }

    // The metadata log accounts for every key exactly once
    let (_, records) = lsm_engine::MetadataLog::open(folder.path())?;

    let keys: u64 = records
        .iter()
        .filter_map(|record| match record {
            MetadataRecord::InsertRun { keys, .. } => Some(*keys),
            _ => None,
        })
        .sum();

    assert_eq!(KEY_COUNT, keys);

    Ok(())
}

#[test]
fn compaction_preserves_visible_content() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let lsn = SequenceNumberCounter::default();

    let env = Config::new(folder.path())
        .page_size(4_096)
        // A single run per level: the second dump triggers compaction
        .run_count_per_level(1)
        .open()?;
    let index = env.create_index("test", IndexOptions::default())?;

    fill(&env, &index, &lsn)?;
    env.checkpoint(lsn.get())?;

    // Overwrite everything with longer values: the second run lands on
    // the same level as the first, which overflows it
    let mut keys = (0..KEY_COUNT).collect::<Vec<_>>();
    keys.shuffle(&mut rand::rng());

    for chunk in keys.chunks(500) {
        let mut tx = env.begin();
        for &i in chunk {
            tx.replace(&index, i.to_be_bytes(), format!("overwritten-{i}-{i}"))?;
        }
        env.prepare(&mut tx)?;
        env.commit(tx, lsn.next())?;
    }

    env.checkpoint(lsn.get())?;

    // Wait for the compaction that merges the two runs
    let deadline = Instant::now() + Duration::from_secs(30);
    while env
        .stats()
        .compaction_count
        .load(std::sync::atomic::Ordering::Acquire)
        == 0
    {
        assert!(Instant::now() < deadline, "compaction never ran");
        std::thread::sleep(Duration::from_millis(100));
    }

    for i in 0..KEY_COUNT {
        assert_eq!(
            Some(format!("overwritten-{i}-{i}").into_bytes().into()),
            env.get(&index, &i.to_be_bytes())?,
        );
    }

    Ok(())
}

#[test]
fn dump_keeps_deletes_invisible() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let lsn = SequenceNumberCounter::default();

    let env = Config::new(folder.path()).open()?;
    let index = env.create_index("test", IndexOptions::default())?;

    let mut tx = env.begin();
    tx.replace(&index, "kept", "v")?;
    tx.replace(&index, "gone", "v")?;
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    let mut tx = env.begin();
    tx.delete(&index, "gone")?;
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    env.checkpoint(lsn.get())?;

    assert_eq!(Some("v".as_bytes().into()), env.get(&index, b"kept")?);
    assert_eq!(None, env.get(&index, b"gone")?);

    // Scans agree
    let mut cursor = env.iter(&index, SearchMode::Ge, b"");
    let (key, _) = cursor.next()?.unwrap();
    assert_eq!(b"kept".as_slice(), &*key);
    assert!(cursor.next()?.is_none());

    Ok(())
}
