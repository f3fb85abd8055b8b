use lsm_engine::{Config, IndexOptions, SearchMode, SequenceNumberCounter};
use std::time::{Duration, Instant};
use test_log::test;

const KEY_COUNT: u64 = 2_000;

fn fill(
    env: &lsm_engine::Environment,
    index: &std::sync::Arc<lsm_engine::Index>,
    lsn: &SequenceNumberCounter,
    pad: usize,
) -> lsm_engine::Result<()> {
    for chunk in (0..KEY_COUNT).collect::<Vec<_>>().chunks(250) {
        let mut tx = env.begin();
        for &i in chunk {
            tx.replace(index, i.to_be_bytes(), format!("{i}-{}", "x".repeat(pad)))?;
        }
        env.prepare(&mut tx)?;
        env.commit(tx, lsn.next())?;
    }
    Ok(())
}

#[test]
fn split_partitions_an_overgrown_range() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let lsn = SequenceNumberCounter::default();

    let env = Config::new(folder.path())
        .page_size(2_048)
        .range_size_target(64 * 1_024)
        .run_count_per_level(1)
        .open()?;
    let index = env.create_index("test", IndexOptions::default())?;

    assert_eq!(1, index.range_count());

    // Three fills with growing values: the first two produce the run
    // layout that forces a compaction (a split needs a compacted
    // range), the third leaves a newest run far beyond 4/3 of the
    // target range size
    fill(&env, &index, &lsn, 50)?;
    env.checkpoint(lsn.get())?;

    fill(&env, &index, &lsn, 120)?;
    env.checkpoint(lsn.get())?;

    fill(&env, &index, &lsn, 300)?;
    env.checkpoint(lsn.get())?;

    let deadline = Instant::now() + Duration::from_secs(30);
    while env
        .stats()
        .split_count
        .load(std::sync::atomic::Ordering::Acquire)
        == 0
    {
        assert!(Instant::now() < deadline, "split never happened");
        std::thread::sleep(Duration::from_millis(100));
    }

    // The parent is gone; the children tile the key space
    assert!(index.range_count() >= 2);

    // Nothing was lost on the way
    for i in 0..KEY_COUNT {
        let value = env.get(&index, &i.to_be_bytes())?.unwrap();
        assert!(value.starts_with(format!("{i}-").as_bytes()), "key {i}");
    }

    // A full scan crosses the new range boundary seamlessly
    let mut cursor = env.iter(&index, SearchMode::Ge, b"");
    let mut count = 0;
    while cursor.next()?.is_some() {
        count += 1;
    }
    assert_eq!(KEY_COUNT, count);

    // Writes keep landing in the right child
    let mut tx = env.begin();
    tx.replace(&index, 0u64.to_be_bytes(), "after-split")?;
    tx.replace(&index, (KEY_COUNT - 1).to_be_bytes(), "after-split")?;
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    assert_eq!(
        Some("after-split".as_bytes().into()),
        env.get(&index, &0u64.to_be_bytes())?,
    );
    assert_eq!(
        Some("after-split".as_bytes().into()),
        env.get(&index, &(KEY_COUNT - 1).to_be_bytes())?,
    );

    Ok(())
}
