use lsm_engine::{Config, IndexOptions, SequenceNumberCounter, UpsertExecutor, UserValue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_log::test;

/// Little-endian u64 addition over 8-byte operation blobs.
struct AddExecutor;

impl UpsertExecutor for AddExecutor {
    fn apply(&self, base: Option<&UserValue>, ops: &UserValue) -> Option<UserValue> {
        let delta = u64::from_le_bytes(ops.as_ref().try_into().ok()?);
        let base = match base {
            Some(v) => u64::from_le_bytes(v.as_ref().try_into().ok()?),
            None => 0,
        };
        Some(base.wrapping_add(delta).to_le_bytes().to_vec().into())
    }

    fn merge(&self, older: &UserValue, newer: &UserValue) -> UserValue {
        let a = u64::from_le_bytes(older.as_ref().try_into().unwrap());
        let b = u64::from_le_bytes(newer.as_ref().try_into().unwrap());
        a.wrapping_add(b).to_le_bytes().to_vec().into()
    }
}

#[test]
fn upsert_accumulates_on_read() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path())
        .upsert_executor(Arc::new(AddExecutor))
        .open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    // On an empty index: +1, then +2
    let mut tx = env.begin();
    tx.upsert(&index, 1u64.to_be_bytes(), 1u64.to_le_bytes())?;
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    let mut tx = env.begin();
    tx.upsert(&index, 1u64.to_be_bytes(), 2u64.to_le_bytes())?;
    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    let value = env.get(&index, &1u64.to_be_bytes())?.unwrap();
    assert_eq!(3u64.to_le_bytes().as_slice(), &*value);

    Ok(())
}

#[test]
fn upsert_within_one_tx_squashes_locally() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path())
        .upsert_executor(Arc::new(AddExecutor))
        .open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    let mut tx = env.begin();
    tx.replace(&index, "k", 10u64.to_le_bytes())?;
    tx.upsert(&index, "k", 5u64.to_le_bytes())?;
    tx.upsert(&index, "k", 7u64.to_le_bytes())?;

    // Squashed before prepare: read-own-writes already sees the result
    assert_eq!(
        22u64.to_le_bytes().as_slice(),
        &*tx.get(&index, b"k")?.unwrap()
    );

    env.prepare(&mut tx)?;
    env.commit(tx, lsn.next())?;

    assert_eq!(
        22u64.to_le_bytes().as_slice(),
        &*env.get(&index, b"k")?.unwrap()
    );

    Ok(())
}

#[test]
fn upsert_long_chain_is_squashed_in_background() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let env = Config::new(folder.path())
        .upsert_executor(Arc::new(AddExecutor))
        .open()?;
    let index = env.create_index("test", IndexOptions::default())?;
    let lsn = SequenceNumberCounter::default();

    // 130 consecutive UPSERTs of the same key crosses the squash
    // threshold
    for _ in 0..130 {
        let mut tx = env.begin();
        tx.upsert(&index, "hot", 1u64.to_le_bytes())?;
        env.prepare(&mut tx)?;
        env.commit(tx, lsn.next())?;
    }

    // The squash fiber plants a REPLACE shortcut
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let squashed = env
            .stats()
            .upsert_squashed
            .load(std::sync::atomic::Ordering::Acquire);

        if squashed > 0 {
            break;
        }

        assert!(
            Instant::now() < deadline,
            "upsert squash did not run within the deadline"
        );
        std::thread::sleep(Duration::from_millis(50));
    }

    // The chain still reduces to the right value
    let value = env.get(&index, b"hot")?.unwrap();
    assert_eq!(130u64.to_le_bytes().as_slice(), &*value);

    Ok(())
}
