// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    statement::{Statement, StatementType},
    UserValue,
};

/// Interprets UPSERT operation blobs.
///
/// The engine never looks inside an operation blob; the executor is
/// supplied by the host through the configuration.
pub trait UpsertExecutor: Send + Sync {
    /// Applies an operation blob against a base value.
    ///
    /// `base` is `None` when the key does not exist (the insert branch).
    /// Returning `None` marks the operation as invalid; the statement is
    /// then skipped, matching the behaviour of a malformed update.
    fn apply(&self, base: Option<&UserValue>, ops: &UserValue) -> Option<UserValue>;

    /// Combines two operation blobs such that applying the result equals
    /// applying `older` first, then `newer`.
    fn merge(&self, older: &UserValue, newer: &UserValue) -> UserValue;
}

/// The default executor: an UPSERT behaves like insert-or-overwrite,
/// the operation blob being the new value.
#[derive(Default)]
pub struct OverwriteExecutor;

impl UpsertExecutor for OverwriteExecutor {
    fn apply(&self, _base: Option<&UserValue>, ops: &UserValue) -> Option<UserValue> {
        Some(ops.clone())
    }

    fn merge(&self, _older: &UserValue, newer: &UserValue) -> UserValue {
        newer.clone()
    }
}

/// Collapses an UPSERT chain onto a base statement.
///
/// `chain` holds UPSERTs newest-first, as yielded by version iteration.
/// `base` is the newest non-UPSERT version below the chain, or `None`
/// if the key's history ended without one. The result is a REPLACE
/// carrying the newest chain LSN, or `None` if the base was a DELETE
/// and every operation in the chain turned out invalid against ∅.
pub(crate) fn squash_chain(
    executor: &dyn UpsertExecutor,
    chain: &[Statement],
    base: Option<&Statement>,
) -> Option<Statement> {
    debug_assert!(chain.iter().all(|s| s.stmt_type == StatementType::Upsert));

    let newest_lsn = chain.first().map_or_else(
        || base.map(|b| b.key.lsn).unwrap_or_default(),
        |s| s.key.lsn,
    );

    let mut acc: Option<UserValue> = match base {
        Some(b) if b.stmt_type == StatementType::Replace => Some(b.value.clone()),
        // DELETE below the chain means the oldest upsert runs its
        // insert branch.
        _ => None,
    };

    // Oldest upsert first
    for stmt in chain.iter().rev() {
        if let Some(applied) = executor.apply(acc.as_ref(), &stmt.value) {
            acc = Some(applied);
        }
        // Invalid operation: skipped, the accumulator is unchanged
    }

    let user_key = chain
        .first()
        .map(|s| s.key.user_key.clone())
        .or_else(|| base.map(|b| b.key.user_key.clone()))?;

    acc.map(|value| Statement::replace(user_key, value, newest_lsn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    /// Little-endian u64 addition, used all over the engine tests.
    pub struct AddExecutor;

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
            #[allow(clippy::expect_used)]
            let a = u64::from_le_bytes(older.as_ref().try_into().expect("8 bytes"));
            #[allow(clippy::expect_used)]
            let b = u64::from_le_bytes(newer.as_ref().try_into().expect("8 bytes"));
            a.wrapping_add(b).to_le_bytes().to_vec().into()
        }
    }

    fn upsert(delta: u64, lsn: u64) -> Statement {
        Statement::upsert(*b"k", delta.to_le_bytes(), lsn)
    }

    #[test]
    fn squash_chain_without_base() {
        let chain = [upsert(2, 5), upsert(1, 4)];
        let result = squash_chain(&AddExecutor, &chain, None).unwrap();

        assert_eq!(StatementType::Replace, result.stmt_type);
        assert_eq!(5, result.key.lsn);
        assert_eq!(3u64.to_le_bytes().as_slice(), &*result.value);
    }

    #[test]
    fn squash_chain_onto_replace() {
        let base = Statement::replace(*b"k", 10u64.to_le_bytes(), 1);
        let chain = [upsert(5, 3), upsert(1, 2)];
        let result = squash_chain(&AddExecutor, &chain, Some(&base)).unwrap();

        assert_eq!(16u64.to_le_bytes().as_slice(), &*result.value);
        assert_eq!(3, result.key.lsn);
    }

    #[test]
    fn squash_chain_onto_delete_runs_insert_branch() {
        let base = Statement::delete(*b"k", 1);
        let chain = [upsert(7, 2)];
        let result = squash_chain(&AddExecutor, &chain, Some(&base)).unwrap();

        assert_eq!(7u64.to_le_bytes().as_slice(), &*result.value);
    }

    #[test]
    fn overwrite_executor_is_last_write_wins() {
        let base: UserValue = (*b"old").into();
        let ops: UserValue = (*b"new").into();
        assert_eq!(
            Some(ops.clone()),
            OverwriteExecutor.apply(Some(&base), &ops)
        );
    }
}
