// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::statement::{Statement, StatementType};
use crate::upsert::UpsertExecutor;
use crate::UserKey;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Per-transaction buffered writes, ordered by (index, user key).
///
/// A subsequent write to the same key replaces the entry; an UPSERT
/// over an existing entry is squashed locally through the executor, so
/// the write set holds at most one statement per key.
pub(crate) struct WriteSet {
    entries: BTreeMap<(u64, UserKey), Statement>,

    /// Bumped on every change; the merge source over the write set is
    /// mutable and restores against this
    version: u64,
}

impl WriteSet {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffers a statement, squashing against any previous write to the
    /// same key. Returns the replaced entry for the undo log.
    pub fn insert(
        &mut self,
        index_id: u64,
        stmt: Statement,
        executor: &dyn UpsertExecutor,
    ) -> Option<Statement> {
        let key = (index_id, stmt.key.user_key.clone());
        self.version += 1;

        let old = self.entries.get(&key);

        let merged = match (old, stmt.stmt_type) {
            (Some(old), StatementType::Upsert) => match old.stmt_type {
                StatementType::Replace => {
                    // Applying to own REPLACE keeps the entry a REPLACE
                    match executor.apply(Some(&old.value), &stmt.value) {
                        Some(value) => {
                            Statement::replace(stmt.key.user_key.clone(), value, 0)
                        }
                        None => old.clone(),
                    }
                }
                StatementType::Delete => {
                    // UPSERT over own DELETE runs the insert branch
                    match executor.apply(None, &stmt.value) {
                        Some(value) => {
                            Statement::replace(stmt.key.user_key.clone(), value, 0)
                        }
                        None => old.clone(),
                    }
                }
                StatementType::Upsert => {
                    let ops = executor.merge(&old.value, &stmt.value);
                    let mut merged =
                        Statement::upsert(stmt.key.user_key.clone(), ops, 0);
                    merged.bump_upsert_count(old.upsert_count);
                    merged.column_mask = old.column_mask | stmt.column_mask;
                    merged
                }
                StatementType::Select => unreachable!("SELECT is never buffered"),
            },
            _ => stmt,
        };

        self.entries.insert(key, merged)
    }

    /// Restores a key to its pre-write state (savepoint rollback).
    pub fn restore(&mut self, index_id: u64, key: &UserKey, prev: Option<Statement>) {
        self.version += 1;

        let key = (index_id, key.clone());
        match prev {
            Some(stmt) => {
                self.entries.insert(key, stmt);
            }
            None => {
                self.entries.remove(&key);
            }
        }
    }

    pub fn get(&self, index_id: u64, key: &UserKey) -> Option<&Statement> {
        self.entries.get(&(index_id, key.clone()))
    }

    /// Iterates all buffered writes in (index, key) order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Statement)> {
        self.entries.iter().map(|((index_id, _), stmt)| (*index_id, stmt))
    }

    /// Directional seek used by the merge source.
    ///
    /// `from` is `(key, inclusive)`; forward seeks the first entry at or
    /// after it, backward the last entry at or before it.
    pub fn seek(
        &self,
        index_id: u64,
        forward: bool,
        from: Option<(UserKey, bool)>,
    ) -> Option<Statement> {
        if forward {
            let lower: Bound<(u64, UserKey)> = match from {
                Some((key, true)) => Bound::Included((index_id, key)),
                Some((key, false)) => Bound::Excluded((index_id, key)),
                None => Bound::Included((index_id, UserKey::empty())),
            };

            self.entries
                .range((lower, Bound::Unbounded))
                .next()
                .filter(|((idx, _), _)| *idx == index_id)
                .map(|(_, stmt)| stmt.clone())
        } else {
            let upper: Bound<(u64, UserKey)> = match from {
                Some((key, true)) => Bound::Included((index_id, key)),
                Some((key, false)) => Bound::Excluded((index_id, key)),
                None => Bound::Excluded((index_id + 1, UserKey::empty())),
            };

            self.entries
                .range((Bound::Included((index_id, UserKey::empty())), upper))
                .next_back()
                .map(|(_, stmt)| stmt.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upsert::OverwriteExecutor;
    use test_log::test;

    #[test]
    fn write_set_replaces_same_key() {
        let mut ws = WriteSet::new();

        ws.insert(1, Statement::replace(*b"k", *b"v1", 0), &OverwriteExecutor);
        let prev = ws.insert(1, Statement::replace(*b"k", *b"v2", 0), &OverwriteExecutor);

        assert_eq!(1, ws.len());
        assert_eq!(*b"v1", &*prev.unwrap().value);
        assert_eq!(*b"v2", &*ws.get(1, &(*b"k").into()).unwrap().value);
    }

    #[test]
    fn write_set_upsert_over_replace_stays_replace() {
        let mut ws = WriteSet::new();

        ws.insert(1, Statement::replace(*b"k", *b"v1", 0), &OverwriteExecutor);
        ws.insert(1, Statement::upsert(*b"k", *b"v2", 0), &OverwriteExecutor);

        let stmt = ws.get(1, &(*b"k").into()).unwrap();
        assert_eq!(StatementType::Replace, stmt.stmt_type);
        assert_eq!(*b"v2", &*stmt.value);
    }

    #[test]
    fn write_set_upsert_over_delete_becomes_replace() {
        let mut ws = WriteSet::new();

        ws.insert(1, Statement::delete(*b"k", 0), &OverwriteExecutor);
        ws.insert(1, Statement::upsert(*b"k", *b"v", 0), &OverwriteExecutor);

        let stmt = ws.get(1, &(*b"k").into()).unwrap();
        assert_eq!(StatementType::Replace, stmt.stmt_type);
    }

    #[test]
    fn write_set_upsert_chain_counts() {
        let mut ws = WriteSet::new();

        ws.insert(1, Statement::upsert(*b"k", *b"a", 0), &OverwriteExecutor);
        ws.insert(1, Statement::upsert(*b"k", *b"b", 0), &OverwriteExecutor);

        let stmt = ws.get(1, &(*b"k").into()).unwrap();
        assert_eq!(StatementType::Upsert, stmt.stmt_type);
        assert_eq!(1, stmt.upsert_count);
    }

    #[test]
    fn write_set_seek_is_per_index() {
        let mut ws = WriteSet::new();

        ws.insert(1, Statement::replace(*b"a", *b"1", 0), &OverwriteExecutor);
        ws.insert(2, Statement::replace(*b"b", *b"2", 0), &OverwriteExecutor);

        let found = ws.seek(1, true, None).unwrap();
        assert_eq!(*b"a", &*found.key.user_key);

        assert!(ws
            .seek(1, true, Some(((*b"a").into(), false)))
            .is_none(), "index 1 has nothing after 'a'");

        let found = ws.seek(2, false, None).unwrap();
        assert_eq!(*b"b", &*found.key.user_key);
    }
}
