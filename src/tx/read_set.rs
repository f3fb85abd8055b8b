// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::TxId;
use crate::UserKey;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Per-index record of which transactions read which keys.
///
/// Ordered by (key, tx); populated only while a transaction has not
/// yet entered a read view. `is_gap` marks a scan probe that found
/// nothing - deleting nothing does not conflict with it.
pub(crate) struct ReadSet {
    entries: BTreeMap<(UserKey, TxId), bool>,
}

impl ReadSet {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Records a read. A point read dominates a gap probe on the
    /// same key.
    pub fn track(&mut self, key: UserKey, tx: TxId, is_gap: bool) {
        self.entries
            .entry((key, tx))
            .and_modify(|gap| *gap &= is_gap)
            .or_insert(is_gap);
    }

    pub fn remove(&mut self, key: &UserKey, tx: TxId) {
        self.entries.remove(&(key.clone(), tx));
    }

    /// All transactions that read `key`, with their gap flags.
    pub fn readers_of(&self, key: &UserKey) -> Vec<(TxId, bool)> {
        self.entries
            .range((
                Bound::Included((key.clone(), TxId::MIN)),
                Bound::Included((key.clone(), TxId::MAX)),
            ))
            .map(|((_, tx), is_gap)| (*tx, *is_gap))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn read_set_point_read_dominates_gap() {
        let mut rs = ReadSet::new();

        rs.track((*b"k").into(), 1, true);
        rs.track((*b"k").into(), 1, false);
        rs.track((*b"k").into(), 1, true);

        assert_eq!(vec![(1, false)], rs.readers_of(&(*b"k").into()));
    }

    #[test]
    fn read_set_scan_while_key_equal() {
        let mut rs = ReadSet::new();

        rs.track((*b"a").into(), 1, false);
        rs.track((*b"a").into(), 2, true);
        rs.track((*b"b").into(), 3, false);

        let readers = rs.readers_of(&(*b"a").into());
        assert_eq!(vec![(1, false), (2, true)], readers);
    }

    #[test]
    fn read_set_remove() {
        let mut rs = ReadSet::new();

        rs.track((*b"a").into(), 1, false);
        rs.remove(&(*b"a").into(), 1);

        assert_eq!(0, rs.len());
        assert!(rs.readers_of(&(*b"a").into()).is_empty());
    }
}
