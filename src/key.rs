// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{seqno::Lsn, UserKey};
use std::cmp::Reverse;

/// Internal identity of a statement: user key plus LSN.
///
/// The statement type is payload, not identity - committing a
/// transaction relabels prepared LSNs in place, and upsert squashing
/// replaces an UPSERT with a REPLACE under the same LSN.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    pub user_key: UserKey,
    pub lsn: Lsn,
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.user_key, self.lsn)
    }
}

impl InternalKey {
    pub fn new<K: Into<UserKey>>(user_key: K, lsn: Lsn) -> Self {
        let user_key = user_key.into();

        assert!(
            user_key.len() <= u16::MAX.into(),
            "keys can be 65535 bytes in length"
        );

        Self { user_key, lsn }
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Order by user key, THEN by LSN descending (newest version first).
// This is one of the most important functions
// Otherwise queries will not match expected behaviour
impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.user_key, Reverse(self.lsn)).cmp(&(&other.user_key, Reverse(other.lsn)))
    }
}
