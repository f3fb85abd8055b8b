// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{key::InternalKey, seqno::Lsn, slice::Slice, UserKey, UserValue};

/// An UPSERT whose chain of pending upserts below it has reached this
/// depth is queued for background squashing.
pub const UPSERT_THRESHOLD: u8 = 128;

/// Saturation value for the upsert chain counter.
pub const UPSERT_INF: u8 = 255;

/// Column mask meaning "all columns touched".
pub const COLUMN_MASK_FULL: u64 = u64::MAX;

/// Statement type
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StatementType {
    /// Full value for a key
    Replace,

    /// Deletion marker (tombstone)
    Delete,

    /// Mergeable update recording an operation to apply
    /// against any prior value
    Upsert,

    /// Search key only, never stored
    Select,
}

impl TryFrom<u8> for StatementType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Replace),
            1 => Ok(Self::Delete),
            2 => Ok(Self::Upsert),
            3 => Ok(Self::Select),
            _ => Err(()),
        }
    }
}

impl From<StatementType> for u8 {
    fn from(value: StatementType) -> Self {
        match value {
            StatementType::Replace => 0,
            StatementType::Delete => 1,
            StatementType::Upsert => 2,
            StatementType::Select => 3,
        }
    }
}

/// An immutable multi-version record
///
/// For `Replace`, `value` is the full tuple; for `Upsert` it is the
/// operation blob interpreted by the index's upsert executor; for
/// `Delete` and `Select` it is empty.
#[derive(Clone, Eq)]
pub struct Statement {
    /// Identity: (user key, LSN)
    pub key: InternalKey,

    /// Statement type
    pub stmt_type: StatementType,

    /// Value or upsert operation blob
    pub value: UserValue,

    /// Depth of the UPSERT chain below this statement, saturating
    /// at [`UPSERT_INF`]
    pub upsert_count: u8,

    /// Bitset of columns the statement touches
    pub column_mask: u64,
}

impl Statement {
    /// Creates a new REPLACE.
    pub fn replace<K: Into<UserKey>, V: Into<UserValue>>(key: K, value: V, lsn: Lsn) -> Self {
        Self {
            key: InternalKey::new(key, lsn),
            stmt_type: StatementType::Replace,
            value: value.into(),
            upsert_count: 0,
            column_mask: COLUMN_MASK_FULL,
        }
    }

    /// Creates a new DELETE.
    pub fn delete<K: Into<UserKey>>(key: K, lsn: Lsn) -> Self {
        Self {
            key: InternalKey::new(key, lsn),
            stmt_type: StatementType::Delete,
            value: Slice::empty(),
            upsert_count: 0,
            column_mask: COLUMN_MASK_FULL,
        }
    }

    /// Creates a new UPSERT carrying an operation blob.
    pub fn upsert<K: Into<UserKey>, V: Into<UserValue>>(key: K, ops: V, lsn: Lsn) -> Self {
        Self {
            key: InternalKey::new(key, lsn),
            stmt_type: StatementType::Upsert,
            value: ops.into(),
            upsert_count: 0,
            column_mask: COLUMN_MASK_FULL,
        }
    }

    /// Creates a search key.
    pub fn select<K: Into<UserKey>>(key: K) -> Self {
        Self {
            key: InternalKey::new(key, Lsn::MAX),
            stmt_type: StatementType::Select,
            value: Slice::empty(),
            upsert_count: 0,
            column_mask: COLUMN_MASK_FULL,
        }
    }

    /// Restricts the statement to the given column mask.
    #[must_use]
    pub fn with_column_mask(mut self, mask: u64) -> Self {
        self.column_mask = mask;
        self
    }

    /// Returns a copy carrying a different LSN.
    #[must_use]
    pub fn with_lsn(mut self, lsn: Lsn) -> Self {
        self.key.lsn = lsn;
        self
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.stmt_type == StatementType::Delete
    }

    /// Approximate heap size, used for mem and quota accounting.
    #[must_use]
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.user_key.len() + self.value.len()
    }

    /// Increments the upsert chain counter, saturating.
    pub fn bump_upsert_count(&mut self, below: u8) {
        self.upsert_count = if below >= UPSERT_INF - 1 {
            UPSERT_INF
        } else {
            below + 1
        };
    }
}

impl PartialEq for Statement {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl PartialOrd for Statement {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.key.cmp(&other.key))
    }
}

impl Ord for Statement {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{} => {:?}",
            self.key,
            match self.stmt_type {
                StatementType::Replace => "R",
                StatementType::Delete => "D",
                StatementType::Upsert => "U",
                StatementType::Select => "S",
            },
            if self.value.len() >= 64 {
                format!("[ ... {} bytes ]", self.value.len())
            } else {
                format!("{:?}", self.value)
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn statement_ordering_is_mvcc() {
        let old = Statement::replace(*b"a", *b"old", 1);
        let new = Statement::replace(*b"a", *b"new", 2);
        assert!(new < old, "newer versions sort first");
    }

    #[test]
    fn statement_upsert_count_saturates() {
        let mut stmt = Statement::upsert(*b"a", *b"+1", 1);
        stmt.bump_upsert_count(3);
        assert_eq!(4, stmt.upsert_count);

        stmt.bump_upsert_count(UPSERT_INF - 1);
        assert_eq!(UPSERT_INF, stmt.upsert_count);

        stmt.bump_upsert_count(UPSERT_INF);
        assert_eq!(UPSERT_INF, stmt.upsert_count);
    }
}
