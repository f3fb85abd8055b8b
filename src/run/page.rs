// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::format::{
    decode_page_index, decode_statement, encode_page_index, encode_statement, read_row, write_row,
    PageInfo, RowType,
};
use crate::coding::{DecodeError, EncodeError};
use crate::key::InternalKey;
use crate::statement::Statement;
use crate::{Slice, UserKey};

/// Accumulates statement rows until the page is cut.
pub(crate) struct PageBuilder {
    buf: Vec<u8>,
    row_offsets: Vec<u32>,
    min_key: Option<UserKey>,
    unpacked_size: u32,
}

impl PageBuilder {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            row_offsets: Vec::new(),
            min_key: None,
            unpacked_size: 0,
        }
    }

    /// Appends a statement row.
    pub fn push(&mut self, stmt: &Statement, row_type: RowType) -> Result<(), EncodeError> {
        debug_assert!(matches!(row_type, RowType::Primary | RowType::Secondary));

        // NOTE: Pages are bounded by the page size target, u32 is plenty
        #[allow(clippy::cast_possible_truncation)]
        self.row_offsets.push(self.buf.len() as u32);

        if self.min_key.is_none() {
            self.min_key = Some(stmt.key.user_key.clone());
        }

        let payload = encode_statement(stmt)?;
        write_row(&mut self.buf, row_type, &payload)?;

        // NOTE: see above
        #[allow(clippy::cast_possible_truncation)]
        {
            self.unpacked_size += stmt.size() as u32;
        }

        Ok(())
    }

    /// Encoded size so far.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn row_count(&self) -> u32 {
        // NOTE: bounded by page size
        #[allow(clippy::cast_possible_truncation)]
        {
            self.row_offsets.len() as u32
        }
    }

    pub fn is_empty(&self) -> bool {
        self.row_offsets.is_empty()
    }

    /// Terminates the page: appends the row-offset table and returns
    /// the encoded page plus its metadata (without the file offset).
    pub fn finish(mut self) -> Result<(Vec<u8>, PageInfo), EncodeError> {
        debug_assert!(!self.is_empty(), "run writer never emits an empty page");

        // NOTE: bounded by page size
        #[allow(clippy::cast_possible_truncation)]
        let page_index_offset = self.buf.len() as u32;

        let payload = encode_page_index(&self.row_offsets)?;
        write_row(&mut self.buf, RowType::PageIndex, &payload)?;

        #[allow(clippy::cast_possible_truncation, clippy::expect_used)]
        let info = PageInfo {
            offset: 0,
            size: self.buf.len() as u32,
            row_count: self.row_offsets.len() as u32,
            min_key: self.min_key.expect("page is not empty"),
            unpacked_size: self.unpacked_size,
            page_index_offset,
        };

        Ok((self.buf, info))
    }
}

/// A decoded page: raw bytes plus the row offset table.
///
/// Rows are decoded lazily on access.
#[derive(Clone)]
pub(crate) struct Page {
    data: Slice,
    row_offsets: Vec<u32>,
}

impl Page {
    /// Parses a page read from the data file.
    pub fn parse(data: Slice, info: &PageInfo) -> Result<Self, DecodeError> {
        let index_offset = info.page_index_offset as usize;

        let mut reader = data
            .get(index_offset..)
            .ok_or(DecodeError::InvalidLength("page index offset"))?;

        let (row_type, payload) = read_row(&mut reader)?;
        if row_type != RowType::PageIndex {
            return Err(DecodeError::InvalidHeader("page index row"));
        }

        let row_offsets = decode_page_index(&payload)?;
        if row_offsets.len() != info.row_count as usize {
            return Err(DecodeError::InvalidLength("page row count"));
        }

        Ok(Self { data, row_offsets })
    }

    pub fn len(&self) -> usize {
        self.row_offsets.len()
    }

    /// Approximate memory weight, for the page cache.
    pub fn weight(&self) -> u64 {
        (self.data.len() + self.row_offsets.len() * 4) as u64
    }

    /// Decodes the i-th statement row.
    pub fn get(&self, idx: usize) -> Result<Statement, DecodeError> {
        let offset = *self
            .row_offsets
            .get(idx)
            .ok_or(DecodeError::InvalidLength("page row index"))? as usize;

        let mut reader = self
            .data
            .get(offset..)
            .ok_or(DecodeError::InvalidLength("page row offset"))?;

        let (row_type, payload) = read_row(&mut reader)?;
        if !matches!(row_type, RowType::Primary | RowType::Secondary) {
            return Err(DecodeError::InvalidHeader("statement row"));
        }

        decode_statement(&payload)
    }

    /// Index of the first row at or after `key` in (user key, -lsn) order.
    pub fn lower_bound(&self, key: &InternalKey) -> Result<usize, DecodeError> {
        let mut lo = 0;
        let mut hi = self.len();

        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.get(mid)?.key < *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        Ok(lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn build_page(stmts: &[Statement]) -> (Vec<u8>, PageInfo) {
        let mut builder = PageBuilder::new(1_024);
        for stmt in stmts {
            builder.push(stmt, RowType::Primary).unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn page_roundtrip_is_identity() {
        let stmts = [
            Statement::replace(*b"a", *b"1", 5),
            Statement::replace(*b"a", *b"0", 2),
            Statement::delete(*b"b", 3),
            Statement::upsert(*b"c", *b"+1", 4),
        ];

        let (bytes, info) = build_page(&stmts);
        assert_eq!(4, info.row_count);
        assert_eq!(*b"a", &*info.min_key);

        let page = Page::parse(bytes.into(), &info).unwrap();
        assert_eq!(4, page.len());

        for (idx, stmt) in stmts.iter().enumerate() {
            let got = page.get(idx).unwrap();
            assert_eq!(stmt.key, got.key);
            assert_eq!(stmt.stmt_type, got.stmt_type);
            assert_eq!(stmt.value, got.value);
        }
    }

    #[test]
    fn page_lower_bound() {
        let stmts = [
            Statement::replace(*b"a", *b"1", 5),
            Statement::replace(*b"a", *b"0", 2),
            Statement::replace(*b"c", *b"2", 3),
        ];

        let (bytes, info) = build_page(&stmts);
        let page = Page::parse(bytes.into(), &info).unwrap();

        // Before everything
        assert_eq!(0, page.lower_bound(&InternalKey::new(*b"a", u64::MAX)).unwrap());

        // Between versions of "a"
        assert_eq!(1, page.lower_bound(&InternalKey::new(*b"a", 4)).unwrap());

        // Between keys
        assert_eq!(2, page.lower_bound(&InternalKey::new(*b"b", u64::MAX)).unwrap());

        // Past everything
        assert_eq!(3, page.lower_bound(&InternalKey::new(*b"z", u64::MAX)).unwrap());
    }

    #[test]
    fn page_corrupted_row_offset_fails() {
        let stmts = [Statement::replace(*b"a", *b"1", 1)];
        let (bytes, mut info) = build_page(&stmts);

        info.page_index_offset = info.size + 100;

        assert!(Page::parse(bytes.into(), &info).is_err());
    }
}
