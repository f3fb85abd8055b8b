// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::page::Page;
use super::Run;
use crate::key::InternalKey;
use crate::page_cache::PageCache;
use crate::statement::Statement;
use std::sync::Arc;

/// Sequentially scans all statements of a run, oldest page to newest.
///
/// Used by compaction and split tasks.
pub(crate) struct RunScanner {
    run: Arc<Run>,
    cache: Arc<PageCache>,
    page_idx: usize,
    row_idx: usize,
    page: Option<Page>,
}

impl RunScanner {
    pub fn new(run: Arc<Run>, cache: Arc<PageCache>) -> Self {
        Self {
            run,
            cache,
            page_idx: 0,
            row_idx: 0,
            page: None,
        }
    }
}

impl Iterator for RunScanner {
    type Item = crate::Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page.is_none() {
                if self.run.is_empty() || self.page_idx >= self.run.page_count() {
                    return None;
                }
                self.page = Some(fail_iter!(self.run.read_page(self.page_idx, &self.cache)));
                self.row_idx = 0;
            }

            #[allow(clippy::expect_used)]
            let page = self.page.as_ref().expect("page is loaded");

            if self.row_idx < page.len() {
                let stmt = fail_iter!(page
                    .get(self.row_idx)
                    .map_err(|_| crate::Error::Corrupted("run page row")));
                self.row_idx += 1;
                return Some(Ok(stmt));
            }

            self.page = None;
            self.page_idx += 1;
        }
    }
}

/// Bidirectional cursor over a run, used by the merge iterator.
///
/// The position is a (page, row) pair; pages are loaded through the
/// page cache on demand.
pub(crate) struct RunCursor {
    run: Arc<Run>,
    cache: Arc<PageCache>,

    /// Loaded page at `pos.0`
    page: Option<(usize, Page)>,

    /// `None` before the first seek
    pos: Option<(usize, usize)>,

    exhausted: bool,
}

impl RunCursor {
    pub fn new(run: Arc<Run>, cache: Arc<PageCache>) -> Self {
        let exhausted = run.is_empty();

        Self {
            run,
            cache,
            page: None,
            pos: None,
            exhausted,
        }
    }

    fn load_page(&mut self, idx: usize) -> crate::Result<&Page> {
        if self.page.as_ref().map(|(i, _)| *i) != Some(idx) {
            let page = self.run.read_page(idx, &self.cache)?;
            self.page = Some((idx, page));
        }

        #[allow(clippy::expect_used)]
        Ok(&self.page.as_ref().expect("page is loaded").1)
    }

    /// Positions the cursor at the first row at or after `key`.
    ///
    /// Returns `false` if the run has no such row.
    pub fn seek(&mut self, key: &InternalKey) -> crate::Result<bool> {
        if self.run.is_empty() {
            self.exhausted = true;
            return Ok(false);
        }

        let page_idx = self.run.find_page(&key.user_key);

        let page = self.load_page(page_idx)?;
        let row_idx = page
            .lower_bound(key)
            .map_err(|_| crate::Error::Corrupted("run page row"))?;

        if row_idx < page.len() {
            self.pos = Some((page_idx, row_idx));
            self.exhausted = false;
            return Ok(true);
        }

        // Past the last row of this page; the target can only be
        // in the next page
        if page_idx + 1 < self.run.page_count() {
            self.pos = Some((page_idx + 1, 0));
            self.exhausted = false;
            return Ok(true);
        }

        self.exhausted = true;
        Ok(false)
    }

    /// Positions the cursor at the last row of the run.
    ///
    /// Returns `false` if the run is empty.
    pub fn seek_to_last(&mut self) -> crate::Result<bool> {
        if self.run.is_empty() {
            self.exhausted = true;
            return Ok(false);
        }

        let page_idx = self.run.page_count() - 1;
        let page = self.load_page(page_idx)?;

        self.pos = Some((page_idx, page.len() - 1));
        self.exhausted = false;
        Ok(true)
    }

    /// Positions the cursor at the last row strictly before `key`.
    ///
    /// Returns `false` if no such row exists.
    pub fn seek_before(&mut self, key: &InternalKey) -> crate::Result<bool> {
        if !self.seek(key)? {
            return self.seek_to_last();
        }
        self.retreat()
    }

    /// Returns the statement at the current position.
    pub fn current(&mut self) -> crate::Result<Option<Statement>> {
        if self.exhausted {
            return Ok(None);
        }

        let Some((page_idx, row_idx)) = self.pos else {
            return Ok(None);
        };

        let page = self.load_page(page_idx)?;
        let stmt = page
            .get(row_idx)
            .map_err(|_| crate::Error::Corrupted("run page row"))?;

        Ok(Some(stmt))
    }

    /// Steps forward; returns `false` when the run is exhausted.
    pub fn advance(&mut self) -> crate::Result<bool> {
        let Some((mut page_idx, mut row_idx)) = self.pos else {
            return Ok(false);
        };

        let page_len = self.load_page(page_idx)?.len();

        if row_idx + 1 < page_len {
            row_idx += 1;
        } else if page_idx + 1 < self.run.page_count() {
            page_idx += 1;
            row_idx = 0;
        } else {
            self.exhausted = true;
            return Ok(false);
        }

        self.pos = Some((page_idx, row_idx));
        self.exhausted = false;
        Ok(true)
    }

    /// Steps backward; returns `false` when the run is exhausted.
    pub fn retreat(&mut self) -> crate::Result<bool> {
        let Some((mut page_idx, mut row_idx)) = self.pos else {
            return Ok(false);
        };

        if row_idx > 0 {
            row_idx -= 1;
        } else if page_idx > 0 {
            page_idx -= 1;
            row_idx = self.load_page(page_idx)?.len() - 1;
        } else {
            self.exhausted = true;
            return Ok(false);
        }

        self.pos = Some((page_idx, row_idx));
        self.exhausted = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::format::RowType;
    use crate::run::writer::{Options, RunWriter};
    use test_log::test;

    fn write_run(dir: &std::path::Path) -> crate::Result<Arc<Run>> {
        let mut writer = RunWriter::new(Options {
            folder: dir.into(),
            run_id: 9,
            page_size: 128,
            bloom_fpr: 0.01,
            row_type: RowType::Primary,
            end_key: None,
        })?;

        for i in (0u64..100).step_by(2) {
            writer.write(&Statement::replace(i.to_be_bytes(), *b"new", 10))?;
            writer.write(&Statement::replace(i.to_be_bytes(), *b"old", 5))?;
        }

        Ok(Arc::new(writer.finish()?))
    }

    #[test]
    fn run_cursor_seek_and_scan() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = write_run(dir.path())?;
        let cache = Arc::new(PageCache::with_capacity_bytes(1_024 * 1_024));

        let mut cursor = RunCursor::new(run, cache);

        // Exact hit: newest version first
        assert!(cursor.seek(&InternalKey::new(10u64.to_be_bytes(), u64::MAX))?);
        let stmt = cursor.current()?.unwrap();
        assert_eq!(10u64.to_be_bytes().as_slice(), &*stmt.key.user_key);
        assert_eq!(10, stmt.key.lsn);

        // Visibility seek: lsn <= 5
        assert!(cursor.seek(&InternalKey::new(10u64.to_be_bytes(), 5))?);
        assert_eq!(5, cursor.current()?.unwrap().key.lsn);

        // Gap seek positions at the next key
        assert!(cursor.seek(&InternalKey::new(11u64.to_be_bytes(), u64::MAX))?);
        assert_eq!(
            12u64.to_be_bytes().as_slice(),
            &*cursor.current()?.unwrap().key.user_key
        );

        // Walk to the end
        assert!(cursor.seek(&InternalKey::new(0u64.to_be_bytes(), u64::MAX))?);
        let mut count = 1;
        while cursor.advance()? {
            count += 1;
        }
        assert_eq!(100, count);

        Ok(())
    }

    #[test]
    fn run_cursor_retreat() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = write_run(dir.path())?;
        let cache = Arc::new(PageCache::with_capacity_bytes(1_024 * 1_024));

        let mut cursor = RunCursor::new(run, cache);

        assert!(cursor.seek_to_last()?);
        let stmt = cursor.current()?.unwrap();
        assert_eq!(98u64.to_be_bytes().as_slice(), &*stmt.key.user_key);
        assert_eq!(5, stmt.key.lsn, "oldest version is last within a key");

        let mut count = 1;
        while cursor.retreat()? {
            count += 1;
        }
        assert_eq!(100, count);

        Ok(())
    }

    #[test]
    fn run_cursor_seek_before() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = write_run(dir.path())?;
        let cache = Arc::new(PageCache::with_capacity_bytes(1_024 * 1_024));

        let mut cursor = RunCursor::new(run, cache);

        // Strictly-before an existing position
        assert!(cursor.seek_before(&InternalKey::new(50u64.to_be_bytes(), u64::MAX))?);
        let stmt = cursor.current()?.unwrap();
        assert_eq!(48u64.to_be_bytes().as_slice(), &*stmt.key.user_key);

        // Before everything
        assert!(!cursor.seek_before(&InternalKey::new(0u64.to_be_bytes(), u64::MAX))?);

        // Past everything lands on the last row
        assert!(cursor.seek_before(&InternalKey::new(200u64.to_be_bytes(), u64::MAX))?);
        let stmt = cursor.current()?.unwrap();
        assert_eq!(98u64.to_be_bytes().as_slice(), &*stmt.key.user_key);

        Ok(())
    }
}
