// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::format::{PageInfo, RowType, RunInfo};
use super::page::PageBuilder;
use super::{Run, RunId};
use crate::bloom::BloomSpectrum;
use crate::coding::Encode;
use crate::file::{fsync_directory, run_file_name, MAGIC_BYTES, RUN_DATA_EXT, RUN_INDEX_EXT};
use crate::seqno::Lsn;
use crate::statement::Statement;
use crate::UserKey;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

pub struct Options {
    /// Index folder the run files land in
    pub folder: PathBuf,

    pub run_id: RunId,

    /// Target encoded page size
    pub page_size: u32,

    /// False positive rate bound for the bloom filter
    pub bloom_fpr: f32,

    /// Row type to write (primary or secondary index statements)
    pub row_type: RowType,

    /// Exclusive upper key bound; the first statement at or past it is
    /// rejected and terminates the current page (used during split)
    pub end_key: Option<UserKey>,
}

/// Serializes a statement stream into a run file pair
///
/// The data is written to a temporary file which is fsync'd and
/// atomically renamed on success, so a crash mid-write leaves only
/// an orphan discoverable through its `PrepareRun` log record.
pub struct RunWriter {
    opts: Options,

    temp_data_path: PathBuf,
    data_writer: BufWriter<File>,
    file_pos: u64,

    page: PageBuilder,
    pages: Vec<PageInfo>,

    spectrum: BloomSpectrum,

    min_key: Option<UserKey>,
    last_key: Option<UserKey>,

    stmt_count: u64,
    min_lsn: Lsn,
    max_lsn: Lsn,

    finished: bool,
}

/// Outcome of writing one statement.
#[derive(Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Written,

    /// The statement lies at or past the configured end key;
    /// it was not written.
    BoundaryReached,
}

impl RunWriter {
    /// Sets up a new `RunWriter` writing into the given folder.
    pub fn new(opts: Options) -> crate::Result<Self> {
        let temp_data_path = opts
            .folder
            .join(format!("{}.tmp", run_file_name(opts.run_id, RUN_DATA_EXT)));

        let file = File::create(&temp_data_path)?;
        let data_writer = BufWriter::with_capacity(u16::MAX.into(), file);

        let page_capacity = opts.page_size as usize;

        Ok(Self {
            opts,
            temp_data_path,
            data_writer,
            file_pos: 0,
            page: PageBuilder::new(page_capacity),
            pages: Vec::new(),
            spectrum: BloomSpectrum::default(),
            min_key: None,
            last_key: None,
            stmt_count: 0,
            min_lsn: Lsn::MAX,
            max_lsn: 0,
            finished: false,
        })
    }

    fn spill_page(&mut self) -> crate::Result<()> {
        if self.page.is_empty() {
            return Ok(());
        }

        let page = std::mem::replace(&mut self.page, PageBuilder::new(self.opts.page_size as usize));

        let (bytes, mut info) = page.finish().map_err(crate::Error::Encode)?;
        info.offset = self.file_pos;

        self.data_writer.write_all(&bytes)?;
        self.file_pos += bytes.len() as u64;

        log::trace!(
            "run writer {}: cut page {} ({} rows, {} B)",
            self.opts.run_id,
            self.pages.len(),
            info.row_count,
            info.size,
        );

        self.pages.push(info);

        Ok(())
    }

    /// Writes a statement.
    pub fn write(&mut self, stmt: &Statement) -> crate::Result<WriteOutcome> {
        if let Some(end_key) = &self.opts.end_key {
            if stmt.key.user_key >= *end_key {
                self.spill_page()?;
                return Ok(WriteOutcome::BoundaryReached);
            }
        }

        // Copied out of the source's memory; both bounds outlive
        // the mems the statements came from
        if self.min_key.is_none() {
            self.min_key = Some(stmt.key.user_key.clone());
        }

        if self.last_key.as_ref() != Some(&stmt.key.user_key) {
            self.spectrum.insert(&stmt.key.user_key);
            self.last_key = Some(stmt.key.user_key.clone());
        }

        self.page.push(stmt, self.opts.row_type).map_err(crate::Error::Encode)?;

        self.stmt_count += 1;
        self.min_lsn = self.min_lsn.min(stmt.key.lsn);
        self.max_lsn = self.max_lsn.max(stmt.key.lsn);

        if self.page.size() >= self.opts.page_size as usize {
            self.spill_page()?;
        }

        Ok(WriteOutcome::Written)
    }

    /// Smallest statement LSN written so far.
    #[must_use]
    pub fn min_lsn(&self) -> Lsn {
        self.min_lsn
    }

    /// Largest statement LSN written so far.
    #[must_use]
    pub fn max_lsn(&self) -> Lsn {
        self.max_lsn
    }

    /// Number of statements written so far.
    #[must_use]
    pub fn stmt_count(&self) -> u64 {
        self.stmt_count
    }

    /// Finishes the run.
    ///
    /// An empty run (no pages) produces no files; the caller still logs
    /// it so replay can skip its LSN span.
    pub fn finish(mut self) -> crate::Result<Run> {
        self.spill_page()?;
        self.finished = true;

        if self.pages.is_empty() {
            log::debug!("run writer {}: empty run", self.opts.run_id);
            let _ = std::fs::remove_file(&self.temp_data_path);
            return Ok(Run::new_empty(self.opts.run_id));
        }

        self.data_writer.flush()?;
        self.data_writer.get_ref().sync_all()?;

        let data_path = self
            .opts
            .folder
            .join(run_file_name(self.opts.run_id, RUN_DATA_EXT));

        std::fs::rename(&self.temp_data_path, &data_path)?;

        // NOTE: page count is bounded by run size / page size
        #[allow(clippy::cast_possible_truncation)]
        let page_count = self.pages.len() as u32;

        #[allow(clippy::expect_used)]
        let info = RunInfo {
            min_key: self.min_key.clone().expect("run is not empty"),
            max_key: self.last_key.clone().expect("run is not empty"),
            page_count,
            bloom: self.spectrum.build(self.opts.bloom_fpr),
        };

        let mut index_bytes = Vec::new();
        index_bytes.extend_from_slice(&MAGIC_BYTES);

        super::format::write_row(&mut index_bytes, RowType::RunInfo, &info.encode_into_vec())
            .map_err(crate::Error::Encode)?;

        for page in &self.pages {
            super::format::write_row(&mut index_bytes, RowType::PageInfo, &page.encode_into_vec())
                .map_err(crate::Error::Encode)?;
        }

        let index_path = self
            .opts
            .folder
            .join(run_file_name(self.opts.run_id, RUN_INDEX_EXT));

        crate::file::write_atomic(&index_path, &index_bytes)?;
        fsync_directory(&self.opts.folder)?;

        log::debug!(
            "run writer {}: finished ({} stmts, {} pages)",
            self.opts.run_id,
            self.stmt_count,
            self.pages.len(),
        );

        Ok(Run::from_parts(
            &self.opts.folder,
            self.opts.run_id,
            info,
            std::mem::take(&mut self.pages),
            self.stmt_count,
            self.min_lsn,
            self.max_lsn,
        ))
    }
}

impl Drop for RunWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.temp_data_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_cache::PageCache;
    use crate::run::reader::RunScanner;
    use std::sync::Arc;
    use test_log::test;

    fn opts(folder: &std::path::Path, run_id: RunId) -> Options {
        Options {
            folder: folder.into(),
            run_id,
            page_size: 256,
            bloom_fpr: 0.01,
            row_type: RowType::Primary,
            end_key: None,
        }
    }

    #[test]
    fn run_writer_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = Arc::new(PageCache::with_capacity_bytes(1_024 * 1_024));

        let mut writer = RunWriter::new(opts(dir.path(), 1))?;

        let mut expected = vec![];
        for i in 0u64..500 {
            let stmt = Statement::replace(i.to_be_bytes(), *b"value", i + 1);
            assert_eq!(WriteOutcome::Written, writer.write(&stmt)?);
            expected.push(stmt);
        }

        let run = Arc::new(writer.finish()?);
        assert_eq!(500, run.stmt_count);
        assert_eq!(1, run.min_lsn);
        assert_eq!(500, run.max_lsn);
        assert!(run.page_count() > 1);

        // Reopen from disk and compare
        let reopened = Arc::new(Run::open(dir.path(), 1, 500, 1, 500)?);
        assert_eq!(run.page_count(), reopened.page_count());
        assert_eq!(run.min_key(), reopened.min_key());
        assert_eq!(run.max_key(), reopened.max_key());

        let scanned = RunScanner::new(reopened, cache)
            .collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(expected.len(), scanned.len());
        for (a, b) in expected.iter().zip(scanned.iter()) {
            assert_eq!(a.key, b.key);
            assert_eq!(a.value, b.value);
        }

        Ok(())
    }

    #[test]
    fn run_writer_empty_run_has_no_files() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let writer = RunWriter::new(opts(dir.path(), 2))?;
        let run = writer.finish()?;

        assert!(run.is_empty());
        assert_eq!(0, std::fs::read_dir(dir.path())?.count());

        Ok(())
    }

    #[test]
    fn run_writer_bloom_contains_written_keys() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut writer = RunWriter::new(opts(dir.path(), 3))?;
        for i in 0u64..100 {
            writer.write(&Statement::replace(i.to_be_bytes(), *b"v", i + 1))?;
        }

        let run = writer.finish()?;

        for i in 0u64..100 {
            assert!(run.may_contain(&i.to_be_bytes()));
        }

        Ok(())
    }

    #[test]
    fn run_writer_respects_end_key() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut opts = opts(dir.path(), 4);
        opts.end_key = Some(50u64.to_be_bytes().into());

        let mut writer = RunWriter::new(opts)?;

        for i in 0u64..49 {
            assert_eq!(
                WriteOutcome::Written,
                writer.write(&Statement::replace(i.to_be_bytes(), *b"v", i + 1))?
            );
        }

        assert_eq!(
            WriteOutcome::BoundaryReached,
            writer.write(&Statement::replace(50u64.to_be_bytes(), *b"v", 51))?
        );

        let run = writer.finish()?;
        assert_eq!(49, run.stmt_count);
        assert_eq!(Some(&48u64.to_be_bytes().into()), run.max_key());

        Ok(())
    }

    #[test]
    fn run_writer_min_max_keys_are_first_and_last() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut writer = RunWriter::new(opts(dir.path(), 5))?;
        writer.write(&Statement::replace(*b"bbb", *b"1", 2))?;
        writer.write(&Statement::replace(*b"ccc", *b"2", 1))?;
        writer.write(&Statement::replace(*b"ddd", *b"3", 3))?;

        let run = writer.finish()?;

        assert_eq!(Some(&(*b"bbb").into()), run.min_key());
        assert_eq!(Some(&(*b"ddd").into()), run.max_key());

        Ok(())
    }
}
