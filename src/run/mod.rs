// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod format;
pub(crate) mod page;
pub(crate) mod reader;
pub mod writer;

use crate::coding::{Decode, DecodeError};
use crate::file::{run_file_name, MAGIC_BYTES, RUN_DATA_EXT, RUN_INDEX_EXT};
use crate::page_cache::PageCache;
use crate::seqno::Lsn;
use crate::{Slice, UserKey};
use format::{read_row, PageInfo, RowType, RunInfo};
use page::Page;
use std::fs::File;
use std::io::{BufReader, Read};
#[cfg(not(unix))]
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Monotonic run id, unique across the environment.
pub type RunId = u64;

/// An immutable sorted file pair inside a range
///
/// The data file holds pages of statement rows; the index file holds
/// run metadata and per-page metadata. Statement count and the LSN
/// bounds are carried out-of-line in the metadata log.
pub struct Run {
    id: RunId,

    /// `None` for empty runs, which have no files
    info: Option<RunInfo>,

    pages: Vec<PageInfo>,

    data_path: PathBuf,

    /// Kept open for the run's lifetime, so compaction can unlink the
    /// file while readers still hold their handle
    data_file: Mutex<Option<File>>,

    /// Sum of encoded page sizes
    size: u64,

    pub(crate) stmt_count: u64,
    pub(crate) min_lsn: Lsn,
    pub(crate) max_lsn: Lsn,
}

impl Run {
    /// Creates the handle of an empty run (logged, but never read).
    #[must_use]
    pub fn new_empty(id: RunId) -> Self {
        Self {
            id,
            info: None,
            pages: Vec::new(),
            data_path: PathBuf::new(),
            data_file: Mutex::new(None),
            size: 0,
            stmt_count: 0,
            min_lsn: 0,
            max_lsn: 0,
        }
    }

    pub(crate) fn from_parts(
        folder: &Path,
        id: RunId,
        info: RunInfo,
        pages: Vec<PageInfo>,
        stmt_count: u64,
        min_lsn: Lsn,
        max_lsn: Lsn,
    ) -> Self {
        let size = pages.iter().map(|p| u64::from(p.size)).sum();

        Self {
            id,
            info: Some(info),
            pages,
            data_path: folder.join(run_file_name(id, RUN_DATA_EXT)),
            data_file: Mutex::new(None),
            size,
            stmt_count,
            min_lsn,
            max_lsn,
        }
    }

    /// Opens a run from its index file.
    pub fn open(
        folder: &Path,
        id: RunId,
        stmt_count: u64,
        min_lsn: Lsn,
        max_lsn: Lsn,
    ) -> crate::Result<Self> {
        let index_path = folder.join(run_file_name(id, RUN_INDEX_EXT));

        let file = File::open(&index_path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("run index file").into());
        }

        let (row_type, payload) = read_row(&mut reader)?;
        if row_type != RowType::RunInfo {
            return Err(DecodeError::InvalidHeader("run info row").into());
        }
        let info = RunInfo::decode_from(&mut &payload[..])?;

        let mut pages = Vec::with_capacity(info.page_count as usize);
        for _ in 0..info.page_count {
            let (row_type, payload) = read_row(&mut reader)?;
            if row_type != RowType::PageInfo {
                return Err(DecodeError::InvalidHeader("page info row").into());
            }
            pages.push(PageInfo::decode_from(&mut &payload[..])?);
        }

        Ok(Self::from_parts(
            folder, id, info, pages, stmt_count, min_lsn, max_lsn,
        ))
    }

    #[must_use]
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Returns `true` if the run holds no statements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stmt_count == 0
    }

    /// Encoded size of the data file in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn min_key(&self) -> Option<&UserKey> {
        self.info.as_ref().map(|i| &i.min_key)
    }

    #[must_use]
    pub fn max_key(&self) -> Option<&UserKey> {
        self.info.as_ref().map(|i| &i.max_key)
    }

    /// Returns `false` if the bloom filter rules the key out.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.info.as_ref().is_some_and(|i| i.bloom.contains(key))
    }

    /// The middle page's min key, the split point approximation.
    #[must_use]
    pub fn mid_key(&self) -> Option<&UserKey> {
        // A run with a single page cannot be split without
        // leaving one child empty
        if self.pages.len() < 2 {
            return None;
        }

        self.pages.get(self.pages.len() / 2).map(|p| &p.min_key)
    }

    /// Index of the last page whose min key is at or before `key`.
    pub(crate) fn find_page(&self, user_key: &[u8]) -> usize {
        let idx = self
            .pages
            .partition_point(|page| &*page.min_key <= user_key);
        idx.saturating_sub(1)
    }

    /// Reads and parses a page, going through the page cache.
    pub(crate) fn read_page(&self, idx: usize, cache: &PageCache) -> crate::Result<Page> {
        if let Some(page) = cache.get(self.id, idx as u32) {
            return Ok(page);
        }

        let info = self
            .pages
            .get(idx)
            .ok_or(crate::Error::Corrupted("page index out of bounds"))?;

        let data = self.read_page_bytes(info)?;

        let page =
            Page::parse(data, info).map_err(|_| crate::Error::Corrupted("run page parse"))?;

        cache.insert(self.id, idx as u32, page.clone());

        Ok(page)
    }

    /// Reads a page's raw bytes through the run's long-lived file
    /// handle, so an unlinked (compacted-away) file stays readable
    /// while this run is referenced.
    #[allow(clippy::expect_used)]
    fn read_page_bytes(&self, info: &PageInfo) -> crate::Result<Slice> {
        let mut guard = self.data_file.lock().expect("lock is poisoned");

        if guard.is_none() {
            *guard = Some(File::open(&self.data_path)?);
        }

        let file = guard.as_mut().expect("file is open");

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;

            let mut buf = vec![0; info.size as usize];
            file.read_exact_at(&mut buf, info.offset)?;
            Ok(buf.into())
        }

        #[cfg(not(unix))]
        {
            file.seek(SeekFrom::Start(info.offset))?;
            Slice::from_reader(file, info.size as usize).map_err(Into::into)
        }
    }

    /// Removes the run's files; used by the orphan sweep and GC.
    pub(crate) fn remove_files(folder: &Path, id: RunId) -> std::io::Result<()> {
        for ext in [RUN_DATA_EXT, RUN_INDEX_EXT] {
            let path = folder.join(run_file_name(id, ext));
            if path.try_exists()? {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Run#{} ({} stmts, {} pages, {} B)",
            self.id,
            self.stmt_count,
            self.pages.len(),
            self.size,
        )
    }
}
