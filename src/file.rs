// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{io::Write, path::Path};

pub const MAGIC_BYTES: [u8; 4] = [b'L', b'S', b'E', 1];

pub const METADATA_LOG_FILE: &str = "metadata.log";

pub const RUN_DATA_EXT: &str = "run";
pub const RUN_INDEX_EXT: &str = "index";

/// Formats a run file name from its id.
#[must_use]
pub fn run_file_name(run_id: u64, ext: &str) -> String {
    format!("{run_id:020}.{ext}")
}

/// Atomically writes a file: temp file, fsync, rename, fsync directory.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    #[allow(clippy::expect_used)]
    let folder = path.parent().expect("should have a parent directory");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    fsync_directory(folder)?;

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}
