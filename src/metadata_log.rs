// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The metadata log: an append-only framed record file describing
//! indexes, ranges and runs. Every run is `PrepareRun`-logged before
//! its first disk write, so a crash leaves at worst an orphan file
//! discoverable on recovery.

use crate::coding::DecodeError;
use crate::file::METADATA_LOG_FILE;
use crate::index::IndexId;
use crate::range::RangeId;
use crate::run::RunId;
use crate::seqno::Lsn;
use crate::UserKey;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use varint_rs::{VarintReader, VarintWriter};

/// A record of the metadata log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MetadataRecord {
    CreateIndex {
        index_id: IndexId,
        name: String,
        space_id: u64,
        part_count: u32,
        column_mask: u64,
        is_primary: bool,
    },
    DropIndex {
        index_id: IndexId,
    },
    InsertRange {
        index_id: IndexId,
        range_id: RangeId,
        begin: Option<UserKey>,
        end: Option<UserKey>,
    },
    DeleteRange {
        index_id: IndexId,
        range_id: RangeId,
    },
    PrepareRun {
        index_id: IndexId,
        range_id: RangeId,
        run_id: RunId,
    },
    InsertRun {
        index_id: IndexId,
        range_id: RangeId,
        run_id: RunId,
        min_lsn: Lsn,
        max_lsn: Lsn,
        is_empty: bool,
        keys: u64,
    },
    DeleteRun {
        index_id: IndexId,
        run_id: RunId,
    },
    ForgetRun {
        index_id: IndexId,
        run_id: RunId,
    },
}

impl MetadataRecord {
    fn kind(&self) -> u8 {
        match self {
            Self::CreateIndex { .. } => 1,
            Self::DropIndex { .. } => 2,
            Self::InsertRange { .. } => 3,
            Self::DeleteRange { .. } => 4,
            Self::PrepareRun { .. } => 5,
            Self::InsertRun { .. } => 6,
            Self::DeleteRun { .. } => 7,
            Self::ForgetRun { .. } => 8,
        }
    }

    fn encode_payload(&self) -> std::io::Result<Vec<u8>> {
        let mut w = Vec::new();

        match self {
            Self::CreateIndex {
                index_id,
                name,
                space_id,
                part_count,
                column_mask,
                is_primary,
            } => {
                w.write_u64_varint(*index_id)?;
                w.write_u64_varint(name.len() as u64)?;
                w.write_all(name.as_bytes())?;
                w.write_u64_varint(*space_id)?;
                w.write_u32_varint(*part_count)?;
                w.write_u64_varint(*column_mask)?;
                w.write_u8(u8::from(*is_primary))?;
            }
            Self::DropIndex { index_id } => {
                w.write_u64_varint(*index_id)?;
            }
            Self::InsertRange {
                index_id,
                range_id,
                begin,
                end,
            } => {
                w.write_u64_varint(*index_id)?;
                w.write_u64_varint(*range_id)?;
                write_boundary(&mut w, begin.as_ref())?;
                write_boundary(&mut w, end.as_ref())?;
            }
            Self::DeleteRange { index_id, range_id } => {
                w.write_u64_varint(*index_id)?;
                w.write_u64_varint(*range_id)?;
            }
            Self::PrepareRun {
                index_id,
                range_id,
                run_id,
            } => {
                w.write_u64_varint(*index_id)?;
                w.write_u64_varint(*range_id)?;
                w.write_u64_varint(*run_id)?;
            }
            Self::InsertRun {
                index_id,
                range_id,
                run_id,
                min_lsn,
                max_lsn,
                is_empty,
                keys,
            } => {
                w.write_u64_varint(*index_id)?;
                w.write_u64_varint(*range_id)?;
                w.write_u64_varint(*run_id)?;
                w.write_u64_varint(*min_lsn)?;
                w.write_u64_varint(*max_lsn)?;
                w.write_u8(u8::from(*is_empty))?;
                w.write_u64_varint(*keys)?;
            }
            Self::DeleteRun { index_id, run_id } | Self::ForgetRun { index_id, run_id } => {
                w.write_u64_varint(*index_id)?;
                w.write_u64_varint(*run_id)?;
            }
        }

        Ok(w)
    }

    fn decode(kind: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = payload;

        Ok(match kind {
            1 => {
                let index_id = r.read_u64_varint()?;
                let name_len = r.read_u64_varint()? as usize;
                let mut name = vec![0; name_len];
                r.read_exact(&mut name)?;
                let name = String::from_utf8(name)
                    .map_err(|_| DecodeError::InvalidHeader("index name"))?;

                Self::CreateIndex {
                    index_id,
                    name,
                    space_id: r.read_u64_varint()?,
                    part_count: r.read_u32_varint()?,
                    column_mask: r.read_u64_varint()?,
                    is_primary: r.read_u8()? != 0,
                }
            }
            2 => Self::DropIndex {
                index_id: r.read_u64_varint()?,
            },
            3 => Self::InsertRange {
                index_id: r.read_u64_varint()?,
                range_id: r.read_u64_varint()?,
                begin: read_boundary(&mut r)?,
                end: read_boundary(&mut r)?,
            },
            4 => Self::DeleteRange {
                index_id: r.read_u64_varint()?,
                range_id: r.read_u64_varint()?,
            },
            5 => Self::PrepareRun {
                index_id: r.read_u64_varint()?,
                range_id: r.read_u64_varint()?,
                run_id: r.read_u64_varint()?,
            },
            6 => Self::InsertRun {
                index_id: r.read_u64_varint()?,
                range_id: r.read_u64_varint()?,
                run_id: r.read_u64_varint()?,
                min_lsn: r.read_u64_varint()?,
                max_lsn: r.read_u64_varint()?,
                is_empty: r.read_u8()? != 0,
                keys: r.read_u64_varint()?,
            },
            7 => Self::DeleteRun {
                index_id: r.read_u64_varint()?,
                run_id: r.read_u64_varint()?,
            },
            8 => Self::ForgetRun {
                index_id: r.read_u64_varint()?,
                run_id: r.read_u64_varint()?,
            },
            _ => return Err(DecodeError::InvalidTag(("MetadataRecord", kind))),
        })
    }
}

fn write_boundary<W: Write>(w: &mut W, key: Option<&UserKey>) -> std::io::Result<()> {
    match key {
        Some(key) => {
            w.write_u8(1)?;
            w.write_u64_varint(key.len() as u64)?;
            w.write_all(key)?;
        }
        None => w.write_u8(0)?,
    }
    Ok(())
}

fn read_boundary<R: Read>(r: &mut R) -> Result<Option<UserKey>, DecodeError> {
    match r.read_u8()? {
        0 => Ok(None),
        1 => {
            let len = r.read_u64_varint()? as usize;
            Ok(Some(UserKey::from_reader(r, len)?))
        }
        b => Err(DecodeError::InvalidTag(("boundary", b))),
    }
}

struct LogInner {
    file: Option<File>,

    /// Records buffered while recovery defers them (index drops)
    deferred: Vec<MetadataRecord>,

    deferring: bool,
}

/// Append-only writer (and initial reader) of the metadata log file.
pub struct MetadataLog {
    inner: Mutex<LogInner>,
    path: PathBuf,
}

impl MetadataLog {
    /// Reads all records of an existing log (tolerating a truncated
    /// tail) and opens the file for appending.
    pub fn open(base: &Path) -> crate::Result<(Self, Vec<MetadataRecord>)> {
        std::fs::create_dir_all(base)?;

        let path = base.join(METADATA_LOG_FILE);

        let records = if path.try_exists()? {
            Self::read_all(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok((
            Self {
                inner: Mutex::new(LogInner {
                    file: Some(file),
                    deferred: Vec::new(),
                    deferring: false,
                }),
                path,
            },
            records,
        ))
    }

    fn read_all(path: &Path) -> crate::Result<Vec<MetadataRecord>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();

        loop {
            let kind = match reader.read_u8() {
                Ok(kind) => kind,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };

            let frame = (|| -> Result<MetadataRecord, DecodeError> {
                let len = reader.read_u32::<BigEndian>()? as usize;
                let expected = reader.read_u64::<BigEndian>()?;

                let mut payload = vec![0; len];
                reader.read_exact(&mut payload)?;

                let got = xxhash_rust::xxh3::xxh3_64(&payload);
                if got != expected {
                    return Err(DecodeError::ChecksumMismatch(got, expected));
                }

                MetadataRecord::decode(kind, &payload)
            })();

            match frame {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A torn tail is the expected crash shape; anything
                    // after it is unreachable anyway
                    log::warn!("metadata log: stopping at torn record: {e:?}");
                    break;
                }
            }
        }

        Ok(records)
    }

    fn write_record(file: &mut File, record: &MetadataRecord) -> crate::Result<()> {
        let payload = record.encode_payload()?;

        let mut frame = Vec::with_capacity(payload.len() + 13);
        frame.write_u8(record.kind())?;

        // NOTE: Record payloads are tiny
        #[allow(clippy::cast_possible_truncation)]
        frame.write_u32::<BigEndian>(payload.len() as u32)?;

        frame.write_u64::<BigEndian>(xxhash_rust::xxh3::xxh3_64(&payload))?;
        frame.extend_from_slice(&payload);

        file.write_all(&frame)?;
        Ok(())
    }

    /// Appends a record. While deferring (local recovery), index drops
    /// are held back in the buffer instead.
    #[allow(clippy::expect_used)]
    pub fn append(&self, record: MetadataRecord) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if inner.deferring && matches!(record, MetadataRecord::DropIndex { .. }) {
            inner.deferred.push(record);
            return Ok(());
        }

        let file = inner.file.as_mut().expect("log is open");
        Self::write_record(file, &record)
    }

    /// Appends several records and fsyncs once.
    #[allow(clippy::expect_used)]
    pub fn append_all(&self, records: &[MetadataRecord]) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let file = inner.file.as_mut().expect("log is open");
        for record in records {
            Self::write_record(file, record)?;
        }
        file.sync_data()?;

        Ok(())
    }

    /// Fsyncs the log.
    #[allow(clippy::expect_used)]
    pub fn sync(&self) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.file.as_mut().expect("log is open").sync_data()?;
        Ok(())
    }

    /// Toggles drop-record deferral; leaving deferral flushes the
    /// buffered records.
    #[allow(clippy::expect_used)]
    pub fn set_deferring(&self, deferring: bool) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.deferring = deferring;

        if !deferring && !inner.deferred.is_empty() {
            let records = std::mem::take(&mut inner.deferred);
            let file = inner.file.as_mut().expect("log is open");
            for record in &records {
                Self::write_record(file, record)?;
            }
            file.sync_data()?;
        }

        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn metadata_log_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let records = vec![
            MetadataRecord::CreateIndex {
                index_id: 1,
                name: "primary".into(),
                space_id: 7,
                part_count: 2,
                column_mask: 0b11,
                is_primary: true,
            },
            MetadataRecord::InsertRange {
                index_id: 1,
                range_id: 10,
                begin: None,
                end: Some((*b"m").into()),
            },
            MetadataRecord::PrepareRun {
                index_id: 1,
                range_id: 10,
                run_id: 100,
            },
            MetadataRecord::InsertRun {
                index_id: 1,
                range_id: 10,
                run_id: 100,
                min_lsn: 5,
                max_lsn: 90,
                is_empty: false,
                keys: 1_000,
            },
            MetadataRecord::DeleteRun {
                index_id: 1,
                run_id: 100,
            },
        ];

        {
            let (log, existing) = MetadataLog::open(dir.path())?;
            assert!(existing.is_empty());
            log.append_all(&records)?;
        }

        let (_, read_back) = MetadataLog::open(dir.path())?;
        assert_eq!(records, read_back);

        Ok(())
    }

    #[test]
    fn metadata_log_tolerates_torn_tail() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let (log, _) = MetadataLog::open(dir.path())?;
            log.append_all(&[MetadataRecord::DropIndex { index_id: 3 }])?;
        }

        // Simulate a crash mid-append
        let path = dir.path().join(METADATA_LOG_FILE);
        let mut bytes = std::fs::read(&path)?;
        bytes.extend_from_slice(&[6, 0, 0]);
        std::fs::write(&path, bytes)?;

        let (_, records) = MetadataLog::open(dir.path())?;
        assert_eq!(vec![MetadataRecord::DropIndex { index_id: 3 }], records);

        Ok(())
    }

    #[test]
    fn metadata_log_defers_drops() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let (log, _) = MetadataLog::open(dir.path())?;
            log.set_deferring(true)?;
            log.append(MetadataRecord::DropIndex { index_id: 1 })?;
            log.append(MetadataRecord::DeleteRange {
                index_id: 2,
                range_id: 5,
            })?;

            // The drop is buffered; the range deletion is not
            let visible = MetadataLog::read_all(&dir.path().join(METADATA_LOG_FILE))?;
            assert_eq!(1, visible.len());

            log.set_deferring(false)?;
        }

        let (_, records) = MetadataLog::open(dir.path())?;
        assert_eq!(2, records.len());
        assert_eq!(
            MetadataRecord::DropIndex { index_id: 1 },
            *records.last().unwrap()
        );

        Ok(())
    }
}
