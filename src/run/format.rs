// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Self-describing tagged codec and framed rows for run files.
//!
//! Every numeric field on disk is a tagged value, so readers can skip
//! fields they do not know. Rows are framed with a type byte, a length
//! and an xxh3 checksum of the payload.

use crate::bloom::{BloomFilter, BLOOM_VERSION};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::key::InternalKey;
use crate::statement::{Statement, StatementType};
use crate::{Slice, UserKey};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

const TAG_UINT: u8 = 0;
const TAG_BIN: u8 = 1;
const TAG_ARRAY: u8 = 2;
const TAG_MAP: u8 = 3;

pub(crate) fn write_uint<W: Write>(writer: &mut W, value: u64) -> Result<(), EncodeError> {
    writer.write_u8(TAG_UINT)?;
    writer.write_u64_varint(value)?;
    Ok(())
}

pub(crate) fn write_bin<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), EncodeError> {
    writer.write_u8(TAG_BIN)?;
    writer.write_u64_varint(bytes.len() as u64)?;
    writer.write_all(bytes)?;
    Ok(())
}

pub(crate) fn write_array_header<W: Write>(writer: &mut W, len: u64) -> Result<(), EncodeError> {
    writer.write_u8(TAG_ARRAY)?;
    writer.write_u64_varint(len)?;
    Ok(())
}

pub(crate) fn write_map_header<W: Write>(writer: &mut W, len: u64) -> Result<(), EncodeError> {
    writer.write_u8(TAG_MAP)?;
    writer.write_u64_varint(len)?;
    Ok(())
}

fn expect_tag<R: Read>(reader: &mut R, tag: u8, what: &'static str) -> Result<(), DecodeError> {
    let got = reader.read_u8()?;
    if got != tag {
        return Err(DecodeError::InvalidTag((what, got)));
    }
    Ok(())
}

pub(crate) fn read_uint<R: Read>(reader: &mut R) -> Result<u64, DecodeError> {
    expect_tag(reader, TAG_UINT, "uint")?;
    Ok(reader.read_u64_varint()?)
}

pub(crate) fn read_bin<R: Read>(reader: &mut R) -> Result<Slice, DecodeError> {
    expect_tag(reader, TAG_BIN, "bin")?;
    let len = reader.read_u64_varint()? as usize;
    Ok(Slice::from_reader(reader, len)?)
}

pub(crate) fn read_array_header<R: Read>(reader: &mut R) -> Result<u64, DecodeError> {
    expect_tag(reader, TAG_ARRAY, "array")?;
    Ok(reader.read_u64_varint()?)
}

pub(crate) fn read_map_header<R: Read>(reader: &mut R) -> Result<u64, DecodeError> {
    expect_tag(reader, TAG_MAP, "map")?;
    Ok(reader.read_u64_varint()?)
}

/// Row types of the framed run format
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RowType {
    /// Run-level metadata (one per `.index` file)
    RunInfo,

    /// Per-page metadata
    PageInfo,

    /// In-page row offset table
    PageIndex,

    /// Primary index statement
    Primary,

    /// Secondary index statement
    Secondary,
}

impl TryFrom<u8> for RowType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::RunInfo),
            2 => Ok(Self::PageInfo),
            3 => Ok(Self::PageIndex),
            4 => Ok(Self::Primary),
            5 => Ok(Self::Secondary),
            _ => Err(()),
        }
    }
}

impl From<RowType> for u8 {
    fn from(value: RowType) -> Self {
        match value {
            RowType::RunInfo => 1,
            RowType::PageInfo => 2,
            RowType::PageIndex => 3,
            RowType::Primary => 4,
            RowType::Secondary => 5,
        }
    }
}

/// type + length + checksum
pub(crate) const ROW_HEADER_LEN: usize = 1 + 4 + 8;

/// Writes a framed row; returns the number of bytes written.
pub(crate) fn write_row<W: Write>(
    writer: &mut W,
    row_type: RowType,
    payload: &[u8],
) -> Result<usize, EncodeError> {
    writer.write_u8(row_type.into())?;

    // NOTE: Row payloads are page-sized, u32 is plenty
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32::<BigEndian>(payload.len() as u32)?;

    writer.write_u64::<BigEndian>(xxhash_rust::xxh3::xxh3_64(payload))?;
    writer.write_all(payload)?;

    Ok(ROW_HEADER_LEN + payload.len())
}

/// Reads a framed row, verifying its checksum.
pub(crate) fn read_row<R: Read>(reader: &mut R) -> Result<(RowType, Vec<u8>), DecodeError> {
    let row_type = reader.read_u8()?;
    let row_type =
        RowType::try_from(row_type).map_err(|()| DecodeError::InvalidTag(("RowType", row_type)))?;

    let len = reader.read_u32::<BigEndian>()? as usize;
    let expected = reader.read_u64::<BigEndian>()?;

    let mut payload = vec![0; len];
    reader.read_exact(&mut payload)?;

    let got = xxhash_rust::xxh3::xxh3_64(&payload);
    if got != expected {
        return Err(DecodeError::ChecksumMismatch(got, expected));
    }

    Ok((row_type, payload))
}

// RUN_INFO map keys
const RUN_INFO_MIN_KEY: u64 = 1;
const RUN_INFO_MAX_KEY: u64 = 2;
const RUN_INFO_PAGE_COUNT: u64 = 3;
const RUN_INFO_BLOOM: u64 = 4;

// PAGE_INFO map keys
const PAGE_INFO_OFFSET: u64 = 1;
const PAGE_INFO_SIZE: u64 = 2;
const PAGE_INFO_ROW_COUNT: u64 = 3;
const PAGE_INFO_MIN_KEY: u64 = 4;
const PAGE_INFO_UNPACKED_SIZE: u64 = 5;
const PAGE_INFO_PAGE_INDEX_OFFSET: u64 = 6;

// Statement map keys
const STMT_KEY: u64 = 1;
const STMT_LSN: u64 = 2;
const STMT_TYPE: u64 = 3;
const STMT_VALUE: u64 = 4;
const STMT_UPSERT_COUNT: u64 = 5;
const STMT_COLUMN_MASK: u64 = 6;

// PAGE_INDEX map key
const PAGE_INDEX_OFFSETS: u64 = 1;

/// Run-level metadata, the head row of every `.index` file
#[derive(Clone, Debug)]
pub struct RunInfo {
    /// First user key of the run
    pub min_key: UserKey,

    /// Last user key of the run
    pub max_key: UserKey,

    /// Number of pages in the data file
    pub page_count: u32,

    /// Bloom filter over all user keys
    pub bloom: BloomFilter,
}

impl Encode for RunInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        write_map_header(writer, 4)?;

        write_uint(writer, RUN_INFO_MIN_KEY)?;
        write_bin(writer, &self.min_key)?;

        write_uint(writer, RUN_INFO_MAX_KEY)?;
        write_bin(writer, &self.max_key)?;

        write_uint(writer, RUN_INFO_PAGE_COUNT)?;
        write_uint(writer, u64::from(self.page_count))?;

        write_uint(writer, RUN_INFO_BLOOM)?;
        write_array_header(writer, 4)?;
        write_uint(writer, BLOOM_VERSION)?;
        write_uint(writer, self.bloom.table_size() as u64)?;
        write_uint(writer, self.bloom.hash_fn_count() as u64)?;
        write_bin(writer, self.bloom.bytes())?;

        Ok(())
    }
}

impl Decode for RunInfo {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let field_count = read_map_header(reader)?;

        let mut min_key = None;
        let mut max_key = None;
        let mut page_count = None;
        let mut bloom = None;

        for _ in 0..field_count {
            match read_uint(reader)? {
                RUN_INFO_MIN_KEY => min_key = Some(read_bin(reader)?),
                RUN_INFO_MAX_KEY => max_key = Some(read_bin(reader)?),
                RUN_INFO_PAGE_COUNT => {
                    page_count = Some(read_uint(reader)? as u32);
                }
                RUN_INFO_BLOOM => {
                    let len = read_array_header(reader)?;
                    if len != 4 {
                        return Err(DecodeError::InvalidLength("bloom"));
                    }

                    let version = read_uint(reader)?;
                    if version != BLOOM_VERSION {
                        return Err(DecodeError::InvalidHeader("bloom version"));
                    }

                    let table_size = read_uint(reader)? as usize;
                    let hash_count = read_uint(reader)? as usize;
                    let bytes = read_bin(reader)?;

                    if bytes.len() != table_size {
                        return Err(DecodeError::InvalidLength("bloom table"));
                    }

                    bloom = Some(BloomFilter::from_parts(
                        table_size * 8,
                        hash_count,
                        bytes.to_vec().into_boxed_slice(),
                    ));
                }
                _ => return Err(DecodeError::InvalidHeader("RunInfo")),
            }
        }

        Ok(Self {
            min_key: min_key.ok_or(DecodeError::InvalidHeader("RunInfo.min_key"))?,
            max_key: max_key.ok_or(DecodeError::InvalidHeader("RunInfo.max_key"))?,
            page_count: page_count.ok_or(DecodeError::InvalidHeader("RunInfo.page_count"))?,
            bloom: bloom.ok_or(DecodeError::InvalidHeader("RunInfo.bloom"))?,
        })
    }
}

/// Per-page metadata, one row per page in the `.index` file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageInfo {
    /// Byte offset of the page in the data file
    pub offset: u64,

    /// Encoded page size in bytes
    pub size: u32,

    /// Number of statement rows in the page
    pub row_count: u32,

    /// First user key in the page
    pub min_key: UserKey,

    /// Decoded size estimate, used for page cache weighting
    pub unpacked_size: u32,

    /// Offset of the PAGE_INDEX row inside the page
    pub page_index_offset: u32,
}

impl Encode for PageInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        write_map_header(writer, 6)?;

        write_uint(writer, PAGE_INFO_OFFSET)?;
        write_uint(writer, self.offset)?;

        write_uint(writer, PAGE_INFO_SIZE)?;
        write_uint(writer, u64::from(self.size))?;

        write_uint(writer, PAGE_INFO_ROW_COUNT)?;
        write_uint(writer, u64::from(self.row_count))?;

        write_uint(writer, PAGE_INFO_MIN_KEY)?;
        write_bin(writer, &self.min_key)?;

        write_uint(writer, PAGE_INFO_UNPACKED_SIZE)?;
        write_uint(writer, u64::from(self.unpacked_size))?;

        write_uint(writer, PAGE_INFO_PAGE_INDEX_OFFSET)?;
        write_uint(writer, u64::from(self.page_index_offset))?;

        Ok(())
    }
}

impl Decode for PageInfo {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let field_count = read_map_header(reader)?;

        let mut info = Self {
            offset: 0,
            size: 0,
            row_count: 0,
            min_key: Slice::empty(),
            unpacked_size: 0,
            page_index_offset: 0,
        };

        for _ in 0..field_count {
            match read_uint(reader)? {
                PAGE_INFO_OFFSET => info.offset = read_uint(reader)?,
                PAGE_INFO_SIZE => info.size = read_uint(reader)? as u32,
                PAGE_INFO_ROW_COUNT => info.row_count = read_uint(reader)? as u32,
                PAGE_INFO_MIN_KEY => info.min_key = read_bin(reader)?,
                PAGE_INFO_UNPACKED_SIZE => info.unpacked_size = read_uint(reader)? as u32,
                PAGE_INFO_PAGE_INDEX_OFFSET => {
                    info.page_index_offset = read_uint(reader)? as u32;
                }
                _ => return Err(DecodeError::InvalidHeader("PageInfo")),
            }
        }

        Ok(info)
    }
}

/// Encodes a statement as a row payload.
pub(crate) fn encode_statement(stmt: &Statement) -> Result<Vec<u8>, EncodeError> {
    let mut payload = Vec::with_capacity(stmt.size() + 16);

    write_map_header(&mut payload, 6)?;

    write_uint(&mut payload, STMT_KEY)?;
    write_bin(&mut payload, &stmt.key.user_key)?;

    write_uint(&mut payload, STMT_LSN)?;
    write_uint(&mut payload, stmt.key.lsn)?;

    write_uint(&mut payload, STMT_TYPE)?;
    write_uint(&mut payload, u64::from(u8::from(stmt.stmt_type)))?;

    write_uint(&mut payload, STMT_VALUE)?;
    write_bin(&mut payload, &stmt.value)?;

    write_uint(&mut payload, STMT_UPSERT_COUNT)?;
    write_uint(&mut payload, u64::from(stmt.upsert_count))?;

    write_uint(&mut payload, STMT_COLUMN_MASK)?;
    write_uint(&mut payload, stmt.column_mask)?;

    Ok(payload)
}

/// Decodes a statement from a row payload.
pub(crate) fn decode_statement(payload: &[u8]) -> Result<Statement, DecodeError> {
    let mut reader = payload;
    let field_count = read_map_header(&mut reader)?;

    let mut user_key = None;
    let mut lsn = 0;
    let mut stmt_type = StatementType::Replace;
    let mut value = Slice::empty();
    let mut upsert_count = 0u8;
    let mut column_mask = u64::MAX;

    for _ in 0..field_count {
        match read_uint(&mut reader)? {
            STMT_KEY => user_key = Some(read_bin(&mut reader)?),
            STMT_LSN => lsn = read_uint(&mut reader)?,
            STMT_TYPE => {
                let raw = read_uint(&mut reader)? as u8;
                stmt_type = StatementType::try_from(raw)
                    .map_err(|()| DecodeError::InvalidTag(("StatementType", raw)))?;
            }
            STMT_VALUE => value = read_bin(&mut reader)?,
            STMT_UPSERT_COUNT => upsert_count = read_uint(&mut reader)? as u8,
            STMT_COLUMN_MASK => column_mask = read_uint(&mut reader)?,
            _ => return Err(DecodeError::InvalidHeader("Statement")),
        }
    }

    Ok(Statement {
        key: InternalKey::new(
            user_key.ok_or(DecodeError::InvalidHeader("Statement.key"))?,
            lsn,
        ),
        stmt_type,
        value,
        upsert_count,
        column_mask,
    })
}

/// Encodes the in-page row offset table.
pub(crate) fn encode_page_index(offsets: &[u32]) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::with_capacity(offsets.len() * 4);
    for offset in offsets {
        bytes.write_u32::<BigEndian>(*offset)?;
    }

    let mut payload = Vec::with_capacity(bytes.len() + 8);
    write_map_header(&mut payload, 1)?;
    write_uint(&mut payload, PAGE_INDEX_OFFSETS)?;
    write_bin(&mut payload, &bytes)?;

    Ok(payload)
}

/// Decodes the in-page row offset table.
pub(crate) fn decode_page_index(payload: &[u8]) -> Result<Vec<u32>, DecodeError> {
    let mut reader = payload;

    if read_map_header(&mut reader)? != 1 {
        return Err(DecodeError::InvalidHeader("PageIndex"));
    }
    if read_uint(&mut reader)? != PAGE_INDEX_OFFSETS {
        return Err(DecodeError::InvalidHeader("PageIndex"));
    }

    let bytes = read_bin(&mut reader)?;
    if bytes.len() % 4 != 0 {
        return Err(DecodeError::InvalidLength("PageIndex"));
    }

    let mut offsets = Vec::with_capacity(bytes.len() / 4);
    let mut reader: &[u8] = &bytes;
    while let Ok(offset) = reader.read_u32::<BigEndian>() {
        offsets.push(offset);
    }

    Ok(offsets)
}
