// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A range-partitioned log-structured merge storage engine core with
//! MVCC transactions.
//!
//! ##### NOTE
//!
//! > This crate only provides the storage engine core, not a full
//! > database. It does not ship with a write-ahead log; commit LSNs
//! > are assigned by the host, and durability is inherited from the
//! > host's WAL.
//!
//! ##### About
//!
//! Each index partitions its key space into disjoint ranges. A range
//! holds one mutable in-memory tree, zero or more sealed ones, and
//! zero or more immutable sorted runs on disk, organised into
//! size-tiered levels. Writes are buffered in optimistic transactions
//! and flushed to the ranges' in-memory trees at prepare; a background
//! scheduler dumps sealed trees to runs and compacts runs to keep read
//! amplification bounded, splitting and coalescing ranges as they grow
//! and shrink.
//!
//! Reads run through a layered merge: the transaction's own write set,
//! a read cache, the in-memory trees and the runs of a range, under an
//! MVCC snapshot. UPSERTs accumulate operations instead of values and
//! are folded away on read, during compaction, and by a background
//! squash thread once chains grow long.
//!
//! # Example usage
//!
//! ```no_run
//! use lsm_engine::{Config, IndexOptions, SearchMode};
//!
//! let env = Config::new("/tmp/engine-data").open()?;
//!
//! let index = env.create_index("my-index", IndexOptions::default())?;
//!
//! let mut tx = env.begin();
//! tx.replace(&index, "my_key", "my_value")?;
//!
//! env.prepare(&mut tx)?;
//!
//! // The host WAL assigns the commit LSN
//! env.commit(tx, 1)?;
//!
//! let item = env.get(&index, b"my_key")?;
//! assert_eq!(Some("my_value".as_bytes().into()), item);
//!
//! // Range scans walk across range boundaries
//! let mut cursor = env.iter(&index, SearchMode::Ge, b"");
//! while let Some((key, value)) = cursor.next()? {
//!     // ...
//! }
//! #
//! # Ok::<(), lsm_engine::Error>(())
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fjall-rs/lsm-engine/main/logo.png")]
#![doc(html_favicon_url = "https://raw.githubusercontent.com/fjall-rs/lsm-engine/main/logo.png")]
#![deny(clippy::all, clippy::cargo)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

#[doc(hidden)]
pub mod bloom;

mod cache;
mod coding;
mod config;
mod env;
mod error;

#[doc(hidden)]
pub mod file;

mod index;
mod key;

mod memtable;

#[doc(hidden)]
pub mod merge;

mod metadata_log;
mod page_cache;

#[doc(hidden)]
pub mod range;

mod read_iter;

#[doc(hidden)]
pub mod recovery;

#[doc(hidden)]
pub mod run;

mod scheduler;
mod seqno;
mod slice;
mod squash;
mod statement;
mod tx;
mod upsert;
mod write_iter;

/// KV-tuple, typically returned by a cursor
pub type KvPair = (UserKey, UserValue);

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
pub type UserValue = Slice;

#[doc(hidden)]
pub use {key::InternalKey, metadata_log::MetadataRecord, statement::Statement};

pub use {
    cache::ReadCache,
    config::Config,
    env::{Cursor, EngineStats, Environment, Status, Transaction},
    error::{Error, Result},
    index::{Index, IndexId, IndexOptions, KeyDef},
    memtable::Mem,
    metadata_log::MetadataLog,
    page_cache::PageCache,
    range::{tree::SearchMode, Range, RangeId},
    recovery::Recovery,
    run::{Run, RunId},
    scheduler::quota::Quota,
    seqno::{Lsn, SequenceNumberCounter, TX_LSN_BASE, VLSN_INF},
    slice::Slice,
    statement::{StatementType, UPSERT_THRESHOLD},
    tx::{read_view::ReadView, TxId, TxState, TxStats},
    upsert::{OverwriteExecutor, UpsertExecutor},
};
