// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Transaction conflict signalled from prepare
    Conflict,

    /// The transaction was sent to an aborted read view
    /// by another transaction's rollback
    ReadViewAborted,

    /// Memory quota is exhausted and the scheduler failed to
    /// reclaim memory (carries the scheduler's last diagnostic)
    QuotaExceeded(Option<String>),

    /// A run page failed its checksum or could not be parsed
    Corrupted(&'static str),

    /// The metadata log describes an impossible state
    /// (overlapping ranges, missing boundaries, orphaned runs)
    Unrecoverable(String),

    /// Internal: the iterated range tree or range content changed,
    /// the iterator must be re-opened
    #[doc(hidden)]
    Invalidated,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LsmEngineError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;
