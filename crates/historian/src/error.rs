//! Error and Result types for historian operations.

use crate::types::{ChannelId, Timestamp};
use std::io;
use thiserror::Error;

/// A convenience `Result` type for historian operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// The error type for historian operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// An entry already exists at the given timestamp.
    #[error("An entry already exists at timestamp {0}")]
    EntryExists(Timestamp),

    /// No entry exists at the given timestamp.
    #[error("No entry exists at timestamp {0}")]
    NoEntry(Timestamp),

    /// A list-based batch request carried no items.
    #[error("Malformed batch: {0}")]
    MalformedBatch(&'static str),

    /// Invalid magic bytes in a journal segment header.
    #[error("Invalid magic bytes: expected HLOG, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported journal format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Journal entry checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// A journal entry could not be decoded.
    #[error("Corrupt journal entry: {0}")]
    CorruptEntry(String),

    /// The system clock could not be read.
    #[error("Clock error: {0}")]
    Clock(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// The entry store was mutated but the matching ledger append failed.
    ///
    /// The two stores disagree about the latest mutation of `timestamp`
    /// until an operator reconciles them.
    #[error("Ledger divergence on channel {channel} at timestamp {timestamp}: {source}")]
    LedgerDivergence {
        /// Channel whose stores diverged.
        channel: ChannelId,
        /// Timestamp of the entry whose ledger record is missing.
        timestamp: Timestamp,
        /// The ledger failure.
        #[source]
        source: Box<HistoryError>,
    },
}

impl HistoryError {
    /// Returns true for failures of the persistence layer, as opposed to
    /// caller errors and state conflicts.
    pub fn is_storage_fault(&self) -> bool {
        !matches!(
            self,
            Self::EntryExists(_) | Self::NoEntry(_) | Self::MalformedBatch(_)
        )
    }
}
