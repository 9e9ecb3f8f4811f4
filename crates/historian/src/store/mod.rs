//! Persistence backends for the entry store and the modification ledger.
//!
//! Both stores are partitioned by [`ChannelId`]. Two implementations ship
//! with the crate:
//!
//! - [`MemoryEntryStore`] / [`MemoryLedger`]: process-local `BTreeMap`s.
//! - [`FileEntryStore`] / [`FileLedger`]: a checksummed segment
//!   [`journal`] replayed into an in-memory index on open.
//!
//! # Write path
//!
//! The file backends follow the journal-first contract:
//! ```text
//! mutation → journal append → sync → index update → Ack
//! ```

pub mod file;
pub mod journal;
pub mod memory;

pub use file::{FileEntryStore, FileLedger};
pub use journal::{Journal, JournalConfig, JournalEntry, SyncMode};
pub use memory::{MemoryEntryStore, MemoryLedger};

use crate::error::Result;
use crate::range::TimeRange;
use crate::types::{ChannelId, LedgerRecord, Timestamp, ValueRecord};

/// A finite, ordered snapshot produced by a store scan.
///
/// Each call to `scan` produces a fresh sequence; no cursor state is kept.
pub type Scan<T> = std::vec::IntoIter<T>;

/// Keyed store of historized values, `(channel, timestamp) → ValueRecord`.
pub trait EntryStore: Send + Sync {
    /// Returns true if an entry exists at `timestamp`.
    fn exists(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<bool>;

    /// Returns the entry at `timestamp`, if any.
    fn get(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<Option<ValueRecord>>;

    /// Inserts a new entry.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::EntryExists` if the timestamp is taken.
    fn insert(&self, channel: &ChannelId, record: &ValueRecord) -> Result<()>;

    /// Replaces value and status of the entry at `record.timestamp`.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::NoEntry` if no entry exists at the timestamp.
    fn update(&self, channel: &ChannelId, record: &ValueRecord) -> Result<()>;

    /// Deletes the entry at `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::NoEntry` if no entry exists at the timestamp.
    fn delete(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<()>;

    /// Deletes every entry inside `range` and returns how many were removed.
    fn delete_range(&self, channel: &ChannelId, range: &TimeRange) -> Result<usize>;

    /// Returns the entries inside `range`, ascending by timestamp.
    fn scan(&self, channel: &ChannelId, range: &TimeRange) -> Result<Scan<ValueRecord>>;
}

/// Append-only audit trail of entry store mutations.
pub trait LedgerStore: Send + Sync {
    /// Appends a record. Records are never modified after this call.
    fn append(&self, channel: &ChannelId, record: &LedgerRecord) -> Result<()>;

    /// Returns the records whose entry timestamp lies inside `range`,
    /// ordered by entry timestamp, then append order.
    fn scan(&self, channel: &ChannelId, range: &TimeRange) -> Result<Scan<LedgerRecord>>;
}
