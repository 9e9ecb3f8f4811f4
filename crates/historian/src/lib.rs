//! Alopex Historian - historized channel values with a modification ledger
//!
//! This crate stores the time-stamped values of named channels and keeps an
//! append-only ledger of every insertion, replacement and deletion, so the
//! state a value had before any later edit can always be recovered.
//!
//! # Components
//!
//! - [`Historian`]: channel registry over shared entry store and ledger backends
//! - [`HistorizedChannel`]: guarded add/replace/upsert/remove/read API of one channel
//! - [`BatchProcessor`]: multi-item mutations with per-item [`Outcome`]s
//! - [`AutoCapture`]: upserts value change notifications from a [`ChannelBinding`]
//! - [`store`]: in-memory and journal-backed [`EntryStore`] / [`LedgerStore`]
//!
//! # Example
//!
//! ```rust
//! use alopex_historian::{Historian, ModificationKind, TimeRange, ValueRecord, ValueType};
//!
//! let historian = Historian::in_memory();
//! let channel = historian.channel("boiler.temperature", ValueType::Double);
//!
//! channel.add(ValueRecord::good(100, "71.5"))?;
//! channel.replace(ValueRecord::good(100, "71.8"))?;
//!
//! let current: Vec<_> = channel.read(TimeRange::unbounded())?.collect();
//! assert_eq!(current[0].value, "71.8");
//!
//! let audit: Vec<_> = channel.read_ledger(TimeRange::at(100))?.collect();
//! assert_eq!(audit[1].kind, ModificationKind::Replaced);
//! assert_eq!(audit[1].value, "71.5");
//! # Ok::<(), alopex_historian::HistoryError>(())
//! ```

#![deny(missing_docs)]

pub mod batch;
pub mod capture;
pub mod channel;
pub mod error;
pub mod guard;
pub mod historian;
pub mod range;
pub mod store;
pub mod types;

pub use batch::{BatchProcessor, BatchRequest, Outcome};
pub use capture::{AutoCapture, ChangeListener, ChannelBinding, ValueChange};
pub use channel::{HistorizedChannel, Upserted};
pub use error::{HistoryError, Result};
pub use guard::ChannelGuard;
pub use historian::{Historian, HistorianConfig};
pub use range::TimeRange;
pub use store::{
    EntryStore, FileEntryStore, FileLedger, JournalConfig, LedgerStore, MemoryEntryStore,
    MemoryLedger, Scan, SyncMode,
};
pub use types::{
    ChannelId, HistoricalRecord, LedgerRecord, ModificationInfo, ModificationKind, StatusCode,
    Timestamp, TypedValue, ValueRecord, ValueType, MAX_TIMESTAMP, MIN_TIMESTAMP,
};
