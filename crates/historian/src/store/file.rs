//! Journal-backed entry store and ledger.
//!
//! Each store owns one [`Journal`] directory and an in-memory index rebuilt
//! from it on open. Mutations are appended to the journal and synced before
//! the index changes, so a failed append leaves the index untouched. The
//! journal also cuts a failed append out of its segment, so the mutation
//! does not reappear on the next open.

use crate::error::{HistoryError, Result};
use crate::range::TimeRange;
use crate::store::journal::{Journal, JournalConfig, JournalEntry};
use crate::store::memory::{EntryIndex, LedgerIndex};
use crate::store::{EntryStore, LedgerStore, Scan};
use crate::types::{ChannelId, LedgerRecord, Timestamp, ValueRecord};
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, warn};

struct EntryState {
    journal: Journal,
    index: EntryIndex,
}

/// Durable entry store.
pub struct FileEntryStore {
    state: RwLock<EntryState>,
}

impl FileEntryStore {
    /// Opens (or creates) the entry store journal in `dir` and replays it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a new segment
    /// cannot be created.
    pub fn open(dir: impl AsRef<Path>, config: JournalConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let mut index = EntryIndex::default();

        for entry in Journal::recover(dir)? {
            match entry {
                JournalEntry::PutEntry { channel, record } => {
                    index.put(&channel, record);
                }
                JournalEntry::DeleteEntry { channel, timestamp } => {
                    index.remove(&channel, timestamp);
                }
                JournalEntry::LedgerAppend { channel, .. } => {
                    warn!(
                        "Ignoring ledger entry for channel {} in entry journal {}",
                        channel,
                        dir.display()
                    );
                }
            }
        }
        debug!("Replayed {} live entries from {}", index.len(), dir.display());

        let journal = Journal::open(dir, config)?;
        Ok(Self {
            state: RwLock::new(EntryState { journal, index }),
        })
    }

    /// Returns the number of live entries across all channels.
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|err| err.into_inner()).index.len()
    }

    /// Returns true if no channel holds any entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the journal to hold only the live entries.
    ///
    /// Returns the number of journal segments removed.
    pub fn compact(&self) -> Result<usize> {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        let live: Vec<JournalEntry> = state
            .index
            .iter()
            .map(|(channel, record)| JournalEntry::PutEntry {
                channel: channel.clone(),
                record: record.clone(),
            })
            .collect();

        let removed = state.journal.compact(&live)?;
        debug!(
            "Compacted entry journal to {} live entries, removed {} segments",
            live.len(),
            removed
        );
        Ok(removed)
    }
}

impl EntryStore for FileEntryStore {
    fn exists(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<bool> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        Ok(state.index.contains(channel, timestamp))
    }

    fn get(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<Option<ValueRecord>> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        Ok(state.index.get(channel, timestamp).cloned())
    }

    fn insert(&self, channel: &ChannelId, record: &ValueRecord) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        if state.index.contains(channel, record.timestamp) {
            return Err(HistoryError::EntryExists(record.timestamp));
        }

        state.journal.append(&JournalEntry::PutEntry {
            channel: channel.clone(),
            record: record.clone(),
        })?;
        state.index.put(channel, record.clone());
        Ok(())
    }

    fn update(&self, channel: &ChannelId, record: &ValueRecord) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        if !state.index.contains(channel, record.timestamp) {
            return Err(HistoryError::NoEntry(record.timestamp));
        }

        state.journal.append(&JournalEntry::PutEntry {
            channel: channel.clone(),
            record: record.clone(),
        })?;
        state.index.put(channel, record.clone());
        Ok(())
    }

    fn delete(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        if !state.index.contains(channel, timestamp) {
            return Err(HistoryError::NoEntry(timestamp));
        }

        state.journal.append(&JournalEntry::DeleteEntry {
            channel: channel.clone(),
            timestamp,
        })?;
        state.index.remove(channel, timestamp);
        Ok(())
    }

    fn delete_range(&self, channel: &ChannelId, range: &TimeRange) -> Result<usize> {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        let doomed = state.index.timestamps_in(channel, range);

        for &timestamp in &doomed {
            state.journal.append(&JournalEntry::DeleteEntry {
                channel: channel.clone(),
                timestamp,
            })?;
            state.index.remove(channel, timestamp);
        }
        Ok(doomed.len())
    }

    fn scan(&self, channel: &ChannelId, range: &TimeRange) -> Result<Scan<ValueRecord>> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        Ok(state.index.scan(channel, range).into_iter())
    }
}

struct LedgerState {
    journal: Journal,
    index: LedgerIndex,
}

/// Durable, append-only ledger.
pub struct FileLedger {
    state: RwLock<LedgerState>,
}

impl FileLedger {
    /// Opens (or creates) the ledger journal in `dir` and replays it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a new segment
    /// cannot be created.
    pub fn open(dir: impl AsRef<Path>, config: JournalConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let mut index = LedgerIndex::default();

        for entry in Journal::recover(dir)? {
            match entry {
                JournalEntry::LedgerAppend { channel, record } => index.push(&channel, record),
                other => warn!(
                    "Ignoring entry store record for channel {} in ledger journal {}",
                    other.channel(),
                    dir.display()
                ),
            }
        }
        debug!("Replayed {} ledger records from {}", index.len(), dir.display());

        let journal = Journal::open(dir, config)?;
        Ok(Self {
            state: RwLock::new(LedgerState { journal, index }),
        })
    }

    /// Returns the number of records across all channels.
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|err| err.into_inner()).index.len()
    }

    /// Returns true if nothing has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LedgerStore for FileLedger {
    fn append(&self, channel: &ChannelId, record: &LedgerRecord) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        state.journal.append(&JournalEntry::LedgerAppend {
            channel: channel.clone(),
            record: record.clone(),
        })?;
        state.index.push(channel, record.clone());
        Ok(())
    }

    fn scan(&self, channel: &ChannelId, range: &TimeRange) -> Result<Scan<LedgerRecord>> {
        let state = self.state.read().unwrap_or_else(|err| err.into_inner());
        Ok(state.index.scan(channel, range).into_iter())
    }
}
