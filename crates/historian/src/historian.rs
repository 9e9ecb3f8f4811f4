//! Channel registry over shared entry store and ledger backends.
//!
//! The [`Historian`] creates each [`HistorizedChannel`] once, on first
//! reference, and hands out shared handles afterwards. All channels share
//! the historian's two backends; each channel owns its own guard.

use crate::capture::{AutoCapture, ChannelBinding};
use crate::channel::HistorizedChannel;
use crate::error::Result;
use crate::store::{
    EntryStore, FileEntryStore, FileLedger, JournalConfig, LedgerStore, MemoryEntryStore,
    MemoryLedger,
};
use crate::types::{ChannelId, ValueType};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Subdirectory of the data directory holding the entry journal.
pub const ENTRIES_DIR: &str = "entries";

/// Subdirectory of the data directory holding the ledger journal.
pub const LEDGER_DIR: &str = "ledger";

/// Configuration for a [`Historian`].
#[derive(Debug, Clone, Default)]
pub struct HistorianConfig {
    /// Directory for the journals. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Journal settings used for both journals.
    pub journal: JournalConfig,
}

impl HistorianConfig {
    /// Persists both stores under `data_dir`.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    /// Sets the journal configuration.
    pub fn with_journal(mut self, journal: JournalConfig) -> Self {
        self.journal = journal;
        self
    }
}

/// Registry of historized channels.
pub struct Historian {
    entries: Arc<dyn EntryStore>,
    ledger: Arc<dyn LedgerStore>,
    /// Set when the entry store is journal-backed.
    compactor: Option<Arc<FileEntryStore>>,
    channels: RwLock<HashMap<ChannelId, Arc<HistorizedChannel>>>,
    captures: RwLock<HashMap<ChannelId, Arc<AutoCapture>>>,
}

impl Historian {
    /// Opens a historian as described by `config`.
    ///
    /// With a data directory, the entry store and the ledger are replayed
    /// from `<data_dir>/entries` and `<data_dir>/ledger`.
    ///
    /// # Errors
    ///
    /// Returns an error if either journal cannot be opened.
    pub fn open(config: HistorianConfig) -> Result<Self> {
        let Some(data_dir) = config.data_dir else {
            return Ok(Self::in_memory());
        };

        let entries = Arc::new(FileEntryStore::open(
            data_dir.join(ENTRIES_DIR),
            config.journal.clone(),
        )?);
        let ledger = Arc::new(FileLedger::open(data_dir.join(LEDGER_DIR), config.journal)?);
        debug!(
            "Opened historian at {} with {} entries and {} ledger records",
            data_dir.display(),
            entries.len(),
            ledger.len()
        );

        let mut historian = Self::with_stores(entries.clone(), ledger);
        historian.compactor = Some(entries);
        Ok(historian)
    }

    /// Creates a historian whose stores live in process memory.
    pub fn in_memory() -> Self {
        Self::with_stores(
            Arc::new(MemoryEntryStore::new()),
            Arc::new(MemoryLedger::new()),
        )
    }

    /// Creates a historian over caller-supplied backends.
    pub fn with_stores(entries: Arc<dyn EntryStore>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            entries,
            ledger,
            compactor: None,
            channels: RwLock::new(HashMap::new()),
            captures: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the channel `id`, creating it on first reference.
    ///
    /// A channel keeps the value type it was created with; a later call
    /// declaring a different type gets the existing channel.
    pub fn channel(
        &self,
        id: impl Into<ChannelId>,
        value_type: ValueType,
    ) -> Arc<HistorizedChannel> {
        let id = id.into();
        if let Some(channel) = self.get(&id) {
            if channel.value_type() != value_type {
                warn!(
                    "Channel {} is declared as {:?}, ignoring requested type {:?}",
                    id,
                    channel.value_type(),
                    value_type
                );
            }
            return channel;
        }

        let mut channels = self.channels.write().unwrap_or_else(|err| err.into_inner());
        channels
            .entry(id)
            .or_insert_with_key(|id| {
                debug!("Creating channel {} of type {:?}", id, value_type);
                Arc::new(HistorizedChannel::new(
                    id.clone(),
                    value_type,
                    self.entries.clone(),
                    self.ledger.clone(),
                ))
            })
            .clone()
    }

    /// Returns the channel `id` if it has been referenced before.
    pub fn get(&self, id: &ChannelId) -> Option<Arc<HistorizedChannel>> {
        let channels = self.channels.read().unwrap_or_else(|err| err.into_inner());
        channels.get(id).cloned()
    }

    /// Returns the ids of all referenced channels, sorted.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let channels = self.channels.read().unwrap_or_else(|err| err.into_inner());
        let mut ids: Vec<_> = channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Binds `binding` to its channel and subscribes an [`AutoCapture`].
    ///
    /// Binding the same channel again returns the existing hook without a
    /// second subscription.
    pub fn bind(&self, binding: &dyn ChannelBinding) -> Arc<AutoCapture> {
        let id = binding.channel_id();
        let mut captures = self.captures.write().unwrap_or_else(|err| err.into_inner());
        if let Some(capture) = captures.get(&id) {
            return capture.clone();
        }

        let channel = self.channel(id.clone(), binding.value_type());
        let capture = Arc::new(AutoCapture::new(channel));
        binding.subscribe(capture.clone());
        debug!("Bound auto-capture to channel {}", id);
        captures.insert(id, capture.clone());
        capture
    }

    /// Returns the auto-capture hook of channel `id`, if bound.
    pub fn capture(&self, id: &ChannelId) -> Option<Arc<AutoCapture>> {
        let captures = self.captures.read().unwrap_or_else(|err| err.into_inner());
        captures.get(id).cloned()
    }

    /// Compacts the entry journal. Returns the number of segments removed,
    /// or zero when the entry store is not journal-backed.
    ///
    /// # Errors
    ///
    /// Returns an error if the compacted segment cannot be written.
    pub fn compact(&self) -> Result<usize> {
        match &self.compactor {
            Some(entries) => entries.compact(),
            None => Ok(0),
        }
    }
}

impl std::fmt::Debug for Historian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Historian")
            .field("channels", &self.channel_ids())
            .field("durable", &self.compactor.is_some())
            .finish_non_exhaustive()
    }
}
