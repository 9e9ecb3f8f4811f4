//! In-memory entry store and ledger.
//!
//! The index types here also back the journal-based stores, which rebuild
//! them from their journals on open.

use crate::error::{HistoryError, Result};
use crate::range::TimeRange;
use crate::store::{EntryStore, LedgerStore, Scan};
use crate::types::{ChannelId, LedgerRecord, Timestamp, ValueRecord};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Per-channel sorted entries.
#[derive(Debug, Default)]
pub(crate) struct EntryIndex {
    partitions: HashMap<ChannelId, BTreeMap<Timestamp, ValueRecord>>,
}

impl EntryIndex {
    pub(crate) fn get(&self, channel: &ChannelId, timestamp: Timestamp) -> Option<&ValueRecord> {
        self.partitions.get(channel)?.get(&timestamp)
    }

    pub(crate) fn contains(&self, channel: &ChannelId, timestamp: Timestamp) -> bool {
        self.get(channel, timestamp).is_some()
    }

    /// Stores `record`, returning the record previously held at its timestamp.
    pub(crate) fn put(&mut self, channel: &ChannelId, record: ValueRecord) -> Option<ValueRecord> {
        self.partitions
            .entry(channel.clone())
            .or_default()
            .insert(record.timestamp, record)
    }

    pub(crate) fn remove(
        &mut self,
        channel: &ChannelId,
        timestamp: Timestamp,
    ) -> Option<ValueRecord> {
        let partition = self.partitions.get_mut(channel)?;
        let removed = partition.remove(&timestamp);
        if partition.is_empty() {
            self.partitions.remove(channel);
        }
        removed
    }

    pub(crate) fn timestamps_in(&self, channel: &ChannelId, range: &TimeRange) -> Vec<Timestamp> {
        self.partitions
            .get(channel)
            .map(|partition| partition.range(range.bounds()).map(|(&ts, _)| ts).collect())
            .unwrap_or_default()
    }

    pub(crate) fn scan(&self, channel: &ChannelId, range: &TimeRange) -> Vec<ValueRecord> {
        self.partitions
            .get(channel)
            .map(|partition| partition.range(range.bounds()).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Iterates over every live entry of every channel.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ChannelId, &ValueRecord)> {
        self.partitions
            .iter()
            .flat_map(|(channel, partition)| partition.values().map(move |r| (channel, r)))
    }

    pub(crate) fn len(&self) -> usize {
        self.partitions.values().map(BTreeMap::len).sum()
    }
}

/// Per-channel ledger records grouped by entry timestamp, in append order.
#[derive(Debug, Default)]
pub(crate) struct LedgerIndex {
    partitions: HashMap<ChannelId, BTreeMap<Timestamp, Vec<LedgerRecord>>>,
}

impl LedgerIndex {
    pub(crate) fn push(&mut self, channel: &ChannelId, record: LedgerRecord) {
        self.partitions
            .entry(channel.clone())
            .or_default()
            .entry(record.timestamp)
            .or_default()
            .push(record);
    }

    pub(crate) fn scan(&self, channel: &ChannelId, range: &TimeRange) -> Vec<LedgerRecord> {
        self.partitions
            .get(channel)
            .map(|partition| {
                partition
                    .range(range.bounds())
                    .flat_map(|(_, records)| records.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.partitions
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }
}

/// Entry store held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryEntryStore {
    index: RwLock<EntryIndex>,
}

impl MemoryEntryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries across all channels.
    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(|err| err.into_inner()).len()
    }

    /// Returns true if no channel holds any entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntryStore for MemoryEntryStore {
    fn exists(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<bool> {
        let index = self.index.read().unwrap_or_else(|err| err.into_inner());
        Ok(index.contains(channel, timestamp))
    }

    fn get(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<Option<ValueRecord>> {
        let index = self.index.read().unwrap_or_else(|err| err.into_inner());
        Ok(index.get(channel, timestamp).cloned())
    }

    fn insert(&self, channel: &ChannelId, record: &ValueRecord) -> Result<()> {
        let mut index = self.index.write().unwrap_or_else(|err| err.into_inner());
        if index.contains(channel, record.timestamp) {
            return Err(HistoryError::EntryExists(record.timestamp));
        }
        index.put(channel, record.clone());
        Ok(())
    }

    fn update(&self, channel: &ChannelId, record: &ValueRecord) -> Result<()> {
        let mut index = self.index.write().unwrap_or_else(|err| err.into_inner());
        if !index.contains(channel, record.timestamp) {
            return Err(HistoryError::NoEntry(record.timestamp));
        }
        index.put(channel, record.clone());
        Ok(())
    }

    fn delete(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<()> {
        let mut index = self.index.write().unwrap_or_else(|err| err.into_inner());
        index
            .remove(channel, timestamp)
            .map(|_| ())
            .ok_or(HistoryError::NoEntry(timestamp))
    }

    fn delete_range(&self, channel: &ChannelId, range: &TimeRange) -> Result<usize> {
        let mut index = self.index.write().unwrap_or_else(|err| err.into_inner());
        let doomed = index.timestamps_in(channel, range);
        for &timestamp in &doomed {
            index.remove(channel, timestamp);
        }
        Ok(doomed.len())
    }

    fn scan(&self, channel: &ChannelId, range: &TimeRange) -> Result<Scan<ValueRecord>> {
        let index = self.index.read().unwrap_or_else(|err| err.into_inner());
        Ok(index.scan(channel, range).into_iter())
    }
}

/// Ledger held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    index: RwLock<LedgerIndex>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records across all channels.
    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(|err| err.into_inner()).len()
    }

    /// Returns true if nothing has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LedgerStore for MemoryLedger {
    fn append(&self, channel: &ChannelId, record: &LedgerRecord) -> Result<()> {
        let mut index = self.index.write().unwrap_or_else(|err| err.into_inner());
        index.push(channel, record.clone());
        Ok(())
    }

    fn scan(&self, channel: &ChannelId, range: &TimeRange) -> Result<Scan<LedgerRecord>> {
        let index = self.index.read().unwrap_or_else(|err| err.into_inner());
        Ok(index.scan(channel, range).into_iter())
    }
}
