//! Historized channel: entry store, ledger and guard behind one API.
//!
//! Every mutation runs under the channel's [`ChannelGuard`] for the whole
//! check → entry store mutation → ledger append sequence:
//!
//! ```text
//! lock → exists/get → insert/update/delete → ledger append → unlock
//! ```
//!
//! Ledger records carry the state a mutation superseded: the new value for
//! an insertion, the old value for a replacement or deletion.

use crate::batch::BatchProcessor;
use crate::error::{HistoryError, Result};
use crate::guard::ChannelGuard;
use crate::range::TimeRange;
use crate::store::{EntryStore, LedgerStore, Scan};
use crate::types::{
    ChannelId, LedgerRecord, ModificationInfo, ModificationKind, Timestamp, ValueRecord,
    ValueType, MIN_TIMESTAMP,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, warn};

/// Which branch an upsert took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    /// No entry existed; the value was inserted.
    Inserted,
    /// An entry existed; it was replaced.
    Replaced,
}

/// One channel's historized values and their modification ledger.
pub struct HistorizedChannel {
    id: ChannelId,
    value_type: ValueType,
    entries: Arc<dyn EntryStore>,
    ledger: Arc<dyn LedgerStore>,
    guard: ChannelGuard,
}

impl HistorizedChannel {
    /// Creates a channel over the given stores.
    ///
    /// `value_type` is the declared type batch items are checked against.
    pub fn new(
        id: impl Into<ChannelId>,
        value_type: ValueType,
        entries: Arc<dyn EntryStore>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            id: id.into(),
            value_type,
            entries,
            ledger,
            guard: ChannelGuard::new(),
        }
    }

    /// Returns the channel id.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Returns the declared value type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Returns a batch processor bound to this channel.
    pub fn batch(&self) -> BatchProcessor<'_> {
        BatchProcessor::new(self)
    }

    /// Inserts `value`, stamped with the current time and no actor.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::EntryExists` if an entry already exists at
    /// `value.timestamp`.
    pub fn add(&self, value: ValueRecord) -> Result<()> {
        self.add_with(value, &ModificationInfo::now()?)
    }

    /// Inserts `value` and records an `Inserted` ledger entry.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::EntryExists` if an entry already exists at
    /// `value.timestamp`.
    pub fn add_with(&self, value: ValueRecord, info: &ModificationInfo) -> Result<()> {
        let _held = self.guard.lock();
        if self.entries.exists(&self.id, value.timestamp)? {
            return Err(HistoryError::EntryExists(value.timestamp));
        }
        self.insert_locked(value, info)
    }

    /// Replaces the entry at `value.timestamp`, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::NoEntry` if no entry exists at the timestamp.
    pub fn replace(&self, value: ValueRecord) -> Result<()> {
        self.replace_with(value, &ModificationInfo::now()?)
    }

    /// Replaces the entry at `value.timestamp` and records a `Replaced`
    /// ledger entry holding the old value.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::NoEntry` if no entry exists at the timestamp.
    pub fn replace_with(&self, value: ValueRecord, info: &ModificationInfo) -> Result<()> {
        let _held = self.guard.lock();
        let old = self
            .entries
            .get(&self.id, value.timestamp)?
            .ok_or(HistoryError::NoEntry(value.timestamp))?;
        self.update_locked(old, value, info)
    }

    /// Inserts or replaces `value`, stamped with the current time.
    pub fn upsert(&self, value: ValueRecord) -> Result<Upserted> {
        self.upsert_with(value, &ModificationInfo::now()?)
    }

    /// Inserts `value` if its timestamp is free, otherwise replaces the
    /// existing entry.
    pub fn upsert_with(&self, value: ValueRecord, info: &ModificationInfo) -> Result<Upserted> {
        let _held = self.guard.lock();
        match self.entries.get(&self.id, value.timestamp)? {
            Some(old) => {
                self.update_locked(old, value, info)?;
                Ok(Upserted::Replaced)
            }
            None => {
                self.insert_locked(value, info)?;
                Ok(Upserted::Inserted)
            }
        }
    }

    /// Removes the entry at `timestamp`, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::NoEntry` if no entry exists at the timestamp.
    pub fn remove(&self, timestamp: Timestamp) -> Result<()> {
        self.remove_with(timestamp, &ModificationInfo::now()?)
    }

    /// Removes the entry at `timestamp` and records a `Deleted` ledger entry
    /// holding the removed value.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::NoEntry` if no entry exists at the timestamp.
    pub fn remove_with(&self, timestamp: Timestamp, info: &ModificationInfo) -> Result<()> {
        let _held = self.guard.lock();
        let old = self
            .entries
            .get(&self.id, timestamp)?
            .ok_or(HistoryError::NoEntry(timestamp))?;
        self.entries.delete(&self.id, timestamp)?;
        self.append_ledger(&old, ModificationKind::Deleted, info)
    }

    /// Removes every entry in `range`, stamped with the current time.
    pub fn remove_range(&self, range: TimeRange) -> Result<usize> {
        self.remove_range_with(range, &ModificationInfo::now()?)
    }

    /// Removes every entry in `range`, recording one `Deleted` ledger entry
    /// per removed entry. Returns the number of entries removed.
    ///
    /// If the entry store fails part way, the entries it did remove still get
    /// their ledger records and the call returns
    /// `HistoryError::LedgerDivergence` naming the first entry left behind.
    pub fn remove_range_with(&self, range: TimeRange, info: &ModificationInfo) -> Result<usize> {
        let _held = self.guard.lock();
        let doomed: Vec<ValueRecord> = self.entries.scan(&self.id, &range)?.collect();
        let removed = match self.entries.delete_range(&self.id, &range) {
            Ok(removed) => removed,
            Err(source) => return Err(self.reconcile_range_delete(&range, &doomed, info, source)),
        };
        if removed != doomed.len() {
            warn!(
                "Range delete on channel {} removed {} entries, scan saw {}",
                self.id,
                removed,
                doomed.len()
            );
        }

        for old in &doomed {
            self.append_ledger(old, ModificationKind::Deleted, info)?;
        }
        Ok(removed)
    }

    /// Returns the entries in `range`, ascending by timestamp.
    pub fn read(&self, range: TimeRange) -> Result<Scan<ValueRecord>> {
        let _held = self.guard.lock();
        self.entries.scan(&self.id, &range)
    }

    /// Returns the ledger records whose entry timestamp lies in `range`.
    pub fn read_ledger(&self, range: TimeRange) -> Result<Scan<LedgerRecord>> {
        let _held = self.guard.lock();
        self.ledger.scan(&self.id, &range)
    }

    /// Returns true if an entry exists at `timestamp`.
    pub fn contains(&self, timestamp: Timestamp) -> Result<bool> {
        let _held = self.guard.lock();
        self.entries.exists(&self.id, timestamp)
    }

    /// Returns the entry at `timestamp`, if any.
    pub fn get(&self, timestamp: Timestamp) -> Result<Option<ValueRecord>> {
        let _held = self.guard.lock();
        self.entries.get(&self.id, timestamp)
    }

    /// Returns true if the channel holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read(TimeRange::unbounded())?.next().is_none())
    }

    fn insert_locked(&self, value: ValueRecord, info: &ModificationInfo) -> Result<()> {
        self.entries.insert(&self.id, &value)?;
        self.append_ledger(&value, ModificationKind::Inserted, info)
    }

    fn update_locked(
        &self,
        old: ValueRecord,
        value: ValueRecord,
        info: &ModificationInfo,
    ) -> Result<()> {
        self.entries.update(&self.id, &value)?;
        self.append_ledger(&old, ModificationKind::Replaced, info)
    }

    /// Records the entries a failed range delete removed anyway.
    ///
    /// Returns `source` unchanged when nothing was removed, otherwise a
    /// `LedgerDivergence` for the entries that survived.
    fn reconcile_range_delete(
        &self,
        range: &TimeRange,
        doomed: &[ValueRecord],
        info: &ModificationInfo,
        source: HistoryError,
    ) -> HistoryError {
        let survivors: HashSet<Timestamp> = match self.entries.scan(&self.id, range) {
            Ok(scan) => scan.map(|record| record.timestamp).collect(),
            Err(rescan) => {
                error!(
                    "Range delete on channel {} failed and the range cannot be rescanned: {:?}",
                    self.id, rescan
                );
                return self.range_divergence(doomed.first(), source);
            }
        };

        let vanished: Vec<&ValueRecord> = doomed
            .iter()
            .filter(|record| !survivors.contains(&record.timestamp))
            .collect();
        if vanished.is_empty() {
            return source;
        }

        for old in &vanished {
            if let Err(err) = self.append_ledger(old, ModificationKind::Deleted, info) {
                return err;
            }
        }

        let first_survivor = doomed
            .iter()
            .find(|record| survivors.contains(&record.timestamp));
        error!(
            "Range delete on channel {} stopped after {} of {} entries: {:?}",
            self.id,
            vanished.len(),
            doomed.len(),
            source
        );
        self.range_divergence(first_survivor.or(doomed.first()), source)
    }

    fn range_divergence(&self, at: Option<&ValueRecord>, source: HistoryError) -> HistoryError {
        HistoryError::LedgerDivergence {
            channel: self.id.clone(),
            timestamp: at.map_or(MIN_TIMESTAMP, |record| record.timestamp),
            source: Box::new(source),
        }
    }

    /// Appends the ledger half of a compound mutation whose entry store half
    /// already succeeded.
    fn append_ledger(
        &self,
        record: &ValueRecord,
        kind: ModificationKind,
        info: &ModificationInfo,
    ) -> Result<()> {
        let entry = LedgerRecord::from_record(record, kind, info);
        self.ledger.append(&self.id, &entry).map_err(|source| {
            error!(
                "Ledger append failed after {:?} of channel {} at {}; stores diverged: {:?}",
                kind, self.id, record.timestamp, source
            );
            HistoryError::LedgerDivergence {
                channel: self.id.clone(),
                timestamp: record.timestamp,
                source: Box::new(source),
            }
        })
    }
}

impl std::fmt::Debug for HistorizedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistorizedChannel")
            .field("id", &self.id)
            .field("value_type", &self.value_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryEntryStore, MemoryLedger};
    use crate::types::StatusCode;

    fn make_channel() -> (HistorizedChannel, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let channel = HistorizedChannel::new(
            "P",
            ValueType::Int32,
            Arc::new(MemoryEntryStore::new()),
            ledger.clone(),
        );
        (channel, ledger)
    }

    /// Ledger that rejects every append.
    struct BrokenLedger;

    impl LedgerStore for BrokenLedger {
        fn append(&self, _channel: &ChannelId, _record: &LedgerRecord) -> Result<()> {
            Err(HistoryError::IoError(std::io::Error::other("ledger offline")))
        }

        fn scan(&self, _channel: &ChannelId, _range: &TimeRange) -> Result<Scan<LedgerRecord>> {
            Ok(Vec::new().into_iter())
        }
    }

    /// Entry store whose range delete removes at most `budget` entries and
    /// then fails.
    struct StallingEntryStore {
        inner: MemoryEntryStore,
        budget: usize,
    }

    impl EntryStore for StallingEntryStore {
        fn exists(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<bool> {
            self.inner.exists(channel, timestamp)
        }

        fn get(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<Option<ValueRecord>> {
            self.inner.get(channel, timestamp)
        }

        fn insert(&self, channel: &ChannelId, record: &ValueRecord) -> Result<()> {
            self.inner.insert(channel, record)
        }

        fn update(&self, channel: &ChannelId, record: &ValueRecord) -> Result<()> {
            self.inner.update(channel, record)
        }

        fn delete(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<()> {
            self.inner.delete(channel, timestamp)
        }

        fn delete_range(&self, channel: &ChannelId, range: &TimeRange) -> Result<usize> {
            let doomed: Vec<_> = self.inner.scan(channel, range)?.collect();
            for record in doomed.iter().take(self.budget) {
                self.inner.delete(channel, record.timestamp)?;
            }
            Err(HistoryError::IoError(std::io::Error::other("disk full")))
        }

        fn scan(&self, channel: &ChannelId, range: &TimeRange) -> Result<Scan<ValueRecord>> {
            self.inner.scan(channel, range)
        }
    }

    fn stalling_channel(budget: usize) -> (HistorizedChannel, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let entries = StallingEntryStore {
            inner: MemoryEntryStore::new(),
            budget,
        };
        let channel =
            HistorizedChannel::new("P", ValueType::Int32, Arc::new(entries), ledger.clone());
        for ts in [10, 20, 30] {
            channel.add(ValueRecord::good(ts, ts.to_string())).unwrap();
        }
        (channel, ledger)
    }

    fn deleted_timestamps(channel: &HistorizedChannel) -> Vec<Timestamp> {
        channel
            .read_ledger(TimeRange::unbounded())
            .unwrap()
            .filter(|r| r.kind == ModificationKind::Deleted)
            .map(|r| r.timestamp)
            .collect()
    }

    #[test]
    fn test_add_records_inserted() {
        let (channel, ledger) = make_channel();
        let info = ModificationInfo::at(1_000).with_actor("alice");

        channel.add_with(ValueRecord::good(100, "5"), &info).unwrap();

        assert!(channel.contains(100).unwrap());
        let records: Vec<_> = channel.read_ledger(TimeRange::at(100)).unwrap().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ModificationKind::Inserted);
        assert_eq!(records[0].value, "5");
        assert_eq!(records[0].modification_time, 1_000);
        assert_eq!(records[0].actor.as_deref(), Some("alice"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_second_add_is_rejected_without_side_effects() {
        let (channel, ledger) = make_channel();
        channel.add(ValueRecord::good(100, "5")).unwrap();

        let err = channel.add(ValueRecord::good(100, "6")).unwrap_err();

        assert!(matches!(err, HistoryError::EntryExists(100)));
        assert_eq!(channel.get(100).unwrap().unwrap().value, "5");
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_replace_records_old_value() {
        let (channel, _) = make_channel();
        channel.add(ValueRecord::new(100, "5", StatusCode::GOOD)).unwrap();

        channel
            .replace(ValueRecord::new(100, "7", StatusCode::UNCERTAIN))
            .unwrap();

        assert_eq!(
            channel.get(100).unwrap(),
            Some(ValueRecord::new(100, "7", StatusCode::UNCERTAIN))
        );
        let replaced: Vec<_> = channel
            .read_ledger(TimeRange::unbounded())
            .unwrap()
            .filter(|r| r.kind == ModificationKind::Replaced)
            .collect();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].value, "5");
        assert_eq!(replaced[0].status, StatusCode::GOOD);
    }

    #[test]
    fn test_replace_and_remove_missing_entry() {
        let (channel, ledger) = make_channel();

        assert!(matches!(
            channel.replace(ValueRecord::good(1, "x")),
            Err(HistoryError::NoEntry(1))
        ));
        assert!(matches!(channel.remove(1), Err(HistoryError::NoEntry(1))));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_upsert_branches() {
        let (channel, _) = make_channel();

        assert_eq!(channel.upsert(ValueRecord::good(1, "a")).unwrap(), Upserted::Inserted);
        assert_eq!(channel.upsert(ValueRecord::good(1, "b")).unwrap(), Upserted::Replaced);

        let values: Vec<_> = channel.read(TimeRange::at(1)).unwrap().collect();
        assert_eq!(values, vec![ValueRecord::good(1, "b")]);

        let kinds: Vec<_> = channel
            .read_ledger(TimeRange::at(1))
            .unwrap()
            .map(|r| (r.kind, r.value))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ModificationKind::Inserted, "a".to_string()),
                (ModificationKind::Replaced, "a".to_string()),
            ]
        );
    }

    #[test]
    fn test_remove_range_logs_each_deletion() {
        let (channel, _) = make_channel();
        for ts in 1..=5 {
            channel.add(ValueRecord::good(ts * 10, ts.to_string())).unwrap();
        }

        let removed = channel.remove_range(TimeRange::between(40, 20)).unwrap();

        assert_eq!(removed, 3);
        let left: Vec<_> = channel
            .read(TimeRange::unbounded())
            .unwrap()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(left, vec![10, 50]);
        let deleted: Vec<_> = channel
            .read_ledger(TimeRange::unbounded())
            .unwrap()
            .filter(|r| r.kind == ModificationKind::Deleted)
            .map(|r| r.value)
            .collect();
        assert_eq!(deleted, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_is_empty() {
        let (channel, _) = make_channel();
        assert!(channel.is_empty().unwrap());
        channel.add(ValueRecord::good(1, "x")).unwrap();
        assert!(!channel.is_empty().unwrap());
        channel.remove(1).unwrap();
        assert!(channel.is_empty().unwrap());
    }

    #[test]
    fn test_ledger_failure_reports_divergence() {
        let entries = Arc::new(MemoryEntryStore::new());
        let channel =
            HistorizedChannel::new("P", ValueType::Int32, entries.clone(), Arc::new(BrokenLedger));

        let err = channel.add(ValueRecord::good(100, "5")).unwrap_err();

        assert!(err.is_storage_fault());
        match err {
            HistoryError::LedgerDivergence {
                channel: id,
                timestamp,
                ..
            } => {
                assert_eq!(id, ChannelId::from("P"));
                assert_eq!(timestamp, 100);
            }
            other => panic!("expected divergence, got {:?}", other),
        }
        // The entry store half is not rolled back.
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_partial_range_delete_records_removed_entries() {
        let (channel, _) = stalling_channel(1);
        let info = ModificationInfo::at(5).with_reason("cleanup");

        let err = channel.remove_range_with(TimeRange::unbounded(), &info).unwrap_err();

        assert!(err.is_storage_fault());
        match err {
            HistoryError::LedgerDivergence {
                timestamp, source, ..
            } => {
                assert_eq!(timestamp, 20);
                assert!(matches!(*source, HistoryError::IoError(_)));
            }
            other => panic!("expected divergence, got {:?}", other),
        }
        assert_eq!(channel.read(TimeRange::unbounded()).unwrap().count(), 2);
        assert!(!channel.contains(10).unwrap());
        assert_eq!(deleted_timestamps(&channel), vec![10]);
    }

    #[test]
    fn test_range_delete_failing_before_any_removal_is_plain_error() {
        let (channel, _) = stalling_channel(0);

        let err = channel.remove_range(TimeRange::unbounded()).unwrap_err();

        assert!(matches!(err, HistoryError::IoError(_)));
        assert_eq!(channel.read(TimeRange::unbounded()).unwrap().count(), 3);
        assert!(deleted_timestamps(&channel).is_empty());
    }
}
