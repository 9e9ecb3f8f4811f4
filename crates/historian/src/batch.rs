//! Batch mutation processing with per-item outcomes.
//!
//! A batch applies a list of items against one [`HistorizedChannel`] and
//! yields exactly one [`Outcome`] per item, in input order. Per-item
//! failures (type mismatch, entry conflicts) are reported in the outcome
//! list and processing continues. Storage faults abort the batch and are
//! returned as `Err`; items processed before the fault stay applied.
//!
//! | Request        | Success                     | Failure                         |
//! |----------------|-----------------------------|---------------------------------|
//! | Create         | GoodEntryInserted           | BadEntryExists, BadTypeMismatch |
//! | Replace        | GoodEntryReplaced           | BadNoEntryExists, BadTypeMismatch |
//! | Update         | GoodEntryInserted/Replaced  | BadTypeMismatch                 |
//! | DeleteAt       | Good                        | BadNoEntryExists                |
//! | DeleteValues   | Good                        | BadNoEntryExists                |
//! | DeleteRange    | Good per removed entry      | (none)                          |
//!
//! The channel guard is taken once per item, so a concurrent reader may see
//! a partially applied batch.

use crate::channel::{HistorizedChannel, Upserted};
use crate::error::{HistoryError, Result};
use crate::range::TimeRange;
use crate::types::{ModificationInfo, StatusCode, Timestamp, TypedValue};
use tracing::{debug, error};

/// Result of one batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The item was applied; no more specific code applies.
    Good,
    /// A new entry was inserted.
    GoodEntryInserted,
    /// An existing entry was replaced.
    GoodEntryReplaced,
    /// An entry already exists at the item's timestamp.
    BadEntryExists,
    /// No entry exists at the item's timestamp.
    BadNoEntryExists,
    /// The item's declared type differs from the channel's.
    BadTypeMismatch,
}

impl Outcome {
    /// Returns the numeric status code of the outcome.
    pub fn code(self) -> StatusCode {
        match self {
            Self::Good => StatusCode::GOOD,
            Self::GoodEntryInserted => StatusCode(0x00A2_0000),
            Self::GoodEntryReplaced => StatusCode(0x00A3_0000),
            Self::BadEntryExists => StatusCode(0x80A0_0000),
            Self::BadNoEntryExists => StatusCode(0x80A1_0000),
            Self::BadTypeMismatch => StatusCode(0x8074_0000),
        }
    }

    /// Returns true for the success outcomes.
    pub fn is_good(self) -> bool {
        self.code().is_good()
    }
}

/// A batch request against one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRequest {
    /// Insert each value; fail items whose timestamp is taken.
    Create(Vec<TypedValue>),
    /// Replace each value; fail items whose timestamp is free.
    Replace(Vec<TypedValue>),
    /// Insert or replace each value.
    Update(Vec<TypedValue>),
    /// Delete the entries at the given timestamps.
    DeleteAt(Vec<Timestamp>),
    /// Delete the entries at the timestamps of the given values.
    DeleteValues(Vec<TypedValue>),
    /// Delete every entry in the range.
    DeleteRange(TimeRange),
}

/// Applies batch requests to a channel.
#[derive(Debug, Clone, Copy)]
pub struct BatchProcessor<'a> {
    channel: &'a HistorizedChannel,
}

impl<'a> BatchProcessor<'a> {
    /// Creates a processor for `channel`.
    pub fn new(channel: &'a HistorizedChannel) -> Self {
        Self { channel }
    }

    /// Dispatches `request` to the matching operation.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::MalformedBatch` for an empty list-based request
    /// and propagates storage faults.
    pub fn process(&self, request: &BatchRequest, info: &ModificationInfo) -> Result<Vec<Outcome>> {
        match request {
            BatchRequest::Create(values) => self.create(values, info),
            BatchRequest::Replace(values) => self.replace(values, info),
            BatchRequest::Update(values) => self.update(values, info),
            BatchRequest::DeleteAt(timestamps) => self.delete_at(timestamps, info),
            BatchRequest::DeleteValues(values) => self.delete_values(values, info),
            BatchRequest::DeleteRange(range) => self.delete_range(*range, info),
        }
    }

    /// Inserts each value whose type matches and whose timestamp is free.
    pub fn create(&self, values: &[TypedValue], info: &ModificationInfo) -> Result<Vec<Outcome>> {
        self.apply_each("create", values, |item| {
            if !self.type_matches(item) {
                return Ok(Outcome::BadTypeMismatch);
            }
            conflict_outcome(
                self.channel.add_with(item.record.clone(), info),
                Outcome::GoodEntryInserted,
            )
        })
    }

    /// Replaces each value whose type matches and whose timestamp is taken.
    pub fn replace(&self, values: &[TypedValue], info: &ModificationInfo) -> Result<Vec<Outcome>> {
        self.apply_each("replace", values, |item| {
            if !self.type_matches(item) {
                return Ok(Outcome::BadTypeMismatch);
            }
            conflict_outcome(
                self.channel.replace_with(item.record.clone(), info),
                Outcome::GoodEntryReplaced,
            )
        })
    }

    /// Inserts or replaces each value whose type matches.
    pub fn update(&self, values: &[TypedValue], info: &ModificationInfo) -> Result<Vec<Outcome>> {
        self.apply_each("update", values, |item| {
            if !self.type_matches(item) {
                return Ok(Outcome::BadTypeMismatch);
            }
            Ok(match self.channel.upsert_with(item.record.clone(), info)? {
                Upserted::Inserted => Outcome::GoodEntryInserted,
                Upserted::Replaced => Outcome::GoodEntryReplaced,
            })
        })
    }

    /// Deletes the entry at each timestamp.
    pub fn delete_at(
        &self,
        timestamps: &[Timestamp],
        info: &ModificationInfo,
    ) -> Result<Vec<Outcome>> {
        self.apply_each("delete", timestamps, |&timestamp| {
            conflict_outcome(self.channel.remove_with(timestamp, info), Outcome::Good)
        })
    }

    /// Deletes the entry at each value's timestamp. Types are not checked.
    pub fn delete_values(
        &self,
        values: &[TypedValue],
        info: &ModificationInfo,
    ) -> Result<Vec<Outcome>> {
        self.apply_each("delete", values, |item| {
            conflict_outcome(
                self.channel.remove_with(item.record.timestamp, info),
                Outcome::Good,
            )
        })
    }

    /// Deletes every entry in `range`, yielding one `Good` per removed entry.
    pub fn delete_range(&self, range: TimeRange, info: &ModificationInfo) -> Result<Vec<Outcome>> {
        let removed = self.channel.remove_range_with(range, info)?;
        debug!(
            "Range delete on channel {} removed {} entries",
            self.channel.id(),
            removed
        );
        Ok(vec![Outcome::Good; removed])
    }

    fn type_matches(&self, item: &TypedValue) -> bool {
        item.value_type == self.channel.value_type()
    }

    fn apply_each<T>(
        &self,
        operation: &'static str,
        items: &[T],
        mut apply: impl FnMut(&T) -> Result<Outcome>,
    ) -> Result<Vec<Outcome>> {
        if items.is_empty() {
            return Err(HistoryError::MalformedBatch("batch carries no items"));
        }

        let mut outcomes = vec![Outcome::Good; items.len()];
        for (index, (outcome, item)) in outcomes.iter_mut().zip(items).enumerate() {
            *outcome = apply(item).map_err(|err| {
                error!(
                    "Batch {} on channel {} aborted at item {} of {}: {:?}",
                    operation,
                    self.channel.id(),
                    index,
                    items.len(),
                    err
                );
                err
            })?;
        }
        Ok(outcomes)
    }
}

/// Maps a single-operation result to an outcome, keeping storage faults as
/// errors.
fn conflict_outcome(result: Result<()>, success: Outcome) -> Result<Outcome> {
    match result {
        Ok(()) => Ok(success),
        Err(HistoryError::EntryExists(_)) => Ok(Outcome::BadEntryExists),
        Err(HistoryError::NoEntry(_)) => Ok(Outcome::BadNoEntryExists),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntryStore, MemoryEntryStore, MemoryLedger, Scan};
    use crate::types::{ChannelId, ModificationKind, ValueRecord, ValueType};
    use std::sync::Arc;

    fn make_channel() -> HistorizedChannel {
        HistorizedChannel::new(
            "P",
            ValueType::Double,
            Arc::new(MemoryEntryStore::new()),
            Arc::new(MemoryLedger::new()),
        )
    }

    /// Entry store that fails every write touching `failing_at`.
    struct FaultyEntryStore {
        inner: MemoryEntryStore,
        failing_at: Timestamp,
    }

    impl FaultyEntryStore {
        fn check(&self, timestamp: Timestamp) -> Result<()> {
            if timestamp == self.failing_at {
                return Err(HistoryError::IoError(std::io::Error::other("disk full")));
            }
            Ok(())
        }
    }

    impl EntryStore for FaultyEntryStore {
        fn exists(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<bool> {
            self.inner.exists(channel, timestamp)
        }

        fn get(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<Option<ValueRecord>> {
            self.inner.get(channel, timestamp)
        }

        fn insert(&self, channel: &ChannelId, record: &ValueRecord) -> Result<()> {
            self.check(record.timestamp)?;
            self.inner.insert(channel, record)
        }

        fn update(&self, channel: &ChannelId, record: &ValueRecord) -> Result<()> {
            self.check(record.timestamp)?;
            self.inner.update(channel, record)
        }

        fn delete(&self, channel: &ChannelId, timestamp: Timestamp) -> Result<()> {
            self.check(timestamp)?;
            self.inner.delete(channel, timestamp)
        }

        fn delete_range(&self, channel: &ChannelId, range: &TimeRange) -> Result<usize> {
            self.inner.delete_range(channel, range)
        }

        fn scan(&self, channel: &ChannelId, range: &TimeRange) -> Result<Scan<ValueRecord>> {
            self.inner.scan(channel, range)
        }
    }

    fn faulty_channel(failing_at: Timestamp) -> HistorizedChannel {
        let entries = FaultyEntryStore {
            inner: MemoryEntryStore::new(),
            failing_at,
        };
        HistorizedChannel::new(
            "P",
            ValueType::Double,
            Arc::new(entries),
            Arc::new(MemoryLedger::new()),
        )
    }

    fn double(ts: Timestamp, value: &str) -> TypedValue {
        TypedValue::new(ValueRecord::good(ts, value), ValueType::Double)
    }

    fn text(ts: Timestamp, value: &str) -> TypedValue {
        TypedValue::new(ValueRecord::good(ts, value), ValueType::String)
    }

    fn info() -> ModificationInfo {
        ModificationInfo::at(5_000).with_actor("batch")
    }

    #[test]
    fn test_outcome_codes() {
        assert!(Outcome::Good.is_good());
        assert!(Outcome::GoodEntryInserted.is_good());
        assert!(Outcome::GoodEntryReplaced.is_good());
        assert!(!Outcome::BadEntryExists.is_good());
        assert!(!Outcome::BadNoEntryExists.is_good());
        assert!(!Outcome::BadTypeMismatch.is_good());
    }

    #[test]
    fn test_create_reports_each_item() {
        let channel = make_channel();
        channel.add(ValueRecord::good(200, "old")).unwrap();

        let outcomes = channel
            .batch()
            .create(
                &[double(100, "1.0"), double(200, "2.0"), text(300, "x"), double(100, "again")],
                &info(),
            )
            .unwrap();

        assert_eq!(
            outcomes,
            vec![
                Outcome::GoodEntryInserted,
                Outcome::BadEntryExists,
                Outcome::BadTypeMismatch,
                Outcome::BadEntryExists,
            ]
        );
        assert_eq!(channel.get(200).unwrap().unwrap().value, "old");
        assert!(!channel.contains(300).unwrap());
    }

    #[test]
    fn test_type_check_precedes_existence_check() {
        let channel = make_channel();
        channel.add(ValueRecord::good(1, "1.0")).unwrap();

        let create = channel.batch().create(&[text(1, "x")], &info()).unwrap();
        let replace = channel.batch().replace(&[text(2, "x")], &info()).unwrap();

        assert_eq!(create, vec![Outcome::BadTypeMismatch]);
        assert_eq!(replace, vec![Outcome::BadTypeMismatch]);
    }

    #[test]
    fn test_replace_and_update() {
        let channel = make_channel();
        channel.add(ValueRecord::good(1, "1.0")).unwrap();

        let replace = channel
            .batch()
            .replace(&[double(1, "1.5"), double(2, "2.0")], &info())
            .unwrap();
        assert_eq!(replace, vec![Outcome::GoodEntryReplaced, Outcome::BadNoEntryExists]);

        let update = channel
            .batch()
            .update(&[double(1, "1.7"), double(2, "2.0"), text(3, "x")], &info())
            .unwrap();
        assert_eq!(
            update,
            vec![
                Outcome::GoodEntryReplaced,
                Outcome::GoodEntryInserted,
                Outcome::BadTypeMismatch,
            ]
        );
        assert_eq!(channel.get(1).unwrap().unwrap().value, "1.7");
        assert_eq!(channel.get(2).unwrap().unwrap().value, "2.0");
    }

    #[test]
    fn test_deletes() {
        let channel = make_channel();
        for ts in 1..=6 {
            channel.add(ValueRecord::good(ts, "v")).unwrap();
        }

        let by_time = channel.batch().delete_at(&[1, 9, 2], &info()).unwrap();
        assert_eq!(by_time, vec![Outcome::Good, Outcome::BadNoEntryExists, Outcome::Good]);

        // Delete-by-value ignores the declared type.
        let by_value = channel
            .batch()
            .delete_values(&[text(3, "ignored"), double(1, "gone")], &info())
            .unwrap();
        assert_eq!(by_value, vec![Outcome::Good, Outcome::BadNoEntryExists]);

        let by_range = channel
            .batch()
            .delete_range(TimeRange::between(5, 4), &info())
            .unwrap();
        assert_eq!(by_range, vec![Outcome::Good, Outcome::Good]);

        let left: Vec<_> = channel
            .read(TimeRange::unbounded())
            .unwrap()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(left, vec![6]);

        let deleted = channel
            .read_ledger(TimeRange::unbounded())
            .unwrap()
            .filter(|r| r.kind == ModificationKind::Deleted)
            .count();
        assert_eq!(deleted, 5);
    }

    #[test]
    fn test_empty_range_delete_is_not_malformed() {
        let channel = make_channel();
        let outcomes = channel
            .batch()
            .delete_range(TimeRange::unbounded(), &info())
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_empty_item_list_is_malformed() {
        let channel = make_channel();
        let batch = channel.batch();

        for request in [
            BatchRequest::Create(vec![]),
            BatchRequest::Replace(vec![]),
            BatchRequest::Update(vec![]),
            BatchRequest::DeleteAt(vec![]),
            BatchRequest::DeleteValues(vec![]),
        ] {
            assert!(matches!(
                batch.process(&request, &info()),
                Err(HistoryError::MalformedBatch(_))
            ));
        }
    }

    #[test]
    fn test_process_dispatch_and_ledger_context() {
        let channel = make_channel();
        let info = ModificationInfo::at(42).with_actor("ops").with_reason("backfill");

        let outcomes = channel
            .batch()
            .process(&BatchRequest::Update(vec![double(10, "1.0")]), &info)
            .unwrap();
        assert_eq!(outcomes, vec![Outcome::GoodEntryInserted]);

        let record = channel
            .read_ledger(TimeRange::at(10))
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(record.modification_time, 42);
        assert_eq!(record.actor.as_deref(), Some("ops"));
        assert_eq!(record.reason.as_deref(), Some("backfill"));
    }

    #[test]
    fn test_storage_fault_aborts_batch() {
        let channel = faulty_channel(3);
        channel.add(ValueRecord::good(1, "0.5")).unwrap();
        let items = [
            double(1, "1.0"),
            double(2, "2.0"),
            double(3, "3.0"),
            double(4, "4.0"),
        ];

        let err = channel.batch().create(&items, &info()).unwrap_err();

        assert!(matches!(err, HistoryError::IoError(_)));
        assert!(err.is_storage_fault());
        // Items before the fault stay applied; nothing after it runs.
        assert_eq!(channel.get(1).unwrap().unwrap().value, "0.5");
        assert!(channel.contains(2).unwrap());
        assert!(!channel.contains(3).unwrap());
        assert!(!channel.contains(4).unwrap());

        let inserted: Vec<_> = channel
            .read_ledger(TimeRange::unbounded())
            .unwrap()
            .filter(|r| r.modification_time == 5_000)
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(inserted, vec![2]);
    }

    #[test]
    fn test_storage_fault_aborts_delete_batch() {
        let channel = faulty_channel(20);
        for ts in [10, 20, 30] {
            channel.add(ValueRecord::good(ts, "1.0")).unwrap();
        }

        let result = channel.batch().delete_at(&[10, 20, 30], &info());

        assert!(matches!(result, Err(HistoryError::IoError(_))));
        assert!(!channel.contains(10).unwrap());
        assert!(channel.contains(20).unwrap());
        assert!(channel.contains(30).unwrap());
    }
}
