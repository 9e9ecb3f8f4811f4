//! Core record types shared by the entry store, the ledger and the channel API.

use crate::error::{HistoryError, Result};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp in nanoseconds since the Unix epoch.
pub type Timestamp = i64;

/// Smallest representable timestamp. Treated as "unbounded" in ranges.
pub const MIN_TIMESTAMP: Timestamp = i64::MIN;

/// Largest representable timestamp. Treated as "unbounded" in ranges.
pub const MAX_TIMESTAMP: Timestamp = i64::MAX;

/// Opaque, caller-supplied identity of a historized channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    /// Creates a channel id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Quality of a reading at capture time.
///
/// The two most significant bits carry the severity: `00` good,
/// `01` uncertain, `10` bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// The reading is good.
    pub const GOOD: Self = Self(0);
    /// The reading is of uncertain quality.
    pub const UNCERTAIN: Self = Self(0x4000_0000);
    /// The reading is bad.
    pub const BAD: Self = Self(0x8000_0000);

    const SEVERITY_MASK: u32 = 0xC000_0000;

    /// Returns true if the severity bits are `00`.
    pub fn is_good(self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0
    }

    /// Returns true if the severity bits are `01`.
    pub fn is_uncertain(self) -> bool {
        self.0 & Self::SEVERITY_MASK == Self::UNCERTAIN.0
    }

    /// Returns true if the severity bit `10` is set.
    pub fn is_bad(self) -> bool {
        self.0 & Self::BAD.0 != 0
    }
}

/// Declared scalar type of a channel's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// `true` / `false`.
    Boolean,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// UTF-8 text.
    String,
    /// Point in time.
    DateTime,
}

/// Common shape of the entry store row and the ledger row.
///
/// The journal encodes these shared fields through this trait, so both row
/// kinds use one wire layout for them.
pub trait HistoricalRecord {
    /// Timestamp of the historized value.
    fn timestamp(&self) -> Timestamp;
    /// Serialized scalar value.
    fn value(&self) -> &str;
    /// Quality of the value at capture time.
    fn status(&self) -> StatusCode;
}

/// One historized value of a channel (an entry store row).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRecord {
    /// Timestamp, unique within the channel.
    pub timestamp: Timestamp,
    /// Serialized scalar value.
    pub value: String,
    /// Quality of the value at capture time.
    pub status: StatusCode,
}

impl ValueRecord {
    /// Creates a new value record.
    pub fn new(timestamp: Timestamp, value: impl Into<String>, status: StatusCode) -> Self {
        Self {
            timestamp,
            value: value.into(),
            status,
        }
    }

    /// Creates a value record with good status.
    pub fn good(timestamp: Timestamp, value: impl Into<String>) -> Self {
        Self::new(timestamp, value, StatusCode::GOOD)
    }
}

impl HistoricalRecord for ValueRecord {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn value(&self) -> &str {
        &self.value
    }

    fn status(&self) -> StatusCode {
        self.status
    }
}

/// A value record tagged with its declared type, as submitted in batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedValue {
    /// The record to historize.
    pub record: ValueRecord,
    /// The declared type of `record.value`.
    pub value_type: ValueType,
}

impl TypedValue {
    /// Creates a typed value.
    pub fn new(record: ValueRecord, value_type: ValueType) -> Self {
        Self { record, value_type }
    }
}

/// Kind of mutation recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModificationKind {
    /// A new entry was inserted.
    Inserted = 1,
    /// An existing entry was replaced.
    Replaced = 2,
    /// An existing entry was deleted.
    Deleted = 3,
}

impl ModificationKind {
    /// Decodes a kind from its on-disk tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Inserted),
            2 => Some(Self::Replaced),
            3 => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Who, why and when of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationInfo {
    /// Identity of the actor performing the mutation.
    pub actor: Option<String>,
    /// Free-form reason for the mutation.
    pub reason: Option<String>,
    /// Time of the mutation.
    pub time: Timestamp,
}

impl ModificationInfo {
    /// Creates an anonymous context stamped with the given time.
    pub fn at(time: Timestamp) -> Self {
        Self {
            actor: None,
            reason: None,
            time,
        }
    }

    /// Creates an anonymous context stamped with the current wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::Clock` if the system clock is before the epoch.
    pub fn now() -> Result<Self> {
        Ok(Self::at(current_timestamp_nanos()?))
    }

    /// Sets the actor.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Sets the reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// One ledger row: the state a mutation produced or superseded, plus who,
/// why and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    /// Timestamp of the affected entry.
    pub timestamp: Timestamp,
    /// Value of the affected entry. For `Replaced` and `Deleted` this is the
    /// value before the mutation.
    pub value: String,
    /// Status of the affected entry, with the same before-state rule.
    pub status: StatusCode,
    /// Time of the mutation.
    pub modification_time: Timestamp,
    /// Kind of the mutation.
    pub kind: ModificationKind,
    /// Actor that performed the mutation.
    pub actor: Option<String>,
    /// Reason given for the mutation.
    pub reason: Option<String>,
}

impl LedgerRecord {
    /// Builds a ledger record from the affected value record.
    pub fn from_record(
        record: &ValueRecord,
        kind: ModificationKind,
        info: &ModificationInfo,
    ) -> Self {
        Self {
            timestamp: record.timestamp,
            value: record.value.clone(),
            status: record.status,
            modification_time: info.time,
            kind,
            actor: info.actor.clone(),
            reason: info.reason.clone(),
        }
    }
}

impl HistoricalRecord for LedgerRecord {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn value(&self) -> &str {
        &self.value
    }

    fn status(&self) -> StatusCode {
        self.status
    }
}

pub(crate) fn current_timestamp_nanos() -> Result<Timestamp> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| HistoryError::Clock(err.to_string()))?;
    Ok(now.as_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_severity() {
        assert!(StatusCode::GOOD.is_good());
        assert!(StatusCode(0x00A2_0000).is_good());
        assert!(StatusCode::UNCERTAIN.is_uncertain());
        assert!(!StatusCode::UNCERTAIN.is_bad());
        assert!(StatusCode(0x80A1_0000).is_bad());
        assert!(!StatusCode(0x80A1_0000).is_good());
    }

    #[test]
    fn test_modification_kind_tags() {
        for kind in [
            ModificationKind::Inserted,
            ModificationKind::Replaced,
            ModificationKind::Deleted,
        ] {
            assert_eq!(ModificationKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(ModificationKind::from_u8(0), None);
        assert_eq!(ModificationKind::from_u8(4), None);
    }

    #[test]
    fn test_ledger_record_copies_prior_state() {
        let prior = ValueRecord::new(100, "5", StatusCode::UNCERTAIN);
        let info = ModificationInfo::at(2_000)
            .with_actor("operator")
            .with_reason("sensor recalibrated");

        let record = LedgerRecord::from_record(&prior, ModificationKind::Replaced, &info);

        assert_eq!(record.timestamp(), 100);
        assert_eq!(record.value(), "5");
        assert_eq!(record.status(), StatusCode::UNCERTAIN);
        assert_eq!(record.modification_time, 2_000);
        assert_eq!(record.actor.as_deref(), Some("operator"));
        assert_eq!(record.reason.as_deref(), Some("sensor recalibrated"));
    }

    #[test]
    fn test_modification_info_now_is_after_epoch() {
        let info = ModificationInfo::now().unwrap();
        assert!(info.time > 0);
        assert!(info.actor.is_none());
    }
}
