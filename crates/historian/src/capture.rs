//! Automatic capture of external value changes into a channel.
//!
//! A [`ChannelBinding`] is the external variable a channel historizes. The
//! historian registers an [`AutoCapture`] with the binding once; from then on
//! every "value about to change" notification carrying a timestamp is
//! upserted through the channel, under the same guard as API mutations.

use crate::channel::{HistorizedChannel, Upserted};
use crate::error::Result;
use crate::types::{ChannelId, ModificationInfo, StatusCode, Timestamp, ValueRecord, ValueType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// A pending value change reported by a bound variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChange {
    /// Serialized new value.
    pub value: String,
    /// Quality of the new value.
    pub status: StatusCode,
    /// Source timestamp of the new value, if the variable stamped one.
    pub timestamp: Option<Timestamp>,
}

impl ValueChange {
    /// Creates a stamped change.
    pub fn new(timestamp: Timestamp, value: impl Into<String>, status: StatusCode) -> Self {
        Self {
            value: value.into(),
            status,
            timestamp: Some(timestamp),
        }
    }

    /// Creates a change without a timestamp. Such changes are not captured.
    pub fn unstamped(value: impl Into<String>, status: StatusCode) -> Self {
        Self {
            value: value.into(),
            status,
            timestamp: None,
        }
    }
}

/// Receiver of value change notifications.
///
/// Invoked synchronously by the binding on the thread that changes the value.
pub trait ChangeListener: Send + Sync {
    /// Called before the bound value changes.
    fn value_changing(&self, change: &ValueChange);
}

/// An external variable that a channel historizes.
pub trait ChannelBinding {
    /// Id of the channel the variable maps to.
    fn channel_id(&self) -> ChannelId;

    /// Declared type of the variable's values.
    fn value_type(&self) -> ValueType;

    /// Registers `listener` for the variable's change notifications.
    fn subscribe(&self, listener: Arc<dyn ChangeListener>);
}

/// Listener that upserts every stamped change into its channel.
#[derive(Debug)]
pub struct AutoCapture {
    channel: Arc<HistorizedChannel>,
    actor: Option<String>,
    enabled: AtomicBool,
}

impl AutoCapture {
    /// Creates an enabled capture hook for `channel`.
    pub fn new(channel: Arc<HistorizedChannel>) -> Self {
        Self {
            channel,
            actor: None,
            enabled: AtomicBool::new(true),
        }
    }

    /// Records `actor` on every captured mutation.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Returns the channel changes are captured into.
    pub fn channel(&self) -> &Arc<HistorizedChannel> {
        &self.channel
    }

    /// Turns capturing on or off. While off, notifications are ignored.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Returns true if notifications are being captured.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Upserts `change` into the channel.
    ///
    /// Returns `Ok(None)` if capturing is disabled or the change carries no
    /// timestamp.
    pub fn capture(&self, change: &ValueChange) -> Result<Option<Upserted>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let Some(timestamp) = change.timestamp else {
            debug!(
                "Ignoring unstamped change on channel {}",
                self.channel.id()
            );
            return Ok(None);
        };

        let mut info = ModificationInfo::now()?;
        info.actor = self.actor.clone();
        let record = ValueRecord::new(timestamp, change.value.clone(), change.status);
        self.channel.upsert_with(record, &info).map(Some)
    }
}

impl ChangeListener for AutoCapture {
    fn value_changing(&self, change: &ValueChange) {
        if let Err(err) = self.capture(change) {
            error!(
                "Failed to capture change on channel {} at {:?}: {:?}",
                self.channel.id(),
                change.timestamp,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::TimeRange;
    use crate::store::{MemoryEntryStore, MemoryLedger};
    use crate::types::ModificationKind;

    fn make_capture() -> AutoCapture {
        AutoCapture::new(Arc::new(HistorizedChannel::new(
            "P",
            ValueType::Double,
            Arc::new(MemoryEntryStore::new()),
            Arc::new(MemoryLedger::new()),
        )))
    }

    #[test]
    fn test_capture_upserts() {
        let capture = make_capture();

        let first = capture
            .capture(&ValueChange::new(100, "1.5", StatusCode::GOOD))
            .unwrap();
        let second = capture
            .capture(&ValueChange::new(100, "1.6", StatusCode::UNCERTAIN))
            .unwrap();

        assert_eq!(first, Some(Upserted::Inserted));
        assert_eq!(second, Some(Upserted::Replaced));
        assert_eq!(
            capture.channel().get(100).unwrap(),
            Some(ValueRecord::new(100, "1.6", StatusCode::UNCERTAIN))
        );
    }

    #[test]
    fn test_unstamped_change_is_ignored() {
        let capture = make_capture();

        let result = capture
            .capture(&ValueChange::unstamped("1.5", StatusCode::GOOD))
            .unwrap();

        assert_eq!(result, None);
        assert!(capture.channel().is_empty().unwrap());
    }

    #[test]
    fn test_disabled_capture_is_ignored() {
        let capture = make_capture();
        capture.set_enabled(false);
        assert!(!capture.is_enabled());

        capture.value_changing(&ValueChange::new(1, "x", StatusCode::GOOD));
        assert!(capture.channel().is_empty().unwrap());

        capture.set_enabled(true);
        capture.value_changing(&ValueChange::new(1, "x", StatusCode::GOOD));
        assert!(capture.channel().contains(1).unwrap());
    }

    #[test]
    fn test_actor_is_recorded() {
        let capture = make_capture().with_actor("plc-7");
        capture.value_changing(&ValueChange::new(5, "2.0", StatusCode::GOOD));

        let records: Vec<_> = capture
            .channel()
            .read_ledger(TimeRange::unbounded())
            .unwrap()
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ModificationKind::Inserted);
        assert_eq!(records[0].actor.as_deref(), Some("plc-7"));
    }
}
