//! Per-channel mutual exclusion.

use std::sync::{Mutex, MutexGuard};

/// Serializes compound operations on one channel.
///
/// The guard is held across the entry store mutation and the ledger append
/// of a single operation, so no other caller of the same channel can observe
/// one without the other. A poisoned guard is recovered: the protected state
/// lives in the stores, not behind the mutex.
#[derive(Debug, Default)]
pub struct ChannelGuard {
    inner: Mutex<()>,
}

impl ChannelGuard {
    /// Creates an unlocked guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the guard is free and returns the held scope.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}
