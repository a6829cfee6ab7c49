//! Per-stream writer exclusion
//!
//! Extending a chain reads the stream's tail and then writes a record linked
//! to it. Two writers interleaving those steps would both link to the same
//! tail and fork the chain, so the whole read-tail-then-write section runs
//! under a lock scoped to the stream key. Writers to different streams never
//! contend.
//!
//! Callers of [`crate::store::LedgerStore::insert_check`] rely on this: the
//! store is the only component allowed to advance a tail.

use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Lock table keyed by stream
#[derive(Debug, Default)]
pub struct StreamLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StreamLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, stream_key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(stream_key) {
            return lock.value().clone();
        }
        self.locks
            .entry(stream_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the stream's writer lock
    ///
    /// Waits at most `timeout`; on expiry fails with [`Error::Concurrency`]
    /// without running `f`, so the caller can retry with backoff.
    pub fn with_stream<T>(
        &self,
        stream_key: &str,
        timeout: Duration,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let lock = self.lock_for(stream_key);
        let _guard = lock.try_lock_for(timeout).ok_or_else(|| {
            Error::Concurrency(format!(
                "timed out after {:?} waiting for writer lock on stream {}",
                timeout, stream_key
            ))
        })?;

        f()
    }

    /// Number of streams that have had a writer
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no stream has had a writer yet
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
