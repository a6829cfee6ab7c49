//! Async ledger handle
//!
//! Wraps a shared [`LedgerStore`] for tokio callers. Every call runs on the
//! blocking pool, so RocksDB I/O and lock waits never stall the runtime.
//! Dropping the returned future does not interrupt a started write: the
//! blocking task runs to completion and its batch commits or fails whole.
//!
//! # Example
//!
//! ```no_run
//! use truth_ledger::{CheckPayload, CheckStatus, Config, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> truth_ledger::Result<()> {
//!     let config = Config::default();
//!     let ledger = Ledger::open(config).await?;
//!
//!     let payload = CheckPayload::new(
//!         "2024-05-01T12:00:00Z",
//!         "github",
//!         "https://api.github.com",
//!         CheckStatus::Up,
//!     )
//!     .with_response_time(120)
//!     .with_status_code(200);
//!     let hash = ledger.insert_check(payload).await?;
//!     println!("appended {}", hash);
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    aggregator::{self, StatusClaim, UptimeWindow},
    chain::ChainReport,
    store::LedgerStore,
    types::{
        Check, CheckPayload, Discrepancy, LedgerStats, Order, Severity, Source,
        StoredDiscrepancy, StoredSource, UptimeAggregate,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Cloneable async handle to a ledger store
#[derive(Debug, Clone)]
pub struct Ledger {
    store: Arc<LedgerStore>,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        let store = tokio::task::spawn_blocking(move || LedgerStore::open(config))
            .await
            .map_err(join_error)??;

        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// Wrap an already opened store
    pub fn from_store(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    /// Underlying synchronous store
    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&LedgerStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(join_error)?
    }

    /// Append a check; see [`LedgerStore::insert_check`]
    pub async fn insert_check(&self, payload: CheckPayload) -> Result<String> {
        self.run(move |store| store.insert_check(payload)).await
    }

    /// Hash of the stream's latest check, or empty
    pub async fn get_chain_tail(&self, stream_key: impl Into<String>) -> Result<String> {
        let stream_key = stream_key.into();
        self.run(move |store| store.get_chain_tail(&stream_key)).await
    }

    /// Checks of a stream by insertion sequence
    pub async fn get_records(
        &self,
        stream_key: impl Into<String>,
        limit: Option<usize>,
        order: Order,
    ) -> Result<Vec<Check>> {
        let stream_key = stream_key.into();
        self.run(move |store| store.get_records(&stream_key, limit, order))
            .await
    }

    /// Streams with at least one check
    pub async fn list_streams(&self) -> Result<Vec<String>> {
        self.run(|store| store.list_streams()).await
    }

    /// Verify one stream's chain
    pub async fn verify_stream(&self, stream_key: impl Into<String>) -> Result<ChainReport> {
        let stream_key = stream_key.into();
        self.run(move |store| store.verify_stream(&stream_key)).await
    }

    /// Verify every stream
    pub async fn verify_all(&self) -> Result<Vec<ChainReport>> {
        self.run(|store| store.verify_all()).await
    }

    /// Uptime over a window
    pub async fn get_uptime(
        &self,
        stream_key: impl Into<String>,
        window: UptimeWindow,
    ) -> Result<UptimeAggregate> {
        let stream_key = stream_key.into();
        self.run(move |store| store.get_uptime(&stream_key, window))
            .await
    }

    /// Persist a discrepancy
    pub async fn insert_discrepancy(&self, record: Discrepancy) -> Result<u64> {
        self.run(move |store| store.insert_discrepancy(record)).await
    }

    /// Compare a claim with measured uptime and persist any discrepancy
    pub async fn record_discrepancy(
        &self,
        stream_key: impl Into<String>,
        claim: StatusClaim,
        window: UptimeWindow,
        now: DateTime<Utc>,
    ) -> Result<Option<(u64, Discrepancy)>> {
        let stream_key = stream_key.into();
        self.run(move |store| {
            aggregator::record_discrepancy(store, &stream_key, &claim, window, now)
        })
        .await
    }

    /// Stored discrepancies, newest first
    pub async fn get_discrepancies(
        &self,
        severity: Option<Severity>,
    ) -> Result<Vec<StoredDiscrepancy>> {
        self.run(move |store| store.get_discrepancies(severity))
            .await
    }

    /// Register a source if absent
    pub async fn upsert_source(&self, source: Source) -> Result<bool> {
        self.run(move |store| store.upsert_source(source)).await
    }

    /// Sources of one stream, or all
    pub async fn get_sources(&self, stream_key: Option<String>) -> Result<Vec<StoredSource>> {
        self.run(move |store| store.get_sources(stream_key.as_deref()))
            .await
    }

    /// Store-wide counters
    pub async fn get_stats(&self) -> Result<LedgerStats> {
        self.run(|store| store.get_stats()).await
    }

    /// Close the store if this is the last handle
    pub async fn shutdown(self) -> Result<()> {
        match Arc::try_unwrap(self.store) {
            Ok(store) => tokio::task::spawn_blocking(move || store.close())
                .await
                .map_err(join_error)?,
            Err(_) => {
                tracing::debug!("Other ledger handles remain, store stays open");
                Ok(())
            }
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Concurrency(format!("blocking ledger task failed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckStatus;
    use tempfile::TempDir;

    async fn create_test_ledger() -> (Ledger, TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        (Ledger::open(config).await.unwrap(), temp_dir)
    }

    fn payload(minute: u32) -> CheckPayload {
        CheckPayload::new(
            format!("2024-05-01T12:{:02}:00Z", minute),
            "openai",
            "https://api.openai.com/v1/models",
            CheckStatus::Up,
        )
        .with_status_code(200)
    }

    #[tokio::test]
    async fn test_ledger_open() {
        let (ledger, _temp) = create_test_ledger().await;
        assert!(ledger.list_streams().await.unwrap().is_empty());
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_verify() {
        let (ledger, _temp) = create_test_ledger().await;

        let h1 = ledger.insert_check(payload(0)).await.unwrap();
        let h2 = ledger.insert_check(payload(1)).await.unwrap();
        assert_eq!(ledger.get_chain_tail("openai").await.unwrap(), h2);

        let records = ledger
            .get_records("openai", None, Order::Descending)
            .await
            .unwrap();
        assert_eq!(records[0].previous_hash, h1);

        let report = ledger.verify_stream("openai").await.unwrap();
        assert!(report.is_valid());
        assert_eq!(report.records_checked, 2);

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_share_one_chain() {
        let (ledger, _temp) = create_test_ledger().await;

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.insert_check(payload(i)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let report = ledger.verify_stream("openai").await.unwrap();
        assert!(report.is_valid());
        assert_eq!(report.records_checked, 20);
    }

    #[tokio::test]
    async fn test_shutdown_with_live_clone_keeps_store_open() {
        let (ledger, _temp) = create_test_ledger().await;
        let other = ledger.clone();

        ledger.shutdown().await.unwrap();
        other.insert_check(payload(0)).await.unwrap();
        other.shutdown().await.unwrap();
    }
}
