//! Ledger store
//!
//! The synchronous public API over [`Storage`]. The store is the only
//! component that advances a stream's tail: it validates, takes the stream's
//! writer lock, links the record to the tail through the chain engine and
//! commits record and indices in one batch.
//!
//! `LedgerStore` is `Send + Sync`; share it behind an `Arc` across threads,
//! or use [`crate::Ledger`] from async code.

use crate::{
    aggregator::{self, UptimeWindow},
    chain::{compute_hash, verify_sequence, ChainReport},
    locks::StreamLocks,
    metrics::Metrics,
    storage::Storage,
    types::{
        metadata_keys, parse_timestamp, validate_reliability, Check, CheckPayload, Discrepancy,
        LedgerStats, Order, Severity, Source, StoredDiscrepancy, StoredSource, UptimeAggregate,
    },
    Config, Error, Result,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::time::Instant;

/// Durable, hash-chained check ledger
#[derive(Debug)]
pub struct LedgerStore {
    storage: Storage,
    locks: StreamLocks,
    /// Serializes metadata writes that derive from store-wide state
    metadata_lock: Mutex<()>,
    /// Serializes source insert-if-absent and updates
    sources_lock: Mutex<()>,
    metrics: Metrics,
    config: Config,
}

impl LedgerStore {
    /// Open or create a store
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = Storage::open(&config)?;
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;

        let store = Self {
            storage,
            locks: StreamLocks::new(),
            metadata_lock: Mutex::new(()),
            sources_lock: Mutex::new(()),
            metrics,
            config,
        };
        let total_checks = store.publish_total_checks()?;

        tracing::info!(
            service = %store.config.service_name,
            version = %store.config.service_version,
            total_checks,
            "Ledger store opened"
        );

        Ok(store)
    }

    /// Configuration the store was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Checks

    /// Append a check to its stream's chain and return its hash
    ///
    /// Concurrent inserts to one stream serialize on the stream's writer
    /// lock; inserts to different streams do not contend. Fails with
    /// [`Error::Validation`] before any I/O, [`Error::Concurrency`] when the
    /// lock is not acquired within the configured timeout, and
    /// [`Error::DuplicateHash`] when the computed hash is already stored.
    /// Nothing is written on failure.
    pub fn insert_check(&self, mut payload: CheckPayload) -> Result<String> {
        let started = Instant::now();
        payload.validate()?;
        payload.raw_response = payload
            .raw_response
            .take()
            .and_then(|raw| truncate_utf8(raw, self.config.raw_response_max_bytes));

        let stream_key = payload.stream_key.clone();
        let check = self.locks.with_stream(&stream_key, self.config.lock_timeout(), || {
            self.link_and_commit(payload)
        })?;

        if let Err(e) = self.publish_total_checks() {
            // The check is durable; the count is rewritten by the next insert
            tracing::warn!(error = %e, "Failed to refresh total_checks");
        }

        self.metrics
            .record_check_insert(started.elapsed().as_secs_f64());
        tracing::debug!(
            stream_key = %check.stream_key,
            sequence_id = check.sequence_id,
            hash = %check.hash,
            status = %check.status,
            "Check inserted"
        );

        Ok(check.hash)
    }

    /// Read tail, link and commit. Caller holds the stream lock.
    fn link_and_commit(&self, payload: CheckPayload) -> Result<Check> {
        let previous_hash = self
            .storage
            .stream_tail(&payload.stream_key)?
            .map(|(_, hash)| hash)
            .unwrap_or_default();

        let hash = compute_hash(&payload, &previous_hash);
        if self.storage.hash_exists(&hash)? {
            return Err(Error::DuplicateHash {
                stream_key: payload.stream_key,
                hash,
            });
        }

        let check = Check {
            sequence_id: self.storage.allocate_check_id(),
            timestamp: payload.timestamp,
            stream_key: payload.stream_key,
            endpoint: payload.endpoint,
            status: payload.status,
            response_time_ms: payload.response_time_ms,
            status_code: payload.status_code,
            source: payload.source,
            raw_response: payload.raw_response,
            hash,
            previous_hash,
            created_at: Utc::now(),
        };

        self.storage.append_check_atomic(&check)?;
        Ok(check)
    }

    /// Recount stored checks and publish the count; the last writer always
    /// sees every committed check
    fn publish_total_checks(&self) -> Result<u64> {
        let _guard = self.metadata_lock.lock();
        let total = self.storage.count_checks()?;
        self.storage
            .put_metadata(metadata_keys::TOTAL_CHECKS, &total.to_string())?;
        Ok(total)
    }

    /// Hash of the stream's latest check, or empty when it has none
    pub fn get_chain_tail(&self, stream_key: &str) -> Result<String> {
        Ok(self
            .storage
            .stream_tail(stream_key)?
            .map(|(_, hash)| hash)
            .unwrap_or_default())
    }

    /// Checks of a stream by insertion sequence
    pub fn get_records(
        &self,
        stream_key: &str,
        limit: Option<usize>,
        order: Order,
    ) -> Result<Vec<Check>> {
        self.storage.stream_checks(stream_key, limit, order)
    }

    /// Look up a check by its hash
    pub fn get_check_by_hash(&self, hash: &str) -> Result<Option<Check>> {
        self.storage.get_check_by_hash(hash)
    }

    /// Streams with at least one check, sorted
    pub fn list_streams(&self) -> Result<Vec<String>> {
        self.storage.list_streams()
    }

    /// Stored checks across all streams
    pub fn total_checks(&self) -> Result<u64> {
        self.storage.count_checks()
    }

    // Verification

    /// Replay a stream's chain from one snapshot
    ///
    /// Breaks are reported, not raised; use [`ChainReport::into_result`] for
    /// `Result` flow. Any break flips `chain_integrity` to "broken"; a failed
    /// flag write is logged and the report still returned.
    pub fn verify_stream(&self, stream_key: &str) -> Result<ChainReport> {
        let records = self
            .storage
            .stream_checks(stream_key, None, Order::Ascending)?;
        let report = verify_sequence(stream_key, &records);

        self.metrics.record_verification(report.breaks.len());

        if report.is_valid() {
            tracing::info!(
                stream_key,
                records = report.records_checked,
                "Chain verified"
            );
        } else {
            for brk in &report.breaks {
                tracing::error!(
                    stream_key,
                    sequence_id = brk.sequence_id,
                    kind = %brk.kind,
                    expected = %brk.expected,
                    actual = %brk.actual,
                    "Chain break"
                );
            }
            self.flag_integrity("broken");
        }

        Ok(report)
    }

    /// Verify every stream; a clean pass resets `chain_integrity` to "valid"
    pub fn verify_all(&self) -> Result<Vec<ChainReport>> {
        let mut reports = Vec::new();
        for stream_key in self.list_streams()? {
            reports.push(self.verify_stream(&stream_key)?);
        }

        if reports.iter().all(ChainReport::is_valid) {
            self.flag_integrity("valid");
        }

        Ok(reports)
    }

    fn flag_integrity(&self, value: &str) {
        if let Err(e) = self.set_metadata(metadata_keys::CHAIN_INTEGRITY, value) {
            tracing::error!(error = %e, value, "Failed to record chain_integrity");
        }
    }

    // Aggregation

    /// Uptime of a stream over a window
    pub fn get_uptime(&self, stream_key: &str, window: UptimeWindow) -> Result<UptimeAggregate> {
        let (start, end) = window.bounds()?;
        let checks = self.storage.stream_checks_between(stream_key, &start, &end)?;
        Ok(aggregator::aggregate(stream_key, &checks))
    }

    // Discrepancies

    /// Persist a discrepancy and return its id
    pub fn insert_discrepancy(&self, record: Discrepancy) -> Result<u64> {
        record.validate()?;

        let stored = self.storage.append_discrepancy(record)?;
        self.metrics.record_discrepancy();

        tracing::warn!(
            stream_key = %stored.record.stream_key,
            severity = %stored.record.severity,
            variance_percent = stored.record.variance_percent,
            claimed = %stored.record.claimed_status,
            actual = %stored.record.actual_status,
            "Discrepancy recorded"
        );

        Ok(stored.sequence_id)
    }

    /// Stored discrepancies, newest first, optionally of one severity
    pub fn get_discrepancies(&self, severity: Option<Severity>) -> Result<Vec<StoredDiscrepancy>> {
        let mut records: Vec<StoredDiscrepancy> = self
            .storage
            .all_discrepancies()?
            .into_iter()
            .filter(|d| severity.map_or(true, |s| d.record.severity == s))
            .collect();

        records.sort_by_key(|d| {
            (
                Reverse(parse_timestamp(&d.record.timestamp).ok()),
                Reverse(d.sequence_id),
            )
        });
        Ok(records)
    }

    // Sources

    /// Register a source; returns false when (stream_key, source_url) exists
    pub fn upsert_source(&self, source: Source) -> Result<bool> {
        source.validate()?;

        let _guard = self.sources_lock.lock();
        if self
            .storage
            .get_source(&source.stream_key, &source.source_url)?
            .is_some()
        {
            return Ok(false);
        }

        let stored = StoredSource {
            sequence_id: self.storage.allocate_source_id(),
            created_at: Utc::now(),
            source,
        };
        self.storage.put_source(&stored)?;

        tracing::info!(
            stream_key = %stored.source.stream_key,
            source_url = %stored.source.source_url,
            source_type = %stored.source.source_type,
            "Source registered"
        );
        Ok(true)
    }

    /// Activate or deactivate a source; returns false when it does not exist
    pub fn set_source_active(&self, stream_key: &str, source_url: &str, active: bool) -> Result<bool> {
        self.update_source(stream_key, source_url, |source| source.active = active)
    }

    /// Change a source's reliability score; returns false when it does not exist
    pub fn set_source_reliability(
        &self,
        stream_key: &str,
        source_url: &str,
        reliability_score: f64,
    ) -> Result<bool> {
        validate_reliability(reliability_score)?;
        self.update_source(stream_key, source_url, |source| {
            source.reliability_score = reliability_score
        })
    }

    fn update_source(
        &self,
        stream_key: &str,
        source_url: &str,
        update: impl FnOnce(&mut Source),
    ) -> Result<bool> {
        let _guard = self.sources_lock.lock();
        let mut stored = match self.storage.get_source(stream_key, source_url)? {
            Some(stored) => stored,
            None => return Ok(false),
        };
        update(&mut stored.source);
        self.storage.put_source(&stored)?;
        Ok(true)
    }

    /// Sources of one stream, or of all streams
    pub fn get_sources(&self, stream_key: Option<&str>) -> Result<Vec<StoredSource>> {
        match stream_key {
            Some(stream_key) => self.storage.stream_sources(stream_key),
            None => self.storage.all_sources(),
        }
    }

    // Metadata

    /// Read a metadata value
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        Ok(self.storage.get_metadata(key)?.map(|entry| entry.value))
    }

    /// Insert or replace a metadata value
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(Error::Validation("metadata key must not be empty".to_string()));
        }
        let _guard = self.metadata_lock.lock();
        self.storage.put_metadata(key, value)
    }

    /// Store-wide counters
    pub fn get_stats(&self) -> Result<LedgerStats> {
        let database_size_bytes = self.storage.size_on_disk()?;
        self.metrics.update_storage_size(database_size_bytes);

        let active_sources = self
            .storage
            .all_sources()?
            .iter()
            .filter(|s| s.source.active)
            .count() as u64;

        Ok(LedgerStats {
            total_checks: self.storage.count_checks()?,
            total_discrepancies: self.storage.count_discrepancies()?,
            streams_monitored: self.list_streams()?.len() as u64,
            active_sources,
            database_size_bytes,
            database_size_mb: (database_size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round()
                / 100.0,
            genesis_timestamp: self.get_metadata(metadata_keys::GENESIS_TIMESTAMP)?,
            last_backup: self.get_metadata(metadata_keys::LAST_BACKUP)?,
        })
    }

    /// Flush and close
    pub fn close(self) -> Result<()> {
        tracing::info!(path = ?self.storage.path(), "Closing ledger store");
        self.storage.close()
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }
}

/// Cap `raw` at `max_bytes` on a char boundary; `None` when nothing remains
fn truncate_utf8(mut raw: String, max_bytes: usize) -> Option<String> {
    if raw.len() > max_bytes {
        let mut end = max_bytes;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        raw.truncate(end);
    }
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}
