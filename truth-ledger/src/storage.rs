//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `checks` - Append-only check log (key: sequence_id)
//! - `check_hashes` - Hash uniqueness index (key: hash, value: sequence_id)
//! - `stream_seq` - Per-stream insertion order (key: stream_key || 0 || sequence_id)
//! - `stream_time` - Per-stream time index (key: stream_key || 0 || micros || sequence_id)
//! - `discrepancies` - Detected discrepancies (key: sequence_id)
//! - `sources` - Verification sources (key: stream_key || 0 || source_url)
//! - `metadata` - Process-wide key/value state (key: name)
//!
//! This layer knows nothing about chains or locking; it persists what the
//! store hands it and answers range queries over consistent snapshots.

use crate::{
    error::{Error, Result},
    types::{
        metadata_keys, parse_timestamp, Check, MetadataEntry, Order, StoredDiscrepancy,
        StoredSource, SCHEMA_VERSION,
    },
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Column family names
const CF_CHECKS: &str = "checks";
const CF_CHECK_HASHES: &str = "check_hashes";
const CF_STREAM_SEQ: &str = "stream_seq";
const CF_STREAM_TIME: &str = "stream_time";
const CF_DISCREPANCIES: &str = "discrepancies";
const CF_SOURCES: &str = "sources";
const CF_METADATA: &str = "metadata";

const ALL_CFS: [&str; 7] = [
    CF_CHECKS,
    CF_CHECK_HASHES,
    CF_STREAM_SEQ,
    CF_STREAM_TIME,
    CF_DISCREPANCIES,
    CF_SOURCES,
    CF_METADATA,
];

/// Separates the stream key from the rest of an index key
const KEY_SEPARATOR: u8 = 0x00;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    path: PathBuf,
    sync_writes: bool,
    next_check_id: AtomicU64,
    next_discrepancy_id: AtomicU64,
    next_source_id: AtomicU64,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("next_check_id", &self.next_check_id)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_CHECKS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_CHECK_HASHES, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_STREAM_SEQ, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_STREAM_TIME, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_DISCREPANCIES, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_SOURCES, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let mut storage = Self {
            db: Arc::new(db),
            path: path.clone(),
            sync_writes: config.rocksdb.sync_writes,
            next_check_id: AtomicU64::new(1),
            next_discrepancy_id: AtomicU64::new(1),
            next_source_id: AtomicU64::new(1),
        };

        storage.next_check_id = AtomicU64::new(storage.last_sequence(CF_CHECKS)? + 1);
        storage.next_discrepancy_id =
            AtomicU64::new(storage.last_sequence(CF_DISCREPANCIES)? + 1);
        storage.next_source_id = AtomicU64::new(storage.max_source_id()? + 1);

        storage.bootstrap_metadata()?;

        tracing::info!(
            path = ?path,
            column_families = ALL_CFS.len(),
            next_check_id = storage.next_check_id.load(Ordering::SeqCst),
            "Opened RocksDB"
        );

        Ok(storage)
    }

    // Column family options

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        // Indices benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helper: get column family handle

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    /// Highest sequence key in a sequence-keyed column family, or 0
    fn last_sequence(&self, cf_name: &str) -> Result<u64> {
        let cf = self.cf(cf_name)?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                decode_u64(&key)
            }
            None => Ok(0),
        }
    }

    fn max_source_id(&self) -> Result<u64> {
        Ok(self
            .all_sources()?
            .iter()
            .map(|s| s.sequence_id)
            .max()
            .unwrap_or(0))
    }

    // Schema bootstrap

    fn bootstrap_metadata(&self) -> Result<()> {
        let now = Utc::now();
        let defaults = [
            (metadata_keys::GENESIS_TIMESTAMP, crate::types::format_timestamp(&now)),
            (metadata_keys::LAST_BACKUP, "never".to_string()),
            (metadata_keys::TOTAL_CHECKS, "0".to_string()),
            (metadata_keys::CHAIN_INTEGRITY, "valid".to_string()),
            (metadata_keys::VERSION, SCHEMA_VERSION.to_string()),
        ];

        let cf = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        let mut initialized = 0usize;
        for (key, value) in defaults {
            if self.db.get_cf(&cf, key.as_bytes())?.is_none() {
                let entry = MetadataEntry {
                    value,
                    updated_at: now,
                };
                batch.put_cf(&cf, key.as_bytes(), bincode::serialize(&entry)?);
                initialized += 1;
            }
        }

        if initialized > 0 {
            self.write(batch)?;
            tracing::info!(keys = initialized, "Initialized ledger metadata");
        }
        Ok(())
    }

    // Check operations

    /// Reserve the next check sequence id
    pub fn allocate_check_id(&self) -> u64 {
        self.next_check_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Hash and sequence id of the most recently inserted check in a stream
    pub fn stream_tail(&self, stream_key: &str) -> Result<Option<(u64, String)>> {
        let cf_seq = self.cf(CF_STREAM_SEQ)?;
        let prefix = stream_prefix(stream_key);
        let upper = stream_upper_bound(stream_key);

        let mut iter = self
            .db
            .iterator_cf(&cf_seq, IteratorMode::From(&upper, Direction::Reverse));

        let sequence_id = match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if !key.starts_with(&prefix) {
                    return Ok(None);
                }
                decode_u64(&key[prefix.len()..])?
            }
            None => return Ok(None),
        };

        let check = self.get_check(sequence_id)?.ok_or_else(|| {
            Error::Storage(format!(
                "stream index for {} points at missing check {}",
                stream_key, sequence_id
            ))
        })?;
        Ok(Some((sequence_id, check.hash)))
    }

    /// Whether a hash is already stored
    pub fn hash_exists(&self, hash: &str) -> Result<bool> {
        let cf = self.cf(CF_CHECK_HASHES)?;
        Ok(self.db.get_cf(&cf, hash.as_bytes())?.is_some())
    }

    /// Append a linked check with all of its indices (atomic)
    pub fn append_check_atomic(&self, check: &Check) -> Result<()> {
        let timestamp = parse_timestamp(&check.timestamp)?;
        let mut batch = WriteBatch::default();

        // 1. Check
        let cf_checks = self.cf(CF_CHECKS)?;
        batch.put_cf(
            &cf_checks,
            check.sequence_id.to_be_bytes(),
            bincode::serialize(check)?,
        );

        // 2. Hash uniqueness index
        let cf_hashes = self.cf(CF_CHECK_HASHES)?;
        batch.put_cf(
            &cf_hashes,
            check.hash.as_bytes(),
            check.sequence_id.to_be_bytes(),
        );

        // 3. Stream insertion order
        let cf_seq = self.cf(CF_STREAM_SEQ)?;
        batch.put_cf(
            &cf_seq,
            stream_seq_key(&check.stream_key, check.sequence_id),
            b"",
        );

        // 4. Stream time index
        let cf_time = self.cf(CF_STREAM_TIME)?;
        batch.put_cf(
            &cf_time,
            stream_time_key(&check.stream_key, &timestamp, check.sequence_id),
            b"",
        );

        // Atomic commit
        self.write(batch)?;

        tracing::debug!(
            sequence_id = check.sequence_id,
            stream_key = %check.stream_key,
            hash = %check.hash,
            "Check appended"
        );

        Ok(())
    }

    /// Get check by sequence id
    pub fn get_check(&self, sequence_id: u64) -> Result<Option<Check>> {
        let cf = self.cf(CF_CHECKS)?;
        match self.db.get_cf(&cf, sequence_id.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get check by hash
    pub fn get_check_by_hash(&self, hash: &str) -> Result<Option<Check>> {
        let cf = self.cf(CF_CHECK_HASHES)?;
        match self.db.get_cf(&cf, hash.as_bytes())? {
            Some(value) => self.get_check(decode_u64(&value)?),
            None => Ok(None),
        }
    }

    /// Checks of one stream in insertion order, read from one snapshot
    ///
    /// `limit` applies after ordering, so `Descending` with a limit yields the
    /// most recent records.
    pub fn stream_checks(
        &self,
        stream_key: &str,
        limit: Option<usize>,
        order: Order,
    ) -> Result<Vec<Check>> {
        let cf_seq = self.cf(CF_STREAM_SEQ)?;
        let cf_checks = self.cf(CF_CHECKS)?;
        let snapshot = self.db.snapshot();

        let prefix = stream_prefix(stream_key);
        let upper = stream_upper_bound(stream_key);
        let mode = match order {
            Order::Ascending => IteratorMode::From(&prefix, Direction::Forward),
            Order::Descending => IteratorMode::From(&upper, Direction::Reverse),
        };

        let mut checks = Vec::new();
        for item in snapshot.iterator_cf(&cf_seq, mode) {
            if limit.is_some_and(|l| checks.len() >= l) {
                break;
            }
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let sequence_id = decode_u64(&key[prefix.len()..])?;
            let value = snapshot
                .get_cf(&cf_checks, sequence_id.to_be_bytes())?
                .ok_or_else(|| {
                    Error::Storage(format!(
                        "stream index for {} points at missing check {}",
                        stream_key, sequence_id
                    ))
                })?;
            checks.push(bincode::deserialize(&value)?);
        }

        Ok(checks)
    }

    /// Checks of one stream with `start <= timestamp <= end`
    pub fn stream_checks_between(
        &self,
        stream_key: &str,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> Result<Vec<Check>> {
        let cf_time = self.cf(CF_STREAM_TIME)?;
        let cf_checks = self.cf(CF_CHECKS)?;
        let snapshot = self.db.snapshot();

        let prefix = stream_prefix(stream_key);
        let from = stream_time_key(stream_key, start, 0);
        let end_micros = encode_micros(end);

        let mut checks = Vec::new();
        for item in snapshot.iterator_cf(&cf_time, IteratorMode::From(&from, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) || key.len() < prefix.len() + 16 {
                break;
            }
            let micros = &key[prefix.len()..prefix.len() + 8];
            if micros > &end_micros[..] {
                break;
            }
            let sequence_id = decode_u64(&key[prefix.len() + 8..])?;
            if let Some(value) = snapshot.get_cf(&cf_checks, sequence_id.to_be_bytes())? {
                checks.push(bincode::deserialize(&value)?);
            }
        }

        Ok(checks)
    }

    /// Count stored checks by scanning the log
    pub fn count_checks(&self) -> Result<u64> {
        self.count_keys(CF_CHECKS)
    }

    /// Distinct stream keys with at least one check, sorted
    pub fn list_streams(&self) -> Result<Vec<String>> {
        let cf_seq = self.cf(CF_STREAM_SEQ)?;
        let mut iter = self.db.raw_iterator_cf(&cf_seq);
        let mut streams = Vec::new();

        iter.seek_to_first();
        while let Some(key) = iter.key() {
            let end = key
                .iter()
                .position(|b| *b == KEY_SEPARATOR)
                .ok_or_else(|| Error::Storage("malformed stream index key".to_string()))?;
            let stream = String::from_utf8(key[..end].to_vec())
                .map_err(|e| Error::Storage(format!("non-UTF-8 stream key: {}", e)))?;
            let next = stream_upper_bound(&stream);
            streams.push(stream);
            iter.seek(&next);
        }
        iter.status()?;

        Ok(streams)
    }

    // Discrepancy operations

    /// Persist a discrepancy, assigning its sequence id
    pub fn append_discrepancy(&self, record: crate::types::Discrepancy) -> Result<StoredDiscrepancy> {
        let stored = StoredDiscrepancy {
            sequence_id: self.next_discrepancy_id.fetch_add(1, Ordering::SeqCst),
            created_at: Utc::now(),
            record,
        };

        let cf = self.cf(CF_DISCREPANCIES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf,
            stored.sequence_id.to_be_bytes(),
            bincode::serialize(&stored)?,
        );
        self.write(batch)?;

        Ok(stored)
    }

    /// All stored discrepancies in insertion order
    pub fn all_discrepancies(&self) -> Result<Vec<StoredDiscrepancy>> {
        let cf = self.cf(CF_DISCREPANCIES)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Count stored discrepancies
    pub fn count_discrepancies(&self) -> Result<u64> {
        self.count_keys(CF_DISCREPANCIES)
    }

    // Source operations

    /// Reserve the next source sequence id
    pub fn allocate_source_id(&self) -> u64 {
        self.next_source_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Get source by (stream_key, source_url)
    pub fn get_source(&self, stream_key: &str, source_url: &str) -> Result<Option<StoredSource>> {
        let cf = self.cf(CF_SOURCES)?;
        match self.db.get_cf(&cf, source_key(stream_key, source_url))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Put source (insert or overwrite)
    pub fn put_source(&self, stored: &StoredSource) -> Result<()> {
        let cf = self.cf(CF_SOURCES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf,
            source_key(&stored.source.stream_key, &stored.source.source_url),
            bincode::serialize(stored)?,
        );
        self.write(batch)
    }

    /// Sources registered for a stream
    pub fn stream_sources(&self, stream_key: &str) -> Result<Vec<StoredSource>> {
        let cf = self.cf(CF_SOURCES)?;
        let prefix = stream_prefix(stream_key);
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Every registered source
    pub fn all_sources(&self) -> Result<Vec<StoredSource>> {
        let cf = self.cf(CF_SOURCES)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    // Metadata operations

    /// Get metadata entry
    pub fn get_metadata(&self, key: &str) -> Result<Option<MetadataEntry>> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Set metadata entry (insert or replace)
    pub fn put_metadata(&self, key: &str, value: &str) -> Result<()> {
        let entry = MetadataEntry {
            value: value.to_string(),
            updated_at: Utc::now(),
        };
        let cf = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, key.as_bytes(), bincode::serialize(&entry)?);
        self.write(batch)
    }

    // Statistics

    fn count_keys(&self, cf_name: &str) -> Result<u64> {
        let cf = self.cf(cf_name)?;
        let mut iter = self.db.raw_iterator_cf(&cf);
        let mut count = 0u64;
        iter.seek_to_first();
        while iter.valid() {
            count += 1;
            iter.next();
        }
        iter.status()?;
        Ok(count)
    }

    /// Bytes used by the data directory
    pub fn size_on_disk(&self) -> Result<u64> {
        dir_size(&self.path)
    }

    /// Data directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        for name in ALL_CFS {
            let cf = self.cf(name)?;
            self.db.flush_cf(&cf)?;
        }
        Ok(())
    }

    /// Overwrite a stored check in place, bypassing the append path
    ///
    /// Exists only so tests can simulate tampering with the data files.
    #[cfg(test)]
    pub(crate) fn overwrite_check_for_test(&self, check: &Check) -> Result<()> {
        let cf = self.cf(CF_CHECKS)?;
        self.db
            .put_cf(&cf, check.sequence_id.to_be_bytes(), bincode::serialize(check)?)?;
        Ok(())
    }

    /// Index a hash as stored without writing a check
    #[cfg(test)]
    pub(crate) fn index_hash_for_test(&self, hash: &str, sequence_id: u64) -> Result<()> {
        let cf = self.cf(CF_CHECK_HASHES)?;
        self.db
            .put_cf(&cf, hash.as_bytes(), sequence_id.to_be_bytes())?;
        Ok(())
    }

    /// Drop the metadata column family so metadata writes fail
    #[cfg(test)]
    pub(crate) fn drop_metadata_for_test(&self) -> Result<()> {
        self.db.drop_cf(CF_METADATA)?;
        Ok(())
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        self.flush()?;
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

// Key helpers

fn stream_prefix(stream_key: &str) -> Vec<u8> {
    let mut key = stream_key.as_bytes().to_vec();
    key.push(KEY_SEPARATOR);
    key
}

/// Smallest key sorting after every key of the stream
fn stream_upper_bound(stream_key: &str) -> Vec<u8> {
    let mut key = stream_key.as_bytes().to_vec();
    key.push(KEY_SEPARATOR + 1);
    key
}

fn stream_seq_key(stream_key: &str, sequence_id: u64) -> Vec<u8> {
    let mut key = stream_prefix(stream_key);
    key.extend_from_slice(&sequence_id.to_be_bytes());
    key
}

/// Micros since epoch with the sign bit flipped so byte order matches time order
fn encode_micros(ts: &DateTime<Utc>) -> [u8; 8] {
    ((ts.timestamp_micros() as u64) ^ (1u64 << 63)).to_be_bytes()
}

fn stream_time_key(stream_key: &str, ts: &DateTime<Utc>, sequence_id: u64) -> Vec<u8> {
    let mut key = stream_prefix(stream_key);
    key.extend_from_slice(&encode_micros(ts));
    key.extend_from_slice(&sequence_id.to_be_bytes());
    key
}

fn source_key(stream_key: &str, source_url: &str) -> Vec<u8> {
    let mut key = stream_prefix(stream_key);
    key.extend_from_slice(source_url.as_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Storage(format!("expected 8-byte key, got {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}
