//! Core types for the ledger
//!
//! All stored types are designed for:
//! - Deterministic serialization (bincode at rest, canonical text for hashing)
//! - Immutability once persisted (no setters on stored records)
//! - One canonical timestamp representation (ISO-8601 UTC text)

use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Provenance tag used when a caller does not set one
pub const DEFAULT_SOURCE: &str = "direct_check";

/// Well-known metadata keys
pub mod metadata_keys {
    /// When the store was first created
    pub const GENESIS_TIMESTAMP: &str = "genesis_timestamp";
    /// Last backup marker, maintained by backup tooling
    pub const LAST_BACKUP: &str = "last_backup";
    /// Count of stored checks, recomputed after each insertion
    pub const TOTAL_CHECKS: &str = "total_checks";
    /// "valid" or "broken", updated by verification
    pub const CHAIN_INTEGRITY: &str = "chain_integrity";
    /// Schema version of the durable layout
    pub const VERSION: &str = "version";
}

/// Current durable schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Target answered with a success code
    Up,
    /// Target answered with a failure code or refused the connection
    Down,
    /// No answer within the probe timeout
    Timeout,
    /// Probe failed for another reason
    Error,
    /// Target answered but slowly or partially
    Degraded,
    /// Outcome could not be determined
    Unknown,
}

impl CheckStatus {
    /// Wire name, also used in canonical encoding
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "up",
            CheckStatus::Down => "down",
            CheckStatus::Timeout => "timeout",
            CheckStatus::Error => "error",
            CheckStatus::Degraded => "degraded",
            CheckStatus::Unknown => "unknown",
        }
    }

    /// Whether this outcome counts towards uptime
    pub fn is_success(&self) -> bool {
        matches!(self, CheckStatus::Up)
    }
}

impl FromStr for CheckStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(CheckStatus::Up),
            "down" => Ok(CheckStatus::Down),
            "timeout" => Ok(CheckStatus::Timeout),
            "error" => Ok(CheckStatus::Error),
            "degraded" => Ok(CheckStatus::Degraded),
            "unknown" => Ok(CheckStatus::Unknown),
            other => Err(Error::Validation(format!("unknown check status: {}", other))),
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single probe, as produced by a prober
///
/// Timeouts and connection failures are ordinary outcomes here, not errors;
/// the ledger only ever receives the resulting [`CheckPayload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Success code received
    Up {
        /// Round-trip latency
        response_time_ms: u64,
        /// HTTP status code
        status_code: i64,
    },
    /// Non-success code received
    Down {
        /// Round-trip latency
        response_time_ms: u64,
        /// HTTP status code
        status_code: i64,
    },
    /// No answer before the deadline
    Timeout {
        /// Deadline that elapsed
        after_ms: u64,
    },
    /// Connection could not be established
    Unreachable,
    /// Any other probe failure
    Error(String),
}

/// Check observation submitted by a prober, before the store links it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPayload {
    /// ISO-8601 UTC, caller-supplied
    pub timestamp: String,

    /// Logical chain this check belongs to (usually the target name)
    pub stream_key: String,

    /// Probed URL
    pub endpoint: String,

    /// Observed status
    pub status: CheckStatus,

    /// Latency, if measured
    pub response_time_ms: Option<u64>,

    /// Response code; 0 means no response
    pub status_code: Option<i64>,

    /// Provenance tag
    pub source: String,

    /// Raw response excerpt, never hashed
    #[serde(default)]
    pub raw_response: Option<String>,
}

impl CheckPayload {
    /// Create a payload with the default source and no optional fields
    pub fn new(
        timestamp: impl Into<String>,
        stream_key: impl Into<String>,
        endpoint: impl Into<String>,
        status: CheckStatus,
    ) -> Self {
        Self {
            timestamp: timestamp.into(),
            stream_key: stream_key.into(),
            endpoint: endpoint.into(),
            status,
            response_time_ms: None,
            status_code: None,
            source: DEFAULT_SOURCE.to_string(),
            raw_response: None,
        }
    }

    /// Build a payload from a probe outcome
    pub fn from_outcome(
        timestamp: impl Into<String>,
        stream_key: impl Into<String>,
        endpoint: impl Into<String>,
        outcome: ProbeOutcome,
    ) -> Self {
        let (status, response_time_ms, status_code, raw) = match outcome {
            ProbeOutcome::Up {
                response_time_ms,
                status_code,
            } => (CheckStatus::Up, response_time_ms, status_code, None),
            ProbeOutcome::Down {
                response_time_ms,
                status_code,
            } => (CheckStatus::Down, response_time_ms, status_code, None),
            ProbeOutcome::Timeout { after_ms } => {
                (CheckStatus::Timeout, after_ms, 0, Some("timeout".to_string()))
            }
            ProbeOutcome::Unreachable => {
                (CheckStatus::Down, 0, 0, Some("connection_error".to_string()))
            }
            ProbeOutcome::Error(detail) => (CheckStatus::Error, 0, 0, Some(detail)),
        };

        let mut payload = Self::new(timestamp, stream_key, endpoint, status)
            .with_response_time(response_time_ms)
            .with_status_code(status_code);
        payload.raw_response = raw;
        payload
    }

    /// Set measured latency
    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    /// Set response code
    pub fn with_status_code(mut self, code: i64) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Set provenance tag
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Attach a raw response excerpt
    pub fn with_raw_response(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = Some(raw.into());
        self
    }

    /// Reject malformed payloads before any I/O
    pub fn validate(&self) -> Result<()> {
        validate_stream_key(&self.stream_key)?;
        parse_timestamp(&self.timestamp)?;

        if self.endpoint.trim().is_empty() {
            return Err(Error::Validation("endpoint must not be empty".to_string()));
        }
        if self.source.trim().is_empty() {
            return Err(Error::Validation("source must not be empty".to_string()));
        }

        Ok(())
    }
}

/// A persisted, chain-linked check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    /// Monotonic id assigned by the store
    pub sequence_id: u64,

    /// ISO-8601 UTC, caller-supplied
    pub timestamp: String,

    /// Logical chain
    pub stream_key: String,

    /// Probed URL
    pub endpoint: String,

    /// Observed status
    pub status: CheckStatus,

    /// Latency, if measured
    pub response_time_ms: Option<u64>,

    /// Response code; 0 means no response
    pub status_code: Option<i64>,

    /// Provenance tag
    pub source: String,

    /// Raw response excerpt (truncated by policy)
    pub raw_response: Option<String>,

    /// SHA-256 over canonical fields, lowercase hex
    pub hash: String,

    /// Hash of the prior check in the stream, empty for the first
    pub previous_hash: String,

    /// Store wall clock at insertion
    pub created_at: DateTime<Utc>,
}

impl Check {
    /// Whether this is the first record of its stream
    pub fn is_genesis(&self) -> bool {
        self.previous_hash.is_empty()
    }
}

/// Discrepancy severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Variance below 2%
    Low,
    /// Variance of at least 2%
    Medium,
    /// Variance of at least 5%
    High,
    /// Variance of at least 10%
    Critical,
}

impl Severity {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(Error::Validation(format!("unknown severity: {}", other))),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mismatch between a claimed status and measured reality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// When the mismatch was detected
    pub timestamp: String,

    /// Stream the claim concerns
    pub stream_key: String,

    /// What the vendor claimed
    pub claimed_status: String,

    /// What was measured
    pub actual_status: String,

    /// Claimed uptime percentage, if the vendor published one
    pub claimed_uptime: Option<f64>,

    /// Measured uptime percentage
    pub measured_uptime: f64,

    /// Absolute difference used for severity
    pub variance_percent: f64,

    /// Check hashes substantiating the measurement, newest first
    pub proof_hashes: Vec<String>,

    /// Where the claim was read from
    pub evidence_url: String,

    /// Severity derived from variance
    pub severity: Severity,

    /// Number of checks behind the measurement
    pub checks_count: u64,
}

impl Discrepancy {
    /// Reject incomplete records before any I/O
    pub fn validate(&self) -> Result<()> {
        validate_stream_key(&self.stream_key)?;
        parse_timestamp(&self.timestamp)?;

        if self.claimed_status.trim().is_empty() {
            return Err(Error::Validation("claimed_status is required".to_string()));
        }
        if self.actual_status.trim().is_empty() {
            return Err(Error::Validation("actual_status is required".to_string()));
        }
        if !self.variance_percent.is_finite() || self.variance_percent < 0.0 {
            return Err(Error::Validation(format!(
                "variance_percent must be a non-negative number, got {}",
                self.variance_percent
            )));
        }
        validate_percentage("measured_uptime", self.measured_uptime)?;
        if let Some(claimed) = self.claimed_uptime {
            validate_percentage("claimed_uptime", claimed)?;
        }
        for hash in &self.proof_hashes {
            if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(Error::Validation(format!("malformed proof hash: {}", hash)));
            }
        }

        Ok(())
    }

    /// Pretty JSON for reports and evidence bundles
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A persisted discrepancy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDiscrepancy {
    /// Id assigned by the store
    pub sequence_id: u64,

    /// Store wall clock at insertion
    pub created_at: DateTime<Utc>,

    /// The record as submitted
    pub record: Discrepancy,
}

/// Verification endpoint registered for a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Stream the source verifies
    pub stream_key: String,

    /// e.g. "official_status", "third_party"
    pub source_type: String,

    /// Unique per stream
    pub source_url: String,

    /// e.g. "scrape"
    pub verification_method: String,

    /// Trust weight in [0, 1]
    pub reliability_score: f64,

    /// Inactive sources are kept but not consulted
    pub active: bool,
}

impl Source {
    /// Create an active source with full reliability
    pub fn new(
        stream_key: impl Into<String>,
        source_type: impl Into<String>,
        source_url: impl Into<String>,
        verification_method: impl Into<String>,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            source_type: source_type.into(),
            source_url: source_url.into(),
            verification_method: verification_method.into(),
            reliability_score: 1.0,
            active: true,
        }
    }

    /// Reject incomplete registrations
    pub fn validate(&self) -> Result<()> {
        validate_stream_key(&self.stream_key)?;
        if self.source_url.trim().is_empty() {
            return Err(Error::Validation("source_url is required".to_string()));
        }
        validate_reliability(self.reliability_score)
    }
}

/// A persisted source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSource {
    /// Id assigned by the store
    pub sequence_id: u64,

    /// Store wall clock at registration
    pub created_at: DateTime<Utc>,

    /// Current source state
    pub source: Source,
}

/// Metadata value with its last update time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Stored value
    pub value: String,

    /// Last write
    pub updated_at: DateTime<Utc>,
}

/// Read order for range queries (by insertion sequence)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Oldest first
    #[default]
    Ascending,
    /// Newest first
    Descending,
}

/// Uptime statistics for one stream over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeAggregate {
    /// Stream the aggregate describes
    pub stream_key: String,

    /// successful / total * 100, rounded to 4 dp
    pub uptime_percent: f64,

    /// Checks inside the window
    pub total_checks: u64,

    /// Checks with status `up`
    pub successful_checks: u64,

    /// Mean latency over checks that measured one, rounded to 2 dp
    pub avg_response_time_ms: f64,

    /// Earliest timestamp inside the window
    pub first_check: Option<String>,

    /// Latest timestamp inside the window
    pub last_check: Option<String>,
}

impl UptimeAggregate {
    /// Zero aggregate for a window without checks
    pub fn empty(stream_key: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            uptime_percent: 0.0,
            total_checks: 0,
            successful_checks: 0,
            avg_response_time_ms: 0.0,
            first_check: None,
            last_check: None,
        }
    }
}

/// Store-wide counters and sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Stored checks
    pub total_checks: u64,

    /// Stored discrepancies
    pub total_discrepancies: u64,

    /// Distinct streams with at least one check
    pub streams_monitored: u64,

    /// Sources with `active == true`
    pub active_sources: u64,

    /// On-disk size of the data directory
    pub database_size_bytes: u64,

    /// Same, in MB rounded to 2 dp
    pub database_size_mb: f64,

    /// From metadata
    pub genesis_timestamp: Option<String>,

    /// From metadata
    pub last_backup: Option<String>,
}

/// Parse the canonical timestamp representation
///
/// Accepts RFC 3339 with an offset, or naive ISO-8601 which is taken as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(Error::Validation(format!("invalid ISO-8601 timestamp: {:?}", s)))
}

/// Render a timestamp in the canonical representation
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn validate_stream_key(stream_key: &str) -> Result<()> {
    if stream_key.trim().is_empty() {
        return Err(Error::Validation("stream_key must not be empty".to_string()));
    }
    // NUL separates index key components
    if stream_key.contains('\0') {
        return Err(Error::Validation("stream_key must not contain NUL".to_string()));
    }
    Ok(())
}

fn validate_percentage(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(Error::Validation(format!(
            "{} must be within 0..=100, got {}",
            field, value
        )));
    }
    Ok(())
}

pub(crate) fn validate_reliability(score: f64) -> Result<()> {
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(Error::Validation(format!(
            "reliability_score must be within 0..=1, got {}",
            score
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_discrepancy() -> Discrepancy {
        Discrepancy {
            timestamp: "2024-05-01T12:00:00Z".to_string(),
            stream_key: "stripe".to_string(),
            claimed_status: "99.99% uptime".to_string(),
            actual_status: "94.00% uptime".to_string(),
            claimed_uptime: Some(99.99),
            measured_uptime: 94.0,
            variance_percent: 5.99,
            proof_hashes: vec!["a".repeat(64)],
            evidence_url: "https://status.stripe.com".to_string(),
            severity: Severity::High,
            checks_count: 100,
        }
    }

    #[test]
    fn test_check_status_round_trip_names() {
        for status in [
            CheckStatus::Up,
            CheckStatus::Down,
            CheckStatus::Timeout,
            CheckStatus::Error,
            CheckStatus::Degraded,
            CheckStatus::Unknown,
        ] {
            assert_eq!(status.as_str().parse::<CheckStatus>().unwrap(), status);
        }
        assert!("UP".parse::<CheckStatus>().is_err());
    }

    #[test]
    fn test_only_up_counts_as_success() {
        assert!(CheckStatus::Up.is_success());
        assert!(!CheckStatus::Degraded.is_success());
        assert!(!CheckStatus::Timeout.is_success());
    }

    #[test]
    fn test_payload_from_timeout_outcome() {
        let payload = CheckPayload::from_outcome(
            "2024-05-01T12:00:00Z",
            "openai",
            "https://api.openai.com/v1/models",
            ProbeOutcome::Timeout { after_ms: 10_000 },
        );
        assert_eq!(payload.status, CheckStatus::Timeout);
        assert_eq!(payload.status_code, Some(0));
        assert_eq!(payload.response_time_ms, Some(10_000));
        assert_eq!(payload.raw_response.as_deref(), Some("timeout"));
        assert_eq!(payload.source, DEFAULT_SOURCE);
    }

    #[test]
    fn test_payload_from_unreachable_is_down() {
        let payload = CheckPayload::from_outcome(
            "2024-05-01T12:00:00Z",
            "aws",
            "https://status.aws.amazon.com",
            ProbeOutcome::Unreachable,
        );
        assert_eq!(payload.status, CheckStatus::Down);
        assert_eq!(payload.status_code, Some(0));
    }

    #[test]
    fn test_payload_validation() {
        let ok = CheckPayload::new("2024-05-01T12:00:00", "github", "https://api.github.com", CheckStatus::Up);
        assert!(ok.validate().is_ok());

        let mut bad = ok.clone();
        bad.stream_key = String::new();
        assert!(matches!(bad.validate(), Err(Error::Validation(_))));

        let mut bad = ok.clone();
        bad.timestamp = "yesterday".to_string();
        assert!(matches!(bad.validate(), Err(Error::Validation(_))));

        let mut bad = ok;
        bad.stream_key = "git\0hub".to_string();
        assert!(matches!(bad.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_parse_timestamp_variants_agree() {
        let a = parse_timestamp("2024-05-01T12:00:00Z").unwrap();
        let b = parse_timestamp("2024-05-01T12:00:00").unwrap();
        let c = parse_timestamp("2024-05-01T14:00:00+02:00").unwrap();
        let d = parse_timestamp("2024-05-01 12:00:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, d);
        assert_eq!(format_timestamp(&a), "2024-05-01T12:00:00.000000Z");
    }

    #[test]
    fn test_discrepancy_validation() {
        assert!(sample_discrepancy().validate().is_ok());

        let mut missing = sample_discrepancy();
        missing.claimed_status = String::new();
        assert!(matches!(missing.validate(), Err(Error::Validation(_))));

        let mut negative = sample_discrepancy();
        negative.variance_percent = -1.0;
        assert!(matches!(negative.validate(), Err(Error::Validation(_))));

        let mut bad_proof = sample_discrepancy();
        bad_proof.proof_hashes = vec!["not-a-hash".to_string()];
        assert!(matches!(bad_proof.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_discrepancy_json_uses_wire_names() {
        let json = sample_discrepancy().to_json().unwrap();
        assert!(json.contains("\"severity\": \"high\""));
        assert!(json.contains("\"stream_key\": \"stripe\""));
    }

    #[test]
    fn test_source_defaults() {
        let source = Source::new("x", "official_status", "y", "scrape");
        assert!(source.active);
        assert_eq!(source.reliability_score, 1.0);
        assert!(source.validate().is_ok());
    }
}
