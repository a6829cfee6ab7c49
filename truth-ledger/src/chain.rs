//! Hash-chain computation and verification
//!
//! Every check's hash is SHA-256 over its canonical encoding, which embeds
//! the hash of the previous check in the same stream. Editing, deleting or
//! reordering any stored check therefore changes what the chain replays to.
//!
//! Verification replays a stream from an empty `previous_hash` and reports
//! every break instead of stopping at the first one.

use crate::canonical::{canonical_bytes, ChainRecord};
use crate::types::Check;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hash a record linked to `previous_hash`
///
/// Pure: no I/O, no clock. Returns 64 lowercase hex characters.
pub fn compute_hash<R: ChainRecord + ?Sized>(record: &R, previous_hash: &str) -> String {
    hex::encode(hash_bytes(&canonical_bytes(record, previous_hash)))
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Which link of a record failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakKind {
    /// Stored `previous_hash` differs from the prior record's stored hash
    PreviousHashMismatch,
    /// Stored hash differs from the hash the chain replays to
    HashMismatch,
}

impl fmt::Display for BreakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakKind::PreviousHashMismatch => f.write_str("previous_hash mismatch"),
            BreakKind::HashMismatch => f.write_str("hash mismatch"),
        }
    }
}

/// One detected inconsistency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    /// Offending record
    pub sequence_id: u64,
    /// Stream the record belongs to
    pub stream_key: String,
    /// Which link failed
    pub kind: BreakKind,
    /// Value the chain replays to
    pub expected: String,
    /// Value found in storage
    pub actual: String,
}

impl fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Check {} ({}): {}. Expected: {}, Got: {}",
            self.sequence_id, self.stream_key, self.kind, self.expected, self.actual
        )
    }
}

/// Outcome of verifying one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    /// Stream verified
    pub stream_key: String,
    /// Records replayed
    pub records_checked: u64,
    /// Every break, in sequence order
    pub breaks: Vec<ChainBreak>,
}

impl ChainReport {
    /// True when no break was found
    pub fn is_valid(&self) -> bool {
        self.breaks.is_empty()
    }

    /// Convert into `Err(ChainBreak)` when any break was found
    pub fn into_result(self) -> Result<u64> {
        if self.breaks.is_empty() {
            Ok(self.records_checked)
        } else {
            Err(Error::ChainBreak {
                stream_key: self.stream_key,
                breaks: self.breaks,
            })
        }
    }
}

/// Replay an ordered sequence of checks and report every break
///
/// Records must be in insertion order. Two checks per record:
/// the stored `previous_hash` must equal the prior record's stored hash, and
/// the stored hash must equal the hash recomputed over the replayed
/// predecessor. Replaying over recomputed hashes (not stored ones) makes a
/// tampered record invalidate every record after it.
pub fn verify_sequence(stream_key: &str, records: &[Check]) -> ChainReport {
    let mut breaks = Vec::new();
    let mut prior_stored: &str = "";
    let mut replayed = String::new();

    for record in records {
        if record.previous_hash != prior_stored {
            breaks.push(ChainBreak {
                sequence_id: record.sequence_id,
                stream_key: stream_key.to_string(),
                kind: BreakKind::PreviousHashMismatch,
                expected: prior_stored.to_string(),
                actual: record.previous_hash.clone(),
            });
        }

        let expected = compute_hash(record, &replayed);
        if record.hash != expected {
            breaks.push(ChainBreak {
                sequence_id: record.sequence_id,
                stream_key: stream_key.to_string(),
                kind: BreakKind::HashMismatch,
                expected: expected.clone(),
                actual: record.hash.clone(),
            });
        }

        prior_stored = &record.hash;
        replayed = expected;
    }

    ChainReport {
        stream_key: stream_key.to_string(),
        records_checked: records.len() as u64,
        breaks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckPayload, CheckStatus};
    use chrono::Utc;

    /// Link payloads into checks the way the store does
    fn link(payloads: Vec<CheckPayload>) -> Vec<Check> {
        let mut previous = String::new();
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let hash = compute_hash(&p, &previous);
                Check {
                    sequence_id: i as u64 + 1,
                    timestamp: p.timestamp,
                    stream_key: p.stream_key,
                    endpoint: p.endpoint,
                    status: p.status,
                    response_time_ms: p.response_time_ms,
                    status_code: p.status_code,
                    source: p.source,
                    raw_response: p.raw_response,
                    hash: hash.clone(),
                    previous_hash: std::mem::replace(&mut previous, hash),
                    created_at: Utc::now(),
                }
            })
            .collect()
    }

    fn payload(minute: u32, status: CheckStatus) -> CheckPayload {
        CheckPayload::new(
            format!("2024-05-01T12:{:02}:00Z", minute),
            "github",
            "https://api.github.com",
            status,
        )
        .with_status_code(if status == CheckStatus::Up { 200 } else { 0 })
    }

    #[test]
    fn test_known_hash_vector() {
        let first = CheckPayload::new(
            "2024-05-01T12:00:00Z",
            "github",
            "https://api.github.com",
            CheckStatus::Up,
        )
        .with_response_time(120)
        .with_status_code(200);
        let h1 = compute_hash(&first, "");
        assert_eq!(
            h1,
            "b728da47ba5c0cecb3035d733f781c979fd19dcdd6949f590f54b4909208449b"
        );

        let second = CheckPayload::new(
            "2024-05-01T12:05:00Z",
            "github",
            "https://api.github.com",
            CheckStatus::Down,
        )
        .with_status_code(0);
        assert_eq!(
            compute_hash(&second, &h1),
            "e251d991fa9329b3f00d272c55ac32bf244d649ca4ada0e9bdf447bd256c38eb"
        );
    }

    #[test]
    fn test_hash_is_deterministic() {
        let p = payload(0, CheckStatus::Up);
        assert_eq!(compute_hash(&p, "abc"), compute_hash(&p, "abc"));
        assert_eq!(compute_hash(&p, "").len(), 64);
    }

    #[test]
    fn test_each_field_changes_hash() {
        let base = payload(0, CheckStatus::Up).with_response_time(100);
        let h = compute_hash(&base, "");

        let mut variants = Vec::new();
        let mut v = base.clone();
        v.timestamp = "2024-05-01T12:00:01Z".to_string();
        variants.push(v);
        let mut v = base.clone();
        v.stream_key = "gitlab".to_string();
        variants.push(v);
        let mut v = base.clone();
        v.endpoint = "https://api.github.com/".to_string();
        variants.push(v);
        let mut v = base.clone();
        v.status = CheckStatus::Degraded;
        variants.push(v);
        let mut v = base.clone();
        v.response_time_ms = Some(101);
        variants.push(v);
        let mut v = base.clone();
        v.response_time_ms = None;
        variants.push(v);
        let mut v = base.clone();
        v.status_code = Some(201);
        variants.push(v);
        let mut v = base.clone();
        v.source = "third_party".to_string();
        variants.push(v);

        for variant in &variants {
            assert_ne!(compute_hash(variant, ""), h, "{:?}", variant);
        }
        assert_ne!(compute_hash(&base, "00"), h);
    }

    #[test]
    fn test_raw_response_is_not_hashed() {
        let p = payload(0, CheckStatus::Up);
        let with_raw = p.clone().with_raw_response("<html>");
        assert_eq!(compute_hash(&p, ""), compute_hash(&with_raw, ""));
    }

    #[test]
    fn test_verify_clean_chain() {
        let checks = link((0..5).map(|m| payload(m, CheckStatus::Up)).collect());
        let report = verify_sequence("github", &checks);
        assert!(report.is_valid());
        assert_eq!(report.records_checked, 5);
        assert_eq!(report.into_result().unwrap(), 5);
    }

    #[test]
    fn test_verify_empty_chain() {
        let report = verify_sequence("github", &[]);
        assert!(report.is_valid());
        assert_eq!(report.records_checked, 0);
    }

    #[test]
    fn test_tamper_propagates_forward() {
        let mut checks = link((0..6).map(|m| payload(m, CheckStatus::Up)).collect());
        checks[2].status = CheckStatus::Down;

        let report = verify_sequence("github", &checks);
        assert!(!report.is_valid());

        let broken: Vec<u64> = report
            .breaks
            .iter()
            .filter(|b| b.kind == BreakKind::HashMismatch)
            .map(|b| b.sequence_id)
            .collect();
        assert_eq!(broken, vec![3, 4, 5, 6]);
        // Links between stored hashes are untouched
        assert!(report
            .breaks
            .iter()
            .all(|b| b.kind != BreakKind::PreviousHashMismatch));
    }

    #[test]
    fn test_rehashed_tamper_breaks_next_link() {
        let mut checks = link((0..4).map(|m| payload(m, CheckStatus::Up)).collect());
        checks[1].status = CheckStatus::Down;
        checks[1].hash = compute_hash(&checks[1], &checks[1].previous_hash);

        let report = verify_sequence("github", &checks);
        assert!(report
            .breaks
            .iter()
            .any(|b| b.sequence_id == 3 && b.kind == BreakKind::PreviousHashMismatch));
        assert!(!report.breaks.iter().any(|b| b.sequence_id < 3));
    }

    #[test]
    fn test_deletion_is_detected() {
        let mut checks = link((0..4).map(|m| payload(m, CheckStatus::Up)).collect());
        checks.remove(1);

        let report = verify_sequence("github", &checks);
        let first = &report.breaks[0];
        assert_eq!(first.sequence_id, 3);
        assert_eq!(first.kind, BreakKind::PreviousHashMismatch);
        assert_eq!(first.expected, checks[0].hash);
    }

    #[test]
    fn test_reordering_is_detected() {
        let mut checks = link((0..3).map(|m| payload(m, CheckStatus::Up)).collect());
        checks.swap(0, 1);
        assert!(!verify_sequence("github", &checks).is_valid());
    }

    #[test]
    fn test_into_result_carries_breaks() {
        let mut checks = link(vec![payload(0, CheckStatus::Up)]);
        checks[0].hash = "0".repeat(64);
        match verify_sequence("github", &checks).into_result() {
            Err(Error::ChainBreak { stream_key, breaks }) => {
                assert_eq!(stream_key, "github");
                assert_eq!(breaks.len(), 1);
                assert!(breaks[0].to_string().starts_with("Check 1 (github): hash mismatch"));
            }
            other => panic!("expected chain break, got {:?}", other),
        }
    }
}
