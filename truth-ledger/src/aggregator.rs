//! Uptime aggregation and the discrepancy decision rule
//!
//! Everything here is a pure function of stored checks except
//! [`detect_discrepancy`] and [`record_discrepancy`], which read (and for the
//! latter, write) through a [`LedgerStore`].

use crate::store::LedgerStore;
use crate::types::{
    format_timestamp, parse_timestamp, Check, Discrepancy, Order, Severity, UptimeAggregate,
};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Longest relative window accepted (100 years)
const MAX_WINDOW_HOURS: i64 = 24 * 365 * 100;

/// Numeric claims within this many points of the measurement are accepted
pub const VARIANCE_THRESHOLD: f64 = 2.0;

/// A qualitative "up" claim is contradicted below this measured uptime
pub const UP_CLAIM_MIN_UPTIME: f64 = 95.0;

/// Time range an aggregate covers, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UptimeWindow {
    /// The `hours` leading up to `now`
    LastHours {
        /// Window length
        hours: i64,
        /// Window end
        now: DateTime<Utc>,
    },
    /// Explicit range
    Range {
        /// Window start
        start: DateTime<Utc>,
        /// Window end
        end: DateTime<Utc>,
    },
}

impl UptimeWindow {
    /// The `hours` leading up to `now`
    pub fn last_hours(hours: i64, now: DateTime<Utc>) -> Self {
        UptimeWindow::LastHours { hours, now }
    }

    /// Resolve to `(start, end)`
    pub fn bounds(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        match *self {
            UptimeWindow::LastHours { hours, now } => {
                if hours <= 0 || hours > MAX_WINDOW_HOURS {
                    return Err(Error::Validation(format!(
                        "window hours must be within 1..={}, got {}",
                        MAX_WINDOW_HOURS, hours
                    )));
                }
                let start = now
                    .checked_sub_signed(Duration::hours(hours))
                    .ok_or_else(|| Error::Validation("window start out of range".to_string()))?;
                Ok((start, now))
            }
            UptimeWindow::Range { start, end } => {
                if start > end {
                    return Err(Error::Validation(format!(
                        "window start {} is after end {}",
                        start, end
                    )));
                }
                Ok((start, end))
            }
        }
    }
}

/// What a vendor's status page claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusClaim {
    /// e.g. "up", "degraded"
    pub claimed_status: String,
    /// Published uptime percentage, when the page shows one
    pub claimed_uptime: Option<f64>,
    /// Page the claim was read from
    pub source_url: String,
}

/// Outcome of comparing a claim with a measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaimVerdict {
    /// Points of difference
    pub variance_percent: f64,
    /// Severity of that difference
    pub severity: Severity,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Aggregate a stream's checks
///
/// Callers pass only checks inside the window; an empty slice gives the zero
/// aggregate.
pub fn aggregate(stream_key: &str, checks: &[Check]) -> UptimeAggregate {
    if checks.is_empty() {
        return UptimeAggregate::empty(stream_key);
    }

    let total = checks.len() as u64;
    let successful = checks.iter().filter(|c| c.status.is_success()).count() as u64;

    let timed: Vec<u64> = checks.iter().filter_map(|c| c.response_time_ms).collect();
    let avg_response_time_ms = if timed.is_empty() {
        0.0
    } else {
        round_to(timed.iter().sum::<u64>() as f64 / timed.len() as f64, 2)
    };

    let first_check = checks
        .iter()
        .min_by_key(|c| parse_timestamp(&c.timestamp).ok())
        .map(|c| c.timestamp.clone());
    let last_check = checks
        .iter()
        .max_by_key(|c| parse_timestamp(&c.timestamp).ok())
        .map(|c| c.timestamp.clone());

    UptimeAggregate {
        stream_key: stream_key.to_string(),
        uptime_percent: round_to(successful as f64 / total as f64 * 100.0, 4),
        total_checks: total,
        successful_checks: successful,
        avg_response_time_ms,
        first_check,
        last_check,
    }
}

/// Absolute difference between claimed and measured uptime
pub fn compute_variance(claimed: f64, measured: f64) -> f64 {
    (claimed - measured).abs()
}

/// Severity of a variance in percentage points
pub fn classify_severity(variance: f64) -> Severity {
    if variance >= 10.0 {
        Severity::Critical
    } else if variance >= 5.0 {
        Severity::High
    } else if variance >= 2.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Decide whether a claim contradicts a measured uptime
///
/// A numeric claim is contradicted when it differs by more than
/// [`VARIANCE_THRESHOLD`]. Without a number, only an "up" claim is judged:
/// it is contradicted below [`UP_CLAIM_MIN_UPTIME`], with the shortfall from
/// 100% as variance.
///
/// Threshold and severity see the exact variance; only the reported
/// `variance_percent` is rounded to 4 dp.
pub fn evaluate_claim(claim: &StatusClaim, measured_uptime: f64) -> Option<ClaimVerdict> {
    let variance = match claim.claimed_uptime {
        Some(claimed) => {
            let variance = compute_variance(claimed, measured_uptime);
            if variance <= VARIANCE_THRESHOLD {
                return None;
            }
            variance
        }
        None => {
            if claim.claimed_status != "up" || measured_uptime >= UP_CLAIM_MIN_UPTIME {
                return None;
            }
            100.0 - measured_uptime
        }
    };

    Some(ClaimVerdict {
        variance_percent: round_to(variance, 4),
        severity: classify_severity(variance),
    })
}

/// Compare a claim against the stream's measured uptime
///
/// Returns `None` when the window holds no checks or the claim holds up.
/// The discrepancy carries the stream's most recent check hashes as proof.
pub fn detect_discrepancy(
    store: &LedgerStore,
    stream_key: &str,
    claim: &StatusClaim,
    window: UptimeWindow,
    now: DateTime<Utc>,
) -> Result<Option<Discrepancy>> {
    let measured = store.get_uptime(stream_key, window)?;
    if measured.total_checks == 0 {
        tracing::info!(stream_key, "No checks in window, skipping claim comparison");
        return Ok(None);
    }

    let verdict = match evaluate_claim(claim, measured.uptime_percent) {
        Some(verdict) => verdict,
        None => return Ok(None),
    };

    let proof_hashes = store
        .get_records(stream_key, Some(store.config().proof_hash_count), Order::Descending)?
        .into_iter()
        .map(|c| c.hash)
        .collect();

    let claimed_status = match claim.claimed_uptime {
        Some(claimed) => format!("{}% uptime", claimed),
        None => claim.claimed_status.clone(),
    };

    Ok(Some(Discrepancy {
        timestamp: format_timestamp(&now),
        stream_key: stream_key.to_string(),
        claimed_status,
        actual_status: format!("{:.2}% uptime", measured.uptime_percent),
        claimed_uptime: claim.claimed_uptime,
        measured_uptime: measured.uptime_percent,
        variance_percent: verdict.variance_percent,
        proof_hashes,
        evidence_url: claim.source_url.clone(),
        severity: verdict.severity,
        checks_count: measured.total_checks,
    }))
}

/// [`detect_discrepancy`], persisting the result when one is found
pub fn record_discrepancy(
    store: &LedgerStore,
    stream_key: &str,
    claim: &StatusClaim,
    window: UptimeWindow,
    now: DateTime<Utc>,
) -> Result<Option<(u64, Discrepancy)>> {
    match detect_discrepancy(store, stream_key, claim, window, now)? {
        Some(discrepancy) => {
            let id = store.insert_discrepancy(discrepancy.clone())?;
            Ok(Some((id, discrepancy)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckStatus;

    fn check(minute: u32, status: CheckStatus, response_time_ms: Option<u64>) -> Check {
        Check {
            sequence_id: minute as u64 + 1,
            timestamp: format!("2024-05-01T12:{:02}:00Z", minute),
            stream_key: "github".to_string(),
            endpoint: "https://api.github.com".to_string(),
            status,
            response_time_ms,
            status_code: Some(200),
            source: "direct_check".to_string(),
            raw_response: None,
            hash: String::new(),
            previous_hash: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_window_is_zero_aggregate() {
        let agg = aggregate("github", &[]);
        assert_eq!(agg, UptimeAggregate::empty("github"));
        assert_eq!(agg.uptime_percent, 0.0);
    }

    #[test]
    fn test_aggregate_rounding_and_bounds() {
        let checks = vec![
            check(5, CheckStatus::Up, Some(100)),
            check(0, CheckStatus::Up, Some(101)),
            check(9, CheckStatus::Degraded, None),
        ];
        let agg = aggregate("github", &checks);
        assert_eq!(agg.total_checks, 3);
        assert_eq!(agg.successful_checks, 2);
        assert_eq!(agg.uptime_percent, 66.6667);
        assert_eq!(agg.avg_response_time_ms, 100.5);
        assert_eq!(agg.first_check.as_deref(), Some("2024-05-01T12:00:00Z"));
        assert_eq!(agg.last_check.as_deref(), Some("2024-05-01T12:09:00Z"));
    }

    #[test]
    fn test_variance_and_severity() {
        let variance = compute_variance(99.99, 94.0);
        assert!((variance - 5.99).abs() < 1e-9);
        assert_eq!(classify_severity(variance), Severity::High);
        assert!(compute_variance(99.00004, 97.0) > VARIANCE_THRESHOLD);

        assert_eq!(classify_severity(10.0), Severity::Critical);
        assert_eq!(classify_severity(4.99), Severity::Medium);
        assert_eq!(classify_severity(2.0), Severity::Medium);
        assert_eq!(classify_severity(1.99), Severity::Low);
    }

    #[test]
    fn test_numeric_claim_threshold_is_exclusive() {
        let claim = StatusClaim {
            claimed_status: "operational".to_string(),
            claimed_uptime: Some(99.0),
            source_url: "https://status.example.com".to_string(),
        };
        assert!(evaluate_claim(&claim, 97.0).is_none());

        let verdict = evaluate_claim(&claim, 96.5).unwrap();
        assert_eq!(verdict.variance_percent, 2.5);
        assert_eq!(verdict.severity, Severity::Medium);
    }

    #[test]
    fn test_claim_decided_before_rounding() {
        let claim = StatusClaim {
            claimed_status: "operational".to_string(),
            claimed_uptime: Some(99.00004),
            source_url: "https://status.example.com".to_string(),
        };
        // Rounds to exactly 2.0 but is over the threshold
        let verdict = evaluate_claim(&claim, 97.0).unwrap();
        assert_eq!(verdict.variance_percent, 2.0);
        assert_eq!(verdict.severity, Severity::Medium);

        // Rounds up to 10.0 but is below the critical bound
        let near_critical = StatusClaim {
            claimed_uptime: Some(99.99999),
            ..claim.clone()
        };
        let verdict = evaluate_claim(&near_critical, 90.0).unwrap();
        assert_eq!(verdict.variance_percent, 10.0);
        assert_eq!(verdict.severity, Severity::High);

        let reported = StatusClaim {
            claimed_uptime: Some(99.99),
            ..claim
        };
        let verdict = evaluate_claim(&reported, 94.0).unwrap();
        assert_eq!(verdict.variance_percent, 5.99);
        assert_eq!(verdict.severity, Severity::High);
    }

    #[test]
    fn test_up_claim_judged_against_95() {
        let claim = StatusClaim {
            claimed_status: "up".to_string(),
            claimed_uptime: None,
            source_url: "https://status.example.com".to_string(),
        };
        assert!(evaluate_claim(&claim, 95.0).is_none());

        let verdict = evaluate_claim(&claim, 50.0).unwrap();
        assert_eq!(verdict.variance_percent, 50.0);
        assert_eq!(verdict.severity, Severity::Critical);

        let degraded = StatusClaim {
            claimed_status: "degraded".to_string(),
            ..claim
        };
        assert!(evaluate_claim(&degraded, 10.0).is_none());
    }

    #[test]
    fn test_window_bounds() {
        let now = parse_timestamp("2024-05-01T12:00:00Z").unwrap();
        let (start, end) = UptimeWindow::last_hours(24, now).bounds().unwrap();
        assert_eq!(end, now);
        assert_eq!(format_timestamp(&start), "2024-04-30T12:00:00.000000Z");

        assert!(UptimeWindow::last_hours(0, now).bounds().is_err());
        let inverted = UptimeWindow::Range { start: now, end: start };
        assert!(matches!(inverted.bounds(), Err(Error::Validation(_))));
    }
}
