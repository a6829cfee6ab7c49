//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the ledger. Each [`Metrics`] owns its
//! registry, so several stores can live in one process.
//!
//! # Metrics
//!
//! - `ledger_checks_total` - Checks appended
//! - `ledger_insert_duration_seconds` - Histogram of insert latencies
//! - `ledger_discrepancies_total` - Discrepancies recorded
//! - `ledger_verifications_total` - Stream verifications run
//! - `ledger_chain_breaks_total` - Breaks reported by verification
//! - `ledger_storage_size_bytes` - Data directory size at last stats call

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Checks appended
    pub checks_total: IntCounter,

    /// Insert duration histogram
    pub insert_duration: Histogram,

    /// Discrepancies recorded
    pub discrepancies_total: IntCounter,

    /// Verifications run
    pub verifications_total: IntCounter,

    /// Chain breaks found
    pub chain_breaks_total: IntCounter,

    /// Storage size
    pub storage_size: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let checks_total = IntCounter::new("ledger_checks_total", "Checks appended")?;
        registry.register(Box::new(checks_total.clone()))?;

        let insert_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_insert_duration_seconds",
                "Histogram of insert latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(insert_duration.clone()))?;

        let discrepancies_total =
            IntCounter::new("ledger_discrepancies_total", "Discrepancies recorded")?;
        registry.register(Box::new(discrepancies_total.clone()))?;

        let verifications_total =
            IntCounter::new("ledger_verifications_total", "Stream verifications run")?;
        registry.register(Box::new(verifications_total.clone()))?;

        let chain_breaks_total = IntCounter::new(
            "ledger_chain_breaks_total",
            "Breaks reported by verification",
        )?;
        registry.register(Box::new(chain_breaks_total.clone()))?;

        let storage_size = IntGauge::new("ledger_storage_size_bytes", "Data directory size")?;
        registry.register(Box::new(storage_size.clone()))?;

        Ok(Self {
            checks_total,
            insert_duration,
            discrepancies_total,
            verifications_total,
            chain_breaks_total,
            storage_size,
            registry,
        })
    }

    /// Record a check append
    pub fn record_check_insert(&self, duration_seconds: f64) {
        self.checks_total.inc();
        self.insert_duration.observe(duration_seconds);
    }

    /// Record a persisted discrepancy
    pub fn record_discrepancy(&self) {
        self.discrepancies_total.inc();
    }

    /// Record one stream verification and the breaks it found
    pub fn record_verification(&self, breaks: usize) {
        self.verifications_total.inc();
        self.chain_breaks_total.inc_by(breaks as u64);
    }

    /// Update storage size
    pub fn update_storage_size(&self, size_bytes: u64) {
        self.storage_size.set(i64::try_from(size_bytes).unwrap_or(i64::MAX));
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("checks_total", &self.checks_total.get())
            .field("discrepancies_total", &self.discrepancies_total.get())
            .field("verifications_total", &self.verifications_total.get())
            .field("chain_breaks_total", &self.chain_breaks_total.get())
            .finish()
    }
}
