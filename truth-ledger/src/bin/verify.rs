//! Ledger verification binary
//!
//! Replays every stream's hash chain and exits non-zero on any break.
//! Configuration comes from the file named by `LEDGER_CONFIG`, or from
//! `LEDGER_*` environment variables.

use anyhow::Context;
use chrono::Utc;
use truth_ledger::{Config, LedgerStore, UptimeWindow};

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match std::env::var("LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        Err(_) => Config::from_env().context("loading configuration from environment")?,
    };

    tracing::info!(data_dir = ?config.data_dir, "Verifying ledger");

    let store = LedgerStore::open(config).context("opening ledger store")?;
    let reports = store.verify_all().context("verifying streams")?;

    let now = Utc::now();
    let mut total_records = 0u64;
    let mut total_breaks = 0usize;
    for report in &reports {
        total_records += report.records_checked;
        total_breaks += report.breaks.len();
        for brk in &report.breaks {
            println!("BREAK  {}", brk);
        }

        let window = UptimeWindow::last_hours(store.config().default_window_hours, now);
        let uptime = store
            .get_uptime(&report.stream_key, window)
            .with_context(|| format!("aggregating uptime for {}", report.stream_key))?;
        println!(
            "{:<6} {} ({} records, {:.2}% uptime over {}h)",
            if report.is_valid() { "OK" } else { "FAIL" },
            report.stream_key,
            report.records_checked,
            uptime.uptime_percent,
            store.config().default_window_hours
        );
    }

    let stats = store.get_stats().context("reading ledger stats")?;
    println!(
        "{} streams, {} records, {} breaks, {:.2} MB on disk",
        reports.len(),
        total_records,
        total_breaks,
        stats.database_size_mb
    );

    store.close().context("closing ledger store")?;

    if total_breaks > 0 {
        tracing::error!(breaks = total_breaks, "Ledger integrity compromised");
        std::process::exit(1);
    }

    tracing::info!("Ledger integrity verified");
    Ok(())
}
