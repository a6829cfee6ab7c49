//! Truth Ledger
//!
//! Tamper-evident, append-only ledger of API health checks.
//!
//! # Architecture
//!
//! - **Hash Chains**: Each check commits to its stream's previous check
//! - **Per-Stream Writers**: One writer per stream at a time, streams in parallel
//! - **Atomic Batches**: A check and its indices land in one RocksDB write
//! - **Derived Analytics**: Uptime and discrepancies are computed from stored checks
//!
//! # Invariants
//!
//! - Chain continuity: record i's `previous_hash` is record i-1's `hash`
//! - Hash determinism: same fields and predecessor give the same hash
//! - Append-only: checks are never modified or deleted
//! - At most one writer per stream tail

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod aggregator;
pub mod canonical;
pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports
pub use aggregator::{StatusClaim, UptimeWindow};
pub use chain::{compute_hash, verify_sequence, BreakKind, ChainBreak, ChainReport};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use store::LedgerStore;
pub use types::{
    Check, CheckPayload, CheckStatus, Discrepancy, LedgerStats, Order, ProbeOutcome, Severity,
    Source, UptimeAggregate,
};
