//! Metric names. Recording goes through the `metrics` facade; installing an
//! exporter is up to the embedding service.

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: availability searches executed. Labels: source (cache|computed).
pub const SLOT_QUERIES_TOTAL: &str = "tablewise_slot_queries_total";

/// Histogram: time spent computing slots on a cache miss, in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "tablewise_slot_query_duration_seconds";

/// Counter: reservation operations. Labels: op, outcome.
pub const RESERVATIONS_TOTAL: &str = "tablewise_reservations_total";

/// Counter: creates that lost a race at commit and had to search again.
pub const CONFLICTS_LOST_TOTAL: &str = "tablewise_conflicts_lost_total";

/// Counter: stored reservations skipped during a conflict scan.
pub const MALFORMED_OCCUPANCIES_TOTAL: &str = "tablewise_malformed_occupancies_total";

// ── Cache ───────────────────────────────────────────────────────

pub const CACHE_HITS_TOTAL: &str = "tablewise_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "tablewise_cache_misses_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: restaurants with a loaded engine.
pub const RESTAURANTS_ACTIVE: &str = "tablewise_restaurants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tablewise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tablewise_wal_flush_batch_size";

/// Record the outcome of a lifecycle operation.
pub fn record_reservation_op<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(RESERVATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}
