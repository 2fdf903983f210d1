use std::sync::Arc;

use chrono::Days;
use tracing::{debug, info, warn};

use crate::registry::RestaurantRegistry;

/// What one maintenance pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub completed: usize,
    pub status_changes: usize,
    pub compacted: usize,
    pub cache_purged: usize,
    pub evicted: usize,
}

/// One synchronous sweep over every loaded restaurant.
pub fn run_pass(registry: &RestaurantRegistry) -> MaintenanceReport {
    let config = registry.config();
    let mut report = MaintenanceReport::default();
    let mut oldest_today = None;

    for engine in registry.engines() {
        let Ok(profile) = engine.profile() else {
            continue;
        };
        let now = profile.local_now();
        match engine.complete_elapsed_at(now) {
            Ok(n) => report.completed += n,
            Err(e) => warn!("{}: completing elapsed reservations failed: {e}", engine.restaurant_id()),
        }
        report.status_changes += engine.refresh_all_statuses_at(now);

        let appends = engine.wal_appends_since_compact();
        if appends >= config.compact_threshold {
            match engine.compact_wal() {
                Ok(()) => {
                    info!("{}: compacted WAL ({appends} appends since last)", engine.restaurant_id());
                    report.compacted += 1;
                }
                Err(e) => warn!("{}: WAL compaction failed: {e}", engine.restaurant_id()),
            }
        }

        let today = now.date();
        oldest_today = Some(oldest_today.map_or(today, |d: chrono::NaiveDate| d.min(today)));
    }

    report.cache_purged = registry.cache().purge_expired();
    // Restaurants sit in different offsets; only drop days that are past
    // everywhere.
    if let Some(cutoff) = oldest_today.and_then(|d| d.checked_sub_days(Days::new(1))) {
        registry.cache().forget_before(cutoff);
    }
    if let Some(max_idle) = config.idle_evict_after {
        report.evicted = registry.evict_idle(max_idle);
    }
    debug!(?report, "maintenance pass");
    report
}

/// Background loop. The pass itself takes blocking locks and fsyncs, so it
/// runs on the blocking pool.
pub async fn run_maintenance(registry: Arc<RestaurantRegistry>) {
    let mut interval = tokio::time::interval(registry.config().maintenance_interval);
    loop {
        interval.tick().await;
        let registry = registry.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || run_pass(&registry)).await {
            warn!("maintenance pass panicked: {e}");
        }
    }
}
