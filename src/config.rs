use std::path::PathBuf;
use std::time::Duration;

use crate::engine::SlotQuery;
use crate::limits::{MAX_RESULTS, MIN_SLOT_INTERVAL};
use crate::model::Minutes;

pub const DEFAULT_SLOT_INTERVAL: Minutes = 30;
pub const DEFAULT_MAX_RESULTS: usize = 10;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
/// Source tag for requests that do not name one.
pub const DEFAULT_SOURCE: &str = "manual";

/// Engine-wide settings. Every field has a default and can be overridden by a
/// `TABLEWISE_*` environment variable.
#[derive(Debug, Clone)]
pub struct Config {
    /// One WAL file per restaurant lives here.
    pub data_dir: PathBuf,
    pub cache_ttl: Duration,
    pub slot_interval: Minutes,
    pub max_results: usize,
    /// Extra searches after a create loses a race at commit.
    pub booking_retries: u32,
    /// WAL appends before the maintenance loop compacts.
    pub compact_threshold: u64,
    /// Intake sources whose bookings start out confirmed.
    pub trusted_sources: Vec<String>,
    pub maintenance_interval: Duration,
    /// Drop engines untouched for this long. `None` keeps them forever.
    pub idle_evict_after: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_ttl: DEFAULT_CACHE_TTL,
            slot_interval: DEFAULT_SLOT_INTERVAL,
            max_results: DEFAULT_MAX_RESULTS,
            booking_retries: 1,
            compact_threshold: 1000,
            trusted_sources: vec![DEFAULT_SOURCE.to_string()],
            maintenance_interval: Duration::from_secs(60),
            idle_evict_after: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let mut cfg = Self::default();
        if let Some(dir) = lookup("TABLEWISE_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "TABLEWISE_CACHE_TTL_SECS") {
            cfg.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(m) = parsed::<Minutes>(&lookup, "TABLEWISE_SLOT_INTERVAL_MINUTES") {
            cfg.slot_interval = m.max(MIN_SLOT_INTERVAL);
        }
        if let Some(n) = parsed::<usize>(&lookup, "TABLEWISE_MAX_RESULTS") {
            cfg.max_results = n.clamp(1, MAX_RESULTS);
        }
        if let Some(n) = parsed(&lookup, "TABLEWISE_BOOKING_RETRIES") {
            cfg.booking_retries = n;
        }
        if let Some(n) = parsed(&lookup, "TABLEWISE_COMPACT_THRESHOLD") {
            cfg.compact_threshold = n;
        }
        if let Some(list) = lookup("TABLEWISE_TRUSTED_SOURCES") {
            cfg.trusted_sources = list
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(secs) = parsed::<u64>(&lookup, "TABLEWISE_MAINTENANCE_INTERVAL_SECS") {
            cfg.maintenance_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parsed::<u64>(&lookup, "TABLEWISE_IDLE_EVICT_SECS") {
            cfg.idle_evict_after = (secs > 0).then(|| Duration::from_secs(secs));
        }
        cfg
    }

    pub fn is_trusted(&self, source: &str) -> bool {
        self.trusted_sources.iter().any(|s| s.eq_ignore_ascii_case(source))
    }

    /// A search with this configuration's grid and result cap.
    pub fn slot_query(&self, party_size: u32) -> SlotQuery {
        SlotQuery::new(party_size)
            .interval(self.slot_interval)
            .max_results(self.max_results)
    }
}
