use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;

use crate::engine::SlotQuery;
use crate::model::AvailabilitySlot;
use crate::observability::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

pub type CachedSlots = Arc<Vec<AvailabilitySlot>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    restaurant: String,
    date: NaiveDate,
}

impl BucketKey {
    fn new(restaurant: &str, date: NaiveDate) -> Self {
        Self {
            restaurant: restaurant.to_string(),
            date,
        }
    }
}

struct CacheEntry {
    slots: CachedSlots,
    expires_at: Instant,
}

/// All cached answers for one restaurant and date, stamped with the
/// generation they were computed against.
#[derive(Default)]
struct Bucket {
    generation: u64,
    entries: HashMap<SlotQuery, CacheEntry>,
}

/// Short-lived memo of availability answers.
///
/// Entries are grouped per `(restaurant, date)`. Every write that changes
/// occupancy calls [`ResultCache::invalidate_date`], which clears the bucket
/// and moves it to a fresh generation. Readers capture the generation before
/// they snapshot reservations and pass it back to [`ResultCache::insert`]; an
/// answer computed against an older generation is dropped, so a reader that
/// raced a writer can never re-seed a stale result. The TTL is only a safety
/// net.
pub struct ResultCache {
    buckets: DashMap<BucketKey, Bucket>,
    /// Restaurant-wide fence, bumped by [`ResultCache::invalidate_restaurant`].
    /// A bucket's effective generation is the larger of the two.
    epochs: DashMap<String, u64>,
    ttl: Duration,
    next_generation: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            epochs: DashMap::new(),
            ttl,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current generation of a bucket. Absent buckets are generation 0.
    pub fn generation(&self, restaurant: &str, date: NaiveDate) -> u64 {
        let bucket = self
            .buckets
            .get(&BucketKey::new(restaurant, date))
            .map_or(0, |b| b.generation);
        bucket.max(self.epoch(restaurant))
    }

    fn epoch(&self, restaurant: &str) -> u64 {
        self.epochs.get(restaurant).map_or(0, |e| *e.value())
    }

    pub fn get(&self, restaurant: &str, date: NaiveDate, query: &SlotQuery) -> Option<CachedSlots> {
        let hit = self
            .buckets
            .get(&BucketKey::new(restaurant, date))
            .and_then(|bucket| {
                bucket
                    .entries
                    .get(query)
                    .filter(|e| e.expires_at > Instant::now())
                    .map(|e| e.slots.clone())
            });
        if hit.is_some() {
            metrics::counter!(CACHE_HITS_TOTAL).increment(1);
        } else {
            metrics::counter!(CACHE_MISSES_TOTAL).increment(1);
        }
        hit
    }

    /// Store an answer computed against `generation`. Returns false when the
    /// bucket moved on in the meantime (or caching is disabled).
    pub fn insert(
        &self,
        restaurant: &str,
        date: NaiveDate,
        query: SlotQuery,
        slots: CachedSlots,
        generation: u64,
    ) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let epoch = self.epoch(restaurant);
        let mut bucket = self.buckets.entry(BucketKey::new(restaurant, date)).or_default();
        if bucket.generation.max(epoch) != generation {
            return false;
        }
        bucket.entries.insert(
            query,
            CacheEntry {
                slots,
                expires_at: Instant::now() + self.ttl,
            },
        );
        true
    }

    /// Drop every answer for `(restaurant, date)` and fence off in-flight readers.
    pub fn invalidate_date(&self, restaurant: &str, date: NaiveDate) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut bucket = self.buckets.entry(BucketKey::new(restaurant, date)).or_default();
        bucket.generation = generation;
        bucket.entries.clear();
    }

    /// Coarse form used after profile or table edits.
    pub fn invalidate_restaurant(&self, restaurant: &str) {
        let epoch = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.epochs.insert(restaurant.to_string(), epoch);
        for mut bucket in self.buckets.iter_mut() {
            if bucket.key().restaurant == restaurant {
                bucket.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                bucket.entries.clear();
            }
        }
    }

    /// Remove expired entries. Buckets stay so their generation survives.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for mut bucket in self.buckets.iter_mut() {
            let before = bucket.entries.len();
            bucket.entries.retain(|_, e| e.expires_at > now);
            removed += before - bucket.entries.len();
        }
        removed
    }

    /// Drop whole buckets for days before `cutoff`. Nothing books the past.
    pub fn forget_before(&self, cutoff: NaiveDate) {
        self.buckets.retain(|key, _| key.date >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
