use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::cache::CachedSlots;
use crate::config::{DEFAULT_MAX_RESULTS, DEFAULT_SLOT_INTERVAL};
use crate::limits::*;
use crate::model::*;
use crate::observability::{SLOT_QUERIES_TOTAL, SLOT_QUERY_DURATION_SECONDS};
use crate::slots::{format_for_display, format_hhmm, generate_candidate_starts, order_by_preference};

use super::conflict::{Occupancy, is_free};
use super::selector::pick_best;
use super::{Engine, EngineError, read_table};

/// Parameters of an availability search. Also the cache key within a
/// `(restaurant, date)` bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotQuery {
    pub party_size: u32,
    /// Results are ordered by distance from this time.
    pub preferred_time: Option<Minutes>,
    pub max_results: usize,
    /// Grid spacing of candidate starts.
    pub interval: Minutes,
    /// Seating length; `None` uses the restaurant default.
    pub duration: Option<Minutes>,
    /// Only evaluate `preferred_time` itself.
    pub exact: bool,
}

impl SlotQuery {
    pub fn new(party_size: u32) -> Self {
        Self {
            party_size,
            preferred_time: None,
            max_results: DEFAULT_MAX_RESULTS,
            interval: DEFAULT_SLOT_INTERVAL,
            duration: None,
            exact: false,
        }
    }

    pub fn preferred(mut self, time: Minutes) -> Self {
        self.preferred_time = Some(time);
        self
    }

    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }

    pub fn interval(mut self, minutes: Minutes) -> Self {
        self.interval = minutes;
        self
    }

    pub fn duration(mut self, minutes: Option<Minutes>) -> Self {
        self.duration = minutes;
        self
    }

    /// Ask for exactly `time` and nothing else; the booking path uses this.
    pub fn exact_at(mut self, time: Minutes) -> Self {
        self.preferred_time = Some(time);
        self.exact = true;
        self.max_results = 1;
        self
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.party_size == 0 || self.party_size > MAX_PARTY_SIZE {
            return Err(EngineError::InvalidPartySize(self.party_size));
        }
        if self.max_results > MAX_RESULTS {
            return Err(EngineError::LimitExceeded("too many results requested"));
        }
        if self.interval < MIN_SLOT_INTERVAL {
            return Err(EngineError::LimitExceeded("slot interval too fine"));
        }
        if let Some(d) = self.duration
            && (d == 0 || d > MAX_DURATION)
        {
            return Err(EngineError::LimitExceeded("duration out of range"));
        }
        if let Some(t) = self.preferred_time
            && t >= MINUTES_PER_DAY
        {
            return Err(EngineError::InvalidTimeFormat(format_hhmm(t)));
        }
        Ok(())
    }
}

/// A capacity-suitable table and its active occupancies for one date,
/// copied out under the table's read lock.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub id: Ulid,
    pub name: String,
    pub capacity: PartyRange,
    pub occupancies: Vec<Occupancy>,
}

/// Walk the candidate grid and emit at most one slot per start time, each
/// resolved to the snuggest free table.
pub fn compute_slots(
    profile: &OperatingProfile,
    date: NaiveDate,
    tables: &[TableSnapshot],
    query: &SlotQuery,
) -> Vec<AvailabilitySlot> {
    let duration = query.duration.unwrap_or(profile.default_duration());
    let suitable: Vec<&TableSnapshot> = tables
        .iter()
        .filter(|t| t.capacity.contains(query.party_size))
        .collect();
    if suitable.is_empty() || query.max_results == 0 {
        return Vec::new();
    }

    let starts: Vec<Minutes> = match (query.exact, query.preferred_time) {
        (true, Some(t)) => {
            let within = t >= profile.open() && t + duration <= profile.close();
            if within { vec![t] } else { Vec::new() }
        }
        _ => {
            let mut starts =
                generate_candidate_starts(profile.open(), profile.close(), query.interval, duration);
            if let Some(preferred) = query.preferred_time {
                order_by_preference(&mut starts, preferred);
            }
            starts
        }
    };

    let mut slots = Vec::new();
    for start in starts {
        if slots.len() >= query.max_results {
            break;
        }
        let free: Vec<&TableSnapshot> = suitable
            .iter()
            .copied()
            .filter(|t| is_free(start, duration, &t.occupancies, profile.default_duration()))
            .collect();
        if let Some(best) = pick_best(&free, query.party_size) {
            slots.push(AvailabilitySlot {
                date,
                start,
                time: format_hhmm(start),
                time_display: format_for_display(start),
                table_id: best.id,
                table_name: best.name.clone(),
                capacity: best.capacity,
            });
        }
    }
    slots
}

impl Engine {
    /// Open slots for `date`, best table per time, served from the cache
    /// when possible.
    pub fn find_slots(&self, date: NaiveDate, query: &SlotQuery) -> Result<Vec<AvailabilitySlot>, EngineError> {
        Ok(self.find_slots_cached(date, query)?.as_ref().clone())
    }

    pub(super) fn find_slots_cached(&self, date: NaiveDate, query: &SlotQuery) -> Result<CachedSlots, EngineError> {
        self.touch();
        query.validate()?;
        if let Some(hit) = self.cache().get(self.restaurant_id(), date, query) {
            metrics::counter!(SLOT_QUERIES_TOTAL, "source" => "cache").increment(1);
            return Ok(hit);
        }
        // Captured before the snapshot; a write that lands in between makes
        // the insert below a no-op.
        let generation = self.cache().generation(self.restaurant_id(), date);
        let slots = Arc::new(self.compute_fresh(date, query, None)?);
        self.cache()
            .insert(self.restaurant_id(), date, query.clone(), slots.clone(), generation);
        Ok(slots)
    }

    /// Uncached search. `exclude` hides one reservation from the scan so an
    /// edit does not conflict with itself.
    pub(super) fn compute_fresh(
        &self,
        date: NaiveDate,
        query: &SlotQuery,
        exclude: Option<Ulid>,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        query.validate()?;
        let profile = self.profile()?;
        let started = Instant::now();

        let tables = self.snapshot_tables(date, query.party_size, exclude);
        let slots = if tables.is_empty() {
            Vec::new()
        } else {
            compute_slots(&profile, date, &tables, query)
        };

        metrics::counter!(SLOT_QUERIES_TOTAL, "source" => "computed").increment(1);
        metrics::histogram!(SLOT_QUERY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        debug!(
            restaurant = %self.restaurant_id(),
            %date,
            party = query.party_size,
            tables = tables.len(),
            slots = slots.len(),
            "computed availability"
        );
        Ok(slots)
    }

    /// One pass over the tables: skip those out of service or the wrong size,
    /// copy the active occupancies for `date` from the rest.
    fn snapshot_tables(&self, date: NaiveDate, party_size: u32, exclude: Option<Ulid>) -> Vec<TableSnapshot> {
        let mut snapshots = Vec::new();
        for lock in self.table_locks() {
            let ts = read_table(&lock);
            if ts.unavailable || !ts.capacity.contains(party_size) {
                continue;
            }
            snapshots.push(TableSnapshot {
                id: ts.id,
                name: ts.name.clone(),
                capacity: ts.capacity,
                occupancies: ts
                    .active_on(date)
                    .filter(|r| Some(r.id) != exclude)
                    .map(Occupancy::from)
                    .collect(),
            });
        }
        snapshots
    }
}
