use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::cache::ResultCache;
use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::observability::RESTAURANTS_ACTIVE;
use crate::slots::{format_for_display, parse_date, parse_time};

/// Owns one engine per restaurant, opened lazily on first use. Each engine
/// has its own WAL file; all of them share one result cache.
pub struct RestaurantRegistry {
    engines: DashMap<String, Arc<Engine>>,
    cache: Arc<ResultCache>,
    config: Arc<Config>,
}

/// Strip everything but alphanumerics, `_` and `-` so the id is safe as a
/// file name.
fn sanitize(restaurant_id: &str) -> Result<String, EngineError> {
    if restaurant_id.len() > MAX_RESTAURANT_ID_LEN {
        return Err(EngineError::LimitExceeded("restaurant id too long"));
    }
    let safe: String = restaurant_id
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(EngineError::InvalidId(restaurant_id.to_string()));
    }
    Ok(safe)
}

fn parse_id(raw: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(raw.trim()).map_err(|_| EngineError::InvalidId(raw.to_string()))
}

impl RestaurantRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            engines: DashMap::new(),
            cache: Arc::new(ResultCache::new(config.cache_ttl)),
            config: Arc::new(config),
        }
    }

    /// Get or lazily open the engine for a restaurant.
    pub fn get_or_open(&self, restaurant_id: &str) -> Result<Arc<Engine>, EngineError> {
        let key = sanitize(restaurant_id)?;
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_RESTAURANTS {
            return Err(EngineError::LimitExceeded("too many restaurants"));
        }

        // The entry guard keeps a second caller from replaying the same WAL.
        let engine = match self.engines.entry(key.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                std::fs::create_dir_all(&self.config.data_dir)
                    .map_err(|e| EngineError::WalError(e.to_string()))?;
                let wal_path = self.config.data_dir.join(format!("{key}.wal"));
                let engine = Engine::open(&key, wal_path, self.cache.clone(), self.config.clone())
                    .map_err(|e| EngineError::WalError(e.to_string()))?;
                slot.insert(Arc::new(engine)).clone()
            }
        };
        metrics::gauge!(RESTAURANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Currently loaded engines.
    pub fn engines(&self) -> Vec<Arc<Engine>> {
        self.engines.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Drop engines idle for at least `max_idle` that nobody else holds.
    /// Their state stays in the WAL and comes back on the next request.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut evicted = Vec::new();
        self.engines.retain(|key, engine| {
            let idle = Arc::strong_count(engine) == 1 && engine.idle_for() >= max_idle;
            if idle {
                evicted.push(key.clone());
            }
            !idle
        });
        for key in &evicted {
            self.cache.invalidate_restaurant(key);
            info!("{key}: evicted idle engine");
        }
        metrics::gauge!(RESTAURANTS_ACTIVE).set(self.engines.len() as f64);
        evicted.len()
    }

    // ── String-typed boundary ────────────────────────────────

    /// Open slots for a day. Date and time are validated before anything is
    /// loaded.
    pub fn find_slots(
        &self,
        restaurant_id: &str,
        date: &str,
        party_size: u32,
        preferred_time: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        let date = parse_date(date)?;
        let preferred = preferred_time.map(parse_time).transpose()?;
        let engine = self.get_or_open(restaurant_id)?;
        let mut query = self.config.slot_query(party_size);
        if let Some(t) = preferred {
            query = query.preferred(t);
        }
        if let Some(n) = max_results {
            query = query.max_results(n);
        }
        engine.find_slots(date, &query)
    }

    /// Book from a form. Never fails outright: the outcome, a message and
    /// alternatives when the time was taken all travel in the result.
    pub fn create_reservation(&self, restaurant_id: &str, form: &BookingForm) -> BookingResult {
        let (engine, request) = match self
            .get_or_open(restaurant_id)
            .and_then(|engine| Ok((engine, form.to_request()?)))
        {
            Ok(pair) => pair,
            Err(e) => return BookingResult::from(Err(e)),
        };
        let outcome = engine.create_reservation(&request);
        let no_availability = matches!(outcome, Err(EngineError::NoAvailability { .. }));
        let mut result = BookingResult::from(outcome);
        if no_availability {
            match engine.alternatives(&request, self.config.max_results) {
                Ok(alternatives) => result.alternatives = alternatives,
                Err(e) => debug!("{restaurant_id}: no alternatives: {e}"),
            }
        }
        result
    }

    pub fn cancel_reservation(&self, restaurant_id: &str, reservation_id: &str) -> OpResult {
        let outcome = parse_id(reservation_id).and_then(|id| {
            let engine = self.get_or_open(restaurant_id)?;
            engine.cancel_reservation(id)
        });
        match outcome {
            Ok(r) => OpResult {
                success: true,
                message: format!("reservation {} canceled", r.id),
            },
            Err(e) => OpResult {
                success: false,
                message: e.to_string(),
            },
        }
    }

    pub fn update_reservation(
        &self,
        restaurant_id: &str,
        reservation_id: &str,
        form: &UpdateForm,
    ) -> Result<Reservation, EngineError> {
        let id = parse_id(reservation_id)?;
        let update = form.to_update()?;
        self.get_or_open(restaurant_id)?.update_reservation(id, &update)
    }

    /// Bookable times near the requested one, without booking anything.
    pub fn alternatives(
        &self,
        restaurant_id: &str,
        form: &BookingForm,
        n: usize,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        let request = form.to_request()?;
        self.get_or_open(restaurant_id)?.alternatives(&request, n)
    }
}

// ── Boundary types ───────────────────────────────────────────────

/// A booking request as a collaborator hands it over.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingForm {
    pub date: String,
    pub time: String,
    pub party_size: u32,
    /// Either an existing guest id or a phone number is required.
    pub guest_id: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub duration: Option<Minutes>,
    pub comments: Option<String>,
    pub source: Option<String>,
}

impl BookingForm {
    pub fn to_request(&self) -> Result<ReservationRequest, EngineError> {
        let date = parse_date(&self.date)?;
        let time = parse_time(&self.time)?;
        let guest = match (&self.guest_id, &self.phone) {
            (Some(id), _) => GuestRef::Id(parse_id(id)?),
            (None, Some(phone)) => GuestRef::Contact {
                phone: phone.clone(),
                name: self.name.clone(),
            },
            (None, None) => return Err(EngineError::InvalidPhone(String::new())),
        };
        Ok(ReservationRequest {
            guest,
            date,
            time,
            party_size: self.party_size,
            duration: self.duration,
            comments: self.comments.clone(),
            source: self.source.clone(),
        })
    }
}

/// Partial edit as a collaborator hands it over.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateForm {
    pub date: Option<String>,
    pub time: Option<String>,
    pub party_size: Option<u32>,
    pub status: Option<String>,
    pub pinned: Option<bool>,
}

impl UpdateForm {
    pub fn to_update(&self) -> Result<ReservationUpdate, EngineError> {
        Ok(ReservationUpdate {
            date: self.date.as_deref().map(parse_date).transpose()?,
            time: self.time.as_deref().map(parse_time).transpose()?,
            party_size: self.party_size,
            status: self.status.as_deref().map(str::parse::<ReservationStatus>).transpose()?,
            pinned: self.pinned,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingResult {
    pub success: bool,
    pub reservation: Option<Reservation>,
    pub table: Option<TableInfo>,
    pub message: String,
    pub alternatives: Vec<AvailabilitySlot>,
    /// Machine-readable failure kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl From<Result<Booking, EngineError>> for BookingResult {
    fn from(outcome: Result<Booking, EngineError>) -> Self {
        match outcome {
            Ok(Booking { reservation, table }) => {
                let time = reservation
                    .start
                    .minutes()
                    .map(format_for_display)
                    .unwrap_or_default();
                Self {
                    success: true,
                    message: format!(
                        "Table {} is reserved for {} on {} at {}",
                        table.name, reservation.party_size, reservation.date, time
                    ),
                    reservation: Some(reservation),
                    table: Some(table),
                    alternatives: Vec::new(),
                    error: None,
                }
            }
            Err(e) => Self {
                success: false,
                reservation: None,
                table: None,
                message: e.to_string(),
                alternatives: Vec::new(),
                error: Some(e.kind()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpResult {
    pub success: bool,
    pub message: String,
}
