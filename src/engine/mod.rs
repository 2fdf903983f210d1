mod availability;
mod conflict;
mod error;
mod lifecycle;
mod queries;
mod selector;

pub use availability::{SlotQuery, TableSnapshot, compute_slots};
pub use conflict::{Occupancy, is_free};
pub use error::EngineError;
pub use lifecycle::normalize_phone;
pub use selector::pick_best;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use tracing::{debug, info};
use ulid::Ulid;

use crate::cache::ResultCache;
use crate::config::Config;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedTableState = Arc<RwLock<TableState>>;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn read_table(lock: &RwLock<TableState>) -> RwLockReadGuard<'_, TableState> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_table(lock: &RwLock<TableState>) -> RwLockWriteGuard<'_, TableState> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: SyncSender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: SyncSender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: SyncSender<u64>,
    },
}

/// Writer thread that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single commit for the whole batch.
/// 5. Respond to all senders.
fn wal_writer_loop(mut wal: Wal, rx: Receiver<WalCommand>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("{}: WAL writer stopped", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, SyncSender<io::Result<()>>)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut append_err = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Commit even after an append error so partial bytes don't leak into
    // the next batch; every caller in this batch is told it failed.
    let commit_err = wal.commit().err();
    let result = match append_err.or(commit_err) {
        Some(e) => Err(e),
        None => Ok(()),
    };
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Availability and reservation engine for one restaurant.
pub struct Engine {
    restaurant_id: String,
    tables: DashMap<Ulid, SharedTableState>,
    /// Reverse lookup: reservation id → table id.
    reservation_index: DashMap<Ulid, Ulid>,
    guests: DashMap<Ulid, Guest>,
    guests_by_phone: DashMap<String, Ulid>,
    /// Serializes guest registration so one phone maps to one guest.
    guest_registration: Mutex<()>,
    profile: RwLock<Option<OperatingProfile>>,
    /// Mutations hold this shared; compaction holds it exclusively so its
    /// snapshot cannot miss an append. Always taken before any table lock.
    write_gate: RwLock<()>,
    wal_tx: Sender<WalCommand>,
    cache: Arc<ResultCache>,
    pub notify: Arc<NotifyHub>,
    config: Arc<Config>,
    last_used_ms: AtomicI64,
}

impl Engine {
    pub fn open(
        restaurant_id: &str,
        wal_path: PathBuf,
        cache: Arc<ResultCache>,
        config: Arc<Config>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel();
        std::thread::Builder::new()
            .name(format!("wal-{restaurant_id}"))
            .spawn(move || wal_writer_loop(wal, wal_rx))?;

        let engine = Self {
            restaurant_id: restaurant_id.to_string(),
            tables: DashMap::new(),
            reservation_index: DashMap::new(),
            guests: DashMap::new(),
            guests_by_phone: DashMap::new(),
            guest_registration: Mutex::new(()),
            profile: RwLock::new(None),
            write_gate: RwLock::new(()),
            wal_tx,
            cache,
            notify: Arc::new(NotifyHub::new()),
            config,
            last_used_ms: AtomicI64::new(now_ms()),
        };

        let replayed = events.len();
        for event in &events {
            engine.replay_event(event);
        }
        if let Ok(profile) = engine.profile() {
            engine.refresh_all_statuses_at(profile.local_now());
        }
        info!(
            "{restaurant_id}: replayed {replayed} events ({} tables, {} reservations)",
            engine.tables.len(),
            engine.reservation_index.len()
        );
        Ok(engine)
    }

    /// Replay runs before the engine is shared, so every lock is uncontended.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::ReservationMoved {
                from_table,
                to_table,
                ..
            } if from_table != to_table => {
                let (Some(from), Some(to)) = (self.get_table(from_table), self.get_table(to_table))
                else {
                    return;
                };
                let mut from = write_table(&from);
                let mut to = write_table(&to);
                move_between_tables(&mut from, &mut to, event, &self.reservation_index);
            }
            other => match other.table_id() {
                Some(table_id)
                    if !matches!(other, Event::TableCreated { .. } | Event::TableDeleted { .. }) =>
                {
                    if let Some(lock) = self.get_table(&table_id) {
                        apply_to_table(&mut write_table(&lock), other, &self.reservation_index);
                    }
                }
                _ => self.apply_global(other),
            },
        }
    }

    /// Apply events that live outside any single table.
    fn apply_global(&self, event: &Event) {
        match event {
            Event::ProfileUpdated { profile } => {
                *self.profile.write().unwrap_or_else(PoisonError::into_inner) = Some(profile.clone());
            }
            Event::TableCreated { id, name, capacity } => {
                let ts = TableState::new(*id, name.clone(), *capacity);
                self.tables.insert(*id, Arc::new(RwLock::new(ts)));
            }
            Event::TableDeleted { id } => {
                if let Some((_, lock)) = self.tables.remove(id) {
                    for r in &read_table(&lock).reservations {
                        self.reservation_index.remove(&r.id);
                    }
                }
            }
            Event::GuestRegistered { guest } => {
                self.guests_by_phone.insert(guest.phone.clone(), guest.id);
                self.guests.insert(guest.id, guest.clone());
            }
            _ => {}
        }
    }

    /// Send an event to the writer thread and wait for it to be durable.
    fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.recv()
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify for an event scoped to one table.
    pub(super) fn persist_and_apply(&self, ts: &mut TableState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event)?;
        apply_to_table(ts, event, &self.reservation_index);
        self.notify.send(event);
        Ok(())
    }

    /// WAL-append + apply + notify for a restaurant-level event.
    pub(super) fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event)?;
        self.apply_global(event);
        self.notify.send(event);
        Ok(())
    }

    /// Cross-table move. Caller holds both write locks.
    pub(super) fn persist_move(
        &self,
        from: &mut TableState,
        to: &mut TableState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event)?;
        move_between_tables(from, to, event, &self.reservation_index);
        self.notify.send(event);
        Ok(())
    }

    pub(super) fn write_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.write_gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn restaurant_id(&self) -> &str {
        &self.restaurant_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn get_table(&self, id: &Ulid) -> Option<SharedTableState> {
        self.tables.get(id).map(|e| e.value().clone())
    }

    /// Every table lock, cloned out so no DashMap shard is held while locking.
    pub(super) fn table_locks(&self) -> Vec<SharedTableState> {
        self.tables.iter().map(|e| e.value().clone()).collect()
    }

    pub fn table_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    /// Reservation → (table id, table lock).
    pub(super) fn resolve_reservation(&self, id: &Ulid) -> Result<(Ulid, SharedTableState), EngineError> {
        let table_id = self.table_for_reservation(id).ok_or(EngineError::NotFound(*id))?;
        let lock = self.get_table(&table_id).ok_or(EngineError::NotFound(table_id))?;
        Ok((table_id, lock))
    }

    /// The restaurant's validated operating profile.
    pub fn profile(&self) -> Result<OperatingProfile, EngineError> {
        let guard = self.profile.read().unwrap_or_else(PoisonError::into_inner);
        let profile = guard
            .clone()
            .ok_or_else(|| EngineError::ConfigurationError("no operating profile configured".into()))?;
        profile.validate()?;
        Ok(profile)
    }

    /// Restaurant wall clock, falling back to UTC before a profile exists.
    pub fn local_now(&self) -> NaiveDateTime {
        self.profile()
            .map(|p| p.local_now())
            .unwrap_or_else(|_| chrono::Utc::now().naive_utc())
    }

    pub(super) fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub(super) fn touch(&self) {
        self.last_used_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let idle = now_ms() - self.last_used_ms.load(Ordering::Relaxed);
        Duration::from_millis(idle.max(0) as u64)
    }
}

/// Apply a table-scoped event. Caller holds the table's write lock.
fn apply_to_table(ts: &mut TableState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::TableUpdated {
            name,
            capacity,
            unavailable,
            ..
        } => {
            ts.name = name.clone();
            ts.capacity = *capacity;
            ts.unavailable = *unavailable;
            if *unavailable {
                ts.status = TableStatus::Unavailable;
            } else if ts.status == TableStatus::Unavailable {
                ts.status = TableStatus::Free;
            }
        }
        Event::ReservationCreated { reservation } => {
            index.insert(reservation.id, ts.id);
            ts.insert_reservation(reservation.clone());
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = ts.reservation_mut(*id) {
                r.status = *status;
            }
        }
        Event::ReservationMoved { id, .. } => {
            // Same-table edit: re-insert to keep the sort order.
            if let Some(mut r) = ts.remove_reservation(*id) {
                reschedule_in_place(&mut r, event);
                ts.insert_reservation(r);
            }
        }
        // Restaurant-level events are handled by `Engine::apply_global`.
        Event::ProfileUpdated { .. }
        | Event::TableCreated { .. }
        | Event::TableDeleted { .. }
        | Event::GuestRegistered { .. } => {}
    }
}

fn move_between_tables(
    from: &mut TableState,
    to: &mut TableState,
    event: &Event,
    index: &DashMap<Ulid, Ulid>,
) {
    let Event::ReservationMoved { id, .. } = event else {
        return;
    };
    if let Some(mut r) = from.remove_reservation(*id) {
        reschedule_in_place(&mut r, event);
        r.table_id = to.id;
        index.insert(r.id, to.id);
        to.insert_reservation(r);
    }
}

fn reschedule_in_place(r: &mut Reservation, event: &Event) {
    if let Event::ReservationMoved {
        date,
        start,
        duration,
        party_size,
        pinned,
        ..
    } = event
    {
        r.date = *date;
        r.start = StartTime::At(*start);
        r.duration = Some(*duration);
        r.party_size = *party_size;
        r.pinned = *pinned;
    }
}
