use std::sync::mpsc;
use std::sync::PoisonError;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::DEFAULT_SOURCE;
use crate::limits::*;
use crate::model::*;
use crate::observability::{CONFLICTS_LOST_TOTAL, record_reservation_op};
use crate::slots::parse_time;

use super::conflict::{check_no_conflict, verify_fit, within_hours};
use super::{Engine, EngineError, WalCommand, now_ms, read_table, write_table};

/// Keep the digits and a leading `+`. Spaces, dashes, dots and parentheses
/// are accepted as separators; anything else is rejected.
pub fn normalize_phone(raw: &str) -> Result<String, EngineError> {
    let trimmed = raw.trim();
    let separators = [' ', '-', '.', '(', ')'];
    let mut out = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.chars().enumerate() {
        match c {
            '+' if i == 0 => out.push('+'),
            d if d.is_ascii_digit() => out.push(d),
            s if separators.contains(&s) => {}
            _ => return Err(EngineError::InvalidPhone(raw.to_string())),
        }
    }
    let digits = out.len() - usize::from(out.starts_with('+'));
    if !(5..=MAX_PHONE_LEN).contains(&digits) {
        return Err(EngineError::InvalidPhone(raw.to_string()));
    }
    Ok(out)
}

fn minute_of_day(now: NaiveDateTime) -> Minutes {
    now.time().num_seconds_from_midnight() / 60
}

/// Occupied if an active window covers `now`, Reserved if one is still ahead.
fn derive_status(ts: &TableState, now: NaiveDateTime, default_duration: Minutes) -> TableStatus {
    if ts.unavailable {
        return TableStatus::Unavailable;
    }
    let today = now.date();
    let minute = minute_of_day(now);
    let from = ts.reservations.partition_point(|r| r.date < today);
    let mut upcoming = false;
    for r in ts.reservations[from..].iter().filter(|r| r.is_active()) {
        if r.date > today {
            upcoming = true;
            continue;
        }
        match r.window(default_duration) {
            Some(w) if w.contains_instant(minute) => return TableStatus::Occupied,
            Some(w) if w.start > minute => upcoming = true,
            _ => {}
        }
    }
    if upcoming { TableStatus::Reserved } else { TableStatus::Free }
}

fn has_elapsed(r: &Reservation, today: NaiveDate, minute: Minutes, default_duration: Minutes) -> bool {
    if r.date < today {
        return true;
    }
    r.date == today && r.window(default_duration).is_some_and(|w| w.end <= minute)
}

fn check_text(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn check_party_size(party_size: u32) -> Result<(), EngineError> {
    if party_size == 0 || party_size > MAX_PARTY_SIZE {
        return Err(EngineError::InvalidPartySize(party_size));
    }
    Ok(())
}

fn check_duration(duration: Option<Minutes>) -> Result<(), EngineError> {
    match duration {
        Some(d) if d == 0 || d > MAX_DURATION => Err(EngineError::LimitExceeded("duration out of range")),
        _ => Ok(()),
    }
}

fn validate_request(req: &ReservationRequest) -> Result<(), EngineError> {
    check_party_size(req.party_size)?;
    if req.time >= MINUTES_PER_DAY {
        return Err(EngineError::InvalidTimeFormat(crate::slots::format_hhmm(req.time)));
    }
    check_duration(req.duration)?;
    check_text(req.comments.as_deref(), MAX_COMMENT_LEN, "comments too long")?;
    check_text(req.source.as_deref(), MAX_SOURCE_LEN, "source tag too long")?;
    if let GuestRef::Contact { phone, name } = &req.guest {
        normalize_phone(phone)?;
        check_text(name.as_deref(), MAX_NAME_LEN, "guest name too long")?;
    }
    Ok(())
}

impl Engine {
    // ── Profile & tables ─────────────────────────────────────

    pub fn set_profile(&self, profile: OperatingProfile) -> Result<(), EngineError> {
        profile.validate()?;
        // Exclusive: no booking may be checked against the old hours while
        // the new ones land.
        let _exclusive = self.write_gate.write().unwrap_or_else(PoisonError::into_inner);
        self.touch();
        self.persist_global(&Event::ProfileUpdated {
            profile: profile.clone(),
        })?;
        self.cache.invalidate_restaurant(&self.restaurant_id);
        self.refresh_all_statuses_at(profile.local_now());
        info!(
            "{}: operating hours {} to {}, default seating {} min",
            self.restaurant_id,
            crate::slots::format_hhmm(profile.open()),
            crate::slots::format_hhmm(profile.close()),
            profile.default_duration()
        );
        Ok(())
    }

    pub fn create_table(&self, id: Ulid, name: String, capacity: PartyRange) -> Result<TableInfo, EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("table name too long"));
        }
        let _gate = self.write_gate();
        self.touch();
        if self.tables.len() >= MAX_TABLES_PER_RESTAURANT {
            return Err(EngineError::LimitExceeded("too many tables"));
        }
        if self.tables.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_global(&Event::TableCreated { id, name, capacity })?;
        self.cache.invalidate_restaurant(&self.restaurant_id);
        let lock = self.get_table(&id).ok_or(EngineError::NotFound(id))?;
        let info = read_table(&lock).info();
        Ok(info)
    }

    pub fn update_table(
        &self,
        id: Ulid,
        name: String,
        capacity: PartyRange,
        unavailable: bool,
    ) -> Result<TableInfo, EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("table name too long"));
        }
        let _gate = self.write_gate();
        self.touch();
        let lock = self.get_table(&id).ok_or(EngineError::NotFound(id))?;
        let mut ts = write_table(&lock);
        if !self.tables.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        // Existing bookings must still fit the new capacity.
        if ts
            .reservations
            .iter()
            .any(|r| r.is_active() && !capacity.contains(r.party_size))
        {
            return Err(EngineError::TableInUse(id));
        }
        let event = Event::TableUpdated {
            id,
            name,
            capacity,
            unavailable,
        };
        self.persist_and_apply(&mut ts, &event)?;
        self.cache.invalidate_restaurant(&self.restaurant_id);
        self.refresh_locked(&mut ts);
        Ok(ts.info())
    }

    /// Refused while any active reservation still points at the table.
    pub fn delete_table(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate();
        self.touch();
        let lock = self.get_table(&id).ok_or(EngineError::NotFound(id))?;
        let ts = write_table(&lock);
        if ts.has_active_reservations() {
            return Err(EngineError::TableInUse(id));
        }
        let event = Event::TableDeleted { id };
        self.wal_append(&event)?;
        // Removed under the table lock so a writer queued on it sees the table gone.
        self.tables.remove(&id);
        for r in &ts.reservations {
            self.reservation_index.remove(&r.id);
        }
        drop(ts);
        self.notify.send(&event);
        self.notify.remove(&id);
        self.cache.invalidate_restaurant(&self.restaurant_id);
        info!("{}: deleted table {id}", self.restaurant_id);
        Ok(())
    }

    // ── Guests ───────────────────────────────────────────────

    /// Look up a guest by phone, registering them on first sight.
    pub fn register_guest(&self, phone: &str, name: Option<String>) -> Result<Guest, EngineError> {
        let _gate = self.write_gate();
        self.touch();
        self.register_guest_locked(phone, name)
    }

    /// Caller holds the write gate.
    fn register_guest_locked(&self, phone: &str, name: Option<String>) -> Result<Guest, EngineError> {
        let phone = normalize_phone(phone)?;
        check_text(name.as_deref(), MAX_NAME_LEN, "guest name too long")?;
        let _serial = self
            .guest_registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = self.guests_by_phone.get(&phone).map(|e| *e.value())
            && let Some(existing) = self.guests.get(&id)
        {
            return Ok(existing.value().clone());
        }
        let guest = Guest {
            id: Ulid::new(),
            phone,
            name,
        };
        self.persist_global(&Event::GuestRegistered {
            guest: guest.clone(),
        })?;
        Ok(guest)
    }

    fn resolve_guest_locked(&self, guest: &GuestRef) -> Result<Ulid, EngineError> {
        match guest {
            GuestRef::Id(id) if self.guests.contains_key(id) => Ok(*id),
            GuestRef::Id(id) => Err(EngineError::NotFound(*id)),
            GuestRef::Contact { phone, name } => {
                self.register_guest_locked(phone, name.clone()).map(|g| g.id)
            }
        }
    }

    // ── Booking ──────────────────────────────────────────────

    /// Book the requested time on the best free table.
    ///
    /// The search runs over snapshots without holding any table lock; the
    /// chosen table is then locked and re-checked before anything is written.
    /// If another writer got there first the whole search runs again with the
    /// cache bypassed, up to `booking_retries` more times.
    pub fn create_reservation(&self, req: &ReservationRequest) -> Result<Booking, EngineError> {
        let result = self.try_create(req);
        match &result {
            Ok(b) => info!(
                "{}: booked {} for {} on {} at {} (table {})",
                self.restaurant_id,
                b.reservation.id,
                b.reservation.party_size,
                b.reservation.date,
                crate::slots::format_hhmm(req.time),
                b.table.name
            ),
            Err(e @ EngineError::NoAvailability { .. }) => debug!("{}: {e}", self.restaurant_id),
            Err(_) => {}
        }
        record_reservation_op("create", &result);
        result
    }

    fn try_create(&self, req: &ReservationRequest) -> Result<Booking, EngineError> {
        validate_request(req)?;
        let _gate = self.write_gate();
        let profile = self.profile()?;
        self.touch();

        let source = req
            .source
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SOURCE)
            .to_ascii_lowercase();
        let status = if self.config.is_trusted(&source) {
            ReservationStatus::Confirmed
        } else {
            ReservationStatus::Created
        };
        let query = self
            .config
            .slot_query(req.party_size)
            .duration(req.duration)
            .exact_at(req.time);

        let mut guest_id = None;
        let mut attempt = 0;
        loop {
            let slots = if attempt == 0 {
                self.find_slots_cached(req.date, &query)?
            } else {
                std::sync::Arc::new(self.compute_fresh(req.date, &query, None)?)
            };
            let Some(slot) = slots.first() else {
                return Err(EngineError::NoAvailability {
                    request: Box::new(req.clone()),
                });
            };
            let guest = match guest_id {
                Some(g) => g,
                None => *guest_id.insert(self.resolve_guest_locked(&req.guest)?),
            };
            match self.commit_new(&profile, req, guest, slot, status, &source) {
                Err(EngineError::ConflictLost { table_id, blocking }) if attempt < self.config.booking_retries => {
                    metrics::counter!(CONFLICTS_LOST_TOTAL).increment(1);
                    debug!(
                        "{}: lost table {table_id} to {blocking:?}, searching again",
                        self.restaurant_id
                    );
                    attempt += 1;
                }
                Err(e @ EngineError::ConflictLost { .. }) => {
                    metrics::counter!(CONFLICTS_LOST_TOTAL).increment(1);
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Lock the slot's table, re-check it, then write.
    fn commit_new(
        &self,
        profile: &OperatingProfile,
        req: &ReservationRequest,
        guest_id: Ulid,
        slot: &AvailabilitySlot,
        status: ReservationStatus,
        source: &str,
    ) -> Result<Booking, EngineError> {
        let gone = EngineError::ConflictLost {
            table_id: slot.table_id,
            blocking: None,
        };
        let Some(lock) = self.get_table(&slot.table_id) else {
            return Err(gone);
        };
        let mut ts = write_table(&lock);
        if !self.tables.contains_key(&ts.id) {
            return Err(gone);
        }
        if ts.reservations.len() >= MAX_RESERVATIONS_PER_TABLE {
            return Err(EngineError::LimitExceeded("too many reservations on table"));
        }

        let duration = req.duration.unwrap_or(profile.default_duration());
        let span = Span::new(slot.start, slot.start + duration);
        verify_fit(&ts, profile, req.date, &span, req.party_size, None)?;

        let reservation = Reservation {
            id: Ulid::new(),
            table_id: ts.id,
            guest_id,
            date: req.date,
            start: StartTime::At(slot.start),
            duration: Some(duration),
            party_size: req.party_size,
            status,
            source: source.to_string(),
            comments: req.comments.clone(),
            pinned: false,
            created_at: now_ms(),
        };
        self.persist_and_apply(
            &mut ts,
            &Event::ReservationCreated {
                reservation: reservation.clone(),
            },
        )?;
        self.cache.invalidate_date(&self.restaurant_id, req.date);
        self.refresh_locked(&mut ts);
        Ok(Booking {
            reservation,
            table: ts.info(),
        })
    }

    /// Bring in a row from a previous system onto a given table. Start times
    /// that do not parse are kept verbatim and never block anything.
    pub fn import_reservation(&self, row: &ImportedReservation) -> Result<Reservation, EngineError> {
        let result = self.try_import(row);
        record_reservation_op("import", &result);
        result
    }

    fn try_import(&self, row: &ImportedReservation) -> Result<Reservation, EngineError> {
        check_party_size(row.party_size)?;
        check_duration(row.duration)?;
        check_text(row.comments.as_deref(), MAX_COMMENT_LEN, "comments too long")?;
        check_text(Some(&row.source), MAX_SOURCE_LEN, "source tag too long")?;
        let _gate = self.write_gate();
        let profile = self.profile()?;
        self.touch();

        let start = match parse_time(&row.time) {
            Ok(m) => StartTime::At(m),
            Err(_) => {
                warn!(
                    "{}: importing reservation on {} with unparseable start {:?}",
                    self.restaurant_id, row.date, row.time
                );
                StartTime::Unparsed(row.time.clone())
            }
        };
        let guest_id = self.resolve_guest_locked(&row.guest)?;

        let lock = self
            .get_table(&row.table_id)
            .ok_or(EngineError::NotFound(row.table_id))?;
        let mut ts = write_table(&lock);
        if !self.tables.contains_key(&ts.id) {
            return Err(EngineError::NotFound(row.table_id));
        }
        if ts.reservations.len() >= MAX_RESERVATIONS_PER_TABLE {
            return Err(EngineError::LimitExceeded("too many reservations on table"));
        }
        // Capacity and hours hold for every row; only active rows occupy.
        // The service flag is not consulted: legacy rows may sit on a table
        // that is out of service today.
        let misfit = EngineError::ConflictLost {
            table_id: ts.id,
            blocking: None,
        };
        if !ts.capacity.contains(row.party_size) {
            return Err(misfit);
        }
        if let StartTime::At(m) = start {
            let span = Span::new(m, m + row.duration.unwrap_or(profile.default_duration()));
            if !within_hours(&profile, &span) {
                return Err(misfit);
            }
            if row.status.is_active() {
                check_no_conflict(&ts, row.date, &span, profile.default_duration(), None)?;
            }
        }

        let reservation = Reservation {
            id: Ulid::new(),
            table_id: ts.id,
            guest_id,
            date: row.date,
            start,
            duration: row.duration,
            party_size: row.party_size,
            status: row.status,
            source: row.source.trim().to_ascii_lowercase(),
            comments: row.comments.clone(),
            pinned: false,
            created_at: now_ms(),
        };
        self.persist_and_apply(
            &mut ts,
            &Event::ReservationCreated {
                reservation: reservation.clone(),
            },
        )?;
        self.cache.invalidate_date(&self.restaurant_id, row.date);
        self.refresh_locked(&mut ts);
        Ok(reservation)
    }

    // ── Status transitions ───────────────────────────────────

    pub fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.write_gate();
        let result = self.transition_locked(id, ReservationStatus::Canceled);
        record_reservation_op("cancel", &result);
        result
    }

    pub fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.write_gate();
        let result = self.transition_locked(id, ReservationStatus::Confirmed);
        record_reservation_op("confirm", &result);
        result
    }

    pub fn complete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.write_gate();
        let result = self.transition_locked(id, ReservationStatus::Completed);
        record_reservation_op("complete", &result);
        result
    }

    /// Caller holds the write gate.
    fn transition_locked(&self, id: Ulid, next: ReservationStatus) -> Result<Reservation, EngineError> {
        self.touch();
        self.with_reservation(id, |ts| {
            let (from, date) = match ts.reservation(id) {
                Some(r) => (r.status, r.date),
                None => return Err(EngineError::NotFound(id)),
            };
            if from == ReservationStatus::Canceled && next == ReservationStatus::Canceled {
                return Err(EngineError::AlreadyCanceled(id));
            }
            if !from.can_transition_to(next) {
                return Err(EngineError::InvalidTransition { id, from, to: next });
            }
            let event = Event::ReservationStatusChanged {
                id,
                table_id: ts.id,
                status: next,
            };
            self.persist_and_apply(ts, &event)?;
            if next.is_terminal() {
                self.cache.invalidate_date(&self.restaurant_id, date);
            }
            self.refresh_locked(ts);
            debug!("{}: reservation {id} {from} → {next}", self.restaurant_id);
            ts.reservation(id).cloned().ok_or(EngineError::NotFound(id))
        })
    }

    /// Run `f` with the write lock of the table that holds reservation `id`.
    /// Re-resolves if the reservation moved between lookup and lock.
    fn with_reservation<R>(
        &self,
        id: Ulid,
        f: impl FnOnce(&mut TableState) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        loop {
            let (table_id, lock) = self.resolve_reservation(&id)?;
            let mut ts = write_table(&lock);
            if ts.reservation(id).is_some() {
                return f(&mut ts);
            }
            if self.table_for_reservation(&id) == Some(table_id) {
                return Err(EngineError::NotFound(id));
            }
        }
    }

    // ── Edits ────────────────────────────────────────────────

    /// Apply an edit. Rescheduling an unpinned reservation runs the best-fit
    /// search again and may move it to another table; a pinned one must fit
    /// where it is.
    pub fn update_reservation(&self, id: Ulid, update: &ReservationUpdate) -> Result<Reservation, EngineError> {
        let result = self.try_update(id, update);
        record_reservation_op("update", &result);
        result
    }

    fn try_update(&self, id: Ulid, update: &ReservationUpdate) -> Result<Reservation, EngineError> {
        if let Some(p) = update.party_size {
            check_party_size(p)?;
        }
        if let Some(t) = update.time
            && t >= MINUTES_PER_DAY
        {
            return Err(EngineError::InvalidTimeFormat(crate::slots::format_hhmm(t)));
        }
        let _gate = self.write_gate();
        self.touch();

        let mut current = self.get_reservation(id)?;
        // Closing the reservation wins over any reschedule in the same edit.
        if let Some(status) = update.status
            && status.is_terminal()
            && status != current.status
        {
            return self.transition_locked(id, status);
        }
        let repins = update.pinned.is_some_and(|p| p != current.pinned);
        if update.reschedules() || repins {
            if current.status.is_terminal() {
                return Err(EngineError::ReservationClosed {
                    id,
                    status: current.status,
                });
            }
            current = self.reschedule(&current, update)?;
        }
        if let Some(status) = update.status
            && status != current.status
        {
            current = self.transition_locked(id, status)?;
        }
        Ok(current)
    }

    fn reschedule(&self, current: &Reservation, update: &ReservationUpdate) -> Result<Reservation, EngineError> {
        let profile = self.profile()?;
        let id = current.id;
        let date = update.date.unwrap_or(current.date);
        let start = match (update.time, &current.start) {
            (Some(t), _) => t,
            (None, StartTime::At(m)) => *m,
            (None, StartTime::Unparsed(raw)) => return Err(EngineError::InvalidTimeFormat(raw.clone())),
        };
        let party_size = update.party_size.unwrap_or(current.party_size);
        let duration = current.duration.unwrap_or(profile.default_duration());
        let pinned = update.pinned.unwrap_or(current.pinned);
        let plan = Move {
            id,
            date,
            start,
            duration,
            party_size,
            pinned,
        };
        let same_slot = date == current.date
            && current.start.minutes() == Some(start)
            && party_size == current.party_size;

        if pinned || same_slot {
            let request = ReservationRequest {
                guest: GuestRef::Id(current.guest_id),
                date,
                time: start,
                party_size,
                duration: Some(duration),
                comments: current.comments.clone(),
                source: Some(current.source.clone()),
            };
            return self.with_reservation(id, |ts| {
                if let Some(r) = ts.reservation(id)
                    && r.status.is_terminal()
                {
                    return Err(EngineError::ReservationClosed { id, status: r.status });
                }
                if !same_slot {
                    match verify_fit(ts, &profile, date, &plan.span(), party_size, Some(id)) {
                        Err(EngineError::ConflictLost { .. }) => {
                            return Err(EngineError::NoAvailability {
                                request: Box::new(request),
                            });
                        }
                        other => other?,
                    }
                }
                self.commit_in_place(ts, &plan)
            });
        }

        let query = self
            .config
            .slot_query(party_size)
            .duration(Some(duration))
            .exact_at(start);
        let mut attempt = 0;
        loop {
            let slots = self.compute_fresh(date, &query, Some(id))?;
            let Some(slot) = slots.first() else {
                return Err(EngineError::NoAvailability {
                    request: Box::new(ReservationRequest {
                        guest: GuestRef::Id(current.guest_id),
                        date,
                        time: start,
                        party_size,
                        duration: Some(duration),
                        comments: current.comments.clone(),
                        source: Some(current.source.clone()),
                    }),
                });
            };
            match self.commit_move(&profile, &plan, slot.table_id) {
                Err(EngineError::ConflictLost { .. }) if attempt < self.config.booking_retries => {
                    metrics::counter!(CONFLICTS_LOST_TOTAL).increment(1);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Same-table edit. Caller holds the table's write lock and has verified
    /// the new window.
    fn commit_in_place(&self, ts: &mut TableState, plan: &Move) -> Result<Reservation, EngineError> {
        let (old_date, status) = ts
            .reservation(plan.id)
            .map(|r| (r.date, r.status))
            .ok_or(EngineError::NotFound(plan.id))?;
        if status.is_terminal() {
            return Err(EngineError::ReservationClosed { id: plan.id, status });
        }
        let event = plan.event(ts.id, ts.id);
        self.persist_and_apply(ts, &event)?;
        self.cache.invalidate_date(&self.restaurant_id, old_date);
        self.cache.invalidate_date(&self.restaurant_id, plan.date);
        self.refresh_locked(ts);
        ts.reservation(plan.id).cloned().ok_or(EngineError::NotFound(plan.id))
    }

    /// Move to `to_table`, possibly the table it is already on. Both tables are
    /// locked in id order.
    fn commit_move(&self, profile: &OperatingProfile, plan: &Move, to_table: Ulid) -> Result<Reservation, EngineError> {
        let (from_table, from_lock) = self.resolve_reservation(&plan.id)?;
        let span = plan.span();

        if from_table == to_table {
            let mut ts = write_table(&from_lock);
            match ts.reservation(plan.id) {
                None => {
                    return Err(EngineError::ConflictLost {
                        table_id: from_table,
                        blocking: None,
                    });
                }
                Some(r) if r.status.is_terminal() => {
                    return Err(EngineError::ReservationClosed {
                        id: plan.id,
                        status: r.status,
                    });
                }
                Some(_) => {}
            }
            verify_fit(&ts, profile, plan.date, &span, plan.party_size, Some(plan.id))?;
            return self.commit_in_place(&mut ts, plan);
        }

        let to_lock = self.get_table(&to_table).ok_or(EngineError::ConflictLost {
            table_id: to_table,
            blocking: None,
        })?;
        let (mut from, mut to) = if from_table < to_table {
            let from = write_table(&from_lock);
            (from, write_table(&to_lock))
        } else {
            let to = write_table(&to_lock);
            (write_table(&from_lock), to)
        };
        let Some((old_date, status)) = from.reservation(plan.id).map(|r| (r.date, r.status)) else {
            return Err(EngineError::ConflictLost {
                table_id: from_table,
                blocking: None,
            });
        };
        if status.is_terminal() {
            return Err(EngineError::ReservationClosed { id: plan.id, status });
        }
        if !self.tables.contains_key(&to_table) {
            return Err(EngineError::ConflictLost {
                table_id: to_table,
                blocking: None,
            });
        }
        if to.reservations.len() >= MAX_RESERVATIONS_PER_TABLE {
            return Err(EngineError::LimitExceeded("too many reservations on table"));
        }
        verify_fit(&to, profile, plan.date, &span, plan.party_size, None)?;

        let event = plan.event(from_table, to_table);
        self.persist_move(&mut from, &mut to, &event)?;
        self.cache.invalidate_date(&self.restaurant_id, old_date);
        self.cache.invalidate_date(&self.restaurant_id, plan.date);
        self.refresh_locked(&mut from);
        self.refresh_locked(&mut to);
        info!(
            "{}: moved reservation {} from table {} to {}",
            self.restaurant_id, plan.id, from.name, to.name
        );
        to.reservation(plan.id).cloned().ok_or(EngineError::NotFound(plan.id))
    }

    // ── Derived status & housekeeping ────────────────────────

    /// Recompute one table's status against the restaurant clock.
    pub fn refresh_table_status(&self, id: Ulid) -> Result<TableStatus, EngineError> {
        let now = self.profile()?.local_now();
        self.refresh_table_status_at(id, now)
    }

    pub fn refresh_table_status_at(&self, id: Ulid, now: NaiveDateTime) -> Result<TableStatus, EngineError> {
        let default_duration = self.profile()?.default_duration();
        let lock = self.get_table(&id).ok_or(EngineError::NotFound(id))?;
        let mut ts = write_table(&lock);
        ts.status = derive_status(&ts, now, default_duration);
        Ok(ts.status)
    }

    /// Returns how many tables changed status. No-op without a profile.
    pub fn refresh_all_statuses_at(&self, now: NaiveDateTime) -> usize {
        let Ok(profile) = self.profile() else {
            return 0;
        };
        let mut changed = 0;
        for lock in self.table_locks() {
            let mut ts = write_table(&lock);
            let status = derive_status(&ts, now, profile.default_duration());
            if status != ts.status {
                ts.status = status;
                changed += 1;
            }
        }
        changed
    }

    fn refresh_locked(&self, ts: &mut TableState) {
        if let Ok(profile) = self.profile() {
            ts.status = derive_status(ts, profile.local_now(), profile.default_duration());
        }
    }

    /// Complete every active reservation whose seating ended before `now`.
    pub fn complete_elapsed_at(&self, now: NaiveDateTime) -> Result<usize, EngineError> {
        let _gate = self.write_gate();
        let profile = self.profile()?;
        let default_duration = profile.default_duration();
        let today = now.date();
        let minute = minute_of_day(now);

        let mut completed = 0;
        for lock in self.table_locks() {
            let mut ts = write_table(&lock);
            let due: Vec<(Ulid, NaiveDate)> = ts
                .reservations
                .iter()
                .filter(|r| r.is_active() && has_elapsed(r, today, minute, default_duration))
                .map(|r| (r.id, r.date))
                .collect();
            for (id, date) in due {
                let event = Event::ReservationStatusChanged {
                    id,
                    table_id: ts.id,
                    status: ReservationStatus::Completed,
                };
                self.persist_and_apply(&mut ts, &event)?;
                self.cache.invalidate_date(&self.restaurant_id, date);
                completed += 1;
            }
            ts.status = derive_status(&ts, now, default_duration);
        }
        if completed > 0 {
            info!("{}: completed {completed} elapsed reservations", self.restaurant_id);
        }
        Ok(completed)
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    pub fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.write_gate.write().unwrap_or_else(PoisonError::into_inner);
        let mut events = Vec::new();

        let profile = self.profile.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(profile) = profile {
            events.push(Event::ProfileUpdated { profile });
        }
        for guest in self.guests.iter() {
            events.push(Event::GuestRegistered {
                guest: guest.value().clone(),
            });
        }
        for lock in self.table_locks() {
            let ts = read_table(&lock);
            events.push(Event::TableCreated {
                id: ts.id,
                name: ts.name.clone(),
                capacity: ts.capacity,
            });
            if ts.unavailable {
                events.push(Event::TableUpdated {
                    id: ts.id,
                    name: ts.name.clone(),
                    capacity: ts.capacity,
                    unavailable: true,
                });
            }
            for r in &ts.reservations {
                events.push(Event::ReservationCreated { reservation: r.clone() });
            }
        }

        let count = events.len();
        let (tx, rx) = mpsc::sync_channel(1);
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.recv()
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("{}: compacted WAL to {count} events", self.restaurant_id);
        Ok(())
    }

    pub fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = mpsc::sync_channel(1);
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .is_err()
        {
            return 0;
        }
        rx.recv().unwrap_or(0)
    }
}

/// Target of a reschedule.
struct Move {
    id: Ulid,
    date: NaiveDate,
    start: Minutes,
    duration: Minutes,
    party_size: u32,
    pinned: bool,
}

impl Move {
    fn span(&self) -> Span {
        Span::new(self.start, self.start + self.duration)
    }

    fn event(&self, from_table: Ulid, to_table: Ulid) -> Event {
        Event::ReservationMoved {
            id: self.id,
            from_table,
            to_table,
            date: self.date,
            start: self.start,
            duration: self.duration,
            party_size: self.party_size,
            pinned: self.pinned,
        }
    }
}
