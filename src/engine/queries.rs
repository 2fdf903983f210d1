use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, read_table};

impl Engine {
    /// Every table, ordered by name then id.
    pub fn list_tables(&self) -> Vec<TableInfo> {
        let mut tables: Vec<TableInfo> = self
            .table_locks()
            .iter()
            .map(|lock| read_table(lock).info())
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        tables
    }

    pub fn table_info(&self, id: Ulid) -> Result<TableInfo, EngineError> {
        let lock = self.get_table(&id).ok_or(EngineError::NotFound(id))?;
        let info = read_table(&lock).info();
        Ok(info)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (_, lock) = self.resolve_reservation(&id)?;
        let ts = read_table(&lock);
        ts.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// All reservations on `date` across tables, any status, ordered by start.
    pub fn reservations_on(&self, date: NaiveDate) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = Vec::new();
        for lock in self.table_locks() {
            out.extend(read_table(&lock).on_date(date).iter().cloned());
        }
        out.sort_by_key(|r| (r.start.minutes().unwrap_or(0), r.id));
        out
    }

    pub fn get_guest(&self, id: Ulid) -> Option<Guest> {
        self.guests.get(&id).map(|g| g.value().clone())
    }

    pub fn find_guest_by_phone(&self, phone: &str) -> Result<Option<Guest>, EngineError> {
        let phone = super::normalize_phone(phone)?;
        Ok(self
            .guests_by_phone
            .get(&phone)
            .and_then(|id| self.get_guest(*id.value())))
    }

    /// Other bookable times near the requested one, nearest first. Offered
    /// after a `NoAvailability`.
    pub fn alternatives(&self, req: &ReservationRequest, n: usize) -> Result<Vec<AvailabilitySlot>, EngineError> {
        let query = self
            .config
            .slot_query(req.party_size)
            .duration(req.duration)
            .preferred(req.time)
            .max_results(n);
        self.find_slots(req.date, &query)
    }
}
