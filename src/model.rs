use chrono::{FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Minutes since local midnight. The only time-of-day type.
pub type Minutes = u32;

/// Unix milliseconds, used for wall-clock stamps.
pub type Ms = i64;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Half-open window `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Minutes) -> bool {
        self.start <= t && t < self.end
    }
}

/// Inclusive party-size range a table can seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRange {
    pub min: u32,
    pub max: u32,
}

impl PartyRange {
    pub fn new(min: u32, max: u32) -> Result<Self, EngineError> {
        if min == 0 || min > max || max > crate::limits::MAX_PARTY_SIZE {
            return Err(EngineError::InvalidCapacity { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, party_size: u32) -> bool {
        self.min <= party_size && party_size <= self.max
    }
}

/// Derived occupancy status of a table. Read model only; booking decisions
/// never consult it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Free,
    Occupied,
    Reserved,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Created,
    Confirmed,
    Canceled,
    Completed,
}

impl ReservationStatus {
    /// Active reservations count toward conflicts.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Created | ReservationStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Created, Confirmed) | (Created | Confirmed, Canceled) | (Created | Confirmed, Completed)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ReservationStatus::Created => "created",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Canceled => "canceled",
            ReservationStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(ReservationStatus::Created),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "canceled" | "cancelled" => Ok(ReservationStatus::Canceled),
            "completed" => Ok(ReservationStatus::Completed),
            _ => Err(EngineError::InvalidStatus(s.to_string())),
        }
    }
}

/// Start of a reservation. Rows written by the engine are always `At`;
/// `Unparsed` only comes in through legacy imports and is kept verbatim so
/// staff can see and fix it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartTime {
    At(Minutes),
    Unparsed(String),
}

impl StartTime {
    pub fn minutes(&self) -> Option<Minutes> {
        match self {
            StartTime::At(m) => Some(*m),
            StartTime::Unparsed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub table_id: Ulid,
    pub guest_id: Ulid,
    pub date: NaiveDate,
    pub start: StartTime,
    /// `None` falls back to the restaurant's default duration.
    pub duration: Option<Minutes>,
    pub party_size: u32,
    pub status: ReservationStatus,
    pub source: String,
    pub comments: Option<String>,
    /// Pinned reservations keep their table when edited.
    pub pinned: bool,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Occupied window, or `None` if the start time is unusable.
    pub fn window(&self, default_duration: Minutes) -> Option<Span> {
        let start = self.start.minutes()?;
        let duration = self.duration.unwrap_or(default_duration).max(1);
        Some(Span::new(start, start + duration))
    }

    fn sort_key(&self) -> (NaiveDate, Minutes) {
        (self.date, self.start.minutes().unwrap_or(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub id: Ulid,
    pub phone: String,
    pub name: Option<String>,
}

/// Per-restaurant operating window. Constructed only through validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingProfile {
    open: Minutes,
    close: Minutes,
    default_duration: Minutes,
    utc_offset_minutes: i32,
}

impl OperatingProfile {
    pub fn new(
        open: Minutes,
        close: Minutes,
        default_duration: Minutes,
        utc_offset_minutes: i32,
    ) -> Result<Self, EngineError> {
        let profile = Self {
            open,
            close,
            default_duration,
            utc_offset_minutes,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Build a profile from the strings a settings form hands over.
    pub fn parse(
        open: &str,
        close: &str,
        default_duration: Minutes,
        timezone: &str,
    ) -> Result<Self, EngineError> {
        let open = crate::slots::parse_time(open)
            .map_err(|_| EngineError::ConfigurationError(format!("unparseable opening time {open:?}")))?;
        let close = crate::slots::parse_time(close)
            .map_err(|_| EngineError::ConfigurationError(format!("unparseable closing time {close:?}")))?;
        let offset = parse_utc_offset(timezone)
            .ok_or_else(|| EngineError::ConfigurationError(format!("unknown timezone {timezone:?}")))?;
        Self::new(open, close, default_duration, offset)
    }

    /// Sanity check. Replayed profiles go through this too.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.open >= self.close {
            return Err(EngineError::ConfigurationError(format!(
                "opening {} is not before closing {}",
                crate::slots::format_hhmm(self.open),
                crate::slots::format_hhmm(self.close)
            )));
        }
        if self.close > MINUTES_PER_DAY {
            return Err(EngineError::ConfigurationError("closing past midnight".into()));
        }
        if self.default_duration == 0 || self.default_duration > crate::limits::MAX_DURATION {
            return Err(EngineError::ConfigurationError(format!(
                "default duration {} out of range",
                self.default_duration
            )));
        }
        if self.utc_offset_minutes.abs() >= MINUTES_PER_DAY as i32 {
            return Err(EngineError::ConfigurationError("utc offset out of range".into()));
        }
        Ok(())
    }

    pub fn open(&self) -> Minutes {
        self.open
    }

    pub fn close(&self) -> Minutes {
        self.close
    }

    pub fn default_duration(&self) -> Minutes {
        self.default_duration
    }

    pub fn window(&self) -> Span {
        Span::new(self.open, self.close)
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Wall-clock time at the restaurant.
    pub fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.offset()).naive_local()
    }
}

/// `UTC`, `Z`, or `±HH:MM`. Returns minutes east of UTC.
pub fn parse_utc_offset(s: &str) -> Option<i32> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("utc") || s == "Z" {
        return Some(0);
    }
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (h, m) = rest.split_once(':')?;
    let h: i32 = h.parse().ok()?;
    let m: i32 = m.parse().ok()?;
    if !(0..=14).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    Some(sign * (h * 60 + m))
}

#[derive(Debug, Clone)]
pub struct TableState {
    pub id: Ulid,
    pub name: String,
    pub capacity: PartyRange,
    /// Administratively taken out of service.
    pub unavailable: bool,
    pub status: TableStatus,
    /// Every reservation ever bound to this table, sorted by `(date, start)`.
    pub reservations: Vec<Reservation>,
}

impl TableState {
    pub fn new(id: Ulid, name: String, capacity: PartyRange) -> Self {
        Self {
            id,
            name,
            capacity,
            unavailable: false,
            status: TableStatus::Free,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `(date, start)`.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let key = reservation.sort_key();
        let pos = self.reservations.partition_point(|r| r.sort_key() <= key);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations on `date`, located by binary search.
    pub fn on_date(&self, date: NaiveDate) -> &[Reservation] {
        let lo = self.reservations.partition_point(|r| r.date < date);
        let hi = self.reservations.partition_point(|r| r.date <= date);
        &self.reservations[lo..hi]
    }

    pub fn active_on(&self, date: NaiveDate) -> impl Iterator<Item = &Reservation> {
        self.on_date(date).iter().filter(|r| r.is_active())
    }

    pub fn has_active_reservations(&self) -> bool {
        self.reservations.iter().any(Reservation::is_active)
    }

    pub fn info(&self) -> TableInfo {
        TableInfo {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
            unavailable: self.unavailable,
            status: self.status,
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProfileUpdated {
        profile: OperatingProfile,
    },
    TableCreated {
        id: Ulid,
        name: String,
        capacity: PartyRange,
    },
    TableUpdated {
        id: Ulid,
        name: String,
        capacity: PartyRange,
        unavailable: bool,
    },
    TableDeleted {
        id: Ulid,
    },
    GuestRegistered {
        guest: Guest,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationMoved {
        id: Ulid,
        from_table: Ulid,
        to_table: Ulid,
        date: NaiveDate,
        start: Minutes,
        duration: Minutes,
        party_size: u32,
        pinned: bool,
    },
    ReservationStatusChanged {
        id: Ulid,
        table_id: Ulid,
        status: ReservationStatus,
    },
}

impl Event {
    /// Table the event touches, if any. Moves report the destination.
    pub fn table_id(&self) -> Option<Ulid> {
        match self {
            Event::TableCreated { id, .. }
            | Event::TableUpdated { id, .. }
            | Event::TableDeleted { id } => Some(*id),
            Event::ReservationCreated { reservation } => Some(reservation.table_id),
            Event::ReservationMoved { to_table, .. } => Some(*to_table),
            Event::ReservationStatusChanged { table_id, .. } => Some(*table_id),
            Event::ProfileUpdated { .. } | Event::GuestRegistered { .. } => None,
        }
    }
}

// ── Request / result types ───────────────────────────────────────

/// Who the reservation is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestRef {
    Id(Ulid),
    /// Looked up by phone, registered on first sight.
    Contact { phone: String, name: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub guest: GuestRef,
    pub date: NaiveDate,
    pub time: Minutes,
    pub party_size: u32,
    /// Overrides the restaurant default for this booking.
    pub duration: Option<Minutes>,
    pub comments: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationUpdate {
    pub date: Option<NaiveDate>,
    pub time: Option<Minutes>,
    pub party_size: Option<u32>,
    pub status: Option<ReservationStatus>,
    pub pinned: Option<bool>,
}

impl ReservationUpdate {
    pub fn reschedules(&self) -> bool {
        self.date.is_some() || self.time.is_some() || self.party_size.is_some()
    }
}

/// A legacy row brought over from another system. Times arrive as raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedReservation {
    pub table_id: Ulid,
    pub guest: GuestRef,
    pub date: NaiveDate,
    pub time: String,
    pub duration: Option<Minutes>,
    pub party_size: u32,
    pub status: ReservationStatus,
    pub source: String,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: PartyRange,
    pub unavailable: bool,
    pub status: TableStatus,
}

/// One bookable time, already resolved to the best table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySlot {
    pub date: NaiveDate,
    #[serde(skip)]
    pub start: Minutes,
    pub time: String,
    pub time_display: String,
    #[serde(rename = "resourceId")]
    pub table_id: Ulid,
    #[serde(rename = "resourceName")]
    pub table_name: String,
    pub capacity: PartyRange,
}

/// A committed reservation together with the table it landed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Booking {
    pub reservation: Reservation,
    pub table: TableInfo,
}
