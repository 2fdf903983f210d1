use ulid::Ulid;

use crate::model::{ReservationRequest, ReservationStatus};

#[derive(Debug)]
pub enum EngineError {
    /// Operating hours missing or invalid. Fatal for the restaurant's queries.
    ConfigurationError(String),
    /// A valid request for which no table is free. Expected outcome.
    NoAvailability { request: Box<ReservationRequest> },
    AlreadyCanceled(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A concurrent writer took the slot between search and commit.
    /// `blocking` is `None` when the table itself changed (capacity, hours,
    /// taken out of service).
    ConflictLost {
        table_id: Ulid,
        blocking: Option<Ulid>,
    },
    InvalidTimeFormat(String),
    InvalidDate(String),
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// Completed reservations can no longer be edited.
    ReservationClosed {
        id: Ulid,
        status: ReservationStatus,
    },
    InvalidId(String),
    InvalidStatus(String),
    InvalidPhone(String),
    InvalidPartySize(u32),
    InvalidCapacity { min: u32, max: u32 },
    TableInUse(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ConfigurationError(_) => "configuration",
            EngineError::NoAvailability { .. } => "no_availability",
            EngineError::AlreadyCanceled(_) => "already_canceled",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::ConflictLost { .. } => "conflict_lost",
            EngineError::InvalidTimeFormat(_) => "invalid_time",
            EngineError::InvalidDate(_) => "invalid_date",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::ReservationClosed { .. } => "reservation_closed",
            EngineError::InvalidId(_) => "invalid_id",
            EngineError::InvalidStatus(_) => "invalid_status",
            EngineError::InvalidPhone(_) => "invalid_phone",
            EngineError::InvalidPartySize(_) => "invalid_party_size",
            EngineError::InvalidCapacity { .. } => "invalid_capacity",
            EngineError::TableInUse(_) => "table_in_use",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ConfigurationError(msg) => write!(f, "configuration error: {msg}"),
            EngineError::NoAvailability { request } => write!(
                f,
                "no table available for {} guests on {} at {}",
                request.party_size,
                request.date,
                crate::slots::format_hhmm(request.time)
            ),
            EngineError::AlreadyCanceled(id) => write!(f, "reservation {id} is already canceled"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::ConflictLost {
                table_id,
                blocking: Some(blocking),
            } => write!(
                f,
                "table {table_id} was taken by reservation {blocking} before commit"
            ),
            EngineError::ConflictLost {
                table_id,
                blocking: None,
            } => write!(f, "table {table_id} changed before commit"),
            EngineError::InvalidTimeFormat(s) => write!(f, "invalid time: {s:?}"),
            EngineError::InvalidDate(s) => write!(f, "invalid date: {s:?}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id} cannot go from {from} to {to}")
            }
            EngineError::ReservationClosed { id, status } => {
                write!(f, "reservation {id} is {status} and can no longer change")
            }
            EngineError::InvalidId(s) => write!(f, "invalid id: {s:?}"),
            EngineError::InvalidStatus(s) => write!(f, "invalid status: {s:?}"),
            EngineError::InvalidPhone(s) => write!(f, "invalid phone number: {s:?}"),
            EngineError::InvalidPartySize(n) => write!(f, "invalid party size: {n}"),
            EngineError::InvalidCapacity { min, max } => {
                write!(f, "invalid capacity range [{min}, {max}]")
            }
            EngineError::TableInUse(id) => {
                write!(f, "cannot delete table {id}: active reservations reference it")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
