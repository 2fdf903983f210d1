use chrono::NaiveDate;
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::observability::MALFORMED_OCCUPANCIES_TOTAL;

use super::EngineError;

/// A stored reservation as the conflict scan sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupancy {
    pub reservation_id: Ulid,
    /// `None` when the stored start time is unusable.
    pub start: Option<Minutes>,
    /// `None` falls back to the restaurant default.
    pub duration: Option<Minutes>,
}

impl From<&Reservation> for Occupancy {
    fn from(r: &Reservation) -> Self {
        Self {
            reservation_id: r.id,
            start: r.start.minutes(),
            duration: r.duration,
        }
    }
}

/// True if `[start, start + duration)` overlaps none of `occupancies`.
///
/// Occupancies with an unusable start are skipped with a warning rather than
/// failing the whole scan.
pub fn is_free(
    start: Minutes,
    duration: Minutes,
    occupancies: &[Occupancy],
    default_duration: Minutes,
) -> bool {
    let candidate = Span::new(start, start + duration.max(1));
    first_conflict(&candidate, occupancies.iter(), default_duration).is_none()
}

fn first_conflict<'a>(
    candidate: &Span,
    occupancies: impl Iterator<Item = &'a Occupancy>,
    default_duration: Minutes,
) -> Option<Ulid> {
    for occ in occupancies {
        let Some(start) = occ.start else {
            warn!(
                reservation = %occ.reservation_id,
                "skipping occupancy with unusable start time"
            );
            metrics::counter!(MALFORMED_OCCUPANCIES_TOTAL).increment(1);
            continue;
        };
        let end = start + occ.duration.unwrap_or(default_duration).max(1);
        if Span::new(start, end).overlaps(candidate) {
            return Some(occ.reservation_id);
        }
    }
    None
}

/// Write-path check, run under the table's write lock: `candidate` must not
/// overlap any active reservation on `date` other than `exclude`.
pub(super) fn check_no_conflict(
    ts: &TableState,
    date: NaiveDate,
    candidate: &Span,
    default_duration: Minutes,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let occupancies: Vec<Occupancy> = ts
        .active_on(date)
        .filter(|r| Some(r.id) != exclude)
        .map(Occupancy::from)
        .collect();
    match first_conflict(candidate, occupancies.iter(), default_duration) {
        Some(blocking) => Err(EngineError::ConflictLost {
            table_id: ts.id,
            blocking: Some(blocking),
        }),
        None => Ok(()),
    }
}

/// The seating starts at or after opening and ends by closing.
pub(super) fn within_hours(profile: &OperatingProfile, candidate: &Span) -> bool {
    let window = profile.window();
    window.start <= candidate.start && candidate.end <= window.end
}

/// Everything a table must satisfy to take `candidate` for `party_size`.
pub(super) fn verify_fit(
    ts: &TableState,
    profile: &OperatingProfile,
    date: NaiveDate,
    candidate: &Span,
    party_size: u32,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let fits = !ts.unavailable && ts.capacity.contains(party_size) && within_hours(profile, candidate);
    if !fits {
        return Err(EngineError::ConflictLost {
            table_id: ts.id,
            blocking: None,
        });
    }
    check_no_conflict(ts, date, candidate, profile.default_duration(), exclude)
}
