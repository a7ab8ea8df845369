use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::{FacilityState, UserState};
use super::{ConflictReason, EngineError};

/// True if any reservation in `existing` overlaps `range`, skipping `exclude`
/// (the reservation being edited).
fn any_overlap(existing: &[Reservation], range: &TimeRange, exclude: Option<Ulid>) -> bool {
    existing
        .iter()
        .filter(|r| Some(r.id) != exclude)
        .any(|r| r.range.overlaps(range))
}

pub(crate) fn has_facility_conflict(
    fs: &FacilityState,
    date: NaiveDate,
    range: &TimeRange,
    exclude: Option<Ulid>,
) -> bool {
    any_overlap(fs.on_date(date), range, exclude)
}

pub(crate) fn has_user_conflict(
    us: &UserState,
    date: NaiveDate,
    range: &TimeRange,
    exclude: Option<Ulid>,
) -> bool {
    any_overlap(us.on_date(date), range, exclude)
}

/// Checks that need no locks: interval shape, lead time, text limits.
pub(crate) fn validate_request(
    date: NaiveDate,
    range: Option<TimeRange>,
    participants: u32,
    purpose: Option<&str>,
    now: NaiveDateTime,
) -> Result<TimeRange, EngineError> {
    let range = range.ok_or(EngineError::Validation("end time must be after start time"))?;
    if date.and_time(range.start) < now + TimeDelta::minutes(BOOKING_LEAD_MINUTES) {
        return Err(EngineError::Validation(
            "booking must start at least 10 minutes from now",
        ));
    }
    if participants == 0 {
        return Err(EngineError::Validation("at least one participant is required"));
    }
    if purpose.is_some_and(|p| p.len() > MAX_PURPOSE_LEN) {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    Ok(range)
}

/// Checks made under the facility and user locks, in order: status,
/// capacity, facility overlap, user overlap. First failure wins.
pub(crate) fn check_admission(
    fs: &FacilityState,
    us: &UserState,
    date: NaiveDate,
    range: &TimeRange,
    participants: u32,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    super::status::ensure_admits_bookings(&fs.facility)?;
    let capacity = fs.facility.capacity();
    if participants > capacity {
        return Err(EngineError::conflict(ConflictReason::TooManyParticipants {
            requested: participants,
            capacity,
        }));
    }
    if exclude.is_none() && fs.reservations.len() >= MAX_RESERVATIONS_PER_FACILITY {
        return Err(EngineError::LimitExceeded("too many reservations on facility"));
    }
    if has_facility_conflict(fs, date, range, exclude) {
        return Err(EngineError::conflict(ConflictReason::TimeSlotBooked));
    }
    if has_user_conflict(us, date, range, exclude) {
        return Err(EngineError::conflict(ConflictReason::UserDoubleBooked));
    }
    Ok(())
}
