use chrono::{NaiveDate, NaiveTime, TimeDelta};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.end <= span.start {
        return Err(EngineError::Validation("end must be after start".into()));
    }
    Ok(())
}

/// Turn a calendar date, start time and duration into the end time of day and
/// the absolute UTC span. The session may not run past midnight.
pub(crate) fn resolve_slot(
    date: NaiveDate,
    start: NaiveTime,
    duration_minutes: u32,
    min_duration_minutes: u32,
) -> Result<(NaiveTime, Span), EngineError> {
    if duration_minutes < min_duration_minutes {
        return Err(EngineError::Validation(format!(
            "duration must be at least {min_duration_minutes} minutes"
        )));
    }
    if duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::Validation(format!(
            "duration must be at most {MAX_DURATION_MINUTES} minutes"
        )));
    }
    let (end, wrapped) =
        start.overflowing_add_signed(TimeDelta::minutes(i64::from(duration_minutes)));
    if wrapped != 0 || end <= start {
        return Err(EngineError::Validation(
            "session must end on the day it starts".into(),
        ));
    }
    let start_ms = date.and_time(start).and_utc().timestamp_millis();
    let end_ms = date.and_time(end).and_utc().timestamp_millis();
    let span = Span { start: start_ms, end: end_ms };
    validate_span(&span)?;
    Ok((end, span))
}

/// First active slot on the calendar overlapping `span`, if any.
///
/// The calendar only carries pending and confirmed sessions, so any hit is a
/// double-booking.
pub fn find_conflict(calendar: &ProviderCalendar, span: &Span) -> Option<Ulid> {
    calendar
        .overlapping(span)
        .find(|slot| slot.span.overlaps(span))
        .map(|slot| slot.session_id)
}

pub(crate) fn check_no_conflict(calendar: &ProviderCalendar, span: &Span) -> Result<(), EngineError> {
    match find_conflict(calendar, span) {
        Some(existing) => Err(EngineError::SlotConflict(existing)),
        None => Ok(()),
    }
}
