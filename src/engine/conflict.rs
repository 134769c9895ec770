use chrono::{Days, NaiveDate};

use crate::config::SchedulingConfig;
use crate::model::*;

use super::error::ValidationError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Unix ms of 00:00 UTC on `date + days`. Saturates at the far end of the
/// calendar instead of failing.
pub fn cooldown_end(date: NaiveDate, days: u32) -> Ms {
    let end = date
        .checked_add_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MAX);
    end.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(Ms::MAX)
}

/// Do `[start_a, start_a + dur_a h)` and `[start_b, start_b + dur_b h)` intersect?
///
/// Touching endpoints do not overlap. A start that does not parse never
/// blocks anything; it is reported as a data-integrity problem.
pub fn overlaps(start_a: &str, duration_a: u8, start_b: &str, duration_b: u8) -> bool {
    match (
        Span::from_start(start_a, duration_a),
        Span::from_start(start_b, duration_b),
    ) {
        (Some(a), Some(b)) => a.overlaps(&b),
        _ => {
            tracing::warn!(
                "unparseable booking time in overlap check: {start_a:?}/{duration_a}h vs {start_b:?}/{duration_b}h"
            );
            false
        }
    }
}

/// First booking of the day that the requested interval collides with,
/// ignoring `exclude` (the booking being edited).
pub(crate) fn find_conflict<'a>(
    day: &'a DayState,
    time: &str,
    duration_hours: u8,
    exclude: Option<ulid::Ulid>,
) -> Option<&'a Booking> {
    day.bookings
        .iter()
        .filter(|b| Some(b.id) != exclude)
        .find(|b| overlaps(time, duration_hours, &b.time, b.duration_hours))
}

/// Structural checks on a requested start/duration. Returns the parsed
/// span; `format_hhmm(span.start)` is the canonical form to store.
pub fn validate_request(
    config: &SchedulingConfig,
    time: &str,
    duration_hours: u8,
) -> Result<Span, ValidationError> {
    if !config.allowed_durations.contains(&duration_hours) {
        return Err(ValidationError::BadDuration(duration_hours));
    }
    let span = Span::from_start(time, duration_hours)
        .ok_or_else(|| ValidationError::MalformedTime(time.into()))?;
    if span.start % 60 != 0 {
        return Err(ValidationError::NotOnTheHour(time.into()));
    }
    let hour = span.start / 60;
    if hour < config.window_start_hour
        || hour > config.last_start_hour
        || span.end > config.latest_end_hour.saturating_mul(60)
    {
        return Err(ValidationError::OutsideWorkingHours {
            start_hour: config.window_start_hour,
            last_start_hour: config.last_start_hour,
            latest_end_hour: config.latest_end_hour,
        });
    }
    Ok(span)
}

/// Calendar checks applied to speaker requests: not in the past, not beyond
/// the booking horizon.
pub fn validate_booking_date(
    date: NaiveDate,
    today: NaiveDate,
    horizon_days: u32,
) -> Result<(), ValidationError> {
    if date < today {
        return Err(ValidationError::DateInPast);
    }
    let last = today
        .checked_add_days(Days::new(u64::from(horizon_days)))
        .unwrap_or(NaiveDate::MAX);
    if date > last {
        return Err(ValidationError::BeyondHorizon(horizon_days));
    }
    Ok(())
}
