use chrono::NaiveDate;
use ulid::Ulid;

use crate::config::CooldownPolicy;
use crate::limits::MAX_BOOKINGS_PER_DAY;
use crate::model::*;

use super::conflict::{cooldown_end, find_conflict, now_ms, validate_request};
use super::schedule::{build_schedule, format_schedule_visualization};
use super::suggest::{format_suggestions, suggest_alternatives};
use super::{Engine, EngineError};

pub const ACCEPTED_MESSAGE: &str = "Бронирование успешно создано";

/// Why a well-formed booking request was turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UserNotFound,
    NotVerified,
    InCooldown { until: Ms },
    /// The request collides with `conflicting`; free alternatives attached.
    Overlap {
        conflicting: Ulid,
        suggestions: Vec<Suggestion>,
    },
}

/// Terminal result of a booking request. Rejections are answers, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Accepted { id: Ulid, message: String },
    Rejected { reason: Rejection, message: String },
}

impl BookingOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BookingOutcome::Accepted { .. })
    }

    pub fn booking_id(&self) -> Option<Ulid> {
        match self {
            BookingOutcome::Accepted { id, .. } => Some(*id),
            BookingOutcome::Rejected { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            BookingOutcome::Accepted { message, .. } | BookingOutcome::Rejected { message, .. } => {
                message
            }
        }
    }

    fn rejected(reason: Rejection) -> Self {
        let message = match &reason {
            Rejection::UserNotFound => "Пользователь не найден".to_string(),
            Rejection::NotVerified => "Ваш аккаунт не подтвержден администратором. \
                 Обратитесь к администратору для подтверждения."
                .to_string(),
            Rejection::InCooldown { until } => {
                let when = chrono::DateTime::from_timestamp_millis(*until)
                    .map(|t| t.format("%d.%m.%Y %H:%M").to_string())
                    .unwrap_or_else(|| until.to_string());
                format!("Вы не можете бронировать точки до {when}")
            }
            // Overlap carries a rendered schedule; built by the caller.
            Rejection::Overlap { .. } => String::new(),
        };
        BookingOutcome::Rejected { reason, message }
    }
}

fn overlap_rejection(
    day: &DayState,
    conflicting: Ulid,
    time: &str,
    duration_hours: u8,
    config: &crate::config::SchedulingConfig,
) -> BookingOutcome {
    let schedule = build_schedule(&day.bookings, config);
    let suggestions = suggest_alternatives(&day.bookings, time, duration_hours, config);
    let message = format!(
        "Выбранное время пересекается с существующим бронированием.\n\n{}{}",
        format_schedule_visualization(&schedule),
        format_suggestions(&suggestions)
    );
    BookingOutcome::Rejected {
        reason: Rejection::Overlap {
            conflicting,
            suggestions,
        },
        message,
    }
}

impl Engine {
    /// Reserve `[time, time + duration_hours)` at a location on a date.
    ///
    /// The day's write lock is held across the overlap check, the WAL append
    /// and the apply, so of two mutually overlapping requests exactly one
    /// is accepted. The booking row and the owner's advanced cooldown marker
    /// are committed as one WAL record.
    pub async fn create_booking(
        &self,
        user_id: Ulid,
        location_id: Ulid,
        date: NaiveDate,
        time: &str,
        duration_hours: u8,
    ) -> Result<BookingOutcome, EngineError> {
        let span = validate_request(&self.config, time, duration_hours)?;
        let canonical = format_hhmm(span.start);
        let time = canonical.as_str();

        let Some(user) = self.store.get_user(&user_id) else {
            return Ok(self.record(BookingOutcome::rejected(Rejection::UserNotFound)));
        };
        if !user.verified {
            return Ok(self.record(BookingOutcome::rejected(Rejection::NotVerified)));
        }
        if !self.store.contains_location(&location_id) {
            return Err(EngineError::NotFound(location_id));
        }

        let _gate = self.commit_gate.read().await;
        let day = self.store.day_or_create((location_id, date));
        let mut guard = day.write().await;
        let _user_guard = self.lock_user(user_id).await;

        // Re-read under the gate: the user may have been deleted meanwhile.
        let Some(user) = self.store.get_user(&user_id) else {
            return Ok(self.record(BookingOutcome::rejected(Rejection::UserNotFound)));
        };
        if self.config.cooldown_policy == CooldownPolicy::Enforced {
            let until = user.cooldown_until;
            if now_ms() < until {
                return Ok(self.record(BookingOutcome::rejected(Rejection::InCooldown { until })));
            }
        }

        if let Some(existing) = find_conflict(&guard, time, duration_hours, None) {
            let outcome = overlap_rejection(&guard, existing.id, time, duration_hours, &self.config);
            return Ok(self.record(outcome));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on this day"));
        }

        let booking = Booking {
            id: Ulid::new(),
            user_id,
            location_id,
            date,
            time: time.to_string(),
            duration_hours,
            created_at: now_ms(),
        };
        if let Err(conflicting) = guard.admits(&booking) {
            tracing::warn!("exclusion check refused booking at {time} on {date}: overlaps {conflicting}");
            let outcome = overlap_rejection(&guard, conflicting, time, duration_hours, &self.config);
            return Ok(self.record(outcome));
        }

        let id = booking.id;
        let cooldown_until = cooldown_end(date, self.settings.cooldown_days());
        let event = Event::BookingCreated {
            booking,
            cooldown_until,
        };
        self.persist_day(&mut guard, &event).await?;
        tracing::info!("booking {id} accepted: {location_id} {date} {time} for {duration_hours}h");

        Ok(self.record(BookingOutcome::Accepted {
            id,
            message: ACCEPTED_MESSAGE.to_string(),
        }))
    }

    fn record(&self, outcome: BookingOutcome) -> BookingOutcome {
        let label = match &outcome {
            BookingOutcome::Accepted { .. } => "accepted",
            BookingOutcome::Rejected { reason, .. } => {
                tracing::debug!("booking rejected: {reason:?}");
                match reason {
                    Rejection::UserNotFound => "user_not_found",
                    Rejection::NotVerified => "not_verified",
                    Rejection::InCooldown { .. } => "in_cooldown",
                    Rejection::Overlap { .. } => "overlap",
                }
            }
        };
        metrics::counter!(crate::observability::BOOKING_OUTCOMES_TOTAL, "outcome" => label)
            .increment(1);
        outcome
    }
}
