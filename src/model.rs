use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for creation stamps and cooldown markers.
pub type Ms = i64;

/// Minutes since midnight.
pub type Minutes = u32;

/// A location's calendar day: the unit of scheduling and of locking.
pub type DayKey = (Ulid, NaiveDate);

// ── Time arithmetic ──────────────────────────────────────────────

/// Parse an `H:MM` or `HH:MM` clock time into minutes since midnight.
///
/// Each field is one or two ASCII digits; hours run to 23 and minutes to 59.
/// Anything else yields `None`, so the result always fits within a day.
pub fn time_to_minutes(s: &str) -> Option<Minutes> {
    let (hours, minutes) = s.split_once(':')?;
    let hours = clock_field(hours, 1)?;
    let minutes = clock_field(minutes, 2)?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn clock_field(field: &str, min_digits: usize) -> Option<Minutes> {
    if !(min_digits..=2).contains(&field.len()) || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

/// Render minutes since midnight as zero-padded `HH:MM`.
pub fn format_hhmm(minutes: Minutes) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// `HH:00` label for a whole hour.
pub fn hour_label(hour: u32) -> String {
    format!("{hour:02}:00")
}

/// Half-open interval `[start, end)` in minutes since midnight.
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

    /// Span of a booking starting at `time` for `duration_hours`.
    pub fn from_start(time: &str, duration_hours: u8) -> Option<Self> {
        let start = time_to_minutes(time)?;
        let end = start.checked_add(Minutes::from(duration_hours).checked_mul(60)?)?;
        Some(Self { start, end })
    }

    pub fn duration_minutes(&self) -> Minutes {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_minute(&self, t: Minutes) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub address: String,
    pub img: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    /// Administrator approval; gates booking eligibility.
    pub verified: bool,
    /// Nominal "no new bookings before" marker.
    pub cooldown_until: Ms,
}

/// One reserved interval at a location on a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub location_id: Ulid,
    pub date: NaiveDate,
    /// Start time, zero-padded `HH:MM`.
    pub time: String,
    pub duration_hours: u8,
    pub created_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Option<Span> {
        Span::from_start(&self.time, self.duration_hours)
    }

    pub fn day(&self) -> DayKey {
        (self.location_id, self.date)
    }
}

/// Administrative change to a booking. `None` keeps the booking's current
/// value, read under the day lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingEdit {
    pub date: Option<NaiveDate>,
    pub time: Option<String>,
    pub duration_hours: Option<u8>,
}

/// All bookings of one location on one date. This is the lock granule for
/// the booking transaction.
#[derive(Debug, Clone)]
pub struct DayState {
    pub location_id: Ulid,
    pub date: NaiveDate,
    /// Sorted by start minute; bookings whose time does not parse sort last.
    pub bookings: Vec<Booking>,
}

impl DayState {
    pub fn new(location_id: Ulid, date: NaiveDate) -> Self {
        Self {
            location_id,
            date,
            bookings: Vec::new(),
        }
    }

    fn sort_key(booking: &Booking) -> Minutes {
        time_to_minutes(&booking.time).unwrap_or(Minutes::MAX)
    }

    /// Exclusion constraint: `Err` with the blocking booking's id when
    /// `booking` overlaps another stored booking. Bookings whose time does
    /// not parse are never blocked and never block.
    pub fn admits(&self, booking: &Booking) -> Result<(), Ulid> {
        let Some(span) = booking.span() else {
            return Ok(());
        };
        match self
            .bookings
            .iter()
            .find(|b| b.id != booking.id && b.span().is_some_and(|s| s.overlaps(&span)))
        {
            Some(existing) => Err(existing.id),
            None => Ok(()),
        }
    }

    /// Insert keeping start order, enforcing [`DayState::admits`].
    pub fn insert_booking(&mut self, booking: Booking) -> Result<(), Ulid> {
        self.admits(&booking)?;
        self.insert_sorted(booking);
        Ok(())
    }

    /// Insert keeping start order without the exclusion check. Only for
    /// records that were already committed.
    pub fn insert_sorted(&mut self, booking: Booking) {
        let key = Self::sort_key(&booking);
        let pos = self.bookings.partition_point(|b| Self::sort_key(b) <= key);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }
}

// ── Derived views ────────────────────────────────────────────────

/// One hour bucket of the daily display grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSlot {
    pub hour: u32,
    /// `HH:00`.
    pub time: String,
    pub occupied: bool,
    pub booking: Option<Booking>,
    pub can_book_1h: bool,
    pub can_book_2h: bool,
}

/// A free alternative offered when a request is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub start_time: String,
    pub duration: u8,
    pub end_time: String,
    pub description: String,
}

// ── WAL record format ────────────────────────────────────────────

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LocationCreated {
        id: Ulid,
        address: String,
        img: String,
    },
    LocationUpdated {
        id: Ulid,
        address: String,
    },
    UserRegistered {
        id: Ulid,
        name: String,
        verified: bool,
        cooldown_until: Ms,
    },
    UserVerificationChanged {
        id: Ulid,
        verified: bool,
    },
    /// Removes the user together with every booking they hold on `days`.
    UserDeleted {
        id: Ulid,
        days: Vec<DayKey>,
    },
    /// Booking row plus the owner's advanced cooldown marker, committed as one record.
    BookingCreated {
        booking: Booking,
        cooldown_until: Ms,
    },
    BookingUpdated {
        id: Ulid,
        location_id: Ulid,
        previous_date: NaiveDate,
        date: NaiveDate,
        time: String,
        duration_hours: u8,
    },
    /// Owner cancellation: removes the booking and resets the cooldown marker.
    BookingCancelled {
        id: Ulid,
        user_id: Ulid,
        location_id: Ulid,
        date: NaiveDate,
        cooldown_reset_to: Ms,
    },
    /// Administrative removal; the cooldown marker is left alone.
    BookingDeleted {
        id: Ulid,
        location_id: Ulid,
        date: NaiveDate,
    },
    SettingChanged {
        key: String,
        value: String,
    },
}

impl Event {
    /// Location a booking event belongs to, for per-location notifications.
    pub fn location_id(&self) -> Option<Ulid> {
        match self {
            Event::LocationCreated { id, .. } | Event::LocationUpdated { id, .. } => Some(*id),
            Event::BookingCreated { booking, .. } => Some(booking.location_id),
            Event::BookingUpdated { location_id, .. }
            | Event::BookingCancelled { location_id, .. }
            | Event::BookingDeleted { location_id, .. } => Some(*location_id),
            Event::UserRegistered { .. }
            | Event::UserVerificationChanged { .. }
            | Event::UserDeleted { .. }
            | Event::SettingChanged { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub name: String,
    pub verified: bool,
    pub cooldown_until: Ms,
    pub in_cooldown: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub booking: Booking,
    pub location_address: Option<String>,
}
