use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;
use crate::settings::Settings;

pub type SharedDayState = Arc<RwLock<DayState>>;

/// In-memory state rebuilt from the WAL: the booking calendar partitioned by
/// location/date plus the directory of locations and users.
pub struct InMemoryStore {
    days: DashMap<DayKey, SharedDayState>,
    /// Reverse lookup: booking id → the day holding it.
    booking_index: DashMap<Ulid, DayKey>,
    locations: DashMap<Ulid, Location>,
    users: DashMap<Ulid, User>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            days: DashMap::new(),
            booking_index: DashMap::new(),
            locations: DashMap::new(),
            users: DashMap::new(),
        }
    }

    // ── Days ─────────────────────────────────────────────────

    pub fn get_day(&self, key: &DayKey) -> Option<SharedDayState> {
        self.days.get(key).map(|e| e.value().clone())
    }

    /// The day's lock, created empty on first use.
    pub fn day_or_create(&self, key: DayKey) -> SharedDayState {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(key.0, key.1))))
            .clone()
    }

    pub fn day_keys(&self) -> Vec<DayKey> {
        self.days.iter().map(|e| *e.key()).collect()
    }

    pub fn all_days(&self) -> Vec<SharedDayState> {
        self.days.iter().map(|e| e.value().clone()).collect()
    }

    // ── Booking index ────────────────────────────────────────

    pub fn day_of_booking(&self, booking_id: &Ulid) -> Option<DayKey> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    pub fn booking_count(&self) -> usize {
        self.booking_index.len()
    }

    // ── Directory ────────────────────────────────────────────

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    pub fn contains_location(&self, id: &Ulid) -> bool {
        self.locations.contains_key(id)
    }

    pub fn get_location(&self, id: &Ulid) -> Option<Location> {
        self.locations.get(id).map(|e| e.value().clone())
    }

    pub fn locations(&self) -> Vec<Location> {
        self.locations.iter().map(|e| e.value().clone()).collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn contains_user(&self, id: &Ulid) -> bool {
        self.users.contains_key(id)
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn users(&self) -> Vec<User> {
        self.users.iter().map(|e| e.value().clone()).collect()
    }

    fn update_user_cooldown(&self, user_id: &Ulid, cooldown_until: Ms) {
        if let Some(mut user) = self.users.get_mut(user_id) {
            user.cooldown_until = cooldown_until;
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a booking event to the day it belongs to. The caller holds the
    /// day's write lock. Moves between dates go through [`Self::apply_move`].
    pub fn apply_day_event(&self, day: &mut DayState, event: &Event) {
        match event {
            Event::BookingCreated {
                booking,
                cooldown_until,
            } => {
                let id = booking.id;
                if let Err(other) = day.insert_booking(booking.clone()) {
                    // Already committed; keep it rather than lose it.
                    tracing::error!("booking {id} overlaps committed booking {other}");
                    day.insert_sorted(booking.clone());
                }
                self.booking_index.insert(id, booking.day());
                self.update_user_cooldown(&booking.user_id, *cooldown_until);
            }
            Event::BookingUpdated {
                id,
                time,
                duration_hours,
                ..
            } => {
                if let Some(mut booking) = day.remove_booking(*id) {
                    booking.time = time.clone();
                    booking.duration_hours = *duration_hours;
                    if let Err(other) = day.insert_booking(booking.clone()) {
                        tracing::error!("booking {id} overlaps committed booking {other}");
                        day.insert_sorted(booking);
                    }
                }
            }
            Event::BookingCancelled {
                id,
                user_id,
                cooldown_reset_to,
                ..
            } => {
                day.remove_booking(*id);
                self.booking_index.remove(id);
                self.update_user_cooldown(user_id, *cooldown_reset_to);
            }
            Event::BookingDeleted { id, .. } => {
                day.remove_booking(*id);
                self.booking_index.remove(id);
            }
            Event::UserDeleted { id: user_id, .. } => {
                let owned: Vec<Ulid> = day
                    .bookings
                    .iter()
                    .filter(|b| b.user_id == *user_id)
                    .map(|b| b.id)
                    .collect();
                for id in owned {
                    day.remove_booking(id);
                    self.booking_index.remove(&id);
                }
            }
            _ => {}
        }
    }

    /// Apply a `BookingUpdated` that changes the booking's date. The caller
    /// holds both days' write locks.
    pub fn apply_move(&self, from: &mut DayState, to: &mut DayState, event: &Event) {
        let Event::BookingUpdated {
            id,
            date,
            time,
            duration_hours,
            ..
        } = event
        else {
            return;
        };
        let Some(mut booking) = from.remove_booking(*id) else {
            return;
        };
        booking.date = *date;
        booking.time = time.clone();
        booking.duration_hours = *duration_hours;
        let key = booking.day();
        if let Err(other) = to.insert_booking(booking.clone()) {
            tracing::error!("booking {id} overlaps committed booking {other}");
            to.insert_sorted(booking);
        }
        self.booking_index.insert(*id, key);
    }

    /// Apply a location, user or setting event. For `UserDeleted` the
    /// caller first applies the event to each of the user's days.
    pub fn apply_directory_event(&self, event: &Event, settings: &Settings) {
        match event {
            Event::LocationCreated { id, address, img } => {
                self.locations.insert(
                    *id,
                    Location {
                        id: *id,
                        address: address.clone(),
                        img: img.clone(),
                    },
                );
            }
            Event::LocationUpdated { id, address } => {
                if let Some(mut location) = self.locations.get_mut(id) {
                    location.address = address.clone();
                }
            }
            Event::UserRegistered {
                id,
                name,
                verified,
                cooldown_until,
            } => {
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        verified: *verified,
                        cooldown_until: *cooldown_until,
                    },
                );
            }
            Event::UserVerificationChanged { id, verified } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.verified = *verified;
                }
            }
            Event::UserDeleted { id, .. } => {
                self.users.remove(id);
            }
            Event::SettingChanged { key, value } => settings.set(key, value),
            _ => {}
        }
    }
}
