use chrono::NaiveDate;
use ulid::Ulid;

use crate::config::CooldownPolicy;
use crate::model::*;
use crate::settings::COOLDOWN_DAYS;

use super::conflict::now_ms;
use super::schedule::build_schedule;
use super::suggest::suggest_alternatives;
use super::{Engine, EngineError};

impl Engine {
    pub fn get_location(&self, id: &Ulid) -> Option<Location> {
        self.store.get_location(id)
    }

    /// All locations ordered by address.
    pub fn list_locations(&self) -> Vec<Location> {
        let mut locations = self.store.locations();
        locations.sort_by(|a, b| a.address.cmp(&b.address).then(a.id.cmp(&b.id)));
        locations
    }

    pub fn get_user(&self, id: &Ulid) -> Option<UserInfo> {
        self.store.get_user(id).map(|user| self.user_info(user))
    }

    /// Every registered user, ordered by name. Administrative view.
    pub fn list_users(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self.store.users().into_iter().map(|u| self.user_info(u)).collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        users
    }

    fn user_info(&self, user: User) -> UserInfo {
        let (in_cooldown, _) = self.cooldown_status(&user);
        UserInfo {
            id: user.id,
            name: user.name,
            verified: user.verified,
            cooldown_until: user.cooldown_until,
            in_cooldown,
        }
    }

    /// `(in_cooldown, until)`. Always `(false, None)` while the cooldown
    /// policy is disabled, although markers are still maintained.
    pub fn check_user_cooldown(&self, user_id: &Ulid) -> (bool, Option<Ms>) {
        match self.store.get_user(user_id) {
            Some(user) => self.cooldown_status(&user),
            None => (false, None),
        }
    }

    fn cooldown_status(&self, user: &User) -> (bool, Option<Ms>) {
        if self.config.cooldown_policy == CooldownPolicy::Disabled {
            return (false, None);
        }
        if now_ms() < user.cooldown_until {
            (true, Some(user.cooldown_until))
        } else {
            (false, None)
        }
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let key = self.store.day_of_booking(id)?;
        let day = self.store.get_day(&key)?;
        let guard = day.read().await;
        guard.get(*id).cloned()
    }

    /// Bookings of one location on one date, in start order.
    pub async fn list_bookings(&self, location_id: Ulid, date: NaiveDate) -> Vec<Booking> {
        match self.store.get_day(&(location_id, date)) {
            Some(day) => day.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }

    /// A speaker's bookings across all locations, ordered by date then time.
    pub async fn get_user_bookings(&self, user_id: &Ulid) -> Vec<BookingInfo> {
        self.collect_bookings(|b| b.user_id == *user_id).await
    }

    /// Every booking, ordered by date then time. Administrative view.
    pub async fn list_all_bookings(&self) -> Vec<BookingInfo> {
        self.collect_bookings(|_| true).await
    }

    async fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<BookingInfo> {
        let mut out = Vec::new();
        for day in self.store.all_days() {
            let guard = day.read().await;
            out.extend(guard.bookings.iter().filter(|b| keep(b)).map(|b| BookingInfo {
                booking: b.clone(),
                location_address: self.store.get_location(&b.location_id).map(|l| l.address),
            }));
        }
        out.sort_by(|a, b| {
            a.booking
                .date
                .cmp(&b.booking.date)
                .then_with(|| {
                    time_to_minutes(&a.booking.time).cmp(&time_to_minutes(&b.booking.time))
                })
                .then(a.booking.id.cmp(&b.booking.id))
        });
        out
    }

    /// The hourly grid of a location's day.
    pub async fn get_location_schedule(
        &self,
        location_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<ScheduleSlot>, EngineError> {
        if !self.store.contains_location(&location_id) {
            return Err(EngineError::NotFound(location_id));
        }
        let bookings = self.list_bookings(location_id, date).await;
        Ok(build_schedule(&bookings, &self.config))
    }

    /// Free alternatives to `(start, duration_hours)` on a location's day.
    pub async fn get_available_time_suggestions(
        &self,
        location_id: Ulid,
        date: NaiveDate,
        start: &str,
        duration_hours: u8,
    ) -> Result<Vec<Suggestion>, EngineError> {
        if !self.store.contains_location(&location_id) {
            return Err(EngineError::NotFound(location_id));
        }
        let bookings = self.list_bookings(location_id, date).await;
        Ok(suggest_alternatives(&bookings, start, duration_hours, &self.config))
    }

    /// Raw setting value; `cooldown_days` always reports its effective value.
    pub fn get_setting(&self, key: &str) -> Option<String> {
        if key == COOLDOWN_DAYS {
            return Some(self.settings.cooldown_days().to_string());
        }
        self.settings.get(key)
    }

    pub fn settings_snapshot(&self) -> Vec<(String, String)> {
        self.settings.snapshot()
    }
}
