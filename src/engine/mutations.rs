use chrono::NaiveDate;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::settings::COOLDOWN_DAYS;

use super::conflict::{find_conflict, now_ms, validate_request};
use super::{Engine, EngineError, ValidationError, WalCommand};

impl Engine {
    // ── Locations ────────────────────────────────────────────

    pub async fn create_location(&self, id: Ulid, address: String, img: String) -> Result<(), EngineError> {
        if address.len() > MAX_ADDRESS_LEN {
            return Err(EngineError::LimitExceeded("address too long"));
        }
        if img.len() > MAX_IMG_LEN {
            return Err(EngineError::LimitExceeded("image reference too long"));
        }
        let _gate = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        if self.store.location_count() >= MAX_LOCATIONS {
            return Err(EngineError::LimitExceeded("too many locations"));
        }
        if self.store.contains_location(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::LocationCreated { id, address, img };
        self.persist_directory(&event).await
    }

    pub async fn update_location_address(&self, id: Ulid, address: String) -> Result<(), EngineError> {
        if address.len() > MAX_ADDRESS_LEN {
            return Err(EngineError::LimitExceeded("address too long"));
        }
        let _gate = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        if !self.store.contains_location(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::LocationUpdated { id, address };
        self.persist_directory(&event).await
    }

    // ── Users ────────────────────────────────────────────────

    /// Register a speaker. The cooldown marker starts at the registration
    /// instant.
    pub async fn register_user(&self, id: Ulid, name: String, verified: bool) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        let _gate = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        if self.store.user_count() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.store.contains_user(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::UserRegistered {
            id,
            name,
            verified,
            cooldown_until: now_ms(),
        };
        self.persist_directory(&event).await
    }

    pub async fn set_user_verified(&self, id: Ulid, verified: bool) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        if !self.store.contains_user(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::UserVerificationChanged { id, verified };
        self.persist_directory(&event).await?;
        tracing::info!("user {id} verified={verified}");
        Ok(())
    }

    /// Remove a user together with every booking they hold. The commit gate
    /// is taken exclusively so no booking for the user commits in between.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        if !self.store.contains_user(&id) {
            return Err(EngineError::NotFound(id));
        }

        let mut keys = self.store.day_keys();
        keys.sort();
        let mut days = Vec::new();
        for key in keys {
            let Some(day) = self.store.get_day(&key) else {
                continue;
            };
            if day.read().await.bookings.iter().any(|b| b.user_id == id) {
                days.push((key, day));
            }
        }

        let mut guards = Vec::with_capacity(days.len());
        for (_, day) in &days {
            guards.push(day.write().await);
        }
        let event = Event::UserDeleted {
            id,
            days: days.iter().map(|(key, _)| *key).collect(),
        };
        self.persist_user_deletion(&mut guards, &event).await?;
        drop(guards);
        self.user_locks.remove(&id);
        tracing::info!("user {id} deleted with bookings on {} days", days.len());
        Ok(())
    }

    // ── Settings ─────────────────────────────────────────────

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), EngineError> {
        if value.len() > MAX_SETTING_VALUE_LEN {
            return Err(EngineError::LimitExceeded("setting value too long"));
        }
        if key == COOLDOWN_DAYS {
            match value.trim().parse::<u32>() {
                Ok(days) if days <= MAX_COOLDOWN_DAYS => {}
                _ => {
                    return Err(ValidationError::BadSetting(format!(
                        "cooldown_days must be an integer in 0..={MAX_COOLDOWN_DAYS}, got {value:?}"
                    ))
                    .into());
                }
            }
        }
        let _gate = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        let event = Event::SettingChanged {
            key: key.to_string(),
            value: value.trim().to_string(),
        };
        self.persist_directory(&event).await
    }

    pub async fn set_cooldown_days(&self, days: u32) -> Result<(), EngineError> {
        self.set_setting(COOLDOWN_DAYS, &days.to_string()).await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Administrative edit replacing date, start and duration.
    pub async fn update_booking(
        &self,
        id: Ulid,
        date: NaiveDate,
        time: &str,
        duration_hours: u8,
    ) -> Result<(), EngineError> {
        let edit = BookingEdit {
            date: Some(date),
            time: Some(time.to_string()),
            duration_hours: Some(duration_hours),
        };
        self.edit_booking(id, &edit).await
    }

    /// Administrative edit. Fields left `None` keep the booking's current
    /// value as read under the day lock. Re-checks the new interval against
    /// every other booking of the location on the (possibly new) date; a
    /// move between dates holds both day locks, taken in key order.
    pub async fn edit_booking(&self, id: Ulid, edit: &BookingEdit) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        loop {
            let from_key = self.store.day_of_booking(&id).ok_or(EngineError::NotFound(id))?;
            let (location_id, previous_date) = from_key;
            let to_key = (location_id, edit.date.unwrap_or(previous_date));

            if to_key == from_key {
                let day = self.store.day_or_create(from_key);
                let mut guard = day.write().await;
                let Some(current) = guard.get(id) else {
                    self.ensure_booking_moved(id, from_key)?;
                    continue;
                };
                let (time, duration_hours) = self.resolve_edit(current, edit)?;
                if let Some(other) = find_conflict(&guard, &time, duration_hours, Some(id)) {
                    return Err(EngineError::Conflict(other.id));
                }
                let event = Event::BookingUpdated {
                    id,
                    location_id,
                    previous_date,
                    date: to_key.1,
                    time,
                    duration_hours,
                };
                return self.persist_day(&mut guard, &event).await;
            }

            let from_day = self.store.day_or_create(from_key);
            let to_day = self.store.day_or_create(to_key);
            let (mut from_guard, mut to_guard) = if from_key < to_key {
                let f = from_day.write().await;
                let t = to_day.write().await;
                (f, t)
            } else {
                let t = to_day.write().await;
                let f = from_day.write().await;
                (f, t)
            };
            let Some(current) = from_guard.get(id) else {
                self.ensure_booking_moved(id, from_key)?;
                continue;
            };
            let (time, duration_hours) = self.resolve_edit(current, edit)?;
            if let Some(other) = find_conflict(&to_guard, &time, duration_hours, Some(id)) {
                return Err(EngineError::Conflict(other.id));
            }
            if to_guard.bookings.len() >= MAX_BOOKINGS_PER_DAY {
                return Err(EngineError::LimitExceeded("too many bookings on this day"));
            }
            let event = Event::BookingUpdated {
                id,
                location_id,
                previous_date,
                date: to_key.1,
                time,
                duration_hours,
            };
            return self.persist_move(&mut from_guard, &mut to_guard, &event).await;
        }
    }

    /// Merge `edit` over the locked `current` booking and validate the
    /// resulting start (canonical `HH:MM`) and duration.
    fn resolve_edit(&self, current: &Booking, edit: &BookingEdit) -> Result<(String, u8), EngineError> {
        let time = edit.time.as_deref().unwrap_or(&current.time);
        let duration_hours = edit.duration_hours.unwrap_or(current.duration_hours);
        let span = validate_request(&self.config, time, duration_hours)?;
        Ok((format_hhmm(span.start), duration_hours))
    }

    /// A booking missing from the day its index entry named has either moved
    /// (retry) or gone (not found).
    fn ensure_booking_moved(&self, id: Ulid, looked_in: DayKey) -> Result<(), EngineError> {
        match self.store.day_of_booking(&id) {
            Some(key) if key != looked_in => Ok(()),
            _ => Err(EngineError::NotFound(id)),
        }
    }

    /// Owner cancellation. Lifts the owner's cooldown by resetting the
    /// marker to now.
    pub async fn cancel_booking(&self, id: Ulid, user_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let key = self.store.day_of_booking(&id).ok_or(EngineError::NotFound(id))?;
        let day = self.store.day_or_create(key);
        let mut guard = day.write().await;
        let owner = guard.get(id).ok_or(EngineError::NotFound(id))?.user_id;
        if owner != user_id {
            return Err(EngineError::NotOwner(id));
        }
        let _user_guard = self.lock_user(user_id).await;
        let event = Event::BookingCancelled {
            id,
            user_id,
            location_id: key.0,
            date: key.1,
            cooldown_reset_to: now_ms(),
        };
        self.persist_day(&mut guard, &event).await?;
        tracing::info!("booking {id} cancelled by its owner");
        Ok(())
    }

    /// Administrative removal; the owner's cooldown marker is untouched.
    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let key = self.store.day_of_booking(&id).ok_or(EngineError::NotFound(id))?;
        let day = self.store.day_or_create(key);
        let mut guard = day.write().await;
        if guard.get(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BookingDeleted {
            id,
            location_id: key.0,
            date: key.1,
        };
        self.persist_day(&mut guard, &event).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut locations = self.store.locations();
        locations.sort_by_key(|l| l.id);
        events.extend(locations.into_iter().map(|l| Event::LocationCreated {
            id: l.id,
            address: l.address,
            img: l.img,
        }));

        let mut users = self.store.users();
        users.sort_by_key(|u| u.id);
        for user in &users {
            events.push(Event::UserRegistered {
                id: user.id,
                name: user.name.clone(),
                verified: user.verified,
                cooldown_until: user.cooldown_until,
            });
        }

        let mut keys = self.store.day_keys();
        keys.sort();
        for key in keys {
            let Some(day) = self.store.get_day(&key) else {
                continue;
            };
            let guard = day.read().await;
            for booking in &guard.bookings {
                // Re-asserting the owner's current marker keeps it unchanged.
                let cooldown_until = self
                    .store
                    .get_user(&booking.user_id)
                    .map(|u| u.cooldown_until)
                    .unwrap_or_default();
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                    cooldown_until,
                });
            }
        }

        events.extend(
            self.settings
                .entries()
                .into_iter()
                .map(|(key, value)| Event::SettingChanged { key, value }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
