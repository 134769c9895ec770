mod conflict;
mod error;
mod mutations;
mod queries;
mod schedule;
mod store;
mod suggest;
mod transaction;

pub use conflict::{cooldown_end, overlaps, validate_booking_date, validate_request};
pub use error::{EngineError, ValidationError};
pub use schedule::{build_schedule, format_schedule_visualization};
pub use store::{InMemoryStore, SharedDayState};
pub use suggest::{describe_slot, format_suggestions, hours_word, suggest_alternatives};
pub use transaction::{BookingOutcome, Rejection};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock, RwLockWriteGuard};
use ulid::Ulid;

use crate::config::SchedulingConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::settings::Settings;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One fsync for the whole batch, then answer every sender. A failed
///    batch is rolled back on disk, so every sender sees the same outcome
///    that replay will.
///
/// A non-append command found while draining closes the batch; it runs
/// after the batch is flushed so it observes every earlier append.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush of {} events failed: {e}", batch.len());
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(event, _)| event))
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {
            tracing::error!("append routed outside the group-commit path");
        }
    }
}

/// The booking engine: day-partitioned state, the directory of users and
/// locations, settings, and the WAL writer handle.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub settings: Arc<Settings>,
    pub config: SchedulingConfig,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Held shared by every mutation and exclusively by compaction and user
    /// deletion, so neither can miss an in-flight commit.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes location/user/setting writes so existence checks hold.
    pub(super) directory_lock: Mutex<()>,
    /// Per-user critical section for cooldown check-and-advance. Always
    /// taken after the day lock.
    pub(super) user_locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: SchedulingConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            settings: Arc::new(Settings::new(config.default_cooldown_days)),
            config,
            wal_tx,
            notify,
            commit_gate: RwLock::new(()),
            directory_lock: Mutex::new(()),
            user_locks: DashMap::new(),
        };

        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            "replayed {} events: {} locations, {} users, {} bookings",
            events.len(),
            engine.store.location_count(),
            engine.store.user_count(),
            engine.store.booking_count(),
        );

        Ok(engine)
    }

    /// Rebuild state from one WAL record. We are the sole owner of every
    /// day lock here, so `try_write` never contends; blocking variants are
    /// off limits because this may run inside an async context.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::BookingCreated { booking, .. } => {
                let day = self.store.day_or_create(booking.day());
                let Ok(mut guard) = day.try_write() else {
                    tracing::error!("replay: day of booking {} is locked", booking.id);
                    return;
                };
                self.store.apply_day_event(&mut guard, event);
            }
            Event::BookingUpdated {
                id,
                location_id,
                previous_date,
                date,
                ..
            } => {
                let Some(from) = self.store.get_day(&(*location_id, *previous_date)) else {
                    tracing::warn!("replay: update of unknown booking {id}");
                    return;
                };
                let Ok(mut from_guard) = from.try_write() else {
                    tracing::error!("replay: day of booking {id} is locked");
                    return;
                };
                if previous_date == date {
                    self.store.apply_day_event(&mut from_guard, event);
                } else {
                    let to = self.store.day_or_create((*location_id, *date));
                    let Ok(mut to_guard) = to.try_write() else {
                        tracing::error!("replay: target day of booking {id} is locked");
                        return;
                    };
                    self.store.apply_move(&mut from_guard, &mut to_guard, event);
                }
            }
            Event::BookingCancelled {
                id,
                location_id,
                date,
                ..
            }
            | Event::BookingDeleted {
                id,
                location_id,
                date,
            } => {
                let Some(day) = self.store.get_day(&(*location_id, *date)) else {
                    tracing::warn!("replay: removal of unknown booking {id}");
                    return;
                };
                let Ok(mut guard) = day.try_write() else {
                    tracing::error!("replay: day of booking {id} is locked");
                    return;
                };
                self.store.apply_day_event(&mut guard, event);
            }
            Event::UserDeleted { id, days } => {
                for key in days {
                    let Some(day) = self.store.get_day(key) else {
                        continue;
                    };
                    let Ok(mut guard) = day.try_write() else {
                        tracing::error!("replay: day holding bookings of user {id} is locked");
                        continue;
                    };
                    self.store.apply_day_event(&mut guard, event);
                }
                self.store.apply_directory_event(event, &self.settings);
            }
            other => self.store.apply_directory_event(other, &self.settings),
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify for a booking event on one day. The
    /// caller holds the day's write lock.
    pub(super) async fn persist_day(&self, day: &mut DayState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_day_event(day, event);
        self.notify.send(event);
        Ok(())
    }

    /// Same as [`Self::persist_day`] for a booking moving between dates.
    pub(super) async fn persist_move(
        &self,
        from: &mut DayState,
        to: &mut DayState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_move(from, to, event);
        self.notify.send(event);
        Ok(())
    }

    /// WAL-append + apply for location, user and setting events. The caller
    /// holds `directory_lock`.
    pub(super) async fn persist_directory(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_directory_event(event, &self.settings);
        self.notify.send(event);
        Ok(())
    }

    /// WAL-append + apply + notify for a `UserDeleted` event. The caller
    /// holds the commit gate exclusively and the write lock of every listed day.
    pub(super) async fn persist_user_deletion(
        &self,
        days: &mut [RwLockWriteGuard<'_, DayState>],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for day in days.iter_mut() {
            self.store.apply_day_event(day, event);
            self.notify.send_to(day.location_id, event);
        }
        self.store.apply_directory_event(event, &self.settings);
        Ok(())
    }

    pub(super) async fn lock_user(&self, user_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self
            .user_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}
