use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-location change feeds. Payloads are the committed
/// event rendered as JSON.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<String>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a location's feed. Creates the channel if needed.
    pub fn subscribe(&self, location_id: Ulid) -> broadcast::Receiver<String> {
        let sender = self
            .channels
            .entry(location_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish a committed event to its location's feed. No-op for events
    /// without a location or when nobody is listening.
    pub fn send(&self, event: &Event) {
        if let Some(location_id) = event.location_id() {
            self.send_to(location_id, event);
        }
    }

    /// Publish a committed event to one location's feed, for events that
    /// touch several locations.
    pub fn send_to(&self, location_id: Ulid, event: &Event) {
        let Some(sender) = self.channels.get(&location_id) else {
            return;
        };
        match serde_json::to_string(event) {
            Ok(payload) => {
                let _ = sender.send(payload);
            }
            Err(e) => tracing::warn!("notify: cannot encode event for {location_id}: {e}"),
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let lid = Ulid::new();
        let mut rx = hub.subscribe(lid);

        hub.send(&Event::LocationUpdated {
            id: lid,
            address: "Невский пр., 30".into(),
        });

        let payload = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["LocationUpdated"]["address"], "Невский пр., 30");
        assert_eq!(value["LocationUpdated"]["id"], lid.to_string());
    }

    #[tokio::test]
    async fn other_locations_are_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.send(&Event::LocationUpdated {
            id: Ulid::new(),
            address: "elsewhere".into(),
        });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Event::SettingChanged {
            key: "cooldown_days".into(),
            value: "3".into(),
        });
        hub.send(&Event::LocationUpdated {
            id: Ulid::new(),
            address: "nobody listens".into(),
        });
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let lid = Ulid::new();
        let rx = hub.subscribe(lid);
        hub.prune();
        assert_eq!(hub.channels.len(), 1);
        drop(rx);
        hub.prune();
        assert_eq!(hub.channels.len(), 0);
    }
}
