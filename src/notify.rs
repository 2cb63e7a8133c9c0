use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// In-process event feed, one broadcast channel per expert. Every committed
/// event is published here; subscribers see their expert's calendar change
/// as it happens.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to one expert's events. Creates the channel if needed.
    pub fn subscribe(&self, expert_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(expert_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, expert_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&expert_id) {
            let _ = sender.send(event.clone());
        }
    }

    #[allow(dead_code)]
    pub fn remove(&self, expert_id: &Ulid) {
        self.channels.remove(expert_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Domain;

    fn expert_event(id: Ulid) -> Event {
        Event::ExpertCreated {
            id,
            name: "Omar".into(),
            domain: Domain::Procure,
            hourly_rate: 80,
            day_start: 540,
            day_end: 1020,
            workdays: vec![1, 2, 3, 4, 5],
            base_rating: 3.5,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let eid = Ulid::new();
        let mut rx = hub.subscribe(eid);

        let event = expert_event(eid);
        hub.send(eid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let eid = Ulid::new();
        // No subscriber — must not panic
        hub.send(eid, &expert_event(eid));
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);

        hub.send(b, &expert_event(b));
        assert!(rx_a.try_recv().is_err());
    }
}
