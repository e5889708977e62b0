//! Per-key fan-out for realtime change events.
//!
//! Every subscriber gets its own unbounded queue, created on subscribe and dropped on
//! removal or once its receiver is gone.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::ChangeEvent;

type Subscribers = Vec<(u64, mpsc::UnboundedSender<ChangeEvent>)>;

pub struct ChangeHub {
    streams: DashMap<String, Subscribers>,
    next_serial: AtomicU64,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Adds a subscriber to `key`. Returns its serial and the receiving end.
    pub fn subscribe(&self, key: &str) -> (u64, mpsc::UnboundedReceiver<ChangeEvent>) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.streams
            .entry(key.to_string())
            .or_default()
            .push((serial, sender));
        (serial, receiver)
    }

    /// Delivers `event` to every subscriber of `key`. Returns the number reached.
    pub fn emit(&self, key: &str, event: ChangeEvent) -> usize {
        let delivered = {
            let Some(mut subscribers) = self.streams.get_mut(key) else {
                return 0;
            };
            subscribers.retain(|(_, sender)| sender.send(event.clone()).is_ok());
            subscribers.len()
        };
        if delivered == 0 {
            self.streams
                .remove_if(key, |_, subscribers| subscribers.is_empty());
        }
        delivered
    }

    /// Drops one subscriber; its receiver observes the feed as closed.
    pub fn remove_subscriber(&self, key: &str, serial: u64) -> bool {
        let removed = {
            let Some(mut subscribers) = self.streams.get_mut(key) else {
                return false;
            };
            let before = subscribers.len();
            subscribers.retain(|(candidate, _)| *candidate != serial);
            subscribers.len() != before
        };
        self.streams
            .remove_if(key, |_, subscribers| subscribers.is_empty());
        removed
    }

    /// Drops every subscriber of `key`.
    pub fn remove(&self, key: &str) -> bool {
        self.streams.remove(key).is_some()
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.streams
            .get(key)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.streams.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::backend::ChangeKind;

    fn make_event(id: &str) -> ChangeEvent {
        ChangeEvent {
            table: "mensajes".to_string(),
            kind: ChangeKind::Insert,
            new: json!({ "id": id }),
            old: Value::Null,
        }
    }

    #[test]
    fn subscribe_creates_stream() {
        let hub = ChangeHub::new();
        assert!(!hub.contains("mensajes"));

        let _rx = hub.subscribe("mensajes");
        assert!(hub.contains("mensajes"));
    }

    #[test]
    fn subscribers_get_distinct_serials() {
        let hub = ChangeHub::new();
        let (first, _rx1) = hub.subscribe("mensajes");
        let (second, _rx2) = hub.subscribe("mensajes");

        assert_ne!(first, second);
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.subscriber_count("mensajes"), 2);
    }

    #[test]
    fn emit_delivers_to_every_subscriber() {
        let hub = ChangeHub::new();
        let (_, mut rx1) = hub.subscribe("mensajes");
        let (_, mut rx2) = hub.subscribe("mensajes");

        assert_eq!(hub.emit("mensajes", make_event("m1")), 2);
        assert_eq!(rx1.try_recv().unwrap().new["id"], "m1");
        assert_eq!(rx2.try_recv().unwrap().new["id"], "m1");
    }

    #[test]
    fn emit_without_subscribers_is_noop() {
        let hub = ChangeHub::new();
        assert_eq!(hub.emit("mensajes", make_event("m1")), 0);
        assert!(hub.is_empty());
    }

    #[test]
    fn emit_cleans_up_when_receivers_dropped() {
        let hub = ChangeHub::new();
        let (_, rx) = hub.subscribe("typing_status");
        drop(rx);
        assert!(hub.contains("typing_status"));

        hub.emit("typing_status", make_event("m1"));
        assert!(!hub.contains("typing_status"));
    }

    #[test]
    fn burst_larger_than_any_buffer_is_kept() {
        let hub = ChangeHub::new();
        let (_, mut rx) = hub.subscribe("mensajes");

        for n in 0..500 {
            hub.emit("mensajes", make_event(&n.to_string()));
        }

        let mut received = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.new["id"], received.to_string());
            received += 1;
        }
        assert_eq!(received, 500);
    }

    #[tokio::test]
    async fn removing_one_subscriber_leaves_the_others() {
        let hub = ChangeHub::new();
        let (first, mut rx1) = hub.subscribe("mensajes");
        let (_, mut rx2) = hub.subscribe("mensajes");

        assert!(hub.remove_subscriber("mensajes", first));
        assert!(!hub.remove_subscriber("mensajes", first));
        assert!(rx1.recv().await.is_none());

        assert_eq!(hub.emit("mensajes", make_event("m1")), 1);
        assert_eq!(rx2.recv().await.unwrap().new["id"], "m1");
    }

    #[tokio::test]
    async fn remove_closes_pending_receivers() {
        let hub = ChangeHub::new();
        let (_, mut rx) = hub.subscribe("mensajes");

        assert!(hub.remove("mensajes"));
        assert!(rx.recv().await.is_none());
    }
}
