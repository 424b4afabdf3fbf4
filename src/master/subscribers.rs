//! Operator event-stream fan-out.

use crate::messages::subscriber::MasterEvent;
use slog::{info, Logger};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct Subscriber {
    tx: mpsc::UnboundedSender<MasterEvent>,
    heartbeater: JoinHandle<()>,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.heartbeater.abort();
    }
}

/// Clients subscribed to the master event stream, keyed by stream id.
/// Events are pushed in arrival order; a failed write drops the
/// subscriber.
pub struct Subscribers {
    subscribed: HashMap<Uuid, Subscriber>,
    heartbeat_interval: Duration,
    logger: Logger,
}

impl Subscribers {
    pub fn new(heartbeat_interval: Duration, logger: Logger) -> Self {
        Self {
            subscribed: HashMap::new(),
            heartbeat_interval,
            logger,
        }
    }

    /// Register a new subscriber; returns its stream id and receiver.
    pub fn add(&mut self) -> (Uuid, mpsc::UnboundedReceiver<MasterEvent>) {
        let stream_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let _ = tx.send(MasterEvent::Subscribed {
            stream_id: stream_id.to_string(),
        });

        // The heartbeater owns a sender clone and exits by itself once
        // the receiver is gone.
        let heartbeat_tx = tx.clone();
        let interval = self.heartbeat_interval;
        let heartbeater = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(MasterEvent::Heartbeat).is_err() {
                    break;
                }
            }
        });

        info!(self.logger, "Added event stream subscriber"; "stream_id" => %stream_id);
        self.subscribed.insert(stream_id, Subscriber { tx, heartbeater });
        (stream_id, rx)
    }

    pub fn remove(&mut self, stream_id: &Uuid) {
        if self.subscribed.remove(stream_id).is_some() {
            info!(self.logger, "Removed event stream subscriber"; "stream_id" => %stream_id);
        }
    }

    /// Broadcast an event, dropping subscribers whose stream closed.
    pub fn send(&mut self, event: MasterEvent) {
        let mut dead = Vec::new();
        for (stream_id, subscriber) in &self.subscribed {
            if subscriber.tx.send(event.clone()).is_err() {
                dead.push(*stream_id);
            }
        }
        for stream_id in dead {
            self.remove(&stream_id);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentId;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let mut subscribers = Subscribers::new(Duration::from_secs(3600), logger());
        let (_, mut rx) = subscribers.add();

        assert!(matches!(
            rx.recv().await.unwrap(),
            MasterEvent::Subscribed { .. }
        ));

        subscribers.send(MasterEvent::AgentRemoved {
            agent_id: AgentId::new("a1"),
        });
        subscribers.send(MasterEvent::FrameworkRemoved {
            framework_id: crate::ids::FrameworkId::new("f1"),
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            MasterEvent::AgentRemoved { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            MasterEvent::FrameworkRemoved { .. }
        ));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let mut subscribers = Subscribers::new(Duration::from_secs(3600), logger());
        let (_, rx) = subscribers.add();
        drop(rx);

        subscribers.send(MasterEvent::Heartbeat);
        assert!(subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeats_flow() {
        let mut subscribers = Subscribers::new(Duration::from_millis(10), logger());
        let (_, mut rx) = subscribers.add();

        let _ = rx.recv().await.unwrap(); // Subscribed
        let event = rx.recv().await.unwrap();
        assert_eq!(event, MasterEvent::Heartbeat);
    }
}
