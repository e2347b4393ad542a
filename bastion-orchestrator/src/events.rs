//! In-process event bus for rule and server lifecycle events
//!
//! Repositories publish; the deployment service and the bootstrapper
//! subscribe. An optional NATS bridge republishes events produced by other
//! processes onto the same bus.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bastion_common::{FirewallRule, ServerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuleEvent {
    /// `previous` is the stored version the save replaced, `None` for a new rule
    Saved {
        rule_id: u64,
        config_id: u64,
        #[serde(default)]
        previous: Option<FirewallRule>,
    },
    /// Carries the removed rule, which no longer exists in the repository
    Deleted { rule: FirewallRule, config_id: u64 },
    ConfigChanged { config_id: u64 },
}

impl RuleEvent {
    pub fn config_id(&self) -> u64 {
        match self {
            RuleEvent::Saved { config_id, .. }
            | RuleEvent::Deleted { config_id, .. }
            | RuleEvent::ConfigChanged { config_id } => *config_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Created { server_id: ServerId },
    /// Server passed its connectivity check and can take work immediately
    BecameReachable { server_id: ServerId },
}

#[async_trait]
pub trait EventPublisher<E>: Send + Sync {
    /// Returns the number of subscribers that received the event
    async fn publish(&self, event: E) -> usize;

    fn events_published(&self) -> u64;
}

pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
    events_published: AtomicU64,
}

impl<E: Clone + Send + Debug + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            events_published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + Send + Debug + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Clone + Send + Sync + Debug + 'static> EventPublisher<E> for EventBus<E> {
    async fn publish(&self, event: E) -> usize {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!(?event, "Event published with no subscribers");
                0
            }
        }
    }

    fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }
}

/// What a subscriber pulls off the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received<E> {
    Event(E),
    /// The subscriber fell behind and this many events were dropped
    Lagged(u64),
}

pub struct Subscription<E> {
    receiver: broadcast::Receiver<E>,
}

impl<E: Clone> Subscription<E> {
    /// Next event or lag notice, `None` once the bus is gone
    pub async fn next(&mut self) -> Option<Received<E>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Received::Event(event)),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!(lagged = count, "Subscriber lagged, events dropped");
                Some(Received::Lagged(count))
            }
        }
    }

    /// Next event, skipping over lag notices
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.next().await? {
                Received::Event(event) => return Some(event),
                Received::Lagged(_) => continue,
            }
        }
    }
}

/// Republish JSON events from a NATS subject onto the bus
pub async fn bridge_nats<E>(
    client: async_nats::Client,
    subject: String,
    bus: Arc<EventBus<E>>,
) -> Result<()>
where
    E: DeserializeOwned + Clone + Send + Sync + Debug + 'static,
{
    let mut subscriber = client
        .subscribe(subject.clone())
        .await
        .with_context(|| format!("Failed to subscribe to {}", subject))?;

    info!(subject = %subject, "NATS event bridge subscribed");

    while let Some(message) = subscriber.next().await {
        match serde_json::from_slice::<E>(&message.payload) {
            Ok(event) => {
                debug!(subject = %subject, ?event, "Bridged event from NATS");
                bus.publish(event).await;
            }
            Err(e) => {
                error!(subject = %subject, error = %e, "Failed to parse bridged event");
            }
        }
    }

    warn!(subject = %subject, "NATS event bridge stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus: EventBus<ServerEvent> = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let delivered = bus.publish(ServerEvent::Created { server_id: 4 }).await;

        assert_eq!(delivered, 2);
        assert_eq!(first.recv().await, Some(ServerEvent::Created { server_id: 4 }));
        assert_eq!(second.recv().await, Some(ServerEvent::Created { server_id: 4 }));
        assert_eq!(bus.events_published(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus: EventBus<RuleEvent> = EventBus::new();
        assert_eq!(bus.publish(RuleEvent::ConfigChanged { config_id: 1 }).await, 0);
        assert_eq!(bus.events_published(), 1);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let bus: EventBus<ServerEvent> = EventBus::with_capacity(2);
        let mut sub = bus.subscribe();
        for server_id in 0..5 {
            bus.publish(ServerEvent::BecameReachable { server_id }).await;
        }
        assert_eq!(sub.recv().await, Some(ServerEvent::BecameReachable { server_id: 3 }));
    }

    #[tokio::test]
    async fn test_lag_is_reported_before_surviving_events() {
        let bus: EventBus<ServerEvent> = EventBus::with_capacity(2);
        let mut sub = bus.subscribe();
        for server_id in 0..5 {
            bus.publish(ServerEvent::Created { server_id }).await;
        }
        assert_eq!(sub.next().await, Some(Received::Lagged(3)));
        assert_eq!(
            sub.next().await,
            Some(Received::Event(ServerEvent::Created { server_id: 3 }))
        );
    }

    #[test]
    fn test_saved_event_without_previous_rule() {
        let json = r#"{"event": "saved", "rule_id": 4, "config_id": 2}"#;
        let event: RuleEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            RuleEvent::Saved {
                rule_id: 4,
                config_id: 2,
                previous: None
            }
        );
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{"event": "became_reachable", "server_id": 9}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, ServerEvent::BecameReachable { server_id: 9 });
    }
}
