// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Lifecycle Event Bus - Pub/Sub for supervisor notifications
//
// In-memory fan-out using tokio broadcast channels. The supervisor is the only
// publisher; the CLI and tests subscribe. Slow subscribers lose the
// oldest events rather than slowing the supervisor down.

use crate::domain::events::LifecycleEvent;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to lifecycle events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<LifecycleEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: LifecycleEvent) {
        debug!(service = %event.service(), event = event.event_type(), "Publishing lifecycle event");

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to lifecycle event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single service
    pub fn subscribe_service(&self, service: impl Into<String>) -> ServiceEventReceiver {
        ServiceEventReceiver {
            receiver: self.sender.subscribe(),
            service: service.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all lifecycle events
pub struct EventReceiver {
    receiver: broadcast::Receiver<LifecycleEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<LifecycleEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<LifecycleEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one service id
pub struct ServiceEventReceiver {
    receiver: broadcast::Receiver<LifecycleEvent>,
    service: String,
}

impl ServiceEventReceiver {
    pub async fn recv(&mut self) -> Result<LifecycleEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.service() == self.service {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::state::ServiceState;
    use chrono::Utc;

    fn changed(service: &str, to: ServiceState) -> LifecycleEvent {
        LifecycleEvent::StateChanged {
            service: service.to_string(),
            from: ServiceState::Pending,
            to,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish(changed("db", ServiceState::Starting));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.service(), "db");
        assert_eq!(received.event_type(), "state_changed");
    }

    #[tokio::test]
    async fn test_service_filter_skips_other_services() {
        let event_bus = EventBus::new(10);
        let mut api_events = event_bus.subscribe_service("api");

        event_bus.publish(changed("db", ServiceState::Starting));
        event_bus.publish(changed("api", ServiceState::Starting));

        let received = api_events.recv().await.unwrap();
        assert_eq!(received.service(), "api");
    }

    #[tokio::test]
    async fn test_try_recv_empty_and_subscriber_count() {
        let event_bus = EventBus::new(10);
        assert_eq!(event_bus.subscriber_count(), 0);

        let mut receiver = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 1);
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));

        // Publishing without subscribers must not panic
        drop(receiver);
        event_bus.publish(changed("db", ServiceState::Failed));
    }

    #[tokio::test]
    async fn test_lagged_receiver_reports_dropped_events() {
        let event_bus = EventBus::new(2);
        let mut receiver = event_bus.subscribe();
        for _ in 0..5 {
            event_bus.publish(changed("db", ServiceState::Starting));
        }
        assert!(matches!(receiver.recv().await, Err(EventBusError::Lagged(3))));
    }
}
