// src/runtime/event_bus.rs

use super::system_events::SystemEvent;
use crate::options::DEFAULT_EVENT_BUS_CAPACITY;
use tokio::sync::broadcast::{self, Receiver, Sender};

/// Broadcasts connection and lifecycle events to any number of subscribers.
/// Internally uses tokio::sync::broadcast.
#[derive(Debug, Clone)]
pub struct EventBus {
  sender: Sender<SystemEvent>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_EVENT_BUS_CAPACITY)
  }

  pub fn with_capacity(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1)); // Ensure capacity >= 1
    tracing::debug!(capacity = capacity.max(1), "Created new EventBus");
    Self { sender }
  }

  /// Publishes an event onto the bus.
  ///
  /// Returns the number of subscribers that saw it. Having no subscriber is
  /// normal here, so that case yields 0 rather than an error.
  pub fn publish(&self, event: SystemEvent) -> usize {
    tracing::trace!(event = ?event, "Publishing event");
    self.sender.send(event).unwrap_or(0)
  }

  /// Each receiver sees every event published *after* it subscribed.
  /// A lagging receiver may miss events (see `tokio::sync::broadcast`).
  pub fn subscribe(&self) -> Receiver<SystemEvent> {
    self.sender.subscribe()
  }

  pub fn subscriber_count(&self) -> usize {
    self.sender.receiver_count()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}
