// src/runtime/system_events.rs

use crate::actor::{ActorId, ActorState};
use std::net::SocketAddr;

/// Events broadcast on a context's `EventBus`.
#[derive(Debug, Clone)] // SystemEvent is Cloneable for use with tokio::sync::broadcast
pub enum SystemEvent {
  /// A mailbox connection was established, inbound or outbound.
  ConnectionMade {
    connection_id: usize,
    peer_addr: Option<SocketAddr>,
  },

  /// A mailbox connection went away. Pending correlations on it are abandoned.
  ConnectionLost {
    connection_id: usize,
    peer_addr: Option<SocketAddr>,
    /// `None` for a clean close. Using `String` keeps the event `Clone`.
    error_msg: Option<String>,
  },

  /// The owning actor moved to a new lifecycle state.
  ActorStateChanged { actor_id: ActorId, state: ActorState },
}
