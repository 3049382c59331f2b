// src/actor.rs

//! Actor identities, the directory that locates them, and the `Actor` façade
//! tying a `Context` to its `Mailbox`.

use crate::context::Context;
use crate::error::MailboxError;
use crate::mailbox::{Mailbox, MailboxClient, MailboxConnection, MailboxServer};
use crate::message::{Kwargs, Value};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Alias every router answers to in addition to its own id.
pub const ARBITER_ALIAS: &str = "arbiter";

/// Unique identifier of an actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  /// A fresh random id.
  pub fn generate() -> Self {
    Self(format!("{:012x}", rand::random::<u64>() & 0xffff_ffff_ffff))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ActorId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ActorId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for ActorId {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl From<&ActorId> for ActorId {
  fn from(id: &ActorId) -> Self {
    id.clone()
  }
}

/// Where an actor can be reached from this process.
#[derive(Debug, Clone)]
pub enum ActorHandle {
  /// The actor lives in this process; its commands run here.
  Local(ActorId),
  /// The actor is reached through this mailbox connection.
  Remote(MailboxConnection),
}

impl ActorHandle {
  pub fn is_local(&self) -> bool {
    matches!(self, ActorHandle::Local(_))
  }
}

/// Resolves actor ids to handles.
pub trait ActorResolver: Send + Sync + fmt::Debug {
  fn lookup_actor(&self, id: &ActorId) -> Option<ActorHandle>;

  fn bind_actor(&self, id: ActorId, handle: ActorHandle);

  /// Forgets every actor reached through the given connection.
  fn unbind_connection(&self, _connection_id: usize) {}
}

/// In-memory id → handle table. The default resolver of a `Context`.
#[derive(Debug, Default)]
pub struct ActorDirectory {
  entries: RwLock<HashMap<ActorId, ActorHandle>>,
}

impl ActorDirectory {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn bind(&self, id: ActorId, handle: ActorHandle) -> Option<ActorHandle> {
    tracing::debug!(actor = %id, local = handle.is_local(), "Binding actor");
    self.entries.write().insert(id, handle)
  }

  pub fn unbind(&self, id: &ActorId) -> Option<ActorHandle> {
    self.entries.write().remove(id)
  }

  pub fn lookup(&self, id: &ActorId) -> Option<ActorHandle> {
    self.entries.read().get(id).cloned()
  }

  pub fn len(&self) -> usize {
    self.entries.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.read().is_empty()
  }
}

impl ActorResolver for ActorDirectory {
  fn lookup_actor(&self, id: &ActorId) -> Option<ActorHandle> {
    self.lookup(id)
  }

  fn bind_actor(&self, id: ActorId, handle: ActorHandle) {
    self.bind(id, handle);
  }

  fn unbind_connection(&self, connection_id: usize) {
    let mut entries = self.entries.write();
    let before = entries.len();
    entries.retain(|_, handle| !matches!(handle, ActorHandle::Remote(conn) if conn.id() == connection_id));
    let removed = before - entries.len();
    if removed > 0 {
      tracing::debug!(conn = connection_id, removed, "Unbound actors of lost connection");
    }
  }
}

/// Lifecycle of the actor owning a `Context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActorState {
  Initial = 0,
  Running = 1,
  Stopping = 2,
  Stopped = 3,
}

impl ActorState {
  pub(crate) fn from_u8(v: u8) -> Self {
    match v {
      0 => ActorState::Initial,
      1 => ActorState::Running,
      2 => ActorState::Stopping,
      _ => ActorState::Stopped,
    }
  }
}

/// An actor as seen by its own process: identity and lifecycle in the
/// `Context`, communication through the `Mailbox`.
#[derive(Debug)]
pub struct Actor {
  context: Context,
  mailbox: Mailbox,
  local_addrs: Vec<SocketAddr>,
}

impl Actor {
  /// Creates the router: binds `endpoint` and starts accepting actors.
  pub async fn arbiter(context: Context, endpoint: &str) -> Result<Self, MailboxError> {
    if !context.is_arbiter() {
      return Err(MailboxError::InvalidArgument(format!(
        "context of actor {} is not an arbiter context",
        context.actor_id()
      )));
    }
    let server = MailboxServer::bind(context.clone(), endpoint).await?;
    let local_addrs = server.local_addrs().to_vec();
    Ok(Self {
      context,
      mailbox: Mailbox::owned(server),
      local_addrs,
    })
  }

  /// Creates an actor whose mailbox connects lazily to the router at `router_endpoint`.
  pub fn client(context: Context, router_endpoint: impl Into<String>) -> Self {
    let client = MailboxClient::new(context.clone(), router_endpoint);
    Self {
      context,
      mailbox: Mailbox::owned(client),
      local_addrs: Vec::new(),
    }
  }

  /// Creates an actor sharing `owner`'s mailbox. Commands addressed to it are
  /// executed in the owner's process.
  pub fn delegated(context: Context, owner: &Actor) -> Self {
    let id = context.actor_id().clone();
    let mailbox = Mailbox::delegate(&owner.mailbox);
    mailbox
      .service()
      .context()
      .resolver()
      .bind_actor(id.clone(), ActorHandle::Local(id));
    Self {
      context,
      mailbox,
      local_addrs: Vec::new(),
    }
  }

  pub fn id(&self) -> &ActorId {
    self.context.actor_id()
  }

  pub fn context(&self) -> &Context {
    &self.context
  }

  pub fn mailbox(&self) -> &Mailbox {
    &self.mailbox
  }

  /// First address the router listens on, if this actor is the router.
  pub fn address(&self) -> Option<SocketAddr> {
    self.local_addrs.first().copied()
  }

  /// Starts the mailbox and, for non-router actors, tells the router where
  /// this actor lives.
  pub async fn start(&self) -> Result<(), MailboxError> {
    if self.context.state() == ActorState::Running {
      return Ok(());
    }
    self.mailbox.start().await?;
    self.context.set_state(ActorState::Running);
    if !self.context.is_arbiter() {
      self
        .send(ARBITER_ALIAS, crate::commands::NOTIFY, vec![], Kwargs::new())
        .await?;
    }
    tracing::debug!(actor = %self.id(), "Actor started");
    Ok(())
  }

  /// Stops the actor. Connection losses from here on are expected and silent.
  pub async fn stop(&self) {
    if self.context.state() == ActorState::Stopped {
      return;
    }
    self.context.set_state(ActorState::Stopping);
    self.mailbox.close().await;
    self.context.set_state(ActorState::Stopped);
    tracing::debug!(actor = %self.id(), "Actor stopped");
  }

  /// Sends `command` to `target` and waits for its result. Commands without
  /// acknowledgement return `Value::Null` once written.
  pub async fn send(
    &self,
    target: impl Into<ActorId>,
    command: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
  ) -> Result<Value, MailboxError> {
    self
      .mailbox
      .request(self.context.actor_id().clone(), target.into(), command, args, kwargs)
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn directory_binds_and_forgets() {
    let dir = ActorDirectory::new();
    assert!(dir.is_empty());
    dir.bind_actor("a".into(), ActorHandle::Local("a".into()));
    assert!(dir.lookup_actor(&"a".into()).map(|h| h.is_local()).unwrap_or(false));
    assert!(dir.lookup_actor(&"b".into()).is_none());
    assert!(dir.unbind(&"a".into()).is_some());
    assert_eq!(dir.len(), 0);
  }

  #[test]
  fn generated_ids_differ() {
    assert_ne!(ActorId::generate(), ActorId::generate());
    assert_eq!(ActorId::from("x").to_string(), "x");
  }

  #[test]
  fn state_round_trips_through_u8() {
    for state in [ActorState::Initial, ActorState::Running, ActorState::Stopping, ActorState::Stopped] {
      assert_eq!(ActorState::from_u8(state as u8), state);
    }
  }
}
