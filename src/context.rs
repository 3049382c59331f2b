// src/context.rs

use crate::actor::{ActorDirectory, ActorHandle, ActorId, ActorResolver, ActorState, ARBITER_ALIAS};
use crate::commands::CommandRegistry;
use crate::options::MailboxOptions;
use crate::runtime::{EventBus, SystemEvent};

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Holds the state shared by every clone of a `Context`.
pub(crate) struct ContextInner {
  actor_id: ActorId,
  is_arbiter: bool,
  state: AtomicU8,
  resolver: Arc<dyn ActorResolver>,
  registry: Arc<CommandRegistry>,
  options: Arc<MailboxOptions>,
  event_bus: EventBus,
  /// Next available unique handle ID for connections and transports.
  next_handle: AtomicUsize,
}

impl fmt::Debug for ContextInner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ContextInner")
      .field("actor_id", &self.actor_id)
      .field("is_arbiter", &self.is_arbiter)
      .field("state", &ActorState::from_u8(self.state.load(Ordering::Relaxed)))
      .field("commands", &self.registry.len())
      .finish_non_exhaustive()
  }
}

/// Everything a mailbox needs to know about the actor owning it.
///
/// Passed explicitly at construction; cheap to clone.
#[derive(Clone, Debug)]
pub struct Context {
  inner: Arc<ContextInner>,
}

impl Context {
  /// Context of a router process with default registry, directory and options.
  pub fn arbiter(actor_id: impl Into<ActorId>) -> Self {
    Self::builder(actor_id).arbiter(true).build()
  }

  /// Context of a regular actor with default registry, directory and options.
  pub fn actor(actor_id: impl Into<ActorId>) -> Self {
    Self::builder(actor_id).build()
  }

  pub fn builder(actor_id: impl Into<ActorId>) -> ContextBuilder {
    ContextBuilder {
      actor_id: actor_id.into(),
      is_arbiter: false,
      resolver: None,
      registry: None,
      options: None,
    }
  }

  pub fn actor_id(&self) -> &ActorId {
    &self.inner.actor_id
  }

  pub fn is_arbiter(&self) -> bool {
    self.inner.is_arbiter
  }

  pub fn state(&self) -> ActorState {
    ActorState::from_u8(self.inner.state.load(Ordering::Acquire))
  }

  pub fn is_running(&self) -> bool {
    self.state() == ActorState::Running
  }

  /// Moves the actor to `state` and announces it on the event bus.
  pub fn set_state(&self, state: ActorState) {
    let previous = ActorState::from_u8(self.inner.state.swap(state as u8, Ordering::AcqRel));
    if previous != state {
      tracing::debug!(actor = %self.inner.actor_id, ?previous, ?state, "Actor state changed");
      self.inner.event_bus.publish(SystemEvent::ActorStateChanged {
        actor_id: self.inner.actor_id.clone(),
        state,
      });
    }
  }

  pub fn resolver(&self) -> &Arc<dyn ActorResolver> {
    &self.inner.resolver
  }

  /// Resolves `id`, treating the router alias as this actor when it is the router.
  pub fn lookup_actor(&self, id: &ActorId) -> Option<ActorHandle> {
    if self.inner.is_arbiter && id.as_str() == ARBITER_ALIAS {
      return Some(ActorHandle::Local(self.inner.actor_id.clone()));
    }
    self.inner.resolver.lookup_actor(id)
  }

  pub fn registry(&self) -> &Arc<CommandRegistry> {
    &self.inner.registry
  }

  pub fn options(&self) -> &Arc<MailboxOptions> {
    &self.inner.options
  }

  pub fn event_bus(&self) -> &EventBus {
    &self.inner.event_bus
  }

  /// Generates the next unique handle ID.
  pub(crate) fn next_handle(&self) -> usize {
    // Relaxed ordering is sufficient for a simple counter
    self.inner.next_handle.fetch_add(1, Ordering::Relaxed)
  }
}

/// Builds a `Context`, falling back to defaults for anything not supplied.
pub struct ContextBuilder {
  actor_id: ActorId,
  is_arbiter: bool,
  resolver: Option<Arc<dyn ActorResolver>>,
  registry: Option<Arc<CommandRegistry>>,
  options: Option<MailboxOptions>,
}

impl ContextBuilder {
  pub fn arbiter(mut self, is_arbiter: bool) -> Self {
    self.is_arbiter = is_arbiter;
    self
  }

  pub fn resolver(mut self, resolver: Arc<dyn ActorResolver>) -> Self {
    self.resolver = Some(resolver);
    self
  }

  pub fn registry(mut self, registry: Arc<CommandRegistry>) -> Self {
    self.registry = Some(registry);
    self
  }

  pub fn options(mut self, options: MailboxOptions) -> Self {
    self.options = Some(options);
    self
  }

  pub fn build(self) -> Context {
    let options = self.options.unwrap_or_default();
    let resolver = self
      .resolver
      .unwrap_or_else(|| Arc::new(ActorDirectory::new()) as Arc<dyn ActorResolver>);
    resolver.bind_actor(self.actor_id.clone(), ActorHandle::Local(self.actor_id.clone()));
    let registry = self
      .registry
      .unwrap_or_else(|| Arc::new(CommandRegistry::with_builtins()));
    let event_bus = EventBus::with_capacity(options.event_bus_capacity);

    tracing::debug!(actor = %self.actor_id, arbiter = self.is_arbiter, "Context created");
    Context {
      inner: Arc::new(ContextInner {
        actor_id: self.actor_id,
        is_arbiter: self.is_arbiter,
        state: AtomicU8::new(ActorState::Initial as u8),
        resolver,
        registry,
        options: Arc::new(options),
        event_bus,
        next_handle: AtomicUsize::new(1),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn context_resolves_itself_and_the_alias() {
    let ctx = Context::arbiter("router");
    assert!(ctx.lookup_actor(&"router".into()).unwrap().is_local());
    assert!(ctx.lookup_actor(&ARBITER_ALIAS.into()).unwrap().is_local());

    let actor = Context::actor("a1");
    assert!(actor.lookup_actor(&ARBITER_ALIAS.into()).is_none());
  }

  #[tokio::test]
  async fn state_changes_are_published() {
    let ctx = Context::actor("a1");
    let mut rx = ctx.event_bus().subscribe();
    assert!(!ctx.is_running());
    ctx.set_state(ActorState::Running);
    ctx.set_state(ActorState::Running);
    assert!(ctx.is_running());
    match rx.recv().await.unwrap() {
      SystemEvent::ActorStateChanged { state, .. } => assert_eq!(state, ActorState::Running),
      other => panic!("unexpected event {:?}", other),
    }
    assert!(rx.try_recv().is_err(), "repeated state must not republish");
  }
}
