// src/mailbox/proxy.rs

use crate::actor::ActorId;
use crate::context::Context;
use crate::error::MailboxError;
use crate::message::{Kwargs, Value};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// What an actor needs from its mailbox, whichever side of the router it is on.
#[async_trait]
pub trait MailboxService: Send + Sync + fmt::Debug + 'static {
  async fn start(&self) -> Result<(), MailboxError>;

  async fn request(
    &self,
    sender: ActorId,
    target: ActorId,
    command: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
  ) -> Result<Value, MailboxError>;

  async fn close(&self);

  /// Context of the actor that owns the underlying connection(s).
  fn context(&self) -> &Context;
}

/// An actor's mailbox: either its own, or a delegate borrowing another
/// actor's connection.
#[derive(Clone)]
pub enum Mailbox {
  Owned(Arc<dyn MailboxService>),
  Delegated { owner: Arc<dyn MailboxService> },
}

impl fmt::Debug for Mailbox {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Mailbox::Owned(service) => f.debug_tuple("Owned").field(service).finish(),
      Mailbox::Delegated { owner } => f
        .debug_struct("Delegated")
        .field("owner", owner.context().actor_id())
        .finish(),
    }
  }
}

impl Mailbox {
  pub fn owned(service: impl MailboxService) -> Self {
    Mailbox::Owned(Arc::new(service))
  }

  /// A mailbox forwarding to `owner`. Delegating a delegate forwards to the
  /// actor that really owns the connection.
  pub fn delegate(owner: &Mailbox) -> Self {
    Mailbox::Delegated {
      owner: owner.service().clone(),
    }
  }

  pub fn service(&self) -> &Arc<dyn MailboxService> {
    match self {
      Mailbox::Owned(service) => service,
      Mailbox::Delegated { owner } => owner,
    }
  }

  pub fn is_delegated(&self) -> bool {
    matches!(self, Mailbox::Delegated { .. })
  }

  /// Starts the underlying service. A delegate's owner manages its own lifecycle.
  pub async fn start(&self) -> Result<(), MailboxError> {
    match self {
      Mailbox::Owned(service) => service.start().await,
      Mailbox::Delegated { .. } => Ok(()),
    }
  }

  pub async fn request(
    &self,
    sender: ActorId,
    target: ActorId,
    command: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
  ) -> Result<Value, MailboxError> {
    self.service().request(sender, target, command, args, kwargs).await
  }

  pub async fn close(&self) {
    if let Mailbox::Owned(service) = self {
      service.close().await;
    }
  }
}
