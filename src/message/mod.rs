// src/message/mod.rs

//! The mailbox message: an envelope plus the local placeholder for its result.

pub mod envelope;
pub mod value;

pub use envelope::{CommandResult, Envelope, Failure, FailureKind, CALLBACK_COMMAND};
pub use value::{Kwargs, Value};

use crate::actor::ActorId;
use crate::commands::CommandRegistry;
use crate::error::MailboxError;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::oneshot;

/// Length of a correlation token in hex characters.
pub const ACK_LEN: usize = 8;

/// Generates a short correlation token. Uniqueness among pending requests is
/// enforced by the connection that registers it.
pub fn new_ack() -> String {
  format!("{:0width$x}", rand::random::<u32>(), width = ACK_LEN)
}

/// A message travelling from actor to actor.
#[derive(Debug)]
pub struct Message {
  envelope: Envelope,
  responder: Option<oneshot::Sender<CommandResult>>,
  pending: Option<PendingResult>,
}

impl Message {
  /// Builds a command message. Commands declared with `ack` get a correlation
  /// token and a pending result; the others are fire-and-forget.
  pub fn command(
    registry: &CommandRegistry,
    command: &str,
    sender: ActorId,
    target: ActorId,
    args: Vec<Value>,
    kwargs: Kwargs,
  ) -> Result<Self, MailboxError> {
    let spec = registry
      .get(command)
      .ok_or_else(|| MailboxError::CommandNotFound(command.to_string()))?;

    let (ack, responder, pending) = if spec.ack() {
      let ack = new_ack();
      let (tx, rx) = oneshot::channel();
      (Some(ack.clone()), Some(tx), Some(PendingResult::new(ack, rx)))
    } else {
      (None, None, None)
    };

    Ok(Self {
      envelope: Envelope::Command {
        command: spec.name().to_string(),
        sender,
        target,
        args,
        kwargs,
        ack,
      },
      responder,
      pending,
    })
  }

  /// Builds the response to a request carrying `ack`.
  pub fn callback(result: CommandResult, ack: impl Into<String>) -> Self {
    Self {
      envelope: Envelope::callback(result, ack),
      responder: None,
      pending: None,
    }
  }

  pub fn envelope(&self) -> &Envelope {
    &self.envelope
  }

  pub fn ack(&self) -> Option<&str> {
    self.envelope.ack()
  }

  pub fn requires_ack(&self) -> bool {
    self.responder.is_some()
  }

  /// Replaces the correlation token of an acked command that has not been sent.
  pub(crate) fn reissue_ack(&mut self) -> Option<&str> {
    if let Envelope::Command { ack: Some(ack), .. } = &mut self.envelope {
      *ack = new_ack();
      if let Some(pending) = self.pending.as_mut() {
        pending.ack = ack.clone();
      }
    }
    self.envelope.ack()
  }

  pub(crate) fn into_parts(self) -> (Envelope, Option<oneshot::Sender<CommandResult>>, Option<PendingResult>) {
    (self.envelope, self.responder, self.pending)
  }
}

/// Resolves with the result of an acked request.
///
/// If the connection the request went out on is torn down, the correlation
/// entry is abandoned and this future stays pending forever. Callers bound
/// the wait with their own timeout.
#[derive(Debug)]
pub struct PendingResult {
  ack: String,
  rx: oneshot::Receiver<CommandResult>,
  abandoned: bool,
}

impl PendingResult {
  pub(crate) fn new(ack: String, rx: oneshot::Receiver<CommandResult>) -> Self {
    Self {
      ack,
      rx,
      abandoned: false,
    }
  }

  /// A placeholder that is already resolved.
  pub(crate) fn ready(ack: String, result: CommandResult) -> Self {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    Self::new(ack, rx)
  }

  pub fn ack(&self) -> &str {
    &self.ack
  }
}

impl Future for PendingResult {
  type Output = CommandResult;

  fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
    if self.abandoned {
      return Poll::Pending;
    }
    match Pin::new(&mut self.rx).poll(cx) {
      Poll::Ready(Ok(result)) => Poll::Ready(result),
      Poll::Ready(Err(_)) => {
        tracing::debug!(ack = %self.ack, "Correlation entry dropped with its connection; result abandoned");
        self.abandoned = true;
        Poll::Pending
      }
      Poll::Pending => Poll::Pending,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::commands::CommandRegistry;

  #[test]
  fn acked_command_gets_token_and_placeholder() {
    let registry = CommandRegistry::with_builtins();
    let msg = Message::command(&registry, "ping", "a".into(), "b".into(), vec![], Kwargs::new()).unwrap();
    assert!(msg.requires_ack());
    let ack = msg.ack().unwrap().to_string();
    assert_eq!(ack.len(), ACK_LEN);
    let (_, responder, pending) = msg.into_parts();
    assert!(responder.is_some());
    assert_eq!(pending.unwrap().ack(), ack);
  }

  #[test]
  fn unknown_command_is_rejected() {
    let registry = CommandRegistry::with_builtins();
    let err = Message::command(&registry, "nope", "a".into(), "b".into(), vec![], Kwargs::new()).unwrap_err();
    assert!(matches!(err, MailboxError::CommandNotFound(ref name) if name == "nope"));
  }

  #[test]
  fn reissued_token_follows_the_placeholder() {
    let registry = CommandRegistry::with_builtins();
    let mut msg = Message::command(&registry, "echo", "a".into(), "b".into(), vec![], Kwargs::new()).unwrap();
    let new_ack = msg.reissue_ack().unwrap().to_string();
    let (env, _, pending) = msg.into_parts();
    assert_eq!(env.ack(), Some(new_ack.as_str()));
    assert_eq!(pending.unwrap().ack(), new_ack);
  }

  #[tokio::test]
  async fn placeholder_resolves_with_sent_result() {
    let (tx, rx) = oneshot::channel();
    let pending = PendingResult::new("00000001".into(), rx);
    tx.send(Ok(Value::from("pong"))).unwrap();
    assert_eq!(pending.await, Ok(Value::from("pong")));
  }

  #[tokio::test]
  async fn dropped_responder_leaves_placeholder_pending() {
    let (tx, rx) = oneshot::channel::<CommandResult>();
    let pending = PendingResult::new("00000002".into(), rx);
    drop(tx);
    let waited = tokio::time::timeout(std::time::Duration::from_millis(50), pending).await;
    assert!(waited.is_err(), "abandoned result must never resolve");
  }
}
