// src/message/envelope.rs

use crate::actor::ActorId;
use crate::error::MailboxError;
use crate::message::value::{Kwargs, Value};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Name under which callback envelopes are reported. Reserved in the registry.
pub const CALLBACK_COMMAND: &str = "callback";

/// Outcome of a command as carried back in a callback envelope.
pub type CommandResult = Result<Value, Failure>;

/// Category of a failure result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
  /// Routing or validation error (unknown actor, unknown sender).
  Command,
  /// The target process has no handler registered under that name.
  CommandNotFound,
  /// The handler returned an error.
  Handler,
  /// The handler panicked.
  Panic,
  /// The request never left this process.
  Connection,
}

impl fmt::Display for FailureKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      FailureKind::Command => "CommandError",
      FailureKind::CommandNotFound => "CommandNotFound",
      FailureKind::Handler => "HandlerError",
      FailureKind::Panic => "HandlerPanic",
      FailureKind::Connection => "ConnectionError",
    };
    f.write_str(name)
  }
}

/// A failure result. Travels over the wire inside a callback envelope.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct Failure {
  pub kind: FailureKind,
  pub message: String,
}

impl Failure {
  pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  pub fn command(message: impl Into<String>) -> Self {
    Self::new(FailureKind::Command, message)
  }

  pub fn handler(message: impl Into<String>) -> Self {
    Self::new(FailureKind::Handler, message)
  }
}

impl From<&MailboxError> for Failure {
  fn from(e: &MailboxError) -> Self {
    match e {
      MailboxError::CommandFailed(f) => f.clone(),
      MailboxError::CommandNotFound(name) => Failure::new(FailureKind::CommandNotFound, format!("unknown {}", name)),
      MailboxError::Command(msg) => Failure::command(msg.clone()),
      other if other.is_connection_error() => Failure::new(FailureKind::Connection, other.to_string()),
      other => Failure::handler(other.to_string()),
    }
  }
}

impl From<MailboxError> for Failure {
  fn from(e: MailboxError) -> Self {
    Failure::from(&e)
  }
}

/// The serialized body of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
  Command {
    command: String,
    sender: ActorId,
    target: ActorId,
    args: Vec<Value>,
    kwargs: Kwargs,
    ack: Option<String>,
  },
  Callback {
    result: CommandResult,
    ack: Option<String>,
  },
}

impl Envelope {
  pub fn callback(result: CommandResult, ack: impl Into<String>) -> Self {
    Envelope::Callback {
      result,
      ack: Some(ack.into()),
    }
  }

  pub fn command_name(&self) -> &str {
    match self {
      Envelope::Command { command, .. } => command,
      Envelope::Callback { .. } => CALLBACK_COMMAND,
    }
  }

  pub fn ack(&self) -> Option<&str> {
    match self {
      Envelope::Command { ack, .. } | Envelope::Callback { ack, .. } => ack.as_deref(),
    }
  }

  pub fn is_callback(&self) -> bool {
    matches!(self, Envelope::Callback { .. })
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>, MailboxError> {
    Ok(bincode::serialize(self)?)
  }

  /// Decodes a frame body. Any failure here means the stream is corrupt.
  pub fn from_bytes(body: &[u8]) -> Result<Self, MailboxError> {
    bincode::deserialize(body).map_err(|e| MailboxError::Protocol(format!("Could not decode message body: {}", e)))
  }
}

impl fmt::Display for Envelope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.command_name())
  }
}
