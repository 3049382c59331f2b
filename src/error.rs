// src/error.rs

use std::io;
use thiserror::Error;

use crate::message::Failure;

#[derive(Error, Debug)]
#[non_exhaustive] // Allows adding more variants later without breaking change
pub enum MailboxError {
  // --- I/O Errors ---
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  #[error("Invalid argument provided: {0}")]
  InvalidArgument(String),

  // --- Connection/Binding Errors ---
  #[error("Address already in use: {0}")]
  AddrInUse(String),
  #[error("Address not available: {0}")]
  AddrNotAvailable(String),
  #[error("Connection refused by peer: {0}")]
  ConnectionRefused(String),
  #[error("Connection closed by peer or transport")]
  ConnectionClosed,
  #[error("Connection aborted: {0}")]
  Aborted(String),
  #[error("Permission denied for endpoint: {0}")]
  PermissionDenied(String),
  /// Every candidate address failed to connect and the failures differ.
  #[error("Multiple exceptions: {}", .0.join(", "))]
  MultipleConnectErrors(Vec<String>),

  // --- Endpoint Errors ---
  #[error("Invalid endpoint format: {0}")]
  InvalidEndpoint(String),
  #[error("Endpoint resolution failed: {0}")]
  EndpointResolutionFailed(String),

  // --- Protocol Errors ---
  /// Malformed framing or an undecodable envelope. Fatal for the connection.
  #[error("Mailbox protocol violation: {0}")]
  Protocol(String),
  /// A callback arrived for a correlation token nobody is waiting on.
  #[error("Callback {0} not in pending callbacks")]
  OrphanedCallback(String),
  #[error("Serialization error: {0}")]
  Serialization(String),

  // --- Command Errors ---
  #[error("Unknown command: {0}")]
  CommandNotFound(String),
  #[error("Command error: {0}")]
  Command(String),
  /// The remote side answered with a failure result.
  #[error("Command failed: {0}")]
  CommandFailed(#[from] Failure),

  // --- Internal Errors ---
  #[error("Internal library error: {0}")]
  Internal(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, MailboxError>;

// Helper function to map common std::io::Error kinds
impl MailboxError {
  pub fn from_io_endpoint(e: io::Error, endpoint: &str) -> Self {
    match e.kind() {
      io::ErrorKind::AddrInUse => MailboxError::AddrInUse(endpoint.to_string()),
      io::ErrorKind::AddrNotAvailable => MailboxError::AddrNotAvailable(endpoint.to_string()),
      io::ErrorKind::ConnectionRefused => MailboxError::ConnectionRefused(endpoint.to_string()),
      io::ErrorKind::PermissionDenied => MailboxError::PermissionDenied(endpoint.to_string()),
      io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => MailboxError::ConnectionClosed,
      _ => MailboxError::Io(e),
    }
  }

  /// True for errors that mean the connection itself is gone. A `Protocol`
  /// error on its own does not say that: an oversized outgoing frame fails
  /// before anything is written.
  pub fn is_connection_error(&self) -> bool {
    match self {
      MailboxError::ConnectionClosed | MailboxError::Aborted(_) => true,
      MailboxError::Io(e) => matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
      ),
      _ => false,
    }
  }
}

impl From<bincode::Error> for MailboxError {
  fn from(e: bincode::Error) -> Self {
    MailboxError::Serialization(e.to_string())
  }
}
