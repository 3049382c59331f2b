//! rmailbox - an asynchronous actor mailbox over framed TCP (optionally TLS) connections, using Tokio.
//!
//! Actors connect to a router (the arbiter), announce themselves, and send
//! each other commands through it. Replies travel back as callbacks matched
//! by a correlation token.

pub mod actor;
pub mod commands;
pub mod context;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod options;
pub mod protocol;
pub mod runtime;
pub mod transport;

// Re-export core types for user convenience
pub use actor::{Actor, ActorDirectory, ActorHandle, ActorId, ActorResolver, ActorState, ARBITER_ALIAS};
pub use commands::{handler_fn, CommandHandler, CommandRegistry, CommandRequest};
pub use context::{Context, ContextBuilder};
pub use error::MailboxError;
pub use mailbox::{Mailbox, MailboxClient, MailboxConnection, MailboxServer, MailboxService};
pub use message::{CommandResult, Failure, FailureKind, Kwargs, Value};
pub use options::MailboxOptions;
pub use runtime::{EventBus, SystemEvent};
pub use transport::{TlsClientConfig, TlsSocket};

// --- Top-Level Functions ---

const VERSION_MAJOR: i32 = 0;
const VERSION_MINOR: i32 = 1;
const VERSION_PATCH: i32 = 0;

/// Returns the library version as a tuple (major, minor, patch).
pub fn version() -> (i32, i32, i32) {
  (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}

/// Returns the major version number of the library.
pub fn version_major() -> i32 {
  VERSION_MAJOR
}

/// Returns the minor version number of the library.
pub fn version_minor() -> i32 {
  VERSION_MINOR
}

/// Returns the patch version number of the library.
pub fn version_patch() -> i32 {
  VERSION_PATCH
}
