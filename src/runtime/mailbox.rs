// src/runtime/mailbox.rs

//! Type aliases for transport command channels based on `async-channel`.

use crate::runtime::command::TransportCmd;

/// The sending end of a transport's command mailbox. Cloneable.
pub type MailboxSender = async_channel::Sender<TransportCmd>;

/// The receiving end of a transport's command mailbox.
pub type MailboxReceiver = async_channel::Receiver<TransportCmd>;

/// Creates a new command mailbox.
///
/// Unbounded: protocol writes are synchronous and must never wait on the
/// socket task. Flow control happens at the transport's write queue.
pub fn mailbox() -> (MailboxSender, MailboxReceiver) {
  async_channel::unbounded()
}
