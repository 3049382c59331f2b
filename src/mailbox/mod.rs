// src/mailbox/mod.rs

//! Mailboxes: the per-connection command protocol, the router-side server,
//! the actor-side client, and the `Mailbox` handle actors hold.

pub mod client;
pub mod protocol;
pub mod proxy;
pub mod server;

pub use client::MailboxClient;
pub use protocol::{MailboxConnection, MailboxProtocol};
pub use proxy::{Mailbox, MailboxService};
pub use server::MailboxServer;
