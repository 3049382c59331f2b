// src/runtime/mod.rs

//! Core asynchronous primitives: transport commands, mailboxes, the event bus.

pub mod command;
pub mod event_bus;
pub mod mailbox;
pub mod system_events;

pub use command::TransportCmd;
pub use event_bus::EventBus;
pub use mailbox::{mailbox, MailboxReceiver, MailboxSender};
pub use system_events::SystemEvent;
