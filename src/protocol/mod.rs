// src/protocol/mod.rs

//! Wire framing used by mailbox connections.

pub mod frame;

pub use frame::{Frame, FrameCodec, OpCode};
