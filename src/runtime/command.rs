// src/runtime/command.rs

use bytes::Bytes;

/// Requests sent from a `TransportHandle` to the task owning the socket.
#[derive(Debug)]
pub enum TransportCmd {
  /// Queue one buffer for sending.
  Write(Bytes),
  /// Queue several buffers, in order.
  WriteAll(Vec<Bytes>),
  /// Stop delivering inbound bytes to the protocol; buffer them instead.
  PauseReading,
  /// Replay buffered chunks and resume delivery.
  ResumeReading,
  /// Stop sending; the queue keeps growing.
  PauseWriting,
  ResumeWriting,
  /// Drain the write queue, then shut the socket down.
  Close,
  /// Drop the write queue and close immediately.
  Abort(String),
}

impl TransportCmd {
  /// Returns a string representation of the command variant name.
  pub fn variant_name(&self) -> &'static str {
    match self {
      TransportCmd::Write(_) => "Write",
      TransportCmd::WriteAll(_) => "WriteAll",
      TransportCmd::PauseReading => "PauseReading",
      TransportCmd::ResumeReading => "ResumeReading",
      TransportCmd::PauseWriting => "PauseWriting",
      TransportCmd::ResumeWriting => "ResumeWriting",
      TransportCmd::Close => "Close",
      TransportCmd::Abort(_) => "Abort",
    }
  }
}
