// src/transport/mod.rs

//! Non-blocking stream transports: the per-socket read/write state machine,
//! the TCP routines that dial, listen and accept, and optional TLS on top.

pub mod endpoint;
pub mod stream;
pub mod tcp;
pub mod tls;

pub use endpoint::{parse_endpoint, Endpoint};
pub use stream::StreamTransport;
pub use tls::{TlsClientConfig, TlsSocket};

use crate::error::MailboxError;
use crate::runtime::{mailbox, MailboxReceiver, MailboxSender, TransportCmd};

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Receives the events of one transport. Runs on the transport's task.
pub trait Protocol: Send + 'static {
  /// The transport task started.
  fn connection_made(&mut self) {}

  /// Bytes arrived, in order. An error aborts the connection.
  fn data_received(&mut self, data: Bytes) -> Result<(), MailboxError>;

  /// The peer closed its side cleanly. The transport closes next.
  fn eof_received(&mut self) {}

  /// The transport is gone. `None` after a clean close.
  fn connection_lost(&mut self, error: Option<&MailboxError>);
}

/// Builds the protocol for a freshly accepted connection.
pub type ProtocolFactory = Arc<dyn Fn(TransportHandle) -> Box<dyn Protocol> + Send + Sync>;

/// The readiness-based operations a transport needs from its socket.
///
/// Implemented for plain `tokio::net::TcpStream` and for `TlsSocket`.
#[async_trait]
pub trait StreamSocket: Send + Sync + 'static {
  async fn readable(&self) -> io::Result<()>;
  async fn writable(&self) -> io::Result<()>;
  fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
  fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

  /// True while bytes accepted by `try_write` are still buffered inside the
  /// socket layer, such as encrypted records the kernel would not take yet.
  fn has_pending_output(&self) -> bool {
    false
  }

  /// Pushes out what `has_pending_output` reports. `WouldBlock` if some is left.
  fn flush_output(&self) -> io::Result<()> {
    Ok(())
  }

  /// Shuts down the write half so the peer sees end-of-stream.
  fn shutdown(&self) -> io::Result<()>;
  fn peer_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl StreamSocket for tokio::net::TcpStream {
  async fn readable(&self) -> io::Result<()> {
    tokio::net::TcpStream::readable(self).await
  }

  async fn writable(&self) -> io::Result<()> {
    tokio::net::TcpStream::writable(self).await
  }

  fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
    tokio::net::TcpStream::try_read(self, buf)
  }

  fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
    tokio::net::TcpStream::try_write(self, buf)
  }

  fn shutdown(&self) -> io::Result<()> {
    socket2::SockRef::from(self).shutdown(std::net::Shutdown::Write)
  }

  fn peer_addr(&self) -> io::Result<SocketAddr> {
    tokio::net::TcpStream::peer_addr(self)
  }
}

/// Cloneable handle to a running transport. Every operation is a command
/// queued to the task owning the socket, so none of them blocks.
#[derive(Debug, Clone)]
pub struct TransportHandle {
  id: usize,
  peer_addr: Option<SocketAddr>,
  tx: MailboxSender,
}

impl TransportHandle {
  /// Creates a handle and the command receiver its transport will consume.
  pub fn channel(id: usize, peer_addr: Option<SocketAddr>) -> (Self, MailboxReceiver) {
    let (tx, rx) = mailbox();
    (Self { id, peer_addr, tx }, rx)
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.peer_addr
  }

  /// True once the transport task has finished.
  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  fn send_cmd(&self, cmd: TransportCmd) -> Result<(), MailboxError> {
    self.tx.try_send(cmd).map_err(|e| {
      tracing::trace!(transport = self.id, cmd = e.into_inner().variant_name(), "Transport gone; command dropped");
      MailboxError::ConnectionClosed
    })
  }

  pub fn write(&self, data: Bytes) -> Result<(), MailboxError> {
    self.send_cmd(TransportCmd::Write(data))
  }

  pub fn write_all(&self, chunks: Vec<Bytes>) -> Result<(), MailboxError> {
    self.send_cmd(TransportCmd::WriteAll(chunks))
  }

  pub fn pause_reading(&self) -> Result<(), MailboxError> {
    self.send_cmd(TransportCmd::PauseReading)
  }

  pub fn resume_reading(&self) -> Result<(), MailboxError> {
    self.send_cmd(TransportCmd::ResumeReading)
  }

  pub fn pause_writing(&self) -> Result<(), MailboxError> {
    self.send_cmd(TransportCmd::PauseWriting)
  }

  pub fn resume_writing(&self) -> Result<(), MailboxError> {
    self.send_cmd(TransportCmd::ResumeWriting)
  }

  /// Graceful close: queued writes are sent first.
  pub fn close(&self) {
    let _ = self.send_cmd(TransportCmd::Close);
  }

  /// Immediate close; queued writes are dropped.
  pub fn abort(&self, reason: impl Into<String>) {
    let _ = self.send_cmd(TransportCmd::Abort(reason.into()));
  }
}
