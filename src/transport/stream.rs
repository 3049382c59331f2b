// src/transport/stream.rs

use super::{Protocol, StreamSocket};
use crate::error::MailboxError;
use crate::options::MailboxOptions;
use crate::runtime::{MailboxReceiver, TransportCmd};

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io;
use tokio::task::JoinHandle;

/// Outcome of one step of the state machine.
#[derive(Debug)]
pub(crate) enum Flow {
  Continue,
  /// The transport is finished; `None` means a clean close.
  Done(Option<MailboxError>),
}

/// Owns one connected socket and drives it with readiness events.
///
/// Writes are queued and sent without blocking; a partial send trims the head
/// chunk in place. Reads are pushed to the protocol as they arrive, or
/// buffered while reading is paused.
pub struct StreamTransport<S: StreamSocket> {
  id: usize,
  socket: S,
  cmd_rx: MailboxReceiver,
  protocol: Box<dyn Protocol>,

  write_queue: VecDeque<Bytes>,
  max_write_chunk: usize,
  writing_paused: bool,

  read_buf: Vec<u8>,
  reading_paused: bool,
  /// Chunks received while reading was paused, in arrival order.
  paused_chunks: Vec<Bytes>,
  /// No more reads: the peer sent EOF or a graceful close is under way.
  read_closed: bool,
  /// Graceful close requested; finish once the queue is drained.
  closing: bool,
}

impl<S: StreamSocket> StreamTransport<S> {
  pub fn new(
    id: usize,
    socket: S,
    cmd_rx: MailboxReceiver,
    protocol: Box<dyn Protocol>,
    options: &MailboxOptions,
  ) -> Self {
    Self {
      id,
      socket,
      cmd_rx,
      protocol,
      write_queue: VecDeque::new(),
      max_write_chunk: options.max_write_chunk.max(1),
      writing_paused: false,
      read_buf: vec![0u8; options.read_chunk_size.max(1)],
      reading_paused: false,
      paused_chunks: Vec::new(),
      read_closed: false,
      closing: false,
    }
  }

  /// Spawns the transport's task.
  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(self.run())
  }

  pub async fn run(mut self) {
    let transport_id = self.id;
    tracing::debug!(transport = transport_id, "Transport started");
    self.protocol.connection_made();

    let reason = loop {
      let want_write = self.has_output() && !self.writing_paused;
      let want_read = !self.read_closed;

      let flow = tokio::select! {
        biased;
        cmd = self.cmd_rx.recv() => match cmd {
          Ok(cmd) => self.handle_command(cmd),
          // Unreachable while the protocol holds a handle; treat as a close.
          Err(_) => Flow::Done(None),
        },
        ready = self.socket.writable(), if want_write => match ready {
          Ok(()) => self.flush(),
          Err(e) => Flow::Done(Some(MailboxError::from(e))),
        },
        ready = self.socket.readable(), if want_read => match ready {
          Ok(()) => self.on_readable(),
          Err(e) => Flow::Done(Some(MailboxError::from(e))),
        },
      };

      if let Flow::Done(reason) = flow {
        break reason;
      }
    };

    self.finish(reason);
  }

  fn finish(&mut self, reason: Option<MailboxError>) {
    self.cmd_rx.close();
    self.write_queue.clear();
    match &reason {
      None => tracing::debug!(transport = self.id, "Transport closed"),
      Some(e) => tracing::debug!(transport = self.id, error = %e, "Transport aborted"),
    }
    self.protocol.connection_lost(reason.as_ref());
  }

  pub(crate) fn handle_command(&mut self, cmd: TransportCmd) -> Flow {
    tracing::trace!(transport = self.id, cmd = cmd.variant_name(), "Transport command");
    match cmd {
      TransportCmd::Write(data) => {
        self.enqueue(data);
        self.try_flush()
      }
      TransportCmd::WriteAll(chunks) => {
        for data in chunks {
          self.enqueue(data);
        }
        self.try_flush()
      }
      TransportCmd::PauseReading => {
        self.reading_paused = true;
        Flow::Continue
      }
      TransportCmd::ResumeReading => self.resume_reading(),
      TransportCmd::PauseWriting => {
        self.writing_paused = true;
        Flow::Continue
      }
      TransportCmd::ResumeWriting => {
        self.writing_paused = false;
        self.try_flush()
      }
      TransportCmd::Close => {
        self.closing = true;
        self.read_closed = true;
        self.maybe_finish_close()
      }
      TransportCmd::Abort(reason) => {
        self.write_queue.clear();
        Flow::Done(Some(MailboxError::Aborted(reason)))
      }
    }
  }

  /// Splits oversized buffers so no queued chunk exceeds `max_write_chunk`.
  fn enqueue(&mut self, mut data: Bytes) {
    if self.closing {
      tracing::trace!(transport = self.id, len = data.len(), "Write after close dropped");
      return;
    }
    while data.len() > self.max_write_chunk {
      self.write_queue.push_back(data.split_to(self.max_write_chunk));
    }
    if !data.is_empty() {
      self.write_queue.push_back(data);
    }
  }

  /// Immediate send attempt after new data or a resume.
  fn try_flush(&mut self) -> Flow {
    if self.writing_paused {
      return Flow::Continue;
    }
    self.flush()
  }

  fn has_output(&self) -> bool {
    !self.write_queue.is_empty() || self.socket.has_pending_output()
  }

  /// Sends from the head of the queue until it is empty or the socket would block.
  pub(crate) fn flush(&mut self) -> Flow {
    match self.socket.flush_output() {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Continue,
      Err(e) => {
        tracing::debug!(transport = self.id, error = %e, "Socket write failed");
        return Flow::Done(Some(MailboxError::from(e)));
      }
    }
    while let Some(head) = self.write_queue.front_mut() {
      match self.socket.try_write(head) {
        Ok(0) => break,
        Ok(n) if n >= head.len() => {
          tracing::trace!(transport = self.id, sent = n, "Chunk sent");
          self.write_queue.pop_front();
        }
        Ok(n) => {
          tracing::trace!(transport = self.id, sent = n, left = head.len() - n, "Partial send");
          head.advance(n);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => {
          tracing::debug!(transport = self.id, error = %e, "Socket write failed");
          return Flow::Done(Some(MailboxError::from(e)));
        }
      }
    }
    self.maybe_finish_close()
  }

  fn maybe_finish_close(&mut self) -> Flow {
    if self.closing && !self.has_output() {
      if let Err(e) = self.socket.shutdown() {
        tracing::trace!(transport = self.id, error = %e, "Socket shutdown failed");
      }
      return Flow::Done(None);
    }
    Flow::Continue
  }

  /// Receives until the socket would block.
  pub(crate) fn on_readable(&mut self) -> Flow {
    let mut first = true;
    loop {
      match self.socket.try_read(&mut self.read_buf) {
        Ok(0) => {
          if first {
            tracing::debug!(transport = self.id, "Peer closed the connection");
            self.protocol.eof_received();
            self.read_closed = true;
            self.closing = true;
            return self.maybe_finish_close();
          }
          return Flow::Continue;
        }
        Ok(n) => {
          first = false;
          let chunk = Bytes::copy_from_slice(&self.read_buf[..n]);
          tracing::trace!(transport = self.id, len = n, paused = self.reading_paused, "Received chunk");
          if self.reading_paused {
            self.paused_chunks.push(chunk);
          } else if let Err(e) = self.protocol.data_received(chunk) {
            tracing::error!(transport = self.id, error = %e, "Protocol rejected data; aborting");
            return Flow::Done(Some(e));
          }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Continue,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => {
          tracing::debug!(transport = self.id, error = %e, "Socket read failed");
          return Flow::Done(Some(MailboxError::from(e)));
        }
      }
    }
  }

  fn resume_reading(&mut self) -> Flow {
    self.reading_paused = false;
    for chunk in std::mem::take(&mut self.paused_chunks) {
      if let Err(e) = self.protocol.data_received(chunk) {
        tracing::error!(transport = self.id, error = %e, "Protocol rejected buffered data; aborting");
        return Flow::Done(Some(e));
      }
    }
    Flow::Continue
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::TransportHandle;
  use async_trait::async_trait;
  use parking_lot::Mutex;
  use std::net::SocketAddr;
  use std::sync::Arc;

  #[derive(Default)]
  struct MockState {
    reads: VecDeque<io::Result<Vec<u8>>>,
    written: Vec<u8>,
    /// Bytes the socket accepts before reporting would-block. `None` is unlimited.
    write_budget: Option<usize>,
    /// Bytes held below the write interface, like unsent TLS records.
    held: usize,
    shutdown: bool,
  }

  #[derive(Clone, Default)]
  struct MockSocket(Arc<Mutex<MockState>>);

  impl MockSocket {
    fn script_read(&self, data: io::Result<&[u8]>) {
      self.0.lock().reads.push_back(data.map(|d| d.to_vec()));
    }

    fn set_budget(&self, budget: Option<usize>) {
      self.0.lock().write_budget = budget;
    }

    fn written(&self) -> Vec<u8> {
      self.0.lock().written.clone()
    }
  }

  #[async_trait]
  impl StreamSocket for MockSocket {
    async fn readable(&self) -> io::Result<()> {
      Ok(())
    }

    async fn writable(&self) -> io::Result<()> {
      Ok(())
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
      match self.0.lock().reads.pop_front() {
        Some(Ok(data)) => {
          buf[..data.len()].copy_from_slice(&data);
          Ok(data.len())
        }
        Some(Err(e)) => Err(e),
        None => Err(io::ErrorKind::WouldBlock.into()),
      }
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
      let mut state = self.0.lock();
      let n = match state.write_budget {
        None => buf.len(),
        Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
        Some(budget) => budget.min(buf.len()),
      };
      if let Some(budget) = state.write_budget.as_mut() {
        *budget -= n;
      }
      state.written.extend_from_slice(&buf[..n]);
      Ok(n)
    }

    fn has_pending_output(&self) -> bool {
      self.0.lock().held > 0
    }

    fn flush_output(&self) -> io::Result<()> {
      let mut state = self.0.lock();
      if state.held > 0 && state.write_budget == Some(0) {
        return Err(io::ErrorKind::WouldBlock.into());
      }
      state.held = 0;
      Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
      self.0.lock().shutdown = true;
      Ok(())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
      Ok(SocketAddr::from(([127, 0, 0, 1], 1)))
    }
  }

  #[derive(Debug, PartialEq)]
  enum Event {
    Data(Vec<u8>),
    Eof,
    Lost(Option<String>),
  }

  struct Recorder(Arc<Mutex<Vec<Event>>>);

  impl Protocol for Recorder {
    fn data_received(&mut self, data: Bytes) -> Result<(), MailboxError> {
      self.0.lock().push(Event::Data(data.to_vec()));
      Ok(())
    }

    fn eof_received(&mut self) {
      self.0.lock().push(Event::Eof);
    }

    fn connection_lost(&mut self, error: Option<&MailboxError>) {
      self.0.lock().push(Event::Lost(error.map(|e| e.to_string())));
    }
  }

  fn transport(max_write_chunk: usize) -> (StreamTransport<MockSocket>, MockSocket, Arc<Mutex<Vec<Event>>>) {
    let socket = MockSocket::default();
    let events = Arc::new(Mutex::new(Vec::new()));
    let (_handle, rx) = TransportHandle::channel(1, None);
    let options = MailboxOptions {
      max_write_chunk,
      read_chunk_size: 64,
      ..MailboxOptions::default()
    };
    let t = StreamTransport::new(1, socket.clone(), rx, Box::new(Recorder(events.clone())), &options);
    (t, socket, events)
  }

  #[test]
  fn oversized_writes_are_split_and_sent_in_order() {
    let (mut t, socket, _) = transport(4);
    socket.set_budget(Some(0));
    t.handle_command(TransportCmd::Write(Bytes::from_static(b"0123456789")));
    t.handle_command(TransportCmd::Write(Bytes::from_static(b"ab")));
    let lens: Vec<usize> = t.write_queue.iter().map(|c| c.len()).collect();
    assert_eq!(lens, vec![4, 4, 2, 2]);

    socket.set_budget(None);
    assert!(matches!(t.flush(), Flow::Continue));
    assert_eq!(socket.written(), b"0123456789ab");
    assert!(t.write_queue.is_empty());
  }

  #[test]
  fn partial_send_trims_head_in_place() {
    let (mut t, socket, _) = transport(1024);
    socket.set_budget(Some(3));
    t.handle_command(TransportCmd::WriteAll(vec![Bytes::from_static(b"hello"), Bytes::from_static(b"!")]));
    assert_eq!(socket.written(), b"hel");
    assert_eq!(t.write_queue.len(), 2);
    assert_eq!(&t.write_queue[0][..], b"lo");

    socket.set_budget(None);
    t.flush();
    assert_eq!(socket.written(), b"hello!");
  }

  #[test]
  fn paused_writes_go_out_after_resume() {
    let (mut t, socket, _) = transport(1024);
    t.handle_command(TransportCmd::PauseWriting);
    t.handle_command(TransportCmd::Write(Bytes::from_static(b"first ")));
    t.handle_command(TransportCmd::Write(Bytes::from_static(b"second")));
    assert!(socket.written().is_empty());
    assert_eq!(t.write_queue.len(), 2);

    t.handle_command(TransportCmd::ResumeWriting);
    assert_eq!(socket.written(), b"first second");
  }

  #[test]
  fn paused_reads_are_replayed_in_order() {
    let (mut t, socket, events) = transport(1024);
    socket.script_read(Ok(b"x"));
    socket.script_read(Ok(b"yz"));
    t.handle_command(TransportCmd::PauseReading);
    assert!(matches!(t.on_readable(), Flow::Continue));
    assert!(events.lock().is_empty());

    t.handle_command(TransportCmd::ResumeReading);
    assert_eq!(*events.lock(), vec![Event::Data(b"x".to_vec()), Event::Data(b"yz".to_vec())]);
    assert!(t.paused_chunks.is_empty());
  }

  #[test]
  fn zero_read_on_first_receive_is_eof() {
    let (mut t, socket, events) = transport(1024);
    socket.script_read(Ok(b""));
    assert!(matches!(t.on_readable(), Flow::Done(None)));
    assert_eq!(*events.lock(), vec![Event::Eof]);
    assert!(socket.0.lock().shutdown);
  }

  #[test]
  fn read_error_aborts() {
    let (mut t, socket, _) = transport(1024);
    socket.script_read(Ok(b"a"));
    socket.script_read(Err(io::ErrorKind::ConnectionReset.into()));
    match t.on_readable() {
      Flow::Done(Some(e)) => assert!(e.is_connection_error()),
      other => panic!("unexpected flow {:?}", other),
    }
  }

  #[test]
  fn close_drains_before_finishing() {
    let (mut t, socket, _) = transport(1024);
    socket.set_budget(Some(0));
    t.handle_command(TransportCmd::Write(Bytes::from_static(b"bye")));
    assert!(matches!(t.handle_command(TransportCmd::Close), Flow::Continue));
    t.handle_command(TransportCmd::Write(Bytes::from_static(b"late")));

    socket.set_budget(None);
    assert!(matches!(t.flush(), Flow::Done(None)));
    assert_eq!(socket.written(), b"bye");
    assert!(socket.0.lock().shutdown);
  }

  #[test]
  fn abort_drops_queue_and_reports_reason() {
    let (mut t, socket, events) = transport(1024);
    socket.set_budget(Some(0));
    t.handle_command(TransportCmd::Write(Bytes::from_static(b"never")));
    let flow = t.handle_command(TransportCmd::Abort("bad frame".into()));
    let Flow::Done(reason) = flow else {
      panic!("abort must finish the transport");
    };
    t.finish(reason);
    assert!(socket.written().is_empty());
    assert_eq!(*events.lock(), vec![Event::Lost(Some("Connection aborted: bad frame".into()))]);
  }

  #[tokio::test]
  async fn run_loop_delivers_and_closes() {
    let (t, socket, events) = transport(1024);
    let (handle, rx) = TransportHandle::channel(2, None);
    let t = StreamTransport { cmd_rx: rx, ..t };
    socket.script_read(Ok(b"ping"));
    handle.write(Bytes::from_static(b"pong")).unwrap();
    handle.close();
    t.run().await;

    assert_eq!(socket.written(), b"pong");
    assert!(handle.is_closed());
    let events = events.lock();
    assert_eq!(events.last(), Some(&Event::Lost(None)));
  }

  #[test]
  fn close_waits_for_output_held_by_the_socket() {
    let (mut t, socket, _) = transport(1024);
    socket.set_budget(Some(0));
    socket.0.lock().held = 5;

    assert!(matches!(t.handle_command(TransportCmd::Close), Flow::Continue));
    assert!(!socket.0.lock().shutdown);
    assert!(t.has_output());

    socket.set_budget(None);
    assert!(matches!(t.flush(), Flow::Done(None)));
    assert!(socket.0.lock().shutdown);
  }
}
