// src/mailbox/protocol.rs

use crate::actor::{ActorHandle, ActorId};
use crate::commands::{CommandHandler, CommandRequest};
use crate::context::Context;
use crate::error::MailboxError;
use crate::message::{CommandResult, Envelope, Failure, FailureKind, Kwargs, Message, PendingResult, Value};
use crate::protocol::{Frame, FrameCodec, OpCode};
use crate::runtime::SystemEvent;
use crate::transport::{Protocol, TransportHandle};

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

struct ConnectionInner {
  id: usize,
  transport: TransportHandle,
  context: Context,
  /// Correlation table: ack → sender of the pending result.
  pending: Mutex<HashMap<String, oneshot::Sender<CommandResult>>>,
  /// Cancelled once the reader side has seen the connection go away.
  lost: CancellationToken,
}

/// One mailbox connection, shared by its protocol (the reader side) and
/// everyone issuing requests on it.
#[derive(Clone)]
pub struct MailboxConnection {
  inner: Arc<ConnectionInner>,
}

impl fmt::Debug for MailboxConnection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MailboxConnection")
      .field("id", &self.inner.id)
      .field("peer_addr", &self.inner.transport.peer_addr())
      .field("pending", &self.pending_count())
      .finish()
  }
}

impl MailboxConnection {
  fn new(context: Context, transport: TransportHandle) -> Self {
    Self {
      inner: Arc::new(ConnectionInner {
        id: transport.id(),
        transport,
        context,
        pending: Mutex::new(HashMap::new()),
        lost: CancellationToken::new(),
      }),
    }
  }

  pub fn id(&self) -> usize {
    self.inner.id
  }

  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.inner.transport.peer_addr()
  }

  pub fn context(&self) -> &Context {
    &self.inner.context
  }

  pub fn transport(&self) -> &TransportHandle {
    &self.inner.transport
  }

  pub fn is_closed(&self) -> bool {
    self.inner.transport.is_closed()
  }

  /// Number of requests awaiting a callback.
  pub fn pending_count(&self) -> usize {
    self.inner.pending.lock().len()
  }

  /// Builds a command message and starts it on this connection.
  pub fn request(
    &self,
    command: &str,
    sender: ActorId,
    target: ActorId,
    args: Vec<Value>,
    kwargs: Kwargs,
  ) -> Result<Option<PendingResult>, MailboxError> {
    let message = Message::command(self.inner.context.registry(), command, sender, target, args, kwargs)?;
    self.start(message)
  }

  /// Writes `message`. Acked messages are registered in the correlation table
  /// before the write and their placeholder is returned; a failed write
  /// resolves it at once with the failure.
  pub fn start(&self, mut message: Message) -> Result<Option<PendingResult>, MailboxError> {
    if !message.requires_ack() {
      self.write_envelope(message.envelope())?;
      return Ok(None);
    }

    let (envelope, placeholder) = {
      let mut pending = self.inner.pending.lock();
      while message.ack().is_some_and(|ack| pending.contains_key(ack)) {
        tracing::debug!(conn = self.inner.id, "Correlation token collision; reissuing");
        message.reissue_ack();
      }
      let (envelope, responder, placeholder) = message.into_parts();
      if let (Some(ack), Some(tx)) = (envelope.ack(), responder) {
        pending.insert(ack.to_string(), tx);
      }
      (envelope, placeholder)
    };

    if let Err(e) = self.write_envelope(&envelope) {
      tracing::debug!(conn = self.inner.id, command = %envelope, error = %e, "Request write failed");
      if let Some(ack) = envelope.ack() {
        let _ = self.resolve(ack, Err(Failure::from(&e)));
      }
    }
    Ok(placeholder)
  }

  /// Serializes, frames and queues `envelope` on the transport.
  pub fn write_envelope(&self, envelope: &Envelope) -> Result<(), MailboxError> {
    let frame = encode_envelope(envelope, self.inner.context.options().max_frame_size)?;
    tracing::trace!(conn = self.inner.id, command = %envelope, ack = ?envelope.ack(), len = frame.len(), "Writing envelope");
    self.inner.transport.write(frame)
  }

  /// Hands `result` to whoever waits on `ack`.
  pub fn resolve(&self, ack: &str, result: CommandResult) -> Result<(), MailboxError> {
    let responder = self.inner.pending.lock().remove(ack);
    match responder {
      Some(tx) => {
        if tx.send(result).is_err() {
          tracing::debug!(conn = self.inner.id, ack, "Requester went away before its callback arrived");
        }
        Ok(())
      }
      None => Err(MailboxError::OrphanedCallback(ack.to_string())),
    }
  }

  /// Drops every correlation entry. Their placeholders never resolve.
  fn abandon_pending(&self) -> usize {
    let mut pending = self.inner.pending.lock();
    let abandoned = pending.len();
    pending.clear();
    abandoned
  }

  fn mark_lost(&self) {
    self.inner.lost.cancel();
  }

  pub fn is_lost(&self) -> bool {
    self.inner.lost.is_cancelled()
  }

  /// Completes once the connection has been lost and its pending requests
  /// abandoned.
  pub async fn lost(&self) {
    self.inner.lost.cancelled().await
  }

  /// Graceful close of the underlying transport.
  pub fn close(&self) {
    self.inner.transport.close();
  }
}

/// Serializes `envelope` into one binary frame.
pub(crate) fn encode_envelope(envelope: &Envelope, max_frame_size: usize) -> Result<Bytes, MailboxError> {
  let body = envelope.to_bytes()?;
  FrameCodec::new(max_frame_size).encode_payload(&body, OpCode::Binary)
}

/// Reader side of a mailbox connection: decodes frames, resolves callbacks and
/// dispatches commands.
pub struct MailboxProtocol {
  connection: MailboxConnection,
  codec: FrameCodec,
  buffer: BytesMut,
  local_jobs: Option<mpsc::UnboundedSender<LocalJob>>,
}

impl MailboxProtocol {
  pub fn new(context: Context, transport: TransportHandle) -> (MailboxConnection, Self) {
    let max_frame_size = context.options().max_frame_size;
    let connection = MailboxConnection::new(context, transport);
    let protocol = Self {
      connection: connection.clone(),
      codec: FrameCodec::new(max_frame_size),
      buffer: BytesMut::new(),
      local_jobs: None,
    };
    (connection, protocol)
  }

  fn handle_frame(&mut self, frame: Frame) -> Result<(), MailboxError> {
    match frame.opcode {
      OpCode::Binary => {
        let envelope = Envelope::from_bytes(&frame.payload)?;
        self.dispatch(envelope);
        Ok(())
      }
      OpCode::Ping => {
        let pong = self.codec.encode_payload(&frame.payload, OpCode::Pong)?;
        self.connection.transport().write(pong)
      }
      OpCode::Pong => Ok(()),
      OpCode::Close => {
        tracing::debug!(conn = self.connection.id(), "Peer sent close frame");
        self.connection.close();
        Ok(())
      }
      OpCode::Text | OpCode::Continuation => Err(MailboxError::Protocol(format!(
        "unexpected {:?} frame on a mailbox connection",
        frame.opcode
      ))),
    }
  }

  fn dispatch(&mut self, envelope: Envelope) {
    let conn_id = self.connection.id();
    match envelope {
      Envelope::Callback { ack: None, .. } => {
        let e = MailboxError::Protocol("callback without correlation token".into());
        tracing::error!(conn = conn_id, error = %e, "Dropping callback");
      }
      Envelope::Callback { ack: Some(ack), result } => {
        if let Err(e) = self.connection.resolve(&ack, result) {
          tracing::error!(conn = conn_id, %ack, error = %e, "Orphaned callback");
        }
      }
      Envelope::Command {
        command,
        sender,
        target,
        args,
        kwargs,
        ack,
      } => {
        tracing::trace!(conn = conn_id, %command, %sender, %target, ?ack, "Dispatching command");
        // Routing, including any relay write, happens here so frames leave in
        // the order they arrived.
        let context = self.connection.context().clone();
        match route(&context, Some(&self.connection), &command, sender, target, args, kwargs) {
          Route::Done(result) => reply(&self.connection, &command, ack, result),
          Route::Relayed { pending, via } => {
            tokio::spawn(await_relay(self.connection.clone(), via, command, ack, pending));
          }
          Route::Local(call) => {
            let job = LocalJob { call, ack };
            if let Err(e) = self.local_jobs().send(job) {
              tracing::error!(conn = conn_id, command = %e.0.call.command, "Local command worker gone; command dropped");
            }
          }
        }
      }
    }
  }

  /// Queue of commands executed in this process, started on first use.
  fn local_jobs(&mut self) -> &mpsc::UnboundedSender<LocalJob> {
    let connection = &self.connection;
    self.local_jobs.get_or_insert_with(|| {
      let (tx, rx) = mpsc::unbounded_channel();
      tokio::spawn(run_local_jobs(connection.clone(), rx));
      tx
    })
  }
}

impl Protocol for MailboxProtocol {
  fn connection_made(&mut self) {
    tracing::debug!(conn = self.connection.id(), peer = ?self.connection.peer_addr(), "Mailbox connection made");
    self.connection.context().event_bus().publish(SystemEvent::ConnectionMade {
      connection_id: self.connection.id(),
      peer_addr: self.connection.peer_addr(),
    });
  }

  fn data_received(&mut self, data: Bytes) -> Result<(), MailboxError> {
    self.buffer.extend_from_slice(&data);
    while let Some(frame) = self.codec.decode(&mut self.buffer)? {
      self.handle_frame(frame)?;
    }
    Ok(())
  }

  fn eof_received(&mut self) {
    tracing::debug!(conn = self.connection.id(), "Mailbox peer closed its side");
  }

  fn connection_lost(&mut self, error: Option<&MailboxError>) {
    let context = self.connection.context().clone();
    let conn_id = self.connection.id();
    let abandoned = self.connection.abandon_pending();
    self.connection.mark_lost();
    context.resolver().unbind_connection(conn_id);

    if context.is_arbiter() && context.is_running() {
      tracing::warn!(conn = conn_id, peer_addr = ?self.connection.peer_addr(), abandoned, error = ?error.map(|e| e.to_string()), "Lost connection with actor");
    } else {
      tracing::debug!(conn = conn_id, abandoned, error = ?error.map(|e| e.to_string()), "Mailbox connection lost");
    }

    context.event_bus().publish(SystemEvent::ConnectionLost {
      connection_id: conn_id,
      peer_addr: self.connection.peer_addr(),
      error_msg: error.map(|e| e.to_string()),
    });
  }
}

/// Sends `result` back when the command was acked; otherwise only failures are logged.
fn reply(connection: &MailboxConnection, command: &str, ack: Option<String>, result: CommandResult) {
  match ack {
    Some(ack) => {
      if let Err(e) = connection.write_envelope(&Envelope::callback(result, ack)) {
        tracing::debug!(conn = connection.id(), %command, error = %e, "Could not send callback");
      }
    }
    None => {
      if let Err(failure) = result {
        tracing::warn!(conn = connection.id(), %command, error = %failure, "Command failed with no one to report to");
      }
    }
  }
}

/// Forwards a relayed result to the connection the command came from. Gives
/// up quietly if either connection goes away first.
async fn await_relay(
  source: MailboxConnection,
  via: MailboxConnection,
  command: String,
  ack: Option<String>,
  pending: PendingResult,
) {
  tokio::select! {
    result = pending => reply(&source, &command, ack, result),
    _ = source.lost() => {
      tracing::debug!(conn = source.id(), %command, "Requester gone; dropping relayed result");
    }
    _ = via.lost() => {
      tracing::debug!(conn = source.id(), via = via.id(), %command, "Relay target gone; request abandoned");
    }
  }
}

struct LocalJob {
  call: LocalCall,
  ack: Option<String>,
}

/// Executes local commands in arrival order. Commands without
/// acknowledgement run to completion before the next one starts; acked ones
/// are started in order and may finish in any order.
async fn run_local_jobs(connection: MailboxConnection, mut jobs: mpsc::UnboundedReceiver<LocalJob>) {
  while let Some(LocalJob { call, ack }) = jobs.recv().await {
    match ack {
      None => {
        let command = call.command.clone();
        let result = call.run().await;
        reply(&connection, &command, None, result);
      }
      Some(ack) => {
        let connection = connection.clone();
        tokio::spawn(async move {
          let command = call.command.clone();
          let result = call.run().await;
          reply(&connection, &command, Some(ack), result);
        });
      }
    }
  }
  tracing::trace!(conn = connection.id(), "Local command worker finished");
}

/// Where a command goes, decided without suspending.
pub(crate) enum Route {
  /// Nothing left to wait for.
  Done(CommandResult),
  /// Written to the connection the target lives behind; its answer arrives
  /// through `pending`.
  Relayed { pending: PendingResult, via: MailboxConnection },
  /// To be executed in this process.
  Local(LocalCall),
}

/// A resolved local handler and its arguments, not yet started.
pub(crate) struct LocalCall {
  command: String,
  handler: Arc<dyn CommandHandler>,
  request: CommandRequest,
  args: Vec<Value>,
  kwargs: Kwargs,
}

impl LocalCall {
  /// Runs the handler. A panic becomes a `Panic` failure.
  pub(crate) async fn run(self) -> CommandResult {
    let LocalCall {
      command,
      handler,
      request,
      args,
      kwargs,
    } = self;
    match AssertUnwindSafe(handler.execute(request, args, kwargs)).catch_unwind().await {
      Ok(result) => result,
      Err(panic) => {
        let message = panic_message(&*panic);
        tracing::error!(%command, panic = %message, "Command handler panicked");
        Err(Failure::new(FailureKind::Panic, message))
      }
    }
  }
}

/// Resolves `target`. A remote target gets the command written to its
/// connection right away; a local one gets its handler looked up.
pub(crate) fn route(
  context: &Context,
  connection: Option<&MailboxConnection>,
  command: &str,
  sender: ActorId,
  target: ActorId,
  args: Vec<Value>,
  kwargs: Kwargs,
) -> Route {
  let Some(handle) = context.lookup_actor(&target) else {
    return Route::Done(Err(Failure::command(format!("Unknown actor {}", target))));
  };

  match handle {
    ActorHandle::Remote(target_conn) => {
      if context.lookup_actor(&sender).is_none() {
        return Route::Done(Err(Failure::command(format!("Unknown actor {}", sender))));
      }
      tracing::trace!(%command, %sender, %target, via = target_conn.id(), "Relaying command");
      match target_conn.request(command, sender, target, args, kwargs) {
        Ok(Some(pending)) => Route::Relayed {
          pending,
          via: target_conn,
        },
        Ok(None) => Route::Done(Ok(Value::Null)),
        Err(e) => Route::Done(Err(Failure::from(&e))),
      }
    }
    ActorHandle::Local(_) => {
      let Some(spec) = context.registry().get(command) else {
        return Route::Done(Err(Failure::new(
          FailureKind::CommandNotFound,
          format!("unknown {}", command),
        )));
      };
      Route::Local(LocalCall {
        command: command.to_string(),
        handler: spec.handler().clone(),
        request: CommandRequest {
          actor: context.clone(),
          caller: context.lookup_actor(&sender),
          sender,
          connection: connection.cloned(),
        },
        args,
        kwargs,
      })
    }
  }
}

/// Routes a command and waits for its result.
pub(crate) async fn execute_or_relay(
  context: &Context,
  connection: Option<&MailboxConnection>,
  command: &str,
  sender: ActorId,
  target: ActorId,
  args: Vec<Value>,
  kwargs: Kwargs,
) -> CommandResult {
  match route(context, connection, command, sender, target, args, kwargs) {
    Route::Done(result) => result,
    Route::Relayed { pending, .. } => pending.await,
    Route::Local(call) => call.run().await,
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "handler panicked".to_string()
  }
}
