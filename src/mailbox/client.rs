// src/mailbox/client.rs

use super::protocol::{MailboxConnection, MailboxProtocol};
use super::MailboxService;
use crate::actor::ActorId;
use crate::context::Context;
use crate::error::MailboxError;
use crate::message::{Kwargs, Value};
use crate::transport::{tcp, tls, Protocol, StreamSocket};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Actor-side mailbox: one outbound connection to the router, opened on the
/// first request. Once that connection is gone the client stays disconnected;
/// an actor re-announces itself only through a fresh start.
#[derive(Debug)]
pub struct MailboxClient {
  context: Context,
  endpoint: String,
  local_addr: Option<String>,
  /// Held across the connect so concurrent first requests share one attempt.
  connection: Mutex<Option<MailboxConnection>>,
  closed: AtomicBool,
}

impl MailboxClient {
  pub fn new(context: Context, endpoint: impl Into<String>) -> Self {
    Self {
      context,
      endpoint: endpoint.into(),
      local_addr: None,
      connection: Mutex::new(None),
      closed: AtomicBool::new(false),
    }
  }

  /// Binds the outbound socket to `local_addr` before connecting.
  pub fn with_local_addr(mut self, local_addr: impl Into<String>) -> Self {
    self.local_addr = Some(local_addr.into());
    self
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  /// Returns the connection, establishing it on first use. Fails with
  /// `ConnectionClosed` after the client was closed or its connection lost.
  pub async fn connection(&self) -> Result<MailboxConnection, MailboxError> {
    let mut slot = self.connection.lock().await;
    if self.closed.load(Ordering::Acquire) {
      return Err(MailboxError::ConnectionClosed);
    }
    if let Some(conn) = slot.as_ref() {
      if conn.is_closed() || conn.is_lost() {
        tracing::debug!(conn = conn.id(), uri = %self.endpoint, "Connection to router is gone");
        return Err(MailboxError::ConnectionClosed);
      }
      return Ok(conn.clone());
    }

    let options = self.context.options();
    let stream = tcp::connect(&self.endpoint, self.local_addr.as_deref(), options).await?;
    let conn = match &options.tls_client {
      Some(client) => {
        let secure = tls::connect(stream, client, options.tls_handshake_timeout).await?;
        self.attach(secure)?
      }
      None => self.attach(stream)?,
    };
    tracing::debug!(conn = conn.id(), uri = %self.endpoint, actor = %self.context.actor_id(), tls = options.tls_client.is_some(), "Connected to router");
    *slot = Some(conn.clone());
    Ok(conn)
  }

  fn attach<S: StreamSocket>(&self, stream: S) -> Result<MailboxConnection, MailboxError> {
    let mut established = None;
    tcp::start_transport(stream, &self.context, |handle| {
      let (conn, protocol) = MailboxProtocol::new(self.context.clone(), handle);
      established = Some(conn);
      Box::new(protocol) as Box<dyn Protocol>
    });
    established.ok_or_else(|| MailboxError::Internal("transport started without a protocol".into()))
  }

  /// Sends `command` to `target` and waits for its result. Commands without
  /// acknowledgement yield `Value::Null` as soon as they are written.
  pub async fn request(
    &self,
    sender: ActorId,
    target: ActorId,
    command: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
  ) -> Result<Value, MailboxError> {
    let conn = self.connection().await?;
    match conn.request(command, sender, target, args, kwargs)? {
      Some(pending) => Ok(pending.await?),
      None => Ok(Value::Null),
    }
  }

  /// Closes the connection if one is open. Idempotent.
  pub async fn close(&self) {
    self.closed.store(true, Ordering::Release);
    if let Some(conn) = self.connection.lock().await.take() {
      tracing::debug!(conn = conn.id(), uri = %self.endpoint, "Closing mailbox client");
      conn.close();
    }
  }
}

#[async_trait]
impl MailboxService for MailboxClient {
  async fn start(&self) -> Result<(), MailboxError> {
    self.connection().await.map(|_| ())
  }

  async fn request(
    &self,
    sender: ActorId,
    target: ActorId,
    command: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
  ) -> Result<Value, MailboxError> {
    MailboxClient::request(self, sender, target, command, args, kwargs).await
  }

  async fn close(&self) {
    MailboxClient::close(self).await
  }

  fn context(&self) -> &Context {
    &self.context
  }
}
