// src/mailbox/server.rs

use super::protocol::{execute_or_relay, MailboxConnection, MailboxProtocol};
use super::MailboxService;
use crate::actor::ActorId;
use crate::context::Context;
use crate::error::MailboxError;
use crate::message::{Kwargs, Value};
use crate::transport::{tcp, Protocol, ProtocolFactory};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The router's mailbox: accepts actor connections, one `MailboxProtocol`
/// each, and relays between them.
#[derive(Debug)]
pub struct MailboxServer {
  context: Context,
  local_addrs: Vec<SocketAddr>,
  accept_tasks: Mutex<Vec<JoinHandle<()>>>,
  connections: Arc<Mutex<Vec<MailboxConnection>>>,
}

impl MailboxServer {
  /// Binds `endpoint` and starts one accept loop per listening socket.
  pub async fn bind(context: Context, endpoint: &str) -> Result<Self, MailboxError> {
    let listeners = tcp::bind_listeners(endpoint, context.options()).await?;
    let local_addrs = listeners.iter().map(|l| l.local_addr()).collect();
    let connections = Arc::new(Mutex::new(Vec::<MailboxConnection>::new()));

    let factory: ProtocolFactory = {
      let context = context.clone();
      let connections = connections.clone();
      Arc::new(move |handle| {
        let (conn, protocol) = MailboxProtocol::new(context.clone(), handle);
        let mut live = connections.lock();
        live.retain(|c| !c.is_closed());
        live.push(conn);
        Box::new(protocol) as Box<dyn Protocol>
      })
    };

    let accept_tasks = listeners
      .into_iter()
      .map(|listener| tokio::spawn(tcp::accept_loop(listener, context.clone(), factory.clone())))
      .collect();

    tracing::info!(actor = %context.actor_id(), uri = %endpoint, ?local_addrs, "Mailbox server listening");
    Ok(Self {
      context,
      local_addrs,
      accept_tasks: Mutex::new(accept_tasks),
      connections,
    })
  }

  pub fn local_addrs(&self) -> &[SocketAddr] {
    &self.local_addrs
  }

  /// Connections that are still open.
  pub fn connections(&self) -> Vec<MailboxConnection> {
    let mut live = self.connections.lock();
    live.retain(|c| !c.is_closed());
    live.clone()
  }

  /// Router-originated request, resolved like an inbound command.
  pub async fn request(
    &self,
    sender: ActorId,
    target: ActorId,
    command: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
  ) -> Result<Value, MailboxError> {
    Ok(execute_or_relay(&self.context, None, command, sender, target, args, kwargs).await?)
  }

  /// Stops accepting and closes every connection.
  pub async fn close(&self) {
    let tasks = std::mem::take(&mut *self.accept_tasks.lock());
    for task in &tasks {
      task.abort();
    }
    for task in tasks {
      if let Err(e) = task.await {
        if !e.is_cancelled() {
          tracing::error!(actor = %self.context.actor_id(), "Accept loop task panicked: {:?}", e);
        }
      }
    }
    let connections = std::mem::take(&mut *self.connections.lock());
    tracing::debug!(actor = %self.context.actor_id(), count = connections.len(), "Closing mailbox server");
    for conn in connections {
      conn.close();
    }
  }
}

#[async_trait]
impl MailboxService for MailboxServer {
  async fn start(&self) -> Result<(), MailboxError> {
    Ok(())
  }

  async fn request(
    &self,
    sender: ActorId,
    target: ActorId,
    command: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
  ) -> Result<Value, MailboxError> {
    MailboxServer::request(self, sender, target, command, args, kwargs).await
  }

  async fn close(&self) {
    MailboxServer::close(self).await
  }

  fn context(&self) -> &Context {
    &self.context
  }
}
