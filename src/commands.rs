// src/commands.rs

//! Command registry and the built-in commands every mailbox understands.

use crate::actor::{ActorHandle, ActorId};
use crate::context::Context;
use crate::error::MailboxError;
use crate::mailbox::MailboxConnection;
use crate::message::{CommandResult, Kwargs, Value, CALLBACK_COMMAND};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub const PING: &str = "ping";
pub const ECHO: &str = "echo";
pub const NOTIFY: &str = "notify";

/// Execution context handed to a command handler.
#[derive(Debug, Clone)]
pub struct CommandRequest {
  /// Context of the actor executing the command.
  pub actor: Context,
  /// Id of the actor that sent the command.
  pub sender: ActorId,
  /// Where the sender can be reached, when it is known here.
  pub caller: Option<ActorHandle>,
  /// Connection the command arrived on. `None` for commands issued in-process.
  pub connection: Option<MailboxConnection>,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
  async fn execute(&self, request: CommandRequest, args: Vec<Value>, kwargs: Kwargs) -> CommandResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
  F: Fn(CommandRequest, Vec<Value>, Kwargs) -> Fut + Send + Sync,
  Fut: Future<Output = CommandResult> + Send + 'static,
{
  async fn execute(&self, request: CommandRequest, args: Vec<Value>, kwargs: Kwargs) -> CommandResult {
    (self.0)(request, args, kwargs).await
  }
}

/// Wraps an async closure as a `CommandHandler`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
  F: Fn(CommandRequest, Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = CommandResult> + Send + 'static,
{
  Arc::new(FnHandler(f))
}

/// A registered command.
#[derive(Clone)]
pub struct CommandSpec {
  name: String,
  ack: bool,
  handler: Arc<dyn CommandHandler>,
}

impl CommandSpec {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Whether the sender waits for a result.
  pub fn ack(&self) -> bool {
    self.ack
  }

  pub fn handler(&self) -> &Arc<dyn CommandHandler> {
    &self.handler
  }
}

impl fmt::Debug for CommandSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CommandSpec")
      .field("name", &self.name)
      .field("ack", &self.ack)
      .finish_non_exhaustive()
  }
}

/// Name → command table, fixed once the owning `Context` is built.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
  commands: HashMap<String, CommandSpec>,
}

impl CommandRegistry {
  /// An empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry holding `ping`, `echo` and `notify`.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    let builtins: [(&str, Arc<dyn CommandHandler>); 3] =
      [(PING, Arc::new(Ping)), (ECHO, Arc::new(Echo)), (NOTIFY, Arc::new(Notify))];
    for (name, handler) in builtins {
      registry.commands.insert(
        name.to_string(),
        CommandSpec {
          name: name.to_string(),
          ack: true,
          handler,
        },
      );
    }
    registry
  }

  /// Registers `handler` under `name`, replacing any previous command of that name.
  pub fn register(
    &mut self,
    name: impl Into<String>,
    ack: bool,
    handler: Arc<dyn CommandHandler>,
  ) -> Result<(), MailboxError> {
    let name = name.into();
    if name == CALLBACK_COMMAND {
      return Err(MailboxError::InvalidArgument(format!("command name '{}' is reserved", name)));
    }
    if name.is_empty() {
      return Err(MailboxError::InvalidArgument("command name must not be empty".into()));
    }
    if self
      .commands
      .insert(name.clone(), CommandSpec { name: name.clone(), ack, handler })
      .is_some()
    {
      tracing::debug!(command = %name, "Replaced registered command");
    }
    Ok(())
  }

  pub fn get(&self, name: &str) -> Option<&CommandSpec> {
    self.commands.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.commands.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.commands.len()
  }

  pub fn is_empty(&self) -> bool {
    self.commands.is_empty()
  }
}

struct Ping;

#[async_trait]
impl CommandHandler for Ping {
  async fn execute(&self, _request: CommandRequest, _args: Vec<Value>, _kwargs: Kwargs) -> CommandResult {
    Ok(Value::from("pong"))
  }
}

/// Returns its first argument, or null.
struct Echo;

#[async_trait]
impl CommandHandler for Echo {
  async fn execute(&self, _request: CommandRequest, args: Vec<Value>, _kwargs: Kwargs) -> CommandResult {
    Ok(args.into_iter().next().unwrap_or_default())
  }
}

/// Records where the sender lives: the connection the command came in on, or
/// this process when it was issued locally.
struct Notify;

#[async_trait]
impl CommandHandler for Notify {
  async fn execute(&self, request: CommandRequest, _args: Vec<Value>, _kwargs: Kwargs) -> CommandResult {
    let handle = match request.connection {
      Some(conn) => ActorHandle::Remote(conn),
      None => ActorHandle::Local(request.sender.clone()),
    };
    tracing::debug!(actor = %request.actor.actor_id(), sender = %request.sender, "Actor notified its location");
    request.actor.resolver().bind_actor(request.sender, handle);
    Ok(Value::Bool(true))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::Failure;

  fn request(ctx: &Context, sender: &str) -> CommandRequest {
    CommandRequest {
      actor: ctx.clone(),
      sender: sender.into(),
      caller: None,
      connection: None,
    }
  }

  #[test]
  fn callback_name_is_reserved() {
    let mut registry = CommandRegistry::new();
    let err = registry
      .register(CALLBACK_COMMAND, true, handler_fn(|_, _, _| async { Ok(Value::Null) }))
      .unwrap_err();
    assert!(matches!(err, MailboxError::InvalidArgument(_)));
    assert!(registry.is_empty());
  }

  #[test]
  fn builtins_are_acked() {
    let registry = CommandRegistry::with_builtins();
    assert_eq!(registry.len(), 3);
    for name in [PING, ECHO, NOTIFY] {
      assert!(registry.get(name).unwrap().ack(), "{} should be acked", name);
    }
  }

  #[tokio::test]
  async fn builtin_handlers_answer() {
    let ctx = Context::arbiter("router");
    let registry = CommandRegistry::with_builtins();

    let ping = registry.get(PING).unwrap().handler().clone();
    assert_eq!(ping.execute(request(&ctx, "a"), vec![], Kwargs::new()).await, Ok("pong".into()));

    let echo = registry.get(ECHO).unwrap().handler().clone();
    assert_eq!(echo.execute(request(&ctx, "a"), vec![Value::Int(7)], Kwargs::new()).await, Ok(Value::Int(7)));
    assert_eq!(echo.execute(request(&ctx, "a"), vec![], Kwargs::new()).await, Ok(Value::Null));

    let notify = registry.get(NOTIFY).unwrap().handler().clone();
    assert_eq!(notify.execute(request(&ctx, "t1"), vec![], Kwargs::new()).await, Ok(Value::Bool(true)));
    assert!(ctx.lookup_actor(&"t1".into()).unwrap().is_local());
  }

  #[tokio::test]
  async fn closures_register_as_handlers() {
    let mut registry = CommandRegistry::new();
    registry
      .register(
        "fail",
        false,
        handler_fn(|_, _, _| async { Err(Failure::handler("boom")) }),
      )
      .unwrap();
    let spec = registry.get("fail").unwrap();
    assert!(!spec.ack());
    let ctx = Context::actor("a");
    let result = spec.handler().execute(request(&ctx, "b"), vec![], Kwargs::new()).await;
    assert_eq!(result.unwrap_err().message, "boom");
  }
}
