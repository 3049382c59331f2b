// tests/common.rs
#![allow(dead_code)] // Not every test file uses every helper

use rmailbox::runtime::SystemEvent;
use rmailbox::{handler_fn, Actor, CommandRegistry, Context, MailboxError, Value};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};

static TRACING_INIT: Once = Once::new();

fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    // Can be overridden by RUST_LOG env variable
    let default_filter = "rmailbox=debug,info";
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
      .with_max_level(tracing::Level::TRACE)
      .with_env_filter(env_filter)
      .with_target(true)
      .with_line_number(true)
      .with_test_writer()
      .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global tracing subscriber");
  });
}

/// Observations made by the test commands of one registry.
pub struct Observed {
  /// Arguments of every `tell` that ran.
  pub told: mpsc::UnboundedReceiver<Vec<Value>>,
  /// Fired when a `stall` handler starts.
  pub stalled: Arc<Notify>,
}

/// Built-ins plus:
/// - `tell` (no ack): reports its arguments to `Observed::told`;
/// - `stall` (ack): signals `Observed::stalled`, then never finishes in test time;
/// - `add` (ack): sums integer arguments;
/// - `whoami` (ack): the id of the executing actor.
pub fn test_registry() -> (Arc<CommandRegistry>, Observed) {
  let (told_tx, told) = mpsc::unbounded_channel();
  let stalled = Arc::new(Notify::new());
  let mut registry = CommandRegistry::with_builtins();

  registry
    .register(
      "tell",
      false,
      handler_fn(move |_, args, _| {
        let _ = told_tx.send(args);
        async { Ok(Value::Null) }
      }),
    )
    .expect("register tell");

  let signal = stalled.clone();
  registry
    .register(
      "stall",
      true,
      handler_fn(move |_, _, _| {
        signal.notify_one();
        async {
          tokio::time::sleep(Duration::from_secs(3600)).await;
          Ok(Value::Null)
        }
      }),
    )
    .expect("register stall");

  registry
    .register(
      "add",
      true,
      handler_fn(|_, args, _| async move { Ok(Value::Int(args.iter().filter_map(Value::as_int).sum())) }),
    )
    .expect("register add");

  registry
    .register(
      "whoami",
      true,
      handler_fn(|request, _, _| async move { Ok(Value::from(request.actor.actor_id().as_str())) }),
    )
    .expect("register whoami");

  (Arc::new(registry), Observed { told, stalled })
}

/// Starts a router on an ephemeral loopback port.
pub async fn start_router(id: &str, registry: Arc<CommandRegistry>) -> Result<Actor, MailboxError> {
  setup_tracing();
  let context = Context::builder(id).arbiter(true).registry(registry).build();
  let router = Actor::arbiter(context, "tcp://127.0.0.1:0").await?;
  router.start().await?;
  Ok(router)
}

pub fn router_uri(router: &Actor) -> String {
  let addr = router.address().expect("router has a listening address");
  format!("tcp://{}", addr)
}

/// Starts an actor connected to `router` and registered with it.
pub async fn start_actor(id: &str, router: &Actor, registry: Arc<CommandRegistry>) -> Result<Actor, MailboxError> {
  setup_tracing();
  let context = Context::builder(id).registry(registry).build();
  let actor = Actor::client(context, router_uri(router));
  actor.start().await?;
  Ok(actor)
}

/// Waits for the first event matching `check`, skipping others.
pub async fn wait_for_event(
  rx: &mut broadcast::Receiver<SystemEvent>,
  timeout: Duration,
  check: impl Fn(&SystemEvent) -> bool,
) -> Result<SystemEvent, String> {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    match tokio::time::timeout_at(deadline, rx.recv()).await {
      Ok(Ok(event)) => {
        if check(&event) {
          return Ok(event);
        }
      }
      Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
        tracing::warn!(skipped = n, "Event receiver lagged");
      }
      Ok(Err(broadcast::error::RecvError::Closed)) => return Err("event bus closed".to_string()),
      Err(_) => return Err(format!("Timeout waiting for event after {:?}", timeout)),
    }
  }
}
