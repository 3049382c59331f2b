// src/options.rs

use crate::transport::TlsClientConfig;

use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_WRITE_CHUNK: usize = 64 * 1024;
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_ACCEPT_BATCH: usize = 30;
pub const DEFAULT_LISTEN_BACKLOG: i32 = 128;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 256;
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables shared by every transport and mailbox created from one `Context`.
#[derive(Debug, Clone)]
pub struct MailboxOptions {
  // Transport
  /// Writes larger than this are split before they are queued.
  pub max_write_chunk: usize,
  /// Size of the scratch buffer used for each non-blocking receive.
  pub read_chunk_size: usize,

  // Listener
  /// Connections accepted per readiness event.
  pub accept_batch: usize,
  pub listen_backlog: i32,
  pub reuse_address: bool,
  /// Pause before polling again after an accept failure.
  pub accept_error_backoff: Duration,

  // TCP specific (applied to every established stream)
  pub tcp_nodelay: bool,
  pub tcp_keepalive: Option<Duration>,

  // TLS. Plain TCP when unset.
  /// Accepted connections complete a server handshake with this config
  /// before their transport starts.
  pub tls_server: Option<Arc<ServerConfig>>,
  /// Outbound connections complete a client handshake with this config.
  pub tls_client: Option<TlsClientConfig>,
  pub tls_handshake_timeout: Duration,

  // Protocol
  /// Largest frame payload accepted or produced.
  pub max_frame_size: usize,

  pub event_bus_capacity: usize,
}

impl Default for MailboxOptions {
  fn default() -> Self {
    Self {
      max_write_chunk: DEFAULT_MAX_WRITE_CHUNK,
      read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
      accept_batch: DEFAULT_ACCEPT_BATCH,
      listen_backlog: DEFAULT_LISTEN_BACKLOG,
      reuse_address: cfg!(unix),
      accept_error_backoff: Duration::from_millis(100),
      tcp_nodelay: true,
      tcp_keepalive: None,
      tls_server: None,
      tls_client: None,
      tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
      max_frame_size: DEFAULT_MAX_FRAME_SIZE,
      event_bus_capacity: DEFAULT_EVENT_BUS_CAPACITY,
    }
  }
}
