// src/transport/tcp.rs

//! TCP dialing, listening and accepting on top of non-blocking `socket2`
//! sockets registered with the tokio reactor.

use super::endpoint::{parse_endpoint, resolve};
use super::{tls, Protocol, ProtocolFactory, StreamSocket, StreamTransport, TransportHandle};
use crate::context::Context;
use crate::error::MailboxError;
use crate::options::MailboxOptions;

use socket2::{Domain, Protocol as SockProtocol, SockRef, Socket, TcpKeepalive, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::TcpStream;

/// Connects to `endpoint`, trying each resolved address in order.
///
/// When `local_addr` is given the socket is bound to a resolved local address
/// of the same family before connecting.
pub async fn connect(
  endpoint: &str,
  local_addr: Option<&str>,
  options: &MailboxOptions,
) -> Result<TcpStream, MailboxError> {
  let ep = parse_endpoint(endpoint)?;
  let candidates = resolve(&ep).await?;
  let locals = match local_addr {
    Some(local) => Some(resolve(&parse_endpoint(local)?).await?),
    None => None,
  };

  let stream = dial_candidates(&candidates, |addr| dial(addr, locals.as_deref())).await?;
  configure_stream(&stream, options)?;
  tracing::debug!(uri = %ep.uri, peer = ?stream.peer_addr().ok(), "TCP connection established");
  Ok(stream)
}

/// Tries each candidate in order and stops at the first success.
///
/// If every attempt fails: one failure, or failures that all read the same,
/// surface that failure; otherwise all of them are reported together.
pub(crate) async fn dial_candidates<T, F, Fut>(candidates: &[SocketAddr], mut dial: F) -> Result<T, MailboxError>
where
  F: FnMut(SocketAddr) -> Fut,
  Fut: Future<Output = io::Result<T>>,
{
  let mut errors = Vec::with_capacity(candidates.len());
  for &addr in candidates {
    match dial(addr).await {
      Ok(conn) => return Ok(conn),
      Err(e) => {
        tracing::debug!(%addr, error = %e, "Connect attempt failed");
        errors.push(e);
      }
    }
  }

  let texts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
  let same_text = texts.windows(2).all(|pair| pair[0] == pair[1]);
  match errors.into_iter().next() {
    None => Err(MailboxError::EndpointResolutionFailed("no candidate addresses".into())),
    Some(first) if same_text => Err(MailboxError::Io(first)),
    Some(_) => Err(MailboxError::MultipleConnectErrors(texts)),
  }
}

/// One non-blocking connect attempt.
async fn dial(addr: SocketAddr, locals: Option<&[SocketAddr]>) -> io::Result<TcpStream> {
  let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;
  socket.set_nonblocking(true)?;
  if let Some(locals) = locals {
    bind_local(&socket, addr, locals)?;
  }

  let connect_failed = |e: io::Error| io::Error::new(e.kind(), format!("Connect call failed {}: {}", addr, e));
  let socket = match socket.connect(&addr.into()) {
    Ok(()) => socket,
    Err(e) if connect_in_progress(&e) => {
      // Dropping this future while waiting deregisters the socket.
      let fd = AsyncFd::with_interest(socket, Interest::WRITABLE)?;
      {
        let _ready = fd.writable().await?;
      }
      if let Some(e) = fd.get_ref().take_error()? {
        return Err(connect_failed(e));
      }
      fd.into_inner()
    }
    Err(e) => return Err(connect_failed(e)),
  };

  TcpStream::from_std(std::net::TcpStream::from(socket))
}

fn connect_in_progress(e: &io::Error) -> bool {
  e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

fn bind_local(socket: &Socket, remote: SocketAddr, locals: &[SocketAddr]) -> io::Result<()> {
  let mut last_err = None;
  for laddr in locals.iter().filter(|l| l.is_ipv4() == remote.is_ipv4()) {
    match socket.bind(&(*laddr).into()) {
      Ok(()) => return Ok(()),
      Err(e) => {
        last_err = Some(io::Error::new(
          e.kind(),
          format!("error while attempting to bind on address {}: {}", laddr, e),
        ))
      }
    }
  }
  Err(last_err.unwrap_or_else(|| {
    io::Error::new(
      io::ErrorKind::AddrNotAvailable,
      format!("no local address of the same family as {} to bind", remote),
    )
  }))
}

/// Applies the per-connection TCP options.
pub(crate) fn configure_stream(stream: &TcpStream, options: &MailboxOptions) -> io::Result<()> {
  stream.set_nodelay(options.tcp_nodelay)?;
  if let Some(idle) = options.tcp_keepalive {
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
  }
  Ok(())
}

/// Wraps an established stream, plain or TLS, in a transport task.
/// `make_protocol` receives the transport's handle before the task starts.
pub(crate) fn start_transport<S: StreamSocket>(
  stream: S,
  context: &Context,
  make_protocol: impl FnOnce(TransportHandle) -> Box<dyn Protocol>,
) -> TransportHandle {
  let id = context.next_handle();
  let (handle, cmd_rx) = TransportHandle::channel(id, stream.peer_addr().ok());
  let protocol = make_protocol(handle.clone());
  StreamTransport::new(id, stream, cmd_rx, protocol, context.options()).spawn();
  handle
}

/// A bound, listening, non-blocking socket registered for readability.
#[derive(Debug)]
pub struct Listener {
  fd: AsyncFd<Socket>,
  local_addr: SocketAddr,
}

impl Listener {
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }
}

/// Binds one listening socket per resolved address of `endpoint`.
///
/// If any socket cannot be created, configured or bound, every socket created
/// so far is closed before the error is returned.
pub async fn bind_listeners(endpoint: &str, options: &MailboxOptions) -> Result<Vec<Listener>, MailboxError> {
  let ep = parse_endpoint(endpoint)?;
  let candidates = resolve(&ep).await?;

  let mut sockets = Vec::with_capacity(candidates.len());
  for addr in candidates {
    match open_listen_socket(addr, options) {
      Ok(socket) => sockets.push(socket),
      Err(e) => {
        tracing::debug!(uri = %ep.uri, %addr, error = %e, closing = sockets.len(), "Bind failed; closing sockets");
        drop(sockets);
        return Err(MailboxError::from_io_endpoint(e, &ep.uri));
      }
    }
  }

  let mut listeners = Vec::with_capacity(sockets.len());
  for socket in sockets {
    socket.listen(options.listen_backlog)?;
    socket.set_nonblocking(true)?;
    let local_addr = socket
      .local_addr()?
      .as_socket()
      .ok_or_else(|| MailboxError::Internal("listening socket has no inet address".into()))?;
    let fd = AsyncFd::with_interest(socket, Interest::READABLE)?;
    tracing::info!(uri = %ep.uri, %local_addr, "TCP listener bound");
    listeners.push(Listener { fd, local_addr });
  }
  Ok(listeners)
}

fn open_listen_socket(addr: SocketAddr, options: &MailboxOptions) -> io::Result<Socket> {
  let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;
  if options.reuse_address {
    socket.set_reuse_address(true)?;
  }
  // One socket per family; no dual-stack listener.
  if addr.is_ipv6() {
    socket.set_only_v6(true)?;
  }
  socket.bind(&addr.into()).map_err(|e| {
    io::Error::new(
      e.kind(),
      format!("error while attempting to bind on address {}: {}", addr, e),
    )
  })?;
  Ok(socket)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
  /// Rejected by a packet filter after the handshake; accept again at once.
  Retry,
  /// Resource exhaustion or an aborted handshake.
  Transient,
  Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptFailure {
  match e.raw_os_error() {
    Some(libc::EPERM) => AcceptFailure::Retry,
    Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::ECONNABORTED) => AcceptFailure::Transient,
    _ => AcceptFailure::Fatal,
  }
}

/// Accepts connections on `listener` until the task is aborted. Each
/// connection gets a transport wired to a fresh protocol from `factory`.
pub(crate) async fn accept_loop(listener: Listener, context: Context, factory: ProtocolFactory) {
  let options = context.options().clone();
  let local_addr = listener.local_addr;
  tracing::debug!(%local_addr, "Accept loop started");

  loop {
    let mut guard = match listener.fd.readable().await {
      Ok(guard) => guard,
      Err(e) => {
        tracing::error!(%local_addr, error = %e, "Listener readiness failed; accept loop stopping");
        return;
      }
    };

    let mut back_off = false;
    for _ in 0..options.accept_batch.max(1) {
      match guard.try_io(|fd| fd.get_ref().accept()) {
        // Would block: readiness cleared, wait for the next event.
        Err(_would_block) => break,
        Ok(Ok((socket, _))) => {
          if let Err(e) = spawn_accepted(socket, &context, &factory) {
            tracing::warn!(%local_addr, error = %e, "Failed to set up accepted connection");
          }
        }
        Ok(Err(e)) => match classify_accept_error(&e) {
          AcceptFailure::Retry => continue,
          AcceptFailure::Transient => {
            tracing::info!(%local_addr, error = %e, "Could not accept new connection");
            back_off = true;
            break;
          }
          AcceptFailure::Fatal => {
            tracing::error!(%local_addr, error = %e, "Could not accept new connection");
            back_off = true;
            break;
          }
        },
      }
    }
    drop(guard);

    if back_off {
      tokio::time::sleep(options.accept_error_backoff).await;
    }
  }
}

fn spawn_accepted(socket: Socket, context: &Context, factory: &ProtocolFactory) -> io::Result<()> {
  socket.set_nonblocking(true)?;
  let stream = TcpStream::from_std(std::net::TcpStream::from(socket))?;
  configure_stream(&stream, context.options())?;

  let Some(config) = context.options().tls_server.clone() else {
    let handle = start_transport(stream, context, |handle| factory(handle));
    tracing::debug!(transport = handle.id(), peer = ?handle.peer_addr(), "Accepted connection");
    return Ok(());
  };

  // The handshake must not hold up the accept loop.
  let context = context.clone();
  let factory = factory.clone();
  tokio::spawn(async move {
    let peer = stream.peer_addr().ok();
    match tls::accept(stream, config, context.options().tls_handshake_timeout).await {
      Ok(secure) => {
        let handle = start_transport(secure, &context, |handle| factory(handle));
        tracing::debug!(transport = handle.id(), ?peer, "Accepted TLS connection");
      }
      Err(e) => tracing::warn!(?peer, error = %e, "TLS handshake with accepted connection failed"),
    }
  });
  Ok(())
}
