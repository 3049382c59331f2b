// src/transport/tls.rs

//! TLS over a non-blocking TCP stream. A `rustls::Connection` is pumped by
//! hand with the stream's readiness API, so the transport state machine sees
//! plaintext through the same synchronous `try_read`/`try_write` calls it
//! uses for plain TCP.

use super::StreamSocket;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Client side settings: the rustls config plus the name the router's
/// certificate is checked against.
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
  pub config: Arc<ClientConfig>,
  pub server_name: ServerName<'static>,
}

impl TlsClientConfig {
  pub fn new(config: Arc<ClientConfig>, server_name: impl TryInto<ServerName<'static>>) -> io::Result<Self> {
    let server_name = server_name
      .try_into()
      .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid TLS server name"))?;
    Ok(Self { config, server_name })
  }
}

/// Adapts `TcpStream`'s non-blocking calls to `Read`/`Write` for rustls.
struct Nonblocking<'a>(&'a TcpStream);

impl Read for Nonblocking<'_> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.0.try_read(buf)
  }
}

impl Write for Nonblocking<'_> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.0.try_write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

fn invalid_data(e: rustls::Error) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, e)
}

/// An established TLS session over a TCP stream.
pub struct TlsSocket {
  tcp: TcpStream,
  tls: Mutex<Connection>,
}

impl std::fmt::Debug for TlsSocket {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsSocket")
      .field("peer_addr", &self.tcp.peer_addr().ok())
      .field("server_side", &matches!(*self.tls.lock(), Connection::Server(_)))
      .finish()
  }
}

/// Runs the client handshake on a connected stream.
pub async fn connect(tcp: TcpStream, client: &TlsClientConfig, within: Duration) -> io::Result<TlsSocket> {
  let conn = ClientConnection::new(client.config.clone(), client.server_name.clone()).map_err(invalid_data)?;
  handshake(tcp, Connection::Client(conn), within).await
}

/// Runs the server handshake on an accepted stream.
pub async fn accept(tcp: TcpStream, config: Arc<ServerConfig>, within: Duration) -> io::Result<TlsSocket> {
  let conn = ServerConnection::new(config).map_err(invalid_data)?;
  handshake(tcp, Connection::Server(conn), within).await
}

async fn handshake(tcp: TcpStream, mut conn: Connection, within: Duration) -> io::Result<TlsSocket> {
  let peer = tcp.peer_addr().ok();
  match tokio::time::timeout(within, drive_handshake(&tcp, &mut conn)).await {
    Ok(Ok(())) => {
      tracing::debug!(?peer, version = ?conn.protocol_version(), "TLS handshake complete");
      Ok(TlsSocket {
        tcp,
        tls: Mutex::new(conn),
      })
    }
    Ok(Err(e)) => {
      tracing::debug!(?peer, error = %e, "TLS handshake failed");
      Err(e)
    }
    Err(_elapsed) => Err(io::Error::new(
      io::ErrorKind::TimedOut,
      format!("TLS handshake not finished after {:?}", within),
    )),
  }
}

async fn drive_handshake(tcp: &TcpStream, conn: &mut Connection) -> io::Result<()> {
  loop {
    while conn.wants_write() {
      match conn.write_tls(&mut Nonblocking(tcp)) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => tcp.writable().await?,
        Err(e) => return Err(e),
      }
    }
    if !conn.is_handshaking() {
      return Ok(());
    }

    tcp.readable().await?;
    match conn.read_tls(&mut Nonblocking(tcp)) {
      Ok(0) => {
        return Err(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          "peer closed the connection during the TLS handshake",
        ))
      }
      Ok(_) => {
        if let Err(e) = conn.process_new_packets() {
          // Let the peer see the alert before giving up.
          let _ = conn.write_tls(&mut Nonblocking(tcp));
          return Err(invalid_data(e));
        }
      }
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
      Err(e) => return Err(e),
    }
  }
}

impl TlsSocket {
  /// Writes queued ciphertext. `WouldBlock` if some is left.
  fn write_ciphertext(&self, tls: &mut Connection) -> io::Result<()> {
    while tls.wants_write() {
      tls.write_tls(&mut Nonblocking(&self.tcp))?;
    }
    Ok(())
  }

  fn has_buffered_plaintext(&self) -> bool {
    match self.tls.lock().process_new_packets() {
      Ok(state) => state.plaintext_bytes_to_read() > 0 || state.peer_has_closed(),
      // Let the next read report it.
      Err(_) => true,
    }
  }
}

#[async_trait]
impl StreamSocket for TlsSocket {
  async fn readable(&self) -> io::Result<()> {
    if self.has_buffered_plaintext() {
      return Ok(());
    }
    self.tcp.readable().await
  }

  async fn writable(&self) -> io::Result<()> {
    self.tcp.writable().await
  }

  fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
    let mut tls = self.tls.lock();
    loop {
      match tls.reader().read(buf) {
        // Zero after close_notify: a clean end of stream.
        Ok(n) => return Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
      }

      tls.read_tls(&mut Nonblocking(&self.tcp))?;
      if let Err(e) = tls.process_new_packets() {
        let _ = self.write_ciphertext(&mut tls);
        return Err(invalid_data(e));
      }
      // Key updates and alerts may have queued records of their own.
      match self.write_ciphertext(&mut tls) {
        Err(e) if e.kind() != io::ErrorKind::WouldBlock => return Err(e),
        _ => {}
      }
    }
  }

  fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
    let mut tls = self.tls.lock();
    // Earlier records go first; no new plaintext while they are stuck.
    self.write_ciphertext(&mut tls)?;
    let n = tls.writer().write(buf)?;
    match self.write_ciphertext(&mut tls) {
      Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
      _ => Ok(n),
    }
  }

  fn has_pending_output(&self) -> bool {
    self.tls.lock().wants_write()
  }

  fn flush_output(&self) -> io::Result<()> {
    let mut tls = self.tls.lock();
    self.write_ciphertext(&mut tls)
  }

  fn shutdown(&self) -> io::Result<()> {
    {
      let mut tls = self.tls.lock();
      tls.send_close_notify();
      if let Err(e) = self.write_ciphertext(&mut tls) {
        tracing::trace!(peer = ?self.tcp.peer_addr().ok(), error = %e, "close_notify not fully sent");
      }
    }
    socket2::SockRef::from(&self.tcp).shutdown(std::net::Shutdown::Write)
  }

  fn peer_addr(&self) -> io::Result<SocketAddr> {
    self.tcp.peer_addr()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
  use rustls::RootCertStore;
  use tokio::net::TcpListener;

  const WAIT: Duration = Duration::from_secs(5);

  fn configs() -> (Arc<ServerConfig>, TlsClientConfig) {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let server = ServerConfig::builder_with_provider(provider.clone())
      .with_safe_default_protocol_versions()
      .unwrap()
      .with_no_client_auth()
      .with_single_cert(vec![cert.clone()], key)
      .unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert).unwrap();
    let client = ClientConfig::builder_with_provider(provider)
      .with_safe_default_protocol_versions()
      .unwrap()
      .with_root_certificates(roots)
      .with_no_client_auth();

    (
      Arc::new(server),
      TlsClientConfig::new(Arc::new(client), "localhost").unwrap(),
    )
  }

  async fn read_some(socket: &TlsSocket, buf: &mut [u8]) -> io::Result<usize> {
    loop {
      socket.readable().await?;
      match socket.try_read(buf) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
        other => return other,
      }
    }
  }

  async fn pair() -> (TlsSocket, TlsSocket) {
    let (server_config, client_config) = configs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
      let (tcp, _) = listener.accept().await.unwrap();
      accept(tcp, server_config, WAIT).await.unwrap()
    });
    let tcp = TcpStream::connect(addr).await.unwrap();
    let client = connect(tcp, &client_config, WAIT).await.unwrap();
    (client, server.await.unwrap())
  }

  #[tokio::test]
  async fn plaintext_crosses_both_ways() {
    let (client, server) = pair().await;

    assert_eq!(client.try_write(b"hello router").unwrap(), 12);
    let mut buf = [0u8; 64];
    let n = read_some(&server, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello router");

    assert_eq!(server.try_write(b"hi").unwrap(), 2);
    let n = read_some(&client, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hi");
  }

  #[tokio::test]
  async fn shutdown_reads_as_clean_eof() {
    let (client, server) = pair().await;
    client.shutdown().unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(read_some(&server, &mut buf).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn untrusted_certificate_fails_the_handshake() {
    let (server_config, _) = configs();
    // A client trusting a different self-signed certificate.
    let (_, stranger) = configs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
      let (tcp, _) = listener.accept().await.unwrap();
      accept(tcp, server_config, WAIT).await
    });

    let tcp = TcpStream::connect(addr).await.unwrap();
    let err = connect(tcp, &stranger, WAIT).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    assert!(server.await.unwrap().is_err());
  }

  #[tokio::test]
  async fn silent_peer_times_out() {
    let (server_config, _) = configs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _quiet = TcpStream::connect(addr).await.unwrap();
    let (tcp, _) = listener.accept().await.unwrap();
    let err = accept(tcp, server_config, Duration::from_millis(100)).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
  }
}
