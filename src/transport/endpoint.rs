// src/transport/endpoint.rs

use crate::error::MailboxError;
use std::net::SocketAddr;

/// A parsed `tcp://host:port` endpoint. The host may be a name that still
/// needs resolving.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
  pub host: String,
  pub port: u16,
  /// Original string, kept for error messages and logs.
  pub uri: String,
}

/// Parses an endpoint string. The `tcp://` scheme is optional.
pub fn parse_endpoint(endpoint_str: &str) -> Result<Endpoint, MailboxError> {
  let invalid_endpoint_err = || MailboxError::InvalidEndpoint(endpoint_str.to_string());

  let address_part = match endpoint_str.find("://") {
    Some(separator_pos) => match &endpoint_str[..separator_pos] {
      "tcp" => &endpoint_str[separator_pos + 3..],
      _ => return Err(invalid_endpoint_err()),
    },
    None => endpoint_str,
  };

  // Fast path for literal socket addresses, including bracketed IPv6.
  if let Ok(addr) = address_part.parse::<SocketAddr>() {
    return Ok(Endpoint {
      host: addr.ip().to_string(),
      port: addr.port(),
      uri: endpoint_str.to_string(),
    });
  }

  let (host, port) = address_part.rsplit_once(':').ok_or_else(invalid_endpoint_err)?;
  let port = port.parse::<u16>().map_err(|_| {
    tracing::debug!("Failed to parse TCP port: {}", port);
    invalid_endpoint_err()
  })?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() || host.contains('\0') {
    return Err(invalid_endpoint_err());
  }
  Ok(Endpoint {
    host: host.to_string(),
    port,
    uri: endpoint_str.to_string(),
  })
}

/// Resolves an endpoint to its candidate socket addresses, in resolver order.
pub async fn resolve(endpoint: &Endpoint) -> Result<Vec<SocketAddr>, MailboxError> {
  let addrs: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
    .await
    .map_err(|e| MailboxError::EndpointResolutionFailed(format!("{}: {}", endpoint.uri, e)))?
    .collect();
  if addrs.is_empty() {
    return Err(MailboxError::EndpointResolutionFailed(format!(
      "{}: resolver returned no addresses",
      endpoint.uri
    )));
  }
  tracing::trace!(uri = %endpoint.uri, candidates = addrs.len(), "Resolved endpoint");
  Ok(addrs)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_literal_and_named_hosts() {
    let ep = parse_endpoint("tcp://127.0.0.1:5555").unwrap();
    assert_eq!((ep.host.as_str(), ep.port), ("127.0.0.1", 5555));

    let ep = parse_endpoint("tcp://[::1]:80").unwrap();
    assert_eq!((ep.host.as_str(), ep.port), ("::1", 80));

    let ep = parse_endpoint("localhost:0").unwrap();
    assert_eq!((ep.host.as_str(), ep.port), ("localhost", 0));
  }

  #[test]
  fn rejects_malformed_endpoints() {
    for bad in ["ipc:///tmp/x", "tcp://nohost", "tcp://:80", "tcp://host:99999"] {
      assert!(
        matches!(parse_endpoint(bad), Err(MailboxError::InvalidEndpoint(_))),
        "{} should be rejected",
        bad
      );
    }
  }

  #[tokio::test]
  async fn resolves_loopback() {
    let ep = parse_endpoint("tcp://127.0.0.1:0").unwrap();
    let addrs = resolve(&ep).await.unwrap();
    assert_eq!(addrs, vec!["127.0.0.1:0".parse::<SocketAddr>().unwrap()]);
  }
}
