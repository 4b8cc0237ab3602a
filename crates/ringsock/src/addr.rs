//! Host name resolution
//!
//! Lookup can block inside the libc resolver, so it runs on the
//! blocking-friendly worker pool. A `None` host means localhost.

use std::net::{SocketAddr, ToSocketAddrs};

use ringsock_core::{SockError, SockResult};

/// Resolve `host:port` to the first usable address.
pub async fn resolve(host: Option<&str>, port: u16) -> SockResult<SocketAddr> {
    let host = host.unwrap_or("localhost").to_string();
    let resolved = tokio::task::spawn_blocking(move || {
        (host.as_str(), port)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next())
    })
    .await
    .map_err(|_| SockError::UnknownHost)?;

    match resolved {
        Ok(Some(addr)) => Ok(addr),
        Ok(None) => Err(SockError::UnknownHost),
        Err(_) => Err(SockError::UnknownHost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_none_host_is_localhost() {
        let addr = resolve(None, 4000).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 4000);
    }

    #[tokio::test]
    async fn test_numeric_host() {
        let addr = resolve(Some("127.0.0.1"), 80).await.unwrap();
        assert_eq!(addr, "127.0.0.1:80".parse().unwrap());
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let err = resolve(Some("no-such-host.invalid"), 80).await.unwrap_err();
        assert_eq!(err, SockError::UnknownHost);
    }
}
