//! ClientSocket — the dialing facade
//!
//! Allocate a plain or TLS handle, connect it, then use one byte-
//! transport API regardless of which transport is underneath.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use ringsock_core::{SockError, SockResult};

use crate::stream::StreamSocket;
use crate::tls::TlsStream;

/// Per-connection options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// TLS only: skip certificate verification (trust-all).
    pub insecure: bool,
}

enum Transport {
    Plain(StreamSocket),
    Tls(TlsStream),
}

/// A client endpoint, plain TCP or TLS depending on allocation.
pub struct ClientSocket {
    tls: bool,
    inner: Option<Transport>,
}

impl ClientSocket {
    /// Allocate an unconnected handle. `tls` fixes the transport kind
    /// for the lifetime of the handle.
    pub fn allocate(tls: bool) -> ClientSocket {
        ClientSocket { tls, inner: None }
    }

    /// Dial `host:port` (`None` host means localhost) under `timeout`.
    ///
    /// For a TLS handle the TCP connect and the handshake each get the
    /// full `timeout` window, and the hostname drives SNI/verification.
    pub async fn connect(
        &mut self,
        port: u16,
        host: Option<&str>,
        timeout: Duration,
        options: ConnectOptions,
    ) -> SockResult<()> {
        if self.inner.is_some() {
            return Err(SockError::Configuration("socket already connected".into()));
        }
        let sock = StreamSocket::open(port, host, timeout).await?;
        if self.tls {
            let hostname = host.unwrap_or("localhost");
            let tls = TlsStream::connect(sock, hostname, options.insecure, timeout).await?;
            self.inner = Some(Transport::Tls(tls));
        } else {
            self.inner = Some(Transport::Plain(sock));
        }
        Ok(())
    }

    /// Connect, run `body` with the open socket, then close it — also
    /// when the body fails.
    pub async fn connect_with<T>(
        mut self,
        port: u16,
        host: Option<&str>,
        timeout: Duration,
        options: ConnectOptions,
        body: impl for<'a> FnOnce(
            &'a mut ClientSocket,
        ) -> Pin<Box<dyn Future<Output = SockResult<T>> + 'a>>,
    ) -> SockResult<T> {
        self.connect(port, host, timeout, options).await?;
        let result = body(&mut self).await;
        let _ = self.close().await;
        result
    }

    fn transport(&mut self) -> SockResult<&mut Transport> {
        self.inner.as_mut().ok_or(SockError::Closed)
    }

    /// Receive one chunk of bytes.
    pub async fn read(&mut self, timeout: Duration) -> SockResult<Vec<u8>> {
        match self.transport()? {
            Transport::Plain(sock) => sock.read(timeout).await,
            Transport::Tls(tls) => tls.read(timeout).await,
        }
    }

    /// Send bytes; returns how many were consumed.
    pub async fn write(&mut self, data: &[u8], timeout: Duration) -> SockResult<usize> {
        match self.transport()? {
            Transport::Plain(sock) => sock.write(data, timeout).await,
            Transport::Tls(tls) => tls.write(data, timeout).await,
        }
    }

    /// Send the whole buffer.
    pub async fn write_all(&mut self, data: &[u8], timeout: Duration) -> SockResult<usize> {
        match self.transport()? {
            Transport::Plain(sock) => sock.write_all(data, timeout).await,
            Transport::Tls(tls) => {
                let mut sent = 0;
                let deadline = std::time::Instant::now() + timeout;
                while sent < data.len() {
                    sent += tls
                        .write(&data[sent..], crate::stream::remaining(deadline)?)
                        .await?;
                }
                Ok(sent)
            }
        }
    }

    /// Close the transport. Idempotent; a never-connected handle is
    /// already closed.
    pub async fn close(&mut self) -> SockResult<()> {
        match self.inner.as_mut() {
            Some(Transport::Plain(sock)) => sock.close().await,
            Some(Transport::Tls(tls)) => tls.close().await,
            None => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        match &self.inner {
            Some(Transport::Plain(sock)) => sock.is_open(),
            Some(Transport::Tls(tls)) => tls.is_open(),
            None => false,
        }
    }

    pub fn local_port(&self) -> SockResult<u16> {
        match &self.inner {
            Some(Transport::Plain(sock)) => sock.local_port(),
            Some(Transport::Tls(tls)) => tls.local_port(),
            None => Err(SockError::Closed),
        }
    }

    pub fn remote_port(&self) -> SockResult<u16> {
        match &self.inner {
            Some(Transport::Plain(sock)) => sock.remote_port(),
            Some(Transport::Tls(tls)) => tls.remote_port(),
            None => Err(SockError::Closed),
        }
    }
}

impl std::fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSocket")
            .field("tls", &self.tls)
            .field("connected", &self.inner.is_some())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ServerSocket;

    const IO_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_unconnected_handle_reports_closed() {
        let mut sock = ClientSocket::allocate(false);
        assert!(!sock.is_open());
        assert_eq!(sock.read(IO_TIMEOUT).await.unwrap_err(), SockError::Closed);
        assert_eq!(sock.local_port().unwrap_err(), SockError::Closed);
        sock.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_connect_rejected() {
        let listener = ServerSocket::allocate()
            .bind(0, Some("127.0.0.1"), 8)
            .await
            .unwrap();
        let port = listener.local_port().unwrap();
        let server = tokio::spawn(async move {
            let _peer = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let mut sock = ClientSocket::allocate(false);
        sock.connect(port, Some("127.0.0.1"), IO_TIMEOUT, ConnectOptions::default())
            .await
            .unwrap();
        let err = sock
            .connect(port, Some("127.0.0.1"), IO_TIMEOUT, ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SockError::Configuration(_)));
        sock.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_closes_on_return() {
        let listener = std::sync::Arc::new(
            ServerSocket::allocate()
                .bind(0, Some("127.0.0.1"), 8)
                .await
                .unwrap(),
        );
        let port = listener.local_port().unwrap();

        let server = {
            let listener = listener.clone();
            tokio::spawn(async move {
                let peer = listener.accept().await.unwrap();
                let got = peer.read(IO_TIMEOUT).await.unwrap();
                peer.write_all(&got, IO_TIMEOUT).await.unwrap();
                // The scoped body returning must close the client side.
                assert_eq!(
                    peer.read(IO_TIMEOUT).await.unwrap_err(),
                    SockError::Closed
                );
            })
        };

        let echoed = ClientSocket::allocate(false)
            .connect_with(
                port,
                Some("127.0.0.1"),
                IO_TIMEOUT,
                ConnectOptions::default(),
                |sock| {
                    Box::pin(async move {
                        sock.write_all(b"ping", IO_TIMEOUT).await?;
                        let mut got = Vec::new();
                        while got.len() < 4 {
                            got.extend(sock.read(IO_TIMEOUT).await?);
                        }
                        Ok(got)
                    })
                },
            )
            .await
            .unwrap();
        assert_eq!(&echoed, b"ping");
        server.await.unwrap();
    }
}
