//! ServerSocket and the accept sequence
//!
//! A bound listener yields accepted [`StreamSocket`]s one at a time:
//! each `accept` is one Accept submission whose CQE result is the new
//! descriptor. The sequence is single-consumer and ends when the
//! listener is closed.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

use ringsock_core::{SockError, SockResult};
use ringsock_uring::{ring, OpKind};

use crate::raw;
use crate::stream::StreamSocket;

/// No accept in flight.
const NO_ACCEPT: u64 = u64::MAX;

/// Allocation handle for a server endpoint.
#[derive(Debug, Default)]
pub struct ServerSocket {
    _priv: (),
}

impl ServerSocket {
    pub fn allocate() -> ServerSocket {
        ServerSocket { _priv: () }
    }

    /// Bind `host:port` (`None` host means all interfaces, port 0 means
    /// kernel-assigned) and start listening.
    pub async fn bind(
        self,
        port: u16,
        host: Option<&str>,
        backlog: u32,
    ) -> SockResult<Listener> {
        let addr = match host {
            Some(host) => crate::addr::resolve(Some(host), port).await?,
            None => std::net::SocketAddr::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                port,
            ),
        };
        let fd = raw::listener_socket(&addr, backlog)?;
        let bound = raw::local_addr(fd)?;
        debug!(port = bound.port(), backlog, "listening");
        Ok(Listener {
            fd,
            port: bound.port(),
            closed: AtomicBool::new(false),
            fd_released: AtomicBool::new(false),
            accept_token: AtomicU64::new(NO_ACCEPT),
        })
    }
}

/// A listening socket emitting accepted connections.
pub struct Listener {
    fd: RawFd,
    port: u16,
    closed: AtomicBool,
    fd_released: AtomicBool,
    /// Token of the in-flight accept, so `close` can cancel it.
    accept_token: AtomicU64,
}

impl Listener {
    /// Wait for the next connection.
    ///
    /// Ends with `Closed` once the listener has been closed.
    pub async fn accept(&self) -> SockResult<StreamSocket> {
        if self.is_closed() {
            return Err(SockError::Closed);
        }
        let engine = ring::current()?;
        let mut comp = engine.submit(OpKind::Accept, self.fd, None).await?;
        self.accept_token.store(comp.token(), Ordering::Release);

        let result = comp.wait().await;
        self.accept_token.store(NO_ACCEPT, Ordering::Release);

        match result {
            Ok((fd, _)) => {
                if self.is_closed() {
                    // Raced a close; don't leak the connection.
                    raw::close_fd(fd);
                    return Err(SockError::Closed);
                }
                StreamSocket::from_accepted(fd)
            }
            Err(SockError::Cancelled) if self.is_closed() => Err(SockError::Closed),
            Err(e) => Err(e),
        }
    }

    /// Lazy accept sequence; single consumer.
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming { listener: self }
    }

    /// Stop accepting: cancels any in-flight accept and releases the
    /// listening descriptor. Idempotent.
    pub async fn close(&self) -> SockResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(port = self.port, "listener closing");

        let token = self.accept_token.swap(NO_ACCEPT, Ordering::AcqRel);
        if token != NO_ACCEPT {
            if let Ok(engine) = ring::current() {
                let _ = engine.submit_cancel(token).await;
            }
        }

        if !self.fd_released.swap(true, Ordering::AcqRel) {
            match ring::current() {
                Ok(engine) => match engine.submit(OpKind::Close, self.fd, None).await {
                    Ok(mut comp) => {
                        let _ = comp.wait().await;
                    }
                    Err(_) => raw::close_fd(self.fd),
                },
                Err(_) => raw::close_fd(self.fd),
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The bound port (kernel-assigned when bound with port 0).
    pub fn local_port(&self) -> SockResult<u16> {
        Ok(self.port)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if !self.fd_released.swap(true, Ordering::AcqRel) {
            raw::close_fd(self.fd);
        }
    }
}

/// Iterator-style adapter over `accept`.
pub struct Incoming<'a> {
    listener: &'a Listener,
}

impl Incoming<'_> {
    /// The next accepted socket, or `None` once the listener is closed
    /// (or the ring has been torn down).
    pub async fn next(&mut self) -> Option<SockResult<StreamSocket>> {
        match self.listener.accept().await {
            Ok(sock) => Some(Ok(sock)),
            Err(SockError::Closed | SockError::Cancelled) if self.listener.is_closed() => None,
            Err(SockError::Shutdown) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
