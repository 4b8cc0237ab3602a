//! StreamSocket — the plain TCP byte transport
//!
//! A connected descriptor driven entirely through the ring engine:
//! connect, recv, send, and close are all tagged submissions. One
//! reader and one writer may run concurrently; two readers (or two
//! writers) serialize on the per-direction busy tokens.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, trace};

use ringsock_core::{config, SockError, SockResult};
use ringsock_uring::{ring, OpKind};

use crate::raw;

const STATE_NEW: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_ESTABLISHED: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// How this socket came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed out via `open`.
    Client,
    /// Produced by a listener's accept.
    Accepted,
}

/// Milliseconds left before `deadline`, or `TimedOut` if it passed.
pub(crate) fn remaining(deadline: Instant) -> SockResult<Duration> {
    let now = Instant::now();
    if now >= deadline {
        Err(SockError::TimedOut)
    } else {
        Ok(deadline - now)
    }
}

/// A connected TCP byte socket.
pub struct StreamSocket {
    fd: RawFd,
    role: Role,
    state: AtomicU8,
    /// True once the fd has been handed to the kernel for closing (or
    /// closed synchronously); guards against a double close in Drop.
    fd_released: AtomicBool,
    /// SO_RCVBUF captured at connect/accept time.
    recv_buf: usize,
    read_busy: Mutex<()>,
    write_busy: Mutex<()>,
}

impl StreamSocket {
    /// Connect to `host:port` (`None` host means localhost) under
    /// `timeout`. The descriptor is closed before returning any error.
    pub async fn open(
        port: u16,
        host: Option<&str>,
        timeout: Duration,
    ) -> SockResult<StreamSocket> {
        let addr = crate::addr::resolve(host, port).await?;
        let engine = ring::current()?;
        let fd = raw::tcp_socket(&addr)?;

        let sock = StreamSocket {
            fd,
            role: Role::Client,
            state: AtomicU8::new(STATE_NEW),
            fd_released: AtomicBool::new(false),
            recv_buf: 0,
            read_busy: Mutex::new(()),
            write_busy: Mutex::new(()),
        };

        sock.state.store(STATE_CONNECTING, Ordering::Release);
        let encoded = raw::encode_sockaddr(&addr);
        if let Err(e) = engine
            .submit_with_deadline(OpKind::Connect, fd, Some(encoded), timeout)
            .await
        {
            // Drop closes the fd; the kernel holds no buffer reference
            // past the terminal completion the deadline path waited for.
            return Err(e);
        }

        let mut sock = sock;
        sock.recv_buf = raw::recv_buffer_size(fd)?;
        sock.state.store(STATE_ESTABLISHED, Ordering::Release);
        trace!(fd, port, "connected");
        Ok(sock)
    }

    /// Wrap a descriptor fresh out of an accept completion.
    pub(crate) fn from_accepted(fd: RawFd) -> SockResult<StreamSocket> {
        raw::set_nodelay(fd);
        let recv_buf = raw::recv_buffer_size(fd)?;
        Ok(StreamSocket {
            fd,
            role: Role::Accepted,
            state: AtomicU8::new(STATE_ESTABLISHED),
            fd_released: AtomicBool::new(false),
            recv_buf,
            read_busy: Mutex::new(()),
            write_busy: Mutex::new(()),
        })
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> SockResult<()> {
        if self.state() == STATE_ESTABLISHED {
            Ok(())
        } else {
            Err(SockError::Closed)
        }
    }

    fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// The buffer length the next `read` will allocate: the config
    /// override if set, else the cached SO_RCVBUF.
    pub(crate) fn recv_chunk_len(&self) -> usize {
        config::current()
            .read_buffer_size
            .unwrap_or(self.recv_buf)
            .max(1)
    }

    /// Receive one chunk of bytes, at most [`Self::recv_chunk_len`].
    ///
    /// A graceful peer close surfaces as `Closed` (idempotently so);
    /// any fatal error moves the socket to Closed first.
    pub async fn read(&self, timeout: Duration) -> SockResult<Vec<u8>> {
        self.ensure_open()?;
        let _busy = self.read_busy.lock().await;
        self.ensure_open()?;

        let engine = ring::current()?;
        let buf = vec![0u8; self.recv_chunk_len()];
        match engine
            .submit_with_deadline(OpKind::Recv, self.fd, Some(buf), timeout)
            .await
        {
            Ok((n, Some(mut buf))) if n > 0 => {
                buf.truncate(n as usize);
                Ok(buf)
            }
            Ok(_) => {
                // End of stream: the peer closed its write side.
                self.mark_closed();
                Err(SockError::Closed)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.mark_closed();
                }
                Err(e)
            }
        }
    }

    /// Send one buffer; returns the byte count the kernel accepted
    /// (which may be short).
    pub async fn write(&self, data: &[u8], timeout: Duration) -> SockResult<usize> {
        self.ensure_open()?;
        let _busy = self.write_busy.lock().await;
        self.ensure_open()?;

        let engine = ring::current()?;
        match engine
            .submit_with_deadline(OpKind::Send, self.fd, Some(data.to_vec()), timeout)
            .await
        {
            Ok((n, _)) => Ok(n as usize),
            Err(e) => {
                if e.is_fatal() {
                    self.mark_closed();
                }
                Err(e)
            }
        }
    }

    /// Send the whole buffer, looping over short writes under one
    /// deadline. Returns `data.len()` on success.
    pub async fn write_all(&self, data: &[u8], timeout: Duration) -> SockResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut sent = 0;
        while sent < data.len() {
            let n = self.write(&data[sent..], remaining(deadline)?).await?;
            if n == 0 {
                self.mark_closed();
                return Err(SockError::Closed);
            }
            sent += n;
        }
        Ok(sent)
    }

    /// Close the socket. Idempotent: the first call submits the close
    /// and awaits its completion, later calls return immediately.
    pub async fn close(&self) -> SockResult<()> {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_CLOSED {
            return Ok(());
        }
        if self.fd_released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(fd = self.fd, role = ?self.role, "closing");

        match ring::current() {
            Ok(engine) => match engine.submit(OpKind::Close, self.fd, None).await {
                Ok(mut comp) => {
                    let _ = comp.wait().await;
                    Ok(())
                }
                Err(_) => {
                    raw::close_fd(self.fd);
                    Ok(())
                }
            },
            Err(_) => {
                raw::close_fd(self.fd);
                Ok(())
            }
        }
    }

    /// True while reads and writes may be submitted.
    pub fn is_open(&self) -> bool {
        self.state() == STATE_ESTABLISHED
    }

    /// The locally bound port.
    pub fn local_port(&self) -> SockResult<u16> {
        Ok(raw::local_addr(self.fd)?.port())
    }

    /// The peer's port.
    pub fn remote_port(&self) -> SockResult<u16> {
        Ok(raw::peer_addr(self.fd)?.port())
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        self.mark_closed();
        if !self.fd_released.swap(true, Ordering::AcqRel) {
            raw::close_fd(self.fd);
        }
    }
}

impl std::fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSocket")
            .field("fd", &self.fd)
            .field("role", &self.role)
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
    async fn test_connect_refused() {
        // Bind then immediately close, so the port is known-dead.
        let listener = ServerSocket::allocate()
            .bind(0, Some("127.0.0.1"), 1)
            .await
            .unwrap();
        let port = listener.local_port().unwrap();
        listener.close().await.unwrap();

        let err = StreamSocket::open(port, Some("127.0.0.1"), IO_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SockError::ConnectionRefused | SockError::Reset | SockError::TimedOut
        ));
    }

    #[tokio::test]
    async fn test_unknown_host_on_open() {
        let err = StreamSocket::open(80, Some("no-such-host.invalid"), IO_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, SockError::UnknownHost);
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let listener = ServerSocket::allocate()
            .bind(0, Some("127.0.0.1"), 8)
            .await
            .unwrap();
        let port = listener.local_port().unwrap();

        let server = tokio::spawn(async move {
            let peer = listener.accept().await.unwrap();
            let got = peer.read(IO_TIMEOUT).await.unwrap();
            peer.write_all(&got, IO_TIMEOUT).await.unwrap();
            got
        });

        let sock = StreamSocket::open(port, Some("127.0.0.1"), IO_TIMEOUT)
            .await
            .unwrap();
        assert!(sock.is_open());
        sock.write_all(b"hello", IO_TIMEOUT).await.unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < 5 {
            echoed.extend(sock.read(IO_TIMEOUT).await.unwrap());
        }
        assert_eq!(&echoed, b"hello");
        assert_eq!(server.await.unwrap(), b"hello");
        sock.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_after_peer_close_is_closed_twice() {
        let listener = ServerSocket::allocate()
            .bind(0, Some("127.0.0.1"), 8)
            .await
            .unwrap();
        let port = listener.local_port().unwrap();

        let server = tokio::spawn(async move {
            let peer = listener.accept().await.unwrap();
            peer.close().await.unwrap();
        });

        let sock = StreamSocket::open(port, Some("127.0.0.1"), IO_TIMEOUT)
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(sock.read(IO_TIMEOUT).await.unwrap_err(), SockError::Closed);
        // Second read must see the same terminal error, not hang.
        assert_eq!(sock.read(IO_TIMEOUT).await.unwrap_err(), SockError::Closed);
        assert!(!sock.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = ServerSocket::allocate()
            .bind(0, Some("127.0.0.1"), 8)
            .await
            .unwrap();
        let port = listener.local_port().unwrap();
        let server = tokio::spawn(async move {
            let _peer = listener.accept().await.unwrap();
        });

        let sock = StreamSocket::open(port, Some("127.0.0.1"), IO_TIMEOUT)
            .await
            .unwrap();
        sock.close().await.unwrap();
        sock.close().await.unwrap();
        assert_eq!(
            sock.write(b"x", IO_TIMEOUT).await.unwrap_err(),
            SockError::Closed
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_observed() {
        let listener = ServerSocket::allocate()
            .bind(0, Some("127.0.0.1"), 8)
            .await
            .unwrap();
        let port = listener.local_port().unwrap();
        let server = tokio::spawn(async move {
            let peer = listener.accept().await.unwrap();
            // Hold the connection open with nothing to read.
            tokio::time::sleep(Duration::from_millis(600)).await;
            drop(peer);
        });

        let sock = StreamSocket::open(port, Some("127.0.0.1"), IO_TIMEOUT)
            .await
            .unwrap();
        let start = Instant::now();
        let err = sock.read(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err, SockError::TimedOut);
        // Deadline plus the bounded cancel grace.
        assert!(start.elapsed() < Duration::from_millis(500));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_buffer_tracks_config_override() {
        let listener = ServerSocket::allocate()
            .bind(0, Some("127.0.0.1"), 8)
            .await
            .unwrap();
        let port = listener.local_port().unwrap();
        let server = tokio::spawn(async move {
            let _peer = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let sock = StreamSocket::open(port, Some("127.0.0.1"), IO_TIMEOUT)
            .await
            .unwrap();

        config::configure(|c| c.read_buffer_size = Some(4096));
        assert_eq!(sock.recv_chunk_len(), 4096);

        // Unset override: fall back to the cached SO_RCVBUF.
        config::reset();
        assert_eq!(sock.recv_chunk_len(), sock.recv_buf);
        assert!(sock.recv_buf > 0);

        sock.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_read_terminates_quickly() {
        let listener = ServerSocket::allocate()
            .bind(0, Some("127.0.0.1"), 8)
            .await
            .unwrap();
        let port = listener.local_port().unwrap();
        let server = tokio::spawn(async move {
            let peer = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;
            drop(peer);
        });

        let sock = std::sync::Arc::new(
            StreamSocket::open(port, Some("127.0.0.1"), IO_TIMEOUT)
                .await
                .unwrap(),
        );
        let reader = {
            let sock = sock.clone();
            tokio::spawn(async move { sock.read(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        reader.abort();
        let res = reader.await;
        assert!(res.is_err() && res.unwrap_err().is_cancelled());
        assert!(start.elapsed() < Duration::from_millis(200));
        server.await.unwrap();
    }
}
