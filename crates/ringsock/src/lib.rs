//! # ringsock — async TCP + TLS sockets on io_uring
//!
//! Client and server TCP byte transports whose every suspension point
//! (connect, accept, read, write, close, TLS handshake step) is one
//! tagged submission on a process-wide io_uring, resumed by a dedicated
//! poller thread. A TLS stream wraps any byte socket and speaks RFC
//! 8446/5246 records over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  ClientSocket / ServerSocket                             │
//! │    TlsStream (rustls record pump, ciphertext tail)       │
//! │    StreamSocket (state machine + per-direction busy)     │
//! └──────────────────┬───────────────────────────────────────┘
//!                    │ OpKind + owned buffer
//! ┌──────────────────▼───────────────────────────────────────┐
//! │  ringsock-uring: RingEngine + poller thread              │
//! └──────────────────┬───────────────────────────────────────┘
//!                    │ SQE / CQE
//!                 kernel
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::time::Duration;
//! use ringsock::{ClientSocket, ConnectOptions, ServerSocket};
//!
//! // Echo server
//! let listener = ServerSocket::allocate().bind(0, None, 128).await?;
//! let port = listener.local_port()?;
//! tokio::spawn(async move {
//!     let mut incoming = listener.incoming();
//!     while let Some(Ok(peer)) = incoming.next().await {
//!         tokio::spawn(async move {
//!             while let Ok(chunk) = peer.read(Duration::from_secs(30)).await {
//!                 let _ = peer.write_all(&chunk, Duration::from_secs(30)).await;
//!             }
//!         });
//!     }
//! });
//!
//! // Client
//! let mut sock = ClientSocket::allocate(false);
//! sock.connect(port, None, Duration::from_secs(5), ConnectOptions::default()).await?;
//! sock.write_all(b"hello", Duration::from_secs(5)).await?;
//! ```
//!
//! Process-wide tuning lives in [`config`]; [`cleanup`] tears the ring
//! down (pending operations observe `Shutdown`) and the next socket
//! operation starts a fresh epoch.

pub mod addr;
pub mod client;
pub mod listener;
pub mod raw;
pub mod stream;
pub mod tls;

pub use ringsock_core::{config, RingConfig, SockError, SockResult};
pub use ringsock_uring::ring::{cleanup, epoch};

pub use client::{ClientSocket, ConnectOptions};
pub use listener::{Incoming, Listener, ServerSocket};
pub use stream::{Role, StreamSocket};
pub use tls::TlsStream;
