//! Echo server on ringsock
//!
//! Accepts connections and echoes every chunk back until the peer
//! closes. Prints a stats line on Ctrl-C.
//!
//! Usage:
//!     echo [port]          (default 9999)
//!
//! Test with:
//!     printf hello | nc 127.0.0.1 9999

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ringsock::{config, ServerSocket, SockError, StreamSocket};

const IO_TIMEOUT: Duration = Duration::from_secs(30);

struct Stats {
    accepts: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    fn new() -> Self {
        Self {
            accepts: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            active: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

async fn handle_client(peer: StreamSocket, stats: Arc<Stats>) {
    stats.active.fetch_add(1, Ordering::Relaxed);
    loop {
        match peer.read(IO_TIMEOUT).await {
            Ok(chunk) => {
                stats.bytes_in.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                match peer.write_all(&chunk, IO_TIMEOUT).await {
                    Ok(n) => {
                        stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(_) => {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
            Err(SockError::Closed) => break,
            Err(_) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }
    let _ = peer.close().await;
    stats.active.fetch_sub(1, Ordering::Relaxed);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(9999);

    config::configure_for_server();

    let listener = Arc::new(ServerSocket::allocate().bind(port, None, 4096).await?);
    let stats = Arc::new(Stats::new());
    println!("echo: listening on port {}", listener.local_port()?);

    let acceptor = {
        let listener = listener.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut incoming = listener.incoming();
            while let Some(next) = incoming.next().await {
                match next {
                    Ok(peer) => {
                        stats.accepts.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(handle_client(peer, stats.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    listener.close().await?;
    let _ = acceptor.await;

    println!(
        "echo: accepts={} in={}B out={}B active={} errors={}",
        stats.accepts.load(Ordering::Relaxed),
        stats.bytes_in.load(Ordering::Relaxed),
        stats.bytes_out.load(Ordering::Relaxed),
        stats.active.load(Ordering::Relaxed),
        stats.errors.load(Ordering::Relaxed),
    );

    ringsock::cleanup()?;
    Ok(())
}
