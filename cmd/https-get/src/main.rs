//! HTTPS GET over a ringsock TLS stream
//!
//! Usage:
//!     https-get <host> [port]      (default 443)

use std::time::Duration;

use ringsock::{ClientSocket, ConnectOptions, SockError};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let host = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("usage: https-get <host> [port]");
        std::process::exit(2);
    });
    let port: u16 = std::env::args()
        .nth(2)
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(443);

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        host
    );

    let response = ClientSocket::allocate(true)
        .connect_with(
            port,
            Some(&host),
            IO_TIMEOUT,
            ConnectOptions::default(),
            |sock| {
                let request = request.clone();
                Box::pin(async move {
                    sock.write_all(request.as_bytes(), IO_TIMEOUT).await?;
                    let mut response = Vec::new();
                    loop {
                        match sock.read(IO_TIMEOUT).await {
                            Ok(chunk) => response.extend(chunk),
                            Err(SockError::Closed) => break,
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(response)
                })
            },
        )
        .await?;

    let head_len = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(response.len().min(512));
    println!("{}", String::from_utf8_lossy(&response[..head_len]));
    println!("-- {} bytes total --", response.len());

    ringsock::cleanup()?;
    Ok(())
}
