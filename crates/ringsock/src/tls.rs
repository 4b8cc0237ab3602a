//! TlsStream — TLS records over a StreamSocket
//!
//! A rustls `ClientConnection` pumped by hand over the byte transport.
//! Ciphertext read from the socket that the engine cannot consume yet
//! is retained in a tail buffer across calls and compacted in place.
//! No plaintext is released before the handshake completes.

use std::io::{self, Read, Write};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rustls::{ClientConfig, ClientConnection, RootCertStore};
use rustls_pki_types::{CertificateDer, ServerName};
use tracing::{debug, trace};

use ringsock_core::{SockError, SockResult};

use crate::stream::{remaining, StreamSocket};

/// Budget for flushing the close-notify alert during `close`.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Standard CA bundle locations, probed in order.
const CA_BUNDLE_PATHS: [&str; 4] = [
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/ssl/cert.pem",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsState {
    Handshaking,
    Established,
    Closing,
    Closed,
}

/// Load roots from the first readable CA bundle on this system.
fn load_root_store() -> SockResult<RootCertStore> {
    for path in CA_BUNDLE_PATHS {
        let Ok(file) = std::fs::File::open(path) else {
            continue;
        };
        let mut reader = io::BufReader::new(file);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<Result<_, _>>()
            .map_err(|e| {
                SockError::Configuration(format!("unparseable CA bundle {}: {}", path, e))
            })?;
        let mut store = RootCertStore::empty();
        let (added, _ignored) = store.add_parsable_certificates(certs);
        if added > 0 {
            debug!(path, added, "loaded CA bundle");
            return Ok(store);
        }
    }
    Err(SockError::Configuration(
        "no readable CA bundle found in standard locations".into(),
    ))
}

fn secure_config() -> SockResult<Arc<ClientConfig>> {
    static CONFIG: OnceLock<SockResult<Arc<ClientConfig>>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let roots = load_root_store()?;
            Ok(Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            ))
        })
        .clone()
}

fn insecure_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            Arc::new(
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                    .with_no_client_auth(),
            )
        })
        .clone()
}

fn client_config(insecure: bool) -> SockResult<Arc<ClientConfig>> {
    if insecure {
        Ok(insecure_config())
    } else {
        secure_config()
    }
}

/// Verifier for streams explicitly marked insecure: accepts anything.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// A TLS client stream owning its underlying byte socket.
///
/// Reads and writes carry plaintext; the wrapped [`StreamSocket`] sees
/// only TLS records. Closing the stream flushes close-notify and closes
/// the socket.
pub struct TlsStream {
    sock: StreamSocket,
    conn: ClientConnection,
    /// Unconsumed ciphertext carried across calls.
    tail: Vec<u8>,
    state: TlsState,
}

impl TlsStream {
    /// Run the TLS handshake over an already-connected socket.
    ///
    /// `host` feeds SNI and, unless `insecure`, endpoint verification.
    /// The whole handshake is bounded by `timeout`.
    pub async fn connect(
        sock: StreamSocket,
        host: &str,
        insecure: bool,
        timeout: Duration,
    ) -> SockResult<TlsStream> {
        let config = client_config(insecure)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| SockError::Configuration(format!("invalid server name: {}", e)))?;
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| SockError::TlsHandshakeFailed(e.to_string()))?;

        let mut stream = TlsStream {
            sock,
            conn,
            tail: Vec::new(),
            state: TlsState::Handshaking,
        };
        stream.drive_handshake(Instant::now() + timeout).await?;
        stream.state = TlsState::Established;
        trace!(host, "tls established");
        Ok(stream)
    }

    async fn drive_handshake(&mut self, deadline: Instant) -> SockResult<()> {
        while self.conn.is_handshaking() {
            self.flush_tls(deadline).await?;
            if !self.conn.is_handshaking() {
                break;
            }
            if self.conn.wants_read() {
                if self.tail.is_empty() {
                    match self.sock.read(remaining(deadline)?).await {
                        Ok(chunk) => self.tail.extend_from_slice(&chunk),
                        Err(SockError::Closed) => {
                            return Err(SockError::TlsHandshakeFailed(
                                "peer closed during handshake".into(),
                            ));
                        }
                        Err(e) => return Err(e),
                    }
                }
                self.feed_engine()?;
            } else if !self.conn.wants_write() {
                return Err(SockError::TlsHandshakeFailed("engine stalled".into()));
            }
        }
        // Trailing flush: the final handshake flight may still be queued.
        self.flush_tls(deadline).await
    }

    /// Feed buffered ciphertext into the engine and let it decode.
    /// Consumed bytes are compacted out of the tail.
    fn feed_engine(&mut self) -> SockResult<rustls::IoState> {
        let mut cursor: &[u8] = &self.tail;
        let consumed = self
            .conn
            .read_tls(&mut cursor)
            .map_err(|e| self.engine_error(e.to_string()))?;
        self.tail.drain(..consumed);
        match self.conn.process_new_packets() {
            Ok(io_state) => Ok(io_state),
            Err(e) => {
                let err = self.engine_error(e.to_string());
                self.state = TlsState::Closed;
                Err(err)
            }
        }
    }

    fn engine_error(&self, detail: String) -> SockError {
        if self.state == TlsState::Handshaking {
            SockError::TlsHandshakeFailed(detail)
        } else {
            SockError::TlsRecord(detail)
        }
    }

    /// Drain pending TLS records through full writes on the socket.
    async fn flush_tls(&mut self, deadline: Instant) -> SockResult<()> {
        while self.conn.wants_write() {
            let mut out = Vec::with_capacity(16 * 1024);
            let n = self
                .conn
                .write_tls(&mut out)
                .map_err(|e| self.engine_error(e.to_string()))?;
            if n == 0 {
                break;
            }
            self.sock.write_all(&out, remaining(deadline)?).await?;
        }
        Ok(())
    }

    /// Read one chunk of plaintext.
    ///
    /// Ciphertext the engine could not consume is retained for the next
    /// call. A clean close-notify (or transport EOF) surfaces as
    /// `Closed` once buffered plaintext is drained.
    pub async fn read(&mut self, timeout: Duration) -> SockResult<Vec<u8>> {
        if matches!(self.state, TlsState::Closed) {
            return Err(SockError::Closed);
        }
        let deadline = Instant::now() + timeout;
        let mut out = vec![0u8; self.sock.recv_chunk_len()];

        loop {
            match self.conn.reader().read(&mut out) {
                Ok(0) => {
                    // close-notify processed and nothing buffered
                    self.state = TlsState::Closed;
                    return Err(SockError::Closed);
                }
                Ok(n) => {
                    out.truncate(n);
                    return Ok(out);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.state = TlsState::Closed;
                    return Err(SockError::TlsRecord(e.to_string()));
                }
            }

            // The engine may owe the peer data (session tickets, acks);
            // flush before blocking on more ciphertext.
            self.flush_tls(deadline).await?;

            if self.tail.is_empty() {
                match self.sock.read(remaining(deadline)?).await {
                    Ok(chunk) => self.tail.extend_from_slice(&chunk),
                    Err(SockError::Closed) => {
                        self.state = TlsState::Closed;
                        return Err(SockError::Closed);
                    }
                    Err(e) => return Err(e),
                }
            }
            self.feed_engine()?;
        }
    }

    /// Write plaintext; returns the number of plaintext bytes consumed
    /// after the resulting records have been fully sent.
    pub async fn write(&mut self, data: &[u8], timeout: Duration) -> SockResult<usize> {
        if self.state != TlsState::Established {
            return Err(SockError::Closed);
        }
        let deadline = Instant::now() + timeout;
        let n = self
            .conn
            .writer()
            .write(data)
            .map_err(|e| SockError::TlsRecord(e.to_string()))?;
        self.flush_tls(deadline).await?;
        Ok(n)
    }

    /// Send close-notify (bounded flush), then close the socket.
    /// Idempotent.
    pub async fn close(&mut self) -> SockResult<()> {
        if self.state == TlsState::Closed {
            return Ok(());
        }
        self.state = TlsState::Closing;
        self.conn.send_close_notify();
        let deadline = Instant::now() + CLOSE_FLUSH_TIMEOUT;
        if let Err(e) = self.flush_tls(deadline).await {
            trace!(error = %e, "close-notify flush incomplete");
        }
        self.state = TlsState::Closed;
        self.sock.close().await
    }

    /// True while plaintext I/O may proceed.
    pub fn is_open(&self) -> bool {
        self.state == TlsState::Established && self.sock.is_open()
    }

    pub fn local_port(&self) -> SockResult<u16> {
        self.sock.local_port()
    }

    pub fn remote_port(&self) -> SockResult<u16> {
        self.sock.remote_port()
    }
}

impl std::fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("state", &self.state)
            .field("tail_len", &self.tail.len())
            .field("sock", &self.sock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_config_builds() {
        let config = client_config(true).unwrap();
        assert!(Arc::strong_count(&config) >= 1);
    }

    #[test]
    fn test_root_store_from_system_bundle() {
        // Only meaningful where a standard bundle exists.
        if !CA_BUNDLE_PATHS.iter().any(|p| std::path::Path::new(p).exists()) {
            return;
        }
        let store = load_root_store().unwrap();
        assert!(!store.is_empty());
    }

    #[test]
    fn test_invalid_server_name() {
        let err = ServerName::try_from("not a hostname".to_string());
        assert!(err.is_err());
    }

    #[tokio::test]
    #[ignore = "requires outbound network access"]
    async fn test_https_fetch_google() {
        let sock = StreamSocket::open(443, Some("www.google.com"), Duration::from_secs(10))
            .await
            .unwrap();
        let mut tls = TlsStream::connect(sock, "www.google.com", false, Duration::from_secs(10))
            .await
            .unwrap();

        tls.write(
            b"GET / HTTP/1.1\r\nHost: www.google.com\r\nConnection: close\r\n\r\n",
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        let mut response = Vec::new();
        loop {
            match tls.read(Duration::from_secs(10)).await {
                Ok(chunk) => response.extend(chunk),
                Err(SockError::Closed) => break,
                Err(e) => panic!("tls read failed: {e}"),
            }
        }
        assert!(response.len() >= 5);
        assert_eq!(&response[..5], b"HTTP/");

        tls.close().await.unwrap();
    }
}
