//! Egress Dialer (spec §4.2).
//!
//! Connects to a target that has already been classified and resolved by
//! [`crate::deny_list::classify`] — this module never re-resolves a
//! hostname, only dials the addresses it is handed, so a DNS answer that
//! changes between classification and dial can't smuggle a connection past
//! the deny-list.
//!
//! TLS dialing follows the `SslConnector`/`tokio_openssl::SslStream`
//! pattern used for outbound HTTPS probing elsewhere in the pack
//! (`into_ssl(sni)` + `Pin::new(&mut stream).connect().await`), generalized
//! with the verification knobs spec §4.2 enumerates.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

/// How the dialer should treat the upstream hop, per spec §4.2.
pub enum TlsMode<'a> {
    /// Plain TCP, no TLS.
    None,
    /// TLS with standard verification against the system trust store.
    Verify { hostname: &'a str },
    /// TLS with verification disabled (`insecure_skip_cert_verification`).
    Insecure { hostname: &'a str },
    /// TLS verified against a caller-supplied root store instead of the
    /// system pool (`root_ca_certs`).
    VerifyWithRoots {
        hostname: &'a str,
        roots: &'a openssl::x509::store::X509Store,
    },
}

/// A dialed upstream connection: either a bare TCP socket or one wrapped in
/// a completed TLS session.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<SslStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dials `resolved_addrs` in order, each with a `connect_timeout` budget,
/// returning the first successful connection (spec §4.2). When `tls_mode`
/// is anything other than [`TlsMode::None`], performs the TLS handshake
/// with SNI set to the target hostname, presenting `config.client_cert`
/// when `client_cert_id == Some("default")`.
pub async fn dial(
    resolved_addrs: &[IpAddr],
    port: u16,
    tls_mode: TlsMode<'_>,
    client_cert_id: Option<&str>,
    config: &ProxyConfig,
) -> Result<UpstreamStream, ProxyError> {
    let tcp = dial_tcp(resolved_addrs, port, config.connect_timeout).await?;

    match tls_mode {
        TlsMode::None => Ok(UpstreamStream::Plain(tcp)),
        TlsMode::Verify { hostname } => {
            dial_tls(tcp, hostname, VerifyPolicy::System, client_cert_id, config).await
        }
        TlsMode::Insecure { hostname } => {
            dial_tls(tcp, hostname, VerifyPolicy::Insecure, client_cert_id, config).await
        }
        TlsMode::VerifyWithRoots { hostname, roots } => {
            dial_tls(tcp, hostname, VerifyPolicy::Roots(roots), client_cert_id, config).await
        }
    }
}

enum VerifyPolicy<'a> {
    System,
    Insecure,
    Roots(&'a openssl::x509::store::X509Store),
}

async fn dial_tcp(
    resolved_addrs: &[IpAddr],
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    let mut last_err: Option<ProxyError> = None;

    for ip in resolved_addrs {
        let addr = SocketAddr::new(*ip, port);
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(source)) => {
                last_err = Some(ProxyError::Refused {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                last_err = Some(ProxyError::ConnectTimeout {
                    addr: addr.to_string(),
                });
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ProxyError::Dns {
        host: "<no resolved addresses>".into(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "empty address list"),
    }))
}

async fn dial_tls(
    tcp: TcpStream,
    hostname: &str,
    policy: VerifyPolicy<'_>,
    client_cert_id: Option<&str>,
    config: &ProxyConfig,
) -> Result<UpstreamStream, ProxyError> {
    let mut builder = SslConnector::builder(SslMethod::tls()).map_err(|source| ProxyError::TlsVerify {
        host: hostname.to_string(),
        source,
    })?;

    match policy {
        VerifyPolicy::System => {}
        VerifyPolicy::Insecure => builder.set_verify(SslVerifyMode::NONE),
        VerifyPolicy::Roots(roots) => {
            builder.set_verify(SslVerifyMode::PEER);
            builder.set_cert_store(clone_store(roots).map_err(|source| ProxyError::TlsVerify {
                host: hostname.to_string(),
                source,
            })?);
        }
    }

    if client_cert_id == Some("default") {
        if let Some(identity) = &config.client_cert {
            builder
                .set_certificate(&identity.cert)
                .map_err(|source| ProxyError::TlsVerify {
                    host: hostname.to_string(),
                    source,
                })?;
            builder
                .set_private_key(&identity.key)
                .map_err(|source| ProxyError::TlsVerify {
                    host: hostname.to_string(),
                    source,
                })?;
        }
    }

    let connector = builder.build();
    let ssl = connector
        .configure()
        .and_then(|c| c.into_ssl(hostname))
        .map_err(|source| ProxyError::TlsVerify {
            host: hostname.to_string(),
            source,
        })?;

    let mut stream = SslStream::new(ssl, tcp).map_err(|source| ProxyError::TlsHandshake {
        host: hostname.to_string(),
        source: source.to_string(),
    })?;

    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| ProxyError::TlsHandshake {
            host: hostname.to_string(),
            source: e.to_string(),
        })?;

    Ok(UpstreamStream::Tls(Box::new(stream)))
}

/// `X509Store` has no `Clone`; rebuild an equivalent store from its
/// certificates so each dial gets its own connector configuration.
fn clone_store(
    store: &openssl::x509::store::X509Store,
) -> Result<openssl::x509::store::X509Store, openssl::error::ErrorStack> {
    let mut builder = openssl::x509::store::X509StoreBuilder::new()?;
    for cert in store.objects().iter().filter_map(|o| o.x509()) {
        builder.add_cert(cert.to_owned())?;
    }
    Ok(builder.build())
}
