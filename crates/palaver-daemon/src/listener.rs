//! TCP listener with connection permits and optional TLS 1.3.
//!
//! The listener enforces `max_connections` with a semaphore: a permit is
//! acquired before `accept` and travels with the connection task, so a
//! flood of connects parks in the kernel backlog instead of exhausting the
//! process. TLS, when enabled, is negotiated in the connection task, never
//! in the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;

use palaver_core::config::SecuritySection;

/// Byte stream a session runs over: plain TCP or TLS.
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> SessionStream for T {}

/// Boxed stream handed to the connection driver.
pub type BoxedStream = Box<dyn SessionStream>;

/// Listener setup failures.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The configured bind address did not parse.
    #[error("invalid listen address {addr:?}: {source}")]
    InvalidAddr {
        /// The offending address string.
        addr: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },
    /// Socket setup or bind failed.
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
    /// TLS material could not be loaded.
    #[error("failed to load TLS configuration: {0}")]
    Tls(String),
}

/// Bound listener plus the connection-permit pool.
pub struct Listener {
    inner: TcpListener,
    permits: Arc<Semaphore>,
    tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("inner", &self.inner)
            .field("permits", &self.permits)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Listener {
    /// Binds `addr` with the given backlog and permit pool size.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError`] on an unparseable address, bind failure,
    /// or bad TLS material.
    pub fn bind(
        addr: &str,
        backlog: u32,
        max_connections: usize,
        security: &SecuritySection,
    ) -> Result<Self, ListenerError> {
        let addr: SocketAddr = addr.parse().map_err(|source| ListenerError::InvalidAddr {
            addr: addr.to_string(),
            source,
        })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let inner = socket.listen(backlog)?;

        let tls = if security.enable_tls {
            Some(load_tls_acceptor(security)?)
        } else {
            None
        };

        Ok(Self {
            inner,
            permits: Arc::new(Semaphore::new(max_connections)),
            tls,
        })
    }

    /// The bound address (useful when binding port 0 in tests).
    ///
    /// # Errors
    ///
    /// Propagates the underlying socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Waits for a permit, then accepts one connection.
    ///
    /// The returned permit must be held for the life of the connection
    /// task; dropping it frees the slot.
    ///
    /// # Errors
    ///
    /// Propagates accept failures. Permit acquisition cannot fail while
    /// the listener is alive.
    pub async fn accept(
        &self,
    ) -> std::io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("listener semaphore is never closed");
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true).ok();
        Ok((stream, addr, permit))
    }

    /// TLS acceptor for connection tasks, when TLS is enabled.
    #[must_use]
    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.clone()
    }
}

/// Completes the transport setup for one accepted socket: TLS handshake if
/// configured, passthrough otherwise.
///
/// # Errors
///
/// Propagates the TLS handshake failure.
pub async fn upgrade(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<BoxedStream> {
    match tls {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await?;
            Ok(Box::new(tls_stream))
        },
        None => Ok(Box::new(stream)),
    }
}

/// Loads certificates and key and builds a TLS 1.3-only acceptor.
fn load_tls_acceptor(security: &SecuritySection) -> Result<TlsAcceptor, ListenerError> {
    if security.min_tls_version != "1.3" {
        return Err(ListenerError::Tls(format!(
            "unsupported min_tls_version {:?}; only \"1.3\" is accepted",
            security.min_tls_version
        )));
    }
    if security.require_client_cert {
        // Client-certificate verification needs a CA bundle setting that
        // does not exist yet; refuse rather than silently skip the check.
        return Err(ListenerError::Tls(
            "require_client_cert is set but no client CA is configured".to_string(),
        ));
    }

    let cert_file = std::fs::File::open(&security.tls_cert_file)
        .map_err(|e| ListenerError::Tls(format!("open {}: {e}", security.tls_cert_file)))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| ListenerError::Tls(format!("parse {}: {e}", security.tls_cert_file)))?;
    if certs.is_empty() {
        return Err(ListenerError::Tls(format!(
            "no certificates found in {}",
            security.tls_cert_file
        )));
    }

    let key_file = std::fs::File::open(&security.tls_key_file)
        .map_err(|e| ListenerError::Tls(format!("open {}: {e}", security.tls_key_file)))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| ListenerError::Tls(format!("parse {}: {e}", security.tls_key_file)))?
        .ok_or_else(|| {
            ListenerError::Tls(format!("no private key found in {}", security.tls_key_file))
        })?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ListenerError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
