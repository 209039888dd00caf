/// Secure layer invocation.
///
/// A [`SecureLayer`] turns a connected TCP socket into an encrypted stream.
/// [`SocketRewrapGuard`] applies it to whatever socket a connection holds at
/// the moment of wrapping, which after a handshake reconnect is not the socket
/// the tunnel was first requested on.

use crate::error::{BoxError, Error, Result};
use crate::transport::HttpConnection;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// An encrypted byte stream over a TCP socket.
pub trait SecureStream: Read + Write + Send {
    /// The socket underneath, for identity and address queries.
    fn socket(&self) -> &TcpStream;
}

impl SecureStream for StreamOwned<ClientConnection, TcpStream> {
    fn socket(&self) -> &TcpStream {
        self.get_ref()
    }
}

/// Starts a secure session on an already-connected socket.
pub trait SecureLayer: Send + Sync {
    fn wrap(&self, socket: TcpStream, server_name: &str) -> Result<Box<dyn SecureStream>>;
}

// ---------------------------------------------------------------------------
// rustls
// ---------------------------------------------------------------------------

/// TLS client layer backed by rustls with the Mozilla root set.
#[derive(Clone)]
pub struct RustlsLayer {
    config: Arc<ClientConfig>,
}

impl RustlsLayer {
    pub fn with_webpki_roots() -> Result<Self> {
        Self::build(webpki_store())
    }

    /// Mozilla roots plus every certificate in the PEM file at `ca_file`,
    /// typically the corporate inspection CA.
    pub fn with_extra_ca(ca_file: &Path) -> Result<Self> {
        let mut roots = webpki_store();
        let file = File::open(ca_file)
            .map_err(|e| Error::Tls(format!("cannot open CA file {}: {}", ca_file.display(), e)))?;
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert = cert.map_err(|e| Error::Tls(format!("bad PEM in {}: {}", ca_file.display(), e)))?;
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("rejected CA in {}: {}", ca_file.display(), e)))?;
            added += 1;
        }
        if added == 0 {
            return Err(Error::Tls(format!("no certificates in {}", ca_file.display())));
        }
        debug!(path = %ca_file.display(), added, "extra CA certificates loaded");
        Self::build(roots)
    }

    fn build(roots: RootCertStore) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(RustlsLayer {
            config: Arc::new(config),
        })
    }
}

fn webpki_store() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

impl SecureLayer for RustlsLayer {
    fn wrap(&self, mut socket: TcpStream, server_name: &str) -> Result<Box<dyn SecureStream>> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name '{}': {}", server_name, e)))?;
        let mut conn = ClientConnection::new(Arc::clone(&self.config), name)
            .map_err(|e| Error::Tls(e.to_string()))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut socket).map_err(|e| Error::Tls(format!("handshake with {}: {}", server_name, e)))?;
        }
        debug!(
            server_name,
            version = ?conn.protocol_version(),
            alpn = ?conn.alpn_protocol().map(String::from_utf8_lossy),
            "tls established"
        );
        Ok(Box::new(StreamOwned::new(conn, socket)))
    }
}

impl<F> SecureLayer for F
where
    F: Fn(TcpStream, &str) -> std::result::Result<Box<dyn SecureStream>, BoxError> + Send + Sync,
{
    fn wrap(&self, socket: TcpStream, server_name: &str) -> Result<Box<dyn SecureStream>> {
        self(socket, server_name).map_err(|e| Error::Tls(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// SocketRewrapGuard
// ---------------------------------------------------------------------------

static REWRAP_LOCK: Mutex<()> = Mutex::new(());

/// Exclusive access to secure-layer setup for one connection.
///
/// Holding the guard serializes wrapping across all connections in the
/// process. The lock is released when the guard is dropped or consumed by
/// [`wrap`](Self::wrap), whatever the outcome.
pub struct SocketRewrapGuard<'a> {
    conn: &'a mut HttpConnection,
    _lock: MutexGuard<'static, ()>,
}

impl<'a> SocketRewrapGuard<'a> {
    /// Blocks until no other connection is wrapping. A lock poisoned by a
    /// panicking holder is taken over.
    pub fn acquire(conn: &'a mut HttpConnection) -> Self {
        let lock = REWRAP_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        SocketRewrapGuard { conn, _lock: lock }
    }

    /// Wrap the connection's live socket with `layer` and continue the
    /// connection on the secured stream.
    pub fn wrap(self, layer: &dyn SecureLayer, server_name: &str) -> Result<()> {
        let socket = self.conn.take_live_socket()?;
        debug!(
            server_name,
            socket = ?socket.local_addr().ok(),
            generation = self.conn.socket_generation(),
            "wrapping live socket"
        );
        let secured = layer.wrap(socket, server_name)?;
        self.conn.install_secure(secured);
        Ok(())
    }
}
