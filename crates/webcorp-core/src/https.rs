/// Secure client connection, direct or through a CONNECT tunnel.

use crate::auth::{AuthScheme, TokenProvider};
use crate::error::Result;
use crate::rewrite::{bracket_host, RequestRewriter};
use crate::secure::{SecureLayer, SocketRewrapGuard};
use crate::transport::{ConnectOptions, HttpConnection, Response};
use crate::tunnel::TunnelNegotiator;
use crate::wrapper::{ConnectionWrapper, HandshakeOutcome};
use http::header::HeaderMap;
use http::Method;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

const HTTPS_PORT: u16 = 443;

/// An HTTPS connection whose authentication is handled by a
/// [`ConnectionWrapper`].
///
/// With a tunnel set, [`ConnectOptions`] address the proxy: the plain
/// connection first negotiates `CONNECT` (authenticating to the proxy if it
/// asks), then the secure layer is started on whatever socket is live. Without
/// a tunnel the secure layer is applied on every connect and the handshake, if
/// any, runs against the origin server inside it.
pub struct HttpsConnection {
    wrapper: ConnectionWrapper<HttpConnection>,
    tunnel: Option<TunnelNegotiator>,
    layer: Arc<dyn SecureLayer>,
    rewriter: RequestRewriter,
    ready: bool,
}

impl HttpsConnection {
    pub fn new(
        options: ConnectOptions,
        scheme: AuthScheme,
        provider: Arc<dyn TokenProvider>,
        layer: Arc<dyn SecureLayer>,
    ) -> Self {
        let rewriter = RequestRewriter::new(default_host(&options.host, options.port));
        HttpsConnection {
            wrapper: ConnectionWrapper::new(HttpConnection::new(options), scheme, provider),
            tunnel: None,
            layer,
            rewriter,
            ready: false,
        }
    }

    /// Tunnel to `host:port` through the proxy given at construction.
    pub fn set_tunnel(&mut self, host: impl Into<String>, port: u16) {
        let tunnel = TunnelNegotiator::new(host, port);
        self.rewriter = RequestRewriter::new(default_host(tunnel.host(), port));
        self.tunnel = Some(tunnel);
    }

    pub fn tunnel(&self) -> Option<&TunnelNegotiator> {
        self.tunnel.as_ref()
    }

    pub fn wrapper(&self) -> &ConnectionWrapper<HttpConnection> {
        &self.wrapper
    }

    pub fn outcome(&self) -> Option<HandshakeOutcome> {
        self.wrapper.outcome()
    }

    pub fn is_secure(&self) -> bool {
        self.wrapper.get_ref().is_secure()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.wrapper.get_ref().local_addr()
    }

    /// Open the connection and bring it to the secured state. Does nothing
    /// when already connected.
    pub fn connect(&mut self) -> Result<()> {
        if self.ready && self.wrapper.get_ref().is_connected() {
            return Ok(());
        }
        match &self.tunnel {
            Some(tunnel) => {
                self.wrapper.get_mut().connect()?;
                tunnel.establish(&mut self.wrapper)?;
                SocketRewrapGuard::acquire(self.wrapper.get_mut()).wrap(self.layer.as_ref(), tunnel.host())?;
            }
            None => {
                let server_name = self.wrapper.get_ref().options().host.clone();
                let conn = self.wrapper.get_mut();
                conn.secure_on_connect(Arc::clone(&self.layer), server_name);
                conn.connect()?;
            }
        }
        debug!(
            socket = ?self.wrapper.get_ref().local_addr(),
            tunnelled = self.tunnel.is_some(),
            "secure connection ready"
        );
        self.ready = true;
        Ok(())
    }

    /// Send a request on the secured connection. The target is rewritten to
    /// absolute form first.
    pub fn request(
        &mut self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        headers: HeaderMap,
    ) -> Result<()> {
        self.connect()?;
        let target = self.rewriter.rewrite(url)?;
        self.wrapper.request(method, &target, body, headers)
    }

    pub fn get_response(&mut self) -> Result<Response> {
        self.wrapper.get_response()
    }

    pub fn close(&mut self) {
        self.wrapper.close();
        self.ready = false;
    }
}

fn default_host(host: &str, port: u16) -> String {
    if port == HTTPS_PORT {
        bracket_host(host)
    } else {
        format!("{}:{}", bracket_host(host), port)
    }
}
