/// HTTP CONNECT tunnel setup through an authenticating proxy.

use crate::error::{Error, Result};
use crate::rewrite::bracket_host;
use crate::transport::{Response, Transport};
use crate::wrapper::ConnectionWrapper;
use http::header::HeaderMap;
use http::Method;
use tracing::{debug, info};

/// Opens a tunnel to `host:port` with a `CONNECT` sent through a
/// [`ConnectionWrapper`], so proxy authentication applies to it like to any
/// other request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelNegotiator {
    host: String,
    port: u16,
    headers: HeaderMap,
}

impl TunnelNegotiator {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TunnelNegotiator {
            host: host.into(),
            port,
            headers: HeaderMap::new(),
        }
    }

    /// Extra headers for the `CONNECT` request, e.g. `User-Agent`.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        format!("{}:{}", bracket_host(&self.host), self.port)
    }

    /// Send `CONNECT` and require a 2xx final answer.
    ///
    /// On success the proxy relays raw bytes from now on; the connection's
    /// socket (possibly a fresh one if the handshake reconnected) is ready for
    /// a secure layer.
    pub fn establish<T: Transport>(&self, conn: &mut ConnectionWrapper<T>) -> Result<Response> {
        let authority = self.authority();
        debug!(%authority, "requesting tunnel");
        conn.request(Method::CONNECT, &authority, None, self.headers.clone())?;
        let response = conn.get_response()?;

        if !response.status.is_success() {
            return Err(Error::TunnelRefused {
                authority,
                status: response.status,
                reason: response.reason,
            });
        }
        info!(%authority, status = response.status.as_u16(), "tunnel established");
        Ok(response)
    }
}
