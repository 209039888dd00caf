/// Blocking HTTP/1.1 transport.
///
/// The [`Transport`] trait is the request/response contract the handshake is
/// written against; [`HttpConnection`] is the socket-backed implementation.

pub mod codec;
pub mod connection;

pub use connection::{ConnectOptions, HttpConnection};

use crate::error::Result;
use http::header::{HeaderMap, CONNECTION};
use http::{Method, StatusCode, Version};

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// The most recently issued request on a connection, kept so the handshake
/// can replay it with a different authorization header.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Vec<u8>>,
    pub headers: HeaderMap,
}

impl PendingRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        PendingRequest {
            method,
            url: url.into(),
            body: None,
            headers: HeaderMap::new(),
        }
    }
}

/// A fully received response. The body has already been drained from the
/// socket when a `Response` is handed out.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the peer announced it will close the connection after this
    /// response.
    pub fn wants_close(&self) -> bool {
        let has_token = |token: &str| {
            self.headers.get_all(CONNECTION).iter().any(|v| {
                v.to_str()
                    .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                    .unwrap_or(false)
            })
        };
        if has_token("close") {
            return true;
        }
        self.version == Version::HTTP_10 && !has_token("keep-alive")
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Request/response contract of a blocking HTTP client connection.
///
/// Implementations alternate strictly: every `send_request` is followed by
/// exactly one `get_response` before the next request.
pub trait Transport {
    fn send_request(
        &mut self,
        method: &Method,
        url: &str,
        body: Option<&[u8]>,
        headers: &HeaderMap,
    ) -> Result<()>;

    fn get_response(&mut self) -> Result<Response>;

    /// Replace the socket with a fresh one to the same endpoint.
    fn reconnect(&mut self) -> Result<()>;

    fn close(&mut self);

    /// While suppressed, `close` (explicit, or triggered by a
    /// `Connection: close` response) leaves the socket open. A close that
    /// arrived meanwhile is carried out when suppression is lifted, unless
    /// `reconnect` already replaced the socket.
    fn set_close_suppressed(&mut self, suppressed: bool);
}
