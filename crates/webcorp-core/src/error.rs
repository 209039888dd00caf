/// Error type shared by the transport, handshake, tunnel and secure layers.

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Boxed error returned by token providers and secure-layer backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    /// The peer's challenge was missing, named another scheme, or carried an
    /// undecodable token. Fatal for the handshake.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Connect, reconnect, read or write failure on the underlying socket.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("proxy refused tunnel to {authority}: {status} {reason}")]
    TunnelRefused {
        authority: String,
        status: StatusCode,
        reason: String,
    },

    #[error("token provider failed: {0}")]
    Provider(#[source] BoxError),

    #[error("secure layer setup failed: {0}")]
    Tls(String),

    #[error("invalid request target '{target}': {reason}")]
    InvalidUrl { target: String, reason: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("previous response has not been read")]
    ResponseNotRead,

    #[error("no request is awaiting a response")]
    NoPendingRequest,
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedResponse(msg.into())
    }

    /// True for errors raised by the socket layer rather than by protocol logic.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
