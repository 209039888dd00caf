pub mod auth;
pub mod config;
pub mod error;
pub mod https;
pub mod probe;
pub mod rewrite;
pub mod secure;
pub mod transport;
pub mod tunnel;
pub mod wrapper;

pub use auth::{AuthScheme, AuthSession, AuthTarget, ChallengeMatch, TokenProvider};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use https::HttpsConnection;
pub use rewrite::RequestRewriter;
pub use secure::{RustlsLayer, SecureLayer, SecureStream, SocketRewrapGuard};
pub use transport::{ConnectOptions, HttpConnection, Response, Transport};
pub use tunnel::TunnelNegotiator;
pub use wrapper::{ConnectionWrapper, HandshakeOutcome, KnockState};
