pub mod ntlm;
pub mod session;
pub mod token;

pub use session::{AuthSession, TokenProvider};
pub use token::Token;

use anyhow::{anyhow, Result};
use http::header::{
    HeaderMap, HeaderName, AUTHORIZATION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION,
    WWW_AUTHENTICATE,
};
use http::StatusCode;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Who demands authentication: the proxy in front of the destination, or the
/// destination (origin server) itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthTarget {
    Proxy,
    Origin,
}

impl AuthTarget {
    /// 407 for a proxy, 401 for an origin server.
    pub fn unauthorized_status(self) -> StatusCode {
        match self {
            AuthTarget::Proxy => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            AuthTarget::Origin => StatusCode::UNAUTHORIZED,
        }
    }

    /// Header the client puts its tokens in.
    pub fn authorization_header(self) -> HeaderName {
        match self {
            AuthTarget::Proxy => PROXY_AUTHORIZATION,
            AuthTarget::Origin => AUTHORIZATION,
        }
    }

    /// Header the peer puts its challenges in.
    pub fn challenge_header(self) -> HeaderName {
        match self {
            AuthTarget::Proxy => PROXY_AUTHENTICATE,
            AuthTarget::Origin => WWW_AUTHENTICATE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthTarget::Proxy => "proxy",
            AuthTarget::Origin => "origin",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "proxy" => Ok(AuthTarget::Proxy),
            "origin" | "direct" => Ok(AuthTarget::Origin),
            other => Err(anyhow!("Unknown auth target: {}", other)),
        }
    }
}

/// How the challenge header is matched against the configured scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeMatch {
    /// First challenge value must begin with `"<Scheme> "`.
    #[default]
    Strict,
    /// Scheme may appear anywhere among the offered challenges.
    Lenient,
}

impl ChallengeMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeMatch::Strict => "strict",
            ChallengeMatch::Lenient => "lenient",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(ChallengeMatch::Strict),
            "lenient" => Ok(ChallengeMatch::Lenient),
            other => Err(anyhow!("Unknown challenge match mode: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthScheme
// ---------------------------------------------------------------------------

/// The single authentication scheme active on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthScheme {
    pub name: String,
    pub target: AuthTarget,
    pub challenge_match: ChallengeMatch,
}

impl AuthScheme {
    pub fn new(name: impl Into<String>, target: AuthTarget) -> Self {
        AuthScheme {
            name: name.into(),
            target,
            challenge_match: ChallengeMatch::default(),
        }
    }

    pub fn ntlm(target: AuthTarget) -> Self {
        Self::new("NTLM", target)
    }

    pub fn with_challenge_match(mut self, mode: ChallengeMatch) -> Self {
        self.challenge_match = mode;
        self
    }

    /// Whether the peer offers this scheme in any challenge header of `headers`.
    pub fn is_offered(&self, headers: &HeaderMap) -> bool {
        offered_schemes(headers, self.target)
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&self.name))
    }
}

impl Default for AuthScheme {
    fn default() -> Self {
        AuthScheme::ntlm(AuthTarget::Proxy)
    }
}

/// List the scheme names offered in the challenge headers for `target`.
///
/// Handles both repeated header fields and comma-separated offers; auth
/// parameters such as `realm="corp"` are skipped. Order is preserved and
/// duplicates removed.
pub fn offered_schemes(headers: &HeaderMap, target: AuthTarget) -> Vec<String> {
    let mut schemes: Vec<String> = Vec::new();
    for value in headers.get_all(target.challenge_header()).iter() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for part in value.split(',') {
            let Some(name) = part.split_whitespace().next() else {
                continue;
            };
            if name.contains('=') {
                continue;
            }
            if !schemes.iter().any(|s| s.eq_ignore_ascii_case(name)) {
                schemes.push(name.to_string());
            }
        }
    }
    schemes
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
