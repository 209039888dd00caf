/// Request target normalization for proxied connections.

use crate::error::{Error, Result};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use tracing::trace;

/// Rewrites request targets into absolute-URI form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRewriter {
    default_host: String,
}

impl RequestRewriter {
    /// `default_host` fills in a missing host: the tunnel destination, or
    /// the connection's own host when no tunnel is active. It may carry a
    /// port.
    pub fn new(default_host: impl Into<String>) -> Self {
        RequestRewriter {
            default_host: default_host.into(),
        }
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    /// Missing scheme becomes `https`, missing host becomes the default host
    /// and an empty path becomes `/`. Path and query are kept. The asterisk
    /// form (`OPTIONS *`) passes through untouched.
    pub fn rewrite(&self, target: &str) -> Result<String> {
        if target == "*" {
            return Ok(target.to_string());
        }
        let invalid = |reason: String| Error::InvalidUrl {
            target: target.to_string(),
            reason,
        };

        let uri: Uri = target.parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
        let mut parts = uri.into_parts();
        if parts.scheme.is_none() {
            parts.scheme = Some(Scheme::HTTPS);
        }
        if parts.authority.is_none() {
            let authority = Authority::try_from(bracket_host(&self.default_host).as_str())
                .map_err(|e| invalid(format!("default host '{}': {}", self.default_host, e)))?;
            parts.authority = Some(authority);
        }
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }

        let rewritten = Uri::from_parts(parts)
            .map_err(|e| invalid(e.to_string()))?
            .to_string();
        if rewritten != target {
            trace!(from = target, to = %rewritten, "request target rewritten");
        }
        Ok(rewritten)
    }
}

/// Wrap a bare IPv6 literal in brackets for use in an authority.
pub fn bracket_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') && host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}
