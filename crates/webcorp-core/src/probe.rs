/// Proxy authentication probe.
///
/// Sends one unauthenticated request per target through the proxy and
/// reports what the proxy answered and which authentication schemes it offers.

use crate::auth::{offered_schemes, AuthScheme};
use crate::error::{Error, Result};
use crate::rewrite::bracket_host;
use crate::transport::{ConnectOptions, HttpConnection, Transport};
use http::header::HeaderMap;
use http::{Method, Uri};
use serde::Serialize;
use std::thread;
use std::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub target: String,
    pub method: String,
    pub status: Option<u16>,
    pub offered_schemes: Vec<String>,
    /// The proxy answered with the unauthorized status for the configured
    /// auth target.
    pub requires_auth: bool,
    /// The configured scheme is among the offered ones.
    pub scheme_offered: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Single target probe
// ---------------------------------------------------------------------------

/// Knock on `url` through the proxy at `options`.
///
/// `https://` targets are probed with `CONNECT host:port`, anything else with
/// an absolute-form `GET`.
pub fn probe_target(options: &ConnectOptions, scheme: &AuthScheme, url: &str) -> ProbeResult {
    let start = Instant::now();
    let mut result = ProbeResult {
        target: url.to_string(),
        method: String::new(),
        status: None,
        offered_schemes: Vec::new(),
        requires_auth: false,
        scheme_offered: false,
        latency_ms: None,
        error: None,
    };

    let (method, request_target) = match knock_request(url) {
        Ok(r) => r,
        Err(e) => {
            result.error = Some(e.to_string());
            return result;
        }
    };
    result.method = method.to_string();

    let mut conn = HttpConnection::new(options.clone());
    let response = conn
        .send_request(&method, &request_target, None, &HeaderMap::new())
        .and_then(|_| conn.get_response());
    conn.close();
    result.latency_ms = Some(start.elapsed().as_millis() as u64);

    match response {
        Ok(r) => {
            debug!(target = url, status = r.status.as_u16(), "probe answered");
            result.status = Some(r.status.as_u16());
            result.offered_schemes = offered_schemes(&r.headers, scheme.target);
            result.requires_auth = r.status == scheme.target.unauthorized_status();
            result.scheme_offered = scheme.is_offered(&r.headers);
        }
        Err(e) => result.error = Some(e.to_string()),
    }
    result
}

fn knock_request(url: &str) -> Result<(Method, String)> {
    let invalid = |reason: &str| Error::InvalidUrl {
        target: url.to_string(),
        reason: reason.to_string(),
    };
    let uri: Uri = url.parse().map_err(|_| invalid("not a URI"))?;
    let host = uri.host().ok_or_else(|| invalid("missing host"))?;
    match uri.scheme_str() {
        Some("https") => {
            let port = uri.port_u16().unwrap_or(443);
            let host = host.trim_start_matches('[').trim_end_matches(']');
            Ok((Method::CONNECT, format!("{}:{}", bracket_host(host), port)))
        }
        Some("http") => Ok((Method::GET, uri.to_string())),
        _ => Err(invalid("scheme must be http or https")),
    }
}

// ---------------------------------------------------------------------------
// Bulk probe
// ---------------------------------------------------------------------------

/// Probe all targets concurrently, one thread each. Results keep the order
/// of `targets`.
pub fn probe_all(options: &ConnectOptions, scheme: &AuthScheme, targets: &[String]) -> Vec<ProbeResult> {
    thread::scope(|s| {
        let handles: Vec<_> = targets
            .iter()
            .map(|t| (t, s.spawn(move || probe_target(options, scheme, t))))
            .collect();
        handles
            .into_iter()
            .map(|(t, h)| {
                h.join().unwrap_or_else(|_| ProbeResult {
                    target: t.clone(),
                    method: String::new(),
                    status: None,
                    offered_schemes: Vec::new(),
                    requires_auth: false,
                    scheme_offered: false,
                    latency_ms: None,
                    error: Some("probe thread panicked".into()),
                })
            })
            .collect()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthTarget;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    /// Answer every connection's first request with a 407 offering
    /// Negotiate and NTLM; return the request lines seen.
    fn fake_proxy(connections: usize) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut lines = Vec::new();
            for _ in 0..connections {
                let (sock, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(sock.try_clone().unwrap());
                let mut first = String::new();
                reader.read_line(&mut first).unwrap();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                        break;
                    }
                }
                lines.push(first.trim_end().to_string());
                let mut w = sock;
                w.write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Negotiate\r\n\
                      Proxy-Authenticate: NTLM\r\n\
                      Content-Length: 0\r\n\r\n",
                )
                .unwrap();
            }
            lines
        });
        (port, handle)
    }

    #[test]
    fn test_probe_http_and_https_targets() {
        let (port, proxy) = fake_proxy(1);
        let options = ConnectOptions::new("127.0.0.1", port).with_timeout(Duration::from_secs(5));
        let scheme = AuthScheme::ntlm(AuthTarget::Proxy);

        let r = probe_target(&options, &scheme, "https://example.com/");
        assert_eq!(r.method, "CONNECT");
        assert_eq!(r.status, Some(407));
        assert!(r.requires_auth);
        assert!(r.scheme_offered);
        assert_eq!(r.offered_schemes, vec!["Negotiate", "NTLM"]);
        assert_eq!(proxy.join().unwrap(), vec!["CONNECT example.com:443 HTTP/1.1"]);
    }

    #[test]
    fn test_probe_all_keeps_order() {
        let (port, proxy) = fake_proxy(2);
        let options = ConnectOptions::new("127.0.0.1", port).with_timeout(Duration::from_secs(5));
        let targets = vec!["http://example.com/a".to_string(), "ftp://example.com/".to_string(), "https://example.org:8443".to_string()];
        let results = probe_all(&options, &AuthScheme::default(), &targets);

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].method, "GET");
        assert_eq!(results[0].status, Some(407));
        assert!(results[1].error.is_some());
        assert_eq!(results[2].method, "CONNECT");

        let mut seen = proxy.join().unwrap();
        seen.sort();
        assert_eq!(
            seen,
            vec!["CONNECT example.org:8443 HTTP/1.1", "GET http://example.com/a HTTP/1.1"]
        );
    }

    #[test]
    fn test_probe_unreachable_proxy() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let options = ConnectOptions::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        let r = probe_target(&options, &AuthScheme::default(), "http://example.com/");
        assert!(r.status.is_none());
        assert!(r.error.is_some());
    }

    #[test]
    fn test_knock_request() {
        assert_eq!(
            knock_request("https://[::1]/x").unwrap(),
            (Method::CONNECT, "[::1]:443".to_string())
        );
        assert_eq!(
            knock_request("http://example.com").unwrap(),
            (Method::GET, "http://example.com/".to_string())
        );
        assert!(knock_request("/relative").is_err());
    }
}
