/// Connection-level authentication handshake.
///
/// [`ConnectionWrapper`] sits between the caller and a [`Transport`]. The first
/// response on the connection (the "knock") decides whether authentication is
/// needed. If the peer answers with the unauthorized status it drives the
/// three-step exchange itself:
///
///   knock          → 401/407 + challenge offer
///   negotiate      → 401/407 + challenge token
///   authenticate   → final response, returned to the caller
///
/// Every step replays the caller's last request with a new authorization
/// header. After the knock is resolved the wrapper is a plain passthrough.

use crate::auth::token::{decode_challenge, Token};
use crate::auth::{AuthScheme, AuthSession, TokenProvider};
use crate::error::{Error, Result};
use crate::transport::{PendingRequest, Response, Transport};
use http::header::{HeaderMap, HeaderValue};
use http::Method;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnockState {
    /// No response has been read yet.
    AwaitingKnock,
    /// Knock resolved; responses are forwarded untouched.
    Passthrough,
}

/// How the knock was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The knock was not an authentication challenge.
    NotRequired,
    /// All three steps ran and the final response was accepted.
    Completed,
    /// All three steps ran but the final response is still unauthorized.
    Rejected,
    /// The handshake raised an error. The connection must be discarded.
    Failed,
}

// ---------------------------------------------------------------------------
// Close suppression
// ---------------------------------------------------------------------------

/// Keeps the transport's socket open while alive, whatever calls `close`.
/// Closes requested in the meantime take effect on drop.
struct CloseSuppression<'a, T: Transport> {
    inner: &'a mut T,
}

impl<'a, T: Transport> CloseSuppression<'a, T> {
    fn new(inner: &'a mut T) -> Self {
        inner.set_close_suppressed(true);
        CloseSuppression { inner }
    }
}

impl<T: Transport> Deref for CloseSuppression<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner
    }
}

impl<T: Transport> DerefMut for CloseSuppression<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner
    }
}

impl<T: Transport> Drop for CloseSuppression<'_, T> {
    fn drop(&mut self) {
        self.inner.set_close_suppressed(false);
    }
}

// ---------------------------------------------------------------------------
// ConnectionWrapper
// ---------------------------------------------------------------------------

pub struct ConnectionWrapper<T: Transport> {
    inner: T,
    scheme: AuthScheme,
    provider: Arc<dyn TokenProvider>,
    session: Option<Box<dyn AuthSession>>,
    pending: Option<PendingRequest>,
    state: KnockState,
    outcome: Option<HandshakeOutcome>,
}

impl<T: Transport> ConnectionWrapper<T> {
    pub fn new(inner: T, scheme: AuthScheme, provider: Arc<dyn TokenProvider>) -> Self {
        ConnectionWrapper {
            inner,
            scheme,
            provider,
            session: None,
            pending: None,
            state: KnockState::AwaitingKnock,
            outcome: None,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn scheme(&self) -> &AuthScheme {
        &self.scheme
    }

    pub fn state(&self) -> KnockState {
        self.state
    }

    /// `None` until the knock has been resolved.
    pub fn outcome(&self) -> Option<HandshakeOutcome> {
        self.outcome
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    /// Send a request and record it for replay. A request that could not be
    /// sent is not recorded.
    pub fn request(
        &mut self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        headers: HeaderMap,
    ) -> Result<()> {
        let pending = PendingRequest {
            method,
            url: url.to_string(),
            body,
            headers,
        };
        self.inner.send_request(
            &pending.method,
            &pending.url,
            pending.body.as_deref(),
            &pending.headers,
        )?;
        self.pending = Some(pending);
        Ok(())
    }

    /// Read the response to the last request, authenticating first if this
    /// is the knock and the peer demands it.
    pub fn get_response(&mut self) -> Result<Response> {
        if self.state == KnockState::Passthrough {
            return self.inner.get_response();
        }

        let knock = self.inner.get_response()?;
        let unauthorized = self.scheme.target.unauthorized_status();
        if knock.status != unauthorized {
            debug!(status = knock.status.as_u16(), "no authentication required");
            self.resolve(HandshakeOutcome::NotRequired);
            return Ok(knock);
        }

        match self.handshake(knock) {
            Ok(last) => {
                let outcome = if last.status == unauthorized {
                    warn!(
                        scheme = %self.scheme.name,
                        status = last.status.as_u16(),
                        "credentials rejected after full handshake"
                    );
                    HandshakeOutcome::Rejected
                } else {
                    info!(scheme = %self.scheme.name, status = last.status.as_u16(), "authenticated");
                    HandshakeOutcome::Completed
                };
                self.resolve(outcome);
                Ok(last)
            }
            Err(e) => {
                warn!(scheme = %self.scheme.name, error = %e, "handshake failed");
                self.resolve(HandshakeOutcome::Failed);
                Err(e)
            }
        }
    }

    pub fn reconnect(&mut self) -> Result<()> {
        self.inner.reconnect()
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    fn resolve(&mut self, outcome: HandshakeOutcome) {
        self.state = KnockState::Passthrough;
        self.outcome = Some(outcome);
    }

    fn handshake(&mut self, knock: Response) -> Result<Response> {
        let scheme = self.scheme.clone();
        let challenge_header = scheme.target.challenge_header();
        if !scheme.is_offered(&knock.headers) {
            return Err(Error::protocol(format!(
                "{} response does not offer {} in {}",
                knock.status.as_u16(),
                scheme.name,
                challenge_header
            )));
        }
        let pending = self.pending.clone().ok_or(Error::NoPendingRequest)?;
        debug!(
            scheme = %scheme.name,
            method = %pending.method,
            url = %pending.url,
            "authentication challenge received"
        );

        let mut conn = CloseSuppression::new(&mut self.inner);
        conn.reconnect()?;

        let session = match self.session.take() {
            Some(existing) => self.session.insert(existing),
            None => self.session.insert(
                self.provider
                    .create_session(&scheme.name)
                    .map_err(Error::Provider)?,
            ),
        };

        let negotiate = Token::from(session.next_token(None).map_err(Error::Provider)?);
        debug!(scheme = %scheme.name, token = ?negotiate, "sending negotiate token");
        replay(&mut *conn, &pending, &scheme, &negotiate)?;
        let challenge_response = conn.get_response()?;

        let challenge = decode_challenge(
            &scheme.name,
            challenge_response.headers.get_all(&challenge_header),
            scheme.challenge_match,
        )?;
        debug!(
            scheme = %scheme.name,
            status = challenge_response.status.as_u16(),
            challenge = ?Token::new(challenge.clone()),
            "challenge received"
        );

        let authenticate = Token::from(session.next_token(Some(&challenge)).map_err(Error::Provider)?);
        debug!(scheme = %scheme.name, token = ?authenticate, "sending authenticate token");
        replay(&mut *conn, &pending, &scheme, &authenticate)?;
        conn.get_response()
    }
}

fn replay<T: Transport>(
    conn: &mut T,
    pending: &PendingRequest,
    scheme: &AuthScheme,
    token: &Token,
) -> Result<()> {
    let value = HeaderValue::try_from(token.header_value(&scheme.name))
        .map_err(|_| Error::protocol(format!("'{}' cannot be sent as a header value", scheme.name)))?;
    let mut headers = pending.headers.clone();
    headers.insert(scheme.target.authorization_header(), value);
    conn.send_request(&pending.method, &pending.url, pending.body.as_deref(), &headers)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthTarget;
    use crate::error::BoxError;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use http::header::{AUTHORIZATION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
    use http::{StatusCode, Version};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const NEGOTIATE: &[u8] = b"NTLMSSP\0\x01\0\0\0neg";
    const AUTHENTICATE: &[u8] = b"NTLMSSP\0\x03\0\0\0auth";
    const CHALLENGE: &[u8] = b"NTLMSSP\0\x02\0\0\0chal";

    #[derive(Debug)]
    struct Sent {
        method: Method,
        url: String,
        headers: HeaderMap,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        responses: VecDeque<Response>,
        sent: Vec<Sent>,
        reconnects: usize,
        in_flight: bool,
        suppressed: bool,
        close_pending: bool,
        closed: bool,
        sent_while_closed: usize,
        fail_reconnect: bool,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Response>) -> Self {
            ScriptedTransport {
                responses: responses.into(),
                ..Default::default()
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn send_request(
            &mut self,
            method: &Method,
            url: &str,
            _body: Option<&[u8]>,
            headers: &HeaderMap,
        ) -> Result<()> {
            if self.in_flight {
                return Err(Error::ResponseNotRead);
            }
            if self.closed {
                self.sent_while_closed += 1;
            }
            self.in_flight = true;
            self.sent.push(Sent {
                method: method.clone(),
                url: url.to_string(),
                headers: headers.clone(),
            });
            Ok(())
        }

        fn get_response(&mut self) -> Result<Response> {
            self.in_flight = false;
            let r = self.responses.pop_front().ok_or(Error::NoPendingRequest)?;
            if r.wants_close() {
                self.close();
            }
            Ok(r)
        }

        fn reconnect(&mut self) -> Result<()> {
            if self.fail_reconnect {
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            self.reconnects += 1;
            self.in_flight = false;
            self.close_pending = false;
            self.closed = false;
            Ok(())
        }

        fn close(&mut self) {
            if self.suppressed {
                self.close_pending = true;
            } else {
                self.closed = true;
            }
        }

        fn set_close_suppressed(&mut self, suppressed: bool) {
            self.suppressed = suppressed;
            if !suppressed && std::mem::take(&mut self.close_pending) {
                self.closed = true;
            }
        }
    }

    struct ScriptedProvider {
        challenges: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
        sessions: Arc<Mutex<usize>>,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            ScriptedProvider {
                challenges: Arc::new(Mutex::new(Vec::new())),
                sessions: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl TokenProvider for ScriptedProvider {
        fn create_session(&self, scheme: &str) -> std::result::Result<Box<dyn AuthSession>, BoxError> {
            assert_eq!(scheme, "NTLM");
            *self.sessions.lock().unwrap() += 1;
            let seen = Arc::clone(&self.challenges);
            Ok(Box::new(move |challenge: Option<&[u8]>| -> std::result::Result<Vec<u8>, BoxError> {
                seen.lock().unwrap().push(challenge.map(<[u8]>::to_vec));
                Ok(match challenge {
                    None => NEGOTIATE.to_vec(),
                    Some(_) => AUTHENTICATE.to_vec(),
                })
            }))
        }
    }

    fn response(status: u16, headers: &[(http::HeaderName, String)]) -> Response {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(name.clone(), HeaderValue::try_from(value.as_str()).unwrap());
        }
        Response {
            version: Version::HTTP_11,
            status: StatusCode::from_u16(status).unwrap(),
            reason: String::new(),
            headers: map,
            body: Vec::new(),
        }
    }

    fn offer() -> (http::HeaderName, String) {
        (PROXY_AUTHENTICATE, "NTLM".to_string())
    }

    fn challenge() -> (http::HeaderName, String) {
        (PROXY_AUTHENTICATE, format!("NTLM {}", STANDARD.encode(CHALLENGE)))
    }

    fn wrapper(responses: Vec<Response>) -> (ConnectionWrapper<ScriptedTransport>, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new());
        let w = ConnectionWrapper::new(
            ScriptedTransport::new(responses),
            AuthScheme::ntlm(AuthTarget::Proxy),
            provider.clone(),
        );
        (w, provider)
    }

    fn auth_header(sent: &Sent) -> Option<&str> {
        sent.headers.get(PROXY_AUTHORIZATION).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_passthrough_without_challenge() {
        let (mut w, provider) = wrapper(vec![response(200, &[]), response(407, &[offer()])]);
        w.request(Method::GET, "/resource", None, HeaderMap::new()).unwrap();
        let r = w.get_response().unwrap();
        assert_eq!(r.status, StatusCode::OK);
        assert_eq!(w.state(), KnockState::Passthrough);
        assert_eq!(w.outcome(), Some(HandshakeOutcome::NotRequired));
        assert_eq!(w.get_ref().sent.len(), 1);
        assert_eq!(w.get_ref().reconnects, 0);
        assert_eq!(*provider.sessions.lock().unwrap(), 0);

        // A later 407 is the caller's business.
        w.request(Method::GET, "/other", None, HeaderMap::new()).unwrap();
        assert_eq!(w.get_response().unwrap().status.as_u16(), 407);
        assert_eq!(w.get_ref().sent.len(), 2);
    }

    #[test]
    fn test_full_handshake() {
        let (mut w, provider) = wrapper(vec![
            response(407, &[offer()]),
            response(407, &[challenge()]),
            response(200, &[]),
        ]);
        let mut headers = HeaderMap::new();
        headers.insert("x-trace", HeaderValue::from_static("1"));
        w.request(Method::POST, "/resource", Some(b"data".to_vec()), headers).unwrap();

        let r = w.get_response().unwrap();
        assert_eq!(r.status, StatusCode::OK);
        assert_eq!(w.outcome(), Some(HandshakeOutcome::Completed));

        let t = w.get_ref();
        assert_eq!(t.sent.len(), 3);
        assert_eq!(t.reconnects, 1);
        for s in &t.sent {
            assert_eq!(s.method, Method::POST);
            assert_eq!(s.url, "/resource");
            assert_eq!(s.headers.get("x-trace").unwrap(), "1");
        }
        assert_eq!(auth_header(&t.sent[0]), None);
        assert_eq!(auth_header(&t.sent[1]), Some(format!("NTLM {}", STANDARD.encode(NEGOTIATE)).as_str()));
        assert_eq!(auth_header(&t.sent[2]), Some(format!("NTLM {}", STANDARD.encode(AUTHENTICATE)).as_str()));

        let seen = provider.challenges.lock().unwrap();
        assert_eq!(*seen, vec![None, Some(CHALLENGE.to_vec())]);
        assert_eq!(*provider.sessions.lock().unwrap(), 1);
    }

    #[test]
    fn test_knock_without_challenge_header() {
        let (mut w, _) = wrapper(vec![response(407, &[])]);
        w.request(Method::GET, "/resource", None, HeaderMap::new()).unwrap();
        let err = w.get_response().unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert_eq!(w.get_ref().sent.len(), 1);
        assert_eq!(w.get_ref().reconnects, 0);
        assert_eq!(w.outcome(), Some(HandshakeOutcome::Failed));
    }

    #[test]
    fn test_challenge_missing_token() {
        let (mut w, provider) = wrapper(vec![response(407, &[offer()]), response(407, &[offer()])]);
        w.request(Method::GET, "/resource", None, HeaderMap::new()).unwrap();
        let err = w.get_response().unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        // knock + negotiate, nothing after the bad challenge
        assert_eq!(w.get_ref().sent.len(), 2);
        assert_eq!(*provider.challenges.lock().unwrap(), vec![None]);
    }

    #[test]
    fn test_rejected_final_response_returned() {
        let (mut w, _) = wrapper(vec![
            response(407, &[offer()]),
            response(407, &[challenge()]),
            response(407, &[offer()]),
        ]);
        w.request(Method::GET, "/resource", None, HeaderMap::new()).unwrap();
        let r = w.get_response().unwrap();
        assert_eq!(r.status.as_u16(), 407);
        assert_eq!(w.outcome(), Some(HandshakeOutcome::Rejected));
        assert_eq!(w.get_ref().sent.len(), 3);
    }

    #[test]
    fn test_close_suppressed_during_handshake() {
        let close = (http::header::CONNECTION, "close".to_string());
        let (mut w, _) = wrapper(vec![
            response(407, &[offer(), close.clone()]),
            response(407, &[challenge(), close]),
            response(200, &[]),
        ]);
        w.request(Method::GET, "/resource", None, HeaderMap::new()).unwrap();
        w.get_response().unwrap();
        let t = w.get_ref();
        // The knock close happens before suppression and the reconnect
        // reopens; the challenge close waits until the handshake is over.
        assert_eq!(t.sent_while_closed, 0);
        assert!(t.closed);
        assert!(!t.suppressed);
    }

    #[test]
    fn test_final_close_applied_after_handshake() {
        let close = (http::header::CONNECTION, "close".to_string());
        let (mut w, _) = wrapper(vec![
            response(407, &[offer()]),
            response(407, &[challenge()]),
            response(200, &[close]),
        ]);
        w.request(Method::GET, "/resource", None, HeaderMap::new()).unwrap();
        assert_eq!(w.get_response().unwrap().status, StatusCode::OK);
        assert_eq!(w.outcome(), Some(HandshakeOutcome::Completed));
        assert!(w.get_ref().closed);
        assert!(!w.get_ref().close_pending);
    }

    #[test]
    fn test_unsent_request_is_not_replayed() {
        let (mut w, _) = wrapper(vec![
            response(407, &[offer()]),
            response(407, &[challenge()]),
            response(200, &[]),
        ]);
        w.request(Method::GET, "/first", None, HeaderMap::new()).unwrap();
        let err = w.request(Method::POST, "/second", None, HeaderMap::new()).unwrap_err();
        assert!(matches!(err, Error::ResponseNotRead));
        assert_eq!(w.pending().map(|p| p.url.as_str()), Some("/first"));

        assert_eq!(w.get_response().unwrap().status, StatusCode::OK);
        let sent: Vec<_> = w
            .get_ref()
            .sent
            .iter()
            .map(|s| (s.method.clone(), s.url.as_str()))
            .collect();
        assert_eq!(sent, vec![(Method::GET, "/first"); 3]);
    }

    #[test]
    fn test_suppression_released_after_failure() {
        let (mut w, _) = wrapper(vec![response(407, &[offer()]), response(502, &[])]);
        w.request(Method::GET, "/resource", None, HeaderMap::new()).unwrap();
        assert!(w.get_response().is_err());
        assert!(!w.get_ref().suppressed);
        w.close();
        assert!(w.get_ref().closed);
    }

    #[test]
    fn test_reconnect_failure_propagates() {
        let (mut w, provider) = wrapper(vec![response(407, &[offer()])]);
        w.get_mut().fail_reconnect = true;
        w.request(Method::GET, "/resource", None, HeaderMap::new()).unwrap();
        let err = w.get_response().unwrap_err();
        assert!(err.is_transport());
        assert!(!w.get_ref().suppressed);
        assert_eq!(*provider.sessions.lock().unwrap(), 0);
    }

    #[test]
    fn test_provider_failure() {
        let provider = |_: &str| -> std::result::Result<Box<dyn AuthSession>, BoxError> {
            Err("no credentials cached".into())
        };
        let mut w = ConnectionWrapper::new(
            ScriptedTransport::new(vec![response(407, &[offer()])]),
            AuthScheme::ntlm(AuthTarget::Proxy),
            Arc::new(provider),
        );
        w.request(Method::GET, "/resource", None, HeaderMap::new()).unwrap();
        let err = w.get_response().unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert_eq!(w.get_ref().sent.len(), 1);
    }

    #[test]
    fn test_origin_target_headers() {
        let provider = Arc::new(ScriptedProvider::new());
        let mut w = ConnectionWrapper::new(
            ScriptedTransport::new(vec![
                response(401, &[(WWW_AUTHENTICATE, "NTLM".into())]),
                response(
                    401,
                    &[(WWW_AUTHENTICATE, format!("NTLM {}", STANDARD.encode(CHALLENGE)))],
                ),
                response(200, &[]),
            ]),
            AuthScheme::ntlm(AuthTarget::Origin),
            provider,
        );
        w.request(Method::GET, "/", None, HeaderMap::new()).unwrap();
        assert_eq!(w.get_response().unwrap().status, StatusCode::OK);
        let sent = &w.get_ref().sent;
        assert!(sent[1].headers.contains_key(AUTHORIZATION));
        assert!(!sent[1].headers.contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn test_proxy_407_ignored_for_origin_target() {
        let mut w = ConnectionWrapper::new(
            ScriptedTransport::new(vec![response(407, &[offer()])]),
            AuthScheme::ntlm(AuthTarget::Origin),
            Arc::new(ScriptedProvider::new()),
        );
        w.request(Method::GET, "/", None, HeaderMap::new()).unwrap();
        assert_eq!(w.get_response().unwrap().status.as_u16(), 407);
        assert_eq!(w.outcome(), Some(HandshakeOutcome::NotRequired));
    }
}
