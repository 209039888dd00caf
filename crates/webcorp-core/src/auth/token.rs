/// Token and challenge header encoding.
///
/// Tokens travel as `"<Scheme> <base64(bytes)>"`; challenges arrive in the same
/// shape and are stripped of the scheme prefix before decoding.

use super::ChallengeMatch;
use crate::auth::ntlm;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::HeaderValue;
use std::fmt;

/// Opaque authentication message bytes produced by a security provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Vec<u8>);

impl Token {
    pub fn new(bytes: Vec<u8>) -> Self {
        Token(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Header value carrying this token for `scheme`.
    pub fn header_value(&self, scheme: &str) -> String {
        encode_header(scheme, &self.0)
    }
}

impl From<Vec<u8>> for Token {
    fn from(bytes: Vec<u8>) -> Self {
        Token(bytes)
    }
}

// Token bytes are credentials; never print them.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Token");
        dbg.field("len", &self.0.len());
        if let Some(kind) = ntlm::message_type(&self.0) {
            dbg.field("ntlmssp", &kind);
        }
        dbg.finish()
    }
}

/// Returns `"<scheme> <base64(token)>"`.
pub fn encode_header(scheme: &str, token: &[u8]) -> String {
    format!("{} {}", scheme, STANDARD.encode(token))
}

/// Extract and decode the challenge for `scheme` from the challenge header
/// values of a response.
///
/// `Strict` requires the first header value to start with `"<scheme> "`
/// exactly. `Lenient` searches every value and every comma-separated offer,
/// comparing the scheme name case-insensitively.
pub fn decode_challenge<'a, I>(scheme: &str, values: I, mode: ChallengeMatch) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a HeaderValue>,
{
    let mut values = values.into_iter().peekable();
    if values.peek().is_none() {
        return Err(Error::protocol(format!("no {} challenge header in response", scheme)));
    }

    let encoded = match mode {
        ChallengeMatch::Strict => {
            let first = values
                .next()
                .map(header_str)
                .transpose()?
                .unwrap_or_default();
            let prefix = format!("{} ", scheme);
            first
                .strip_prefix(prefix.as_str())
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    Error::protocol(format!(
                        "challenge '{}' does not start with '{}'",
                        truncate(first),
                        prefix
                    ))
                })?
                .to_string()
        }
        ChallengeMatch::Lenient => {
            let mut found = None;
            for value in values {
                let value = header_str(value)?;
                if let Some(token) = find_offer(value, scheme) {
                    found = Some(token.to_string());
                    break;
                }
            }
            found.ok_or_else(|| {
                Error::protocol(format!("no {} challenge among offered schemes", scheme))
            })?
        }
    };

    STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| Error::protocol(format!("undecodable {} challenge: {}", scheme, e)))
}

fn find_offer<'v>(value: &'v str, scheme: &str) -> Option<&'v str> {
    value.split(',').map(str::trim).find_map(|offer| {
        let (name, rest) = offer.split_once(' ')?;
        if !name.eq_ignore_ascii_case(scheme) {
            return None;
        }
        let token = rest.trim();
        (!token.is_empty()).then_some(token)
    })
}

fn header_str(value: &HeaderValue) -> Result<&str> {
    value
        .to_str()
        .map_err(|_| Error::protocol("challenge header is not visible ASCII"))
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(32) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
