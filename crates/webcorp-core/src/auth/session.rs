/// Security provider boundary.
///
/// A `TokenProvider` stands in for the platform security-support provider
/// (SSPI on Windows, a GSS/ntlm helper elsewhere). It is asked for one session
/// per connection, and the session produces the negotiate token (no challenge)
/// followed by the authenticate token (decoded server challenge).

use crate::error::BoxError;

/// Per-connection authentication context.
pub trait AuthSession: Send {
    /// Produce the next token. `None` yields the initial negotiate token;
    /// `Some(challenge)` yields the authenticate token for that challenge.
    fn next_token(&mut self, challenge: Option<&[u8]>) -> Result<Vec<u8>, BoxError>;
}

/// Factory of [`AuthSession`]s for a named scheme such as `"NTLM"`.
pub trait TokenProvider: Send + Sync {
    fn create_session(&self, scheme: &str) -> Result<Box<dyn AuthSession>, BoxError>;
}

impl<F> TokenProvider for F
where
    F: Fn(&str) -> Result<Box<dyn AuthSession>, BoxError> + Send + Sync,
{
    fn create_session(&self, scheme: &str) -> Result<Box<dyn AuthSession>, BoxError> {
        self(scheme)
    }
}

impl<F> AuthSession for F
where
    F: FnMut(Option<&[u8]>) -> Result<Vec<u8>, BoxError> + Send,
{
    fn next_token(&mut self, challenge: Option<&[u8]>) -> Result<Vec<u8>, BoxError> {
        self(challenge)
    }
}
