//! Access token collaborator.
//!
//! The telemetry endpoint authenticates the WebSocket handshake with a token in the
//! query string. Obtaining and refreshing that token belongs to the host application;
//! the connection state machine only asks whether the current token is usable and,
//! when it is not, for one refresh before connecting.

use async_trait::async_trait;
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};

use crate::Result;
use crate::error::Error;

/// Source of the token appended to the telemetry URL.
///
/// # Example
///
/// ```ignore
/// struct Session { /* ... */ }
///
/// #[async_trait]
/// impl TokenProvider for Session {
///     fn is_valid(&self) -> bool { !self.expired() }
///     fn current_token(&self) -> SecretString { self.jwt.clone() }
///     async fn refresh(&self) -> Result<()> { self.exchange_refresh_token().await }
/// }
/// ```
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Whether [`TokenProvider::current_token`] can be used right now.
    fn is_valid(&self) -> bool;

    fn current_token(&self) -> SecretString;

    /// Obtain a new token. An error here ends the session: the connection attempt is
    /// abandoned and an unauthenticated event is emitted.
    async fn refresh(&self) -> Result<()>;
}

/// A token that never expires, e.g. a long-lived API token or a test fixture.
#[derive(Clone, Debug)]
pub struct StaticToken {
    token: SecretString,
}

impl StaticToken {
    #[must_use]
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    fn is_valid(&self) -> bool {
        true
    }

    fn current_token(&self) -> SecretString {
        self.token.clone()
    }

    async fn refresh(&self) -> Result<()> {
        Err(Error::authentication("a static token cannot be refreshed"))
    }
}
