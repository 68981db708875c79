//! Shared-secret check for write operations.
//!
//! The credential is taken from the first location that carries one, in this
//! order: the `x-api-key` header, the `key` query parameter, the `key` field of
//! a structured body. A later location is never consulted once an earlier one
//! is present, even if the earlier value is wrong.
//!
//! The comparison is a plain string equality and is not constant-time. That
//! leaves a theoretical timing side channel, accepted for a single low-stakes
//! shared secret.

/// Header carrying the credential.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Raised when a guarded operation is attempted without the right key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bad key")]
pub struct Unauthorized;

/// Credentials found on a request, one slot per accepted location.
#[derive(Debug, Default, Clone, Copy)]
pub struct Credentials<'a> {
    pub header: Option<&'a str>,
    pub query: Option<&'a str>,
    pub body: Option<&'a str>,
}

impl<'a> Credentials<'a> {
    /// The credential that counts, following the fixed precedence.
    pub fn presented(&self) -> Option<&'a str> {
        self.header.or(self.query).or(self.body)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessGuard {
    secret: Option<String>,
}

impl AccessGuard {
    /// Guards with `secret`. An empty secret leaves every operation open.
    pub fn new(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        Self {
            secret: (!secret.is_empty()).then_some(secret),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub fn check(&self, credentials: Credentials<'_>) -> Result<(), Unauthorized> {
        match &self.secret {
            None => Ok(()),
            Some(secret) if credentials.presented() == Some(secret.as_str()) => Ok(()),
            Some(_) => Err(Unauthorized),
        }
    }
}
