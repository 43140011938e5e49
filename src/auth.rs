//! Bearer-token access for the socket handshake and REST calls.
//!
//! Login and session storage live outside this crate; the chat layer only
//! needs "the current bearer token" at the moment it connects.

/// Source of the current bearer credential.
pub trait TokenProvider: Send + Sync {
    /// The token to present right now, or `None` when signed out.
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed token, e.g. injected after a login flow completes.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Reads the token from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenProvider for EnvToken {
    fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|token| token.trim().to_owned())
            .filter(|token| !token.is_empty())
    }
}

/// `Authorization` header value for a token.
#[must_use]
pub fn bearer_header(token: &str) -> String {
    format!("Bearer {token}")
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
