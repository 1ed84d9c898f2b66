//! Caller identity and token authorization.

use crate::contract::Access;
use std::collections::HashMap;
use thiserror::Error;

/// Identity resolved from a request token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub name: String,
    pub authenticated: bool,
    pub roles: Vec<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(name: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            name: name.into(),
            authenticated: true,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

impl Access {
    /// Whether an identity satisfies this requirement.
    pub fn permits(&self, identity: &Identity) -> bool {
        match self {
            Access::Anonymous => true,
            Access::Authenticated => identity.authenticated,
            Access::Roles(roles) => {
                identity.authenticated && roles.iter().any(|role| identity.has_role(role))
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("authorization failed: {0}")]
    Other(String),
}

/// Resolves the caller's identity from the request token.
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, token: Option<&str>) -> Result<Identity, AuthError>;
}

/// Treats every caller as anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuthorizer;

impl Authorizer for AnonymousAuthorizer {
    fn authorize(&self, _token: Option<&str>) -> Result<Identity, AuthError> {
        Ok(Identity::anonymous())
    }
}

/// Fixed token table.
///
/// A missing token resolves to the anonymous identity; an unknown token is
/// refused outright.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthorizer {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        match token {
            None => Ok(Identity::anonymous()),
            Some(token) => self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken),
        }
    }
}
