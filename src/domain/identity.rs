//! Throttle identity.
//!
//! A throttle is identified by a `(scope, key)` pair: the scope names the
//! subject being limited (a user, a tenant) and the key names the kind of
//! occurrence (an email type, an API action).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length in bytes of a scope or key.
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Errors returned for malformed identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The scope was empty
    #[error("scope must not be empty")]
    EmptyScope,
    /// The key was empty
    #[error("key must not be empty")]
    EmptyKey,
    /// An identifier exceeded `MAX_IDENTIFIER_LEN` bytes
    #[error("{field} is {len} bytes long, the limit is {MAX_IDENTIFIER_LEN}")]
    TooLong {
        /// Which identifier ("scope" or "key")
        field: &'static str,
        /// Its length in bytes
        len: usize,
    },
    /// An identifier contained a NUL character
    #[error("{field} must not contain NUL characters")]
    ContainsNul {
        /// Which identifier ("scope" or "key")
        field: &'static str,
    },
}

/// Validated `(scope, key)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThrottleKey {
    scope: String,
    key: String,
}

impl ThrottleKey {
    /// Create a throttle identity.
    ///
    /// # Errors
    /// Returns `IdentityError` if either part is empty, longer than
    /// `MAX_IDENTIFIER_LEN` bytes, or contains a NUL character.
    pub fn new(scope: impl Into<String>, key: impl Into<String>) -> Result<Self, IdentityError> {
        let scope = scope.into();
        let key = key.into();

        if scope.is_empty() {
            return Err(IdentityError::EmptyScope);
        }
        if key.is_empty() {
            return Err(IdentityError::EmptyKey);
        }
        check("scope", &scope)?;
        check("key", &key)?;

        Ok(Self { scope, key })
    }

    /// The scope part.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The key part.
    pub fn key(&self) -> &str {
        &self.key
    }
}

fn check(field: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(IdentityError::TooLong {
            field,
            len: value.len(),
        });
    }
    if value.contains('\0') {
        return Err(IdentityError::ContainsNul { field });
    }
    Ok(())
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.key)
    }
}
