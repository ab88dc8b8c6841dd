//! Per-credential sessions
//!
//! Every distinct credential maps to a [`SessionKey`] and every key owns one
//! memory context, held by the [`SessionRegistry`]. Keys are derived from a
//! SHA-256 digest so raw credentials never reach logs or the snapshot
//! directory.

mod registry;
mod store;

pub use registry::{Session, SessionGuard, SessionRegistry, SessionStats};
pub use store::{SNAPSHOT_EXTENSION, SnapshotStore};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum length for session keys
const MAX_SESSION_KEY_LEN: usize = 128;

/// Number of hex characters kept from the credential digest
pub const SESSION_KEY_HEX_LEN: usize = 16;

/// Errors that can occur during session key validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionKeyError {
    /// Session key is empty
    #[error("Session key cannot be empty")]
    Empty,

    /// Session key contains invalid characters
    #[error("Session key contains invalid characters: allowed are a-z, A-Z, 0-9, _, -")]
    InvalidChars,

    /// Session key exceeds maximum length
    #[error("Session key exceeds maximum length of {MAX_SESSION_KEY_LEN} characters")]
    TooLong,
}

/// A validated session key
///
/// Generated keys are 16 lowercase hex characters. Keys read back from the
/// snapshot directory go through the same validation as any other input:
/// - non-empty
/// - only alphanumeric characters, underscores, and hyphens
/// - at most 128 characters long
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    /// Get the session key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading 8 characters, for log lines
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }

    fn validate(s: &str) -> Result<(), SessionKeyError> {
        if s.is_empty() {
            return Err(SessionKeyError::Empty);
        }

        if s.len() > MAX_SESSION_KEY_LEN {
            return Err(SessionKeyError::TooLong);
        }

        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SessionKeyError::InvalidChars);
        }

        Ok(())
    }
}

impl TryFrom<&str> for SessionKey {
    type Error = SessionKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::validate(value)?;
        Ok(SessionKey(value.to_string()))
    }
}

impl TryFrom<String> for SessionKey {
    type Error = SessionKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(SessionKey(value))
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.0
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the session key for a credential: the first 16 hex characters of
/// its SHA-256 digest. An empty credential yields the shared anonymous key.
pub fn generate_session_key(credential: &str) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    SessionKey(digest[..SESSION_KEY_HEX_LEN].to_string())
}
