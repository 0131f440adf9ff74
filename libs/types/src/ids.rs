//! Identifier types for relay entities
//!
//! Lock identifiers arrive from remote debugged processes and end up as
//! file names in the lock directory, so they are validated on construction.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::IdError;

/// Maximum length of a lock identifier in bytes.
pub const MAX_LOCK_ID_LEN: usize = 128;

/// Identifier of a paused call site.
///
/// Accepts 1..=128 characters from `[A-Za-z0-9_.-]`, excluding the
/// path components `.` and `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LockId(String);

impl LockId {
    /// Create a new LockId, validating its characters.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.len() > MAX_LOCK_ID_LEN {
            return Err(IdError::TooLong {
                len: id.len(),
                max: MAX_LOCK_ID_LEN,
            });
        }
        if id == "." || id == ".." {
            return Err(IdError::Reserved(id));
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(IdError::InvalidChar(c));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LockId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LockId> for String {
    fn from(id: LockId) -> Self {
        id.0
    }
}

impl AsRef<str> for LockId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a registered broadcast subscriber.
///
/// Assigned sequentially by the channel; never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
