//! Identifier types shared by every Courier crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a live connection.
///
/// Connection ids are generated per accepted transport and must be unique
/// across every worker process, since remote workers address connections by
/// id over the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A user identifier exactly as a client presented it.
///
/// Clients send user ids either as JSON strings (`"7"`) or as JSON integers
/// (`7`). Raw ids are never compared with each other; they are resolved to a
/// canonical identity first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawUserId {
    /// Integer encoding.
    Number(i64),
    /// String encoding.
    Text(String),
}

impl RawUserId {
    /// Render the id as text, trimming surrounding whitespace.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            RawUserId::Number(n) => n.to_string(),
            RawUserId::Text(s) => s.trim().to_string(),
        }
    }

    /// The integer form of this id, if it has one.
    #[must_use]
    pub fn as_number(&self) -> Option<i64> {
        match self {
            RawUserId::Number(n) => Some(*n),
            RawUserId::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Whether the id carries no usable value.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        matches!(self, RawUserId::Text(s) if s.trim().is_empty())
    }
}

impl fmt::Display for RawUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawUserId::Number(n) => write!(f, "{n}"),
            RawUserId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RawUserId {
    fn from(n: i64) -> Self {
        RawUserId::Number(n)
    }
}

impl From<&str> for RawUserId {
    fn from(s: &str) -> Self {
        RawUserId::Text(s.to_string())
    }
}

impl From<String> for RawUserId {
    fn from(s: String) -> Self {
        RawUserId::Text(s)
    }
}
