//! Identity resolution.
//!
//! Clients present user ids as JSON strings or JSON integers. Every component
//! downstream of this module works with the canonical [`UserId`] only.

use crate::error::{with_deadline, RelayError, StoreError};
use async_trait::async_trait;
use courier_protocol::RawUserId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Canonical user identity: the decimal/text rendering of the user record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Primary key of a user record, as stored by the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Numeric(i64),
    Text(String),
}

impl RecordKey {
    /// The canonical identity this key stands for.
    #[must_use]
    pub fn canonical(&self) -> UserId {
        match self {
            RecordKey::Numeric(n) => UserId(n.to_string()),
            RecordKey::Text(s) => UserId(s.clone()),
        }
    }

    /// Whether this key equals the raw id in either encoding.
    #[must_use]
    pub fn matches(&self, raw: &RawUserId) -> bool {
        match self {
            RecordKey::Numeric(n) => raw.as_number() == Some(*n),
            RecordKey::Text(s) => *s == raw.to_text(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// A user record as returned by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub key: RecordKey,
    /// Secondary id some records still carry from an older schema.
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub legacy_id: Option<RecordKey>,
    pub username: String,
    #[serde(default)]
    pub role: Role,
}

/// A resolved identity with its cached profile fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
}

impl From<UserRecord> for Identity {
    fn from(record: UserRecord) -> Self {
        Self {
            user_id: record.key.canonical(),
            username: record.username,
            role: record.role,
        }
    }
}

/// Read access to the persistent user directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Exact lookup on the record key.
    async fn find_by_key(&self, key: &RecordKey) -> Result<Option<UserRecord>, StoreError>;

    /// Permissive lookup matching the record key or legacy id in either
    /// encoding.
    async fn find_any(&self, raw: &RawUserId) -> Result<Option<UserRecord>, StoreError>;
}

/// Resolves raw client identifiers to canonical identities.
#[derive(Clone)]
pub struct IdentityResolver {
    directory: Arc<dyn UserDirectory>,
    timeout: Duration,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(directory: Arc<dyn UserDirectory>, timeout: Duration) -> Self {
        Self { directory, timeout }
    }

    /// Resolve a raw id.
    ///
    /// Lookups run in order: exact key as text, numeric-coerced key, then the
    /// permissive query. The first hit wins.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::IdentityNotFound` when nothing matches, or when a
    /// directory call fails or times out.
    pub async fn resolve(&self, raw: &RawUserId) -> Result<Identity, RelayError> {
        if raw.is_blank() {
            return Err(RelayError::IdentityNotFound(String::new()));
        }

        let text = RecordKey::Text(raw.to_text());
        if let Some(record) = self.lookup(raw, self.directory.find_by_key(&text)).await? {
            return Ok(record.into());
        }

        if let Some(n) = raw.as_number() {
            let numeric = RecordKey::Numeric(n);
            if let Some(record) = self.lookup(raw, self.directory.find_by_key(&numeric)).await? {
                return Ok(record.into());
            }
        }

        match self.lookup(raw, self.directory.find_any(raw)).await? {
            Some(record) => Ok(record.into()),
            None => {
                debug!(raw = %raw, "No user record for raw id");
                Err(RelayError::IdentityNotFound(raw.to_text()))
            }
        }
    }

    async fn lookup<F>(&self, raw: &RawUserId, call: F) -> Result<Option<UserRecord>, RelayError>
    where
        F: std::future::Future<Output = Result<Option<UserRecord>, StoreError>>,
    {
        with_deadline(self.timeout, call).await.map_err(|e| {
            warn!(raw = %raw, error = %e, "User directory lookup failed");
            RelayError::IdentityNotFound(raw.to_text())
        })
    }
}
