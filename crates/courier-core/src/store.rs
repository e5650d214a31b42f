//! Collaborator interfaces consumed by the delivery layer.
//!
//! The delivery layer never owns durable state. Token verification and the
//! channel/message/file store live behind these traits.

use crate::error::{RelayError, StoreError};
use crate::group::GroupId;
use crate::identity::{Role, UserId};
use crate::message::{NewMessage, StoredMessage};
use async_trait::async_trait;
use courier_protocol::RawUserId;

/// Claims extracted from a verified session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Raw identifier carried by the token; still needs resolution.
    pub subject: RawUserId,
    pub username: Option<String>,
    pub role: Option<Role>,
}

/// Verifies session tokens.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    /// # Errors
    ///
    /// Returns `RelayError::InvalidToken` for any token that does not verify.
    async fn verify(&self, token: &str) -> Result<Claims, RelayError>;
}

/// Channel, message and file persistence.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a message and return its record.
    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    /// Channels the user currently belongs to.
    async fn memberships_for(&self, user: &UserId) -> Result<Vec<GroupId>, StoreError>;

    async fn channel_exists(&self, channel: &str) -> Result<bool, StoreError>;

    async fn user_exists(&self, user: &UserId) -> Result<bool, StoreError>;

    /// Attach previously uploaded files to a persisted message.
    async fn link_files_to_message(
        &self,
        file_ids: &[String],
        message: &StoredMessage,
    ) -> Result<(), StoreError>;
}

/// Verifier that rejects every token. Used when no secret is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAllTokens;

#[async_trait]
impl AuthVerifier for RejectAllTokens {
    async fn verify(&self, _token: &str) -> Result<Claims, RelayError> {
        Err(RelayError::InvalidToken("Token verification is not configured".into()))
    }
}
