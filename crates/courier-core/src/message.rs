//! Message records handed to the persistence collaborator.

use crate::group::GroupId;
use crate::identity::UserId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Id prefix for channel messages.
pub const CHANNEL_MESSAGE_PREFIX: &str = "msg_";

/// Id prefix for direct messages.
pub const DIRECT_MESSAGE_PREFIX: &str = "pmsg_";

/// Where a message belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum Conversation {
    /// A channel, addressed by channel id.
    Channel(GroupId),
    /// A direct conversation, addressed by the receiver.
    Direct(UserId),
}

impl Conversation {
    /// Prefix of ids generated for messages in this kind of conversation.
    #[must_use]
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Conversation::Channel(_) => CHANNEL_MESSAGE_PREFIX,
            Conversation::Direct(_) => DIRECT_MESSAGE_PREFIX,
        }
    }
}

/// A message about to be persisted. Both parties are canonical identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation: Conversation,
    pub sender: UserId,
    pub content: String,
}

/// What the store returns after persisting a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// Generate a short message id such as `msg_1a2b3c4d`.
#[must_use]
pub fn generate_message_id(prefix: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &uuid[..8])
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
