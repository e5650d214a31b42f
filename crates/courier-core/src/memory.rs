//! In-memory user directory and chat store.
//!
//! Stands in for the external persistence collaborator during development and
//! tests. It can be seeded from a TOML file:
//!
//! ```toml
//! [[users]]
//! id = 1
//! username = "rushi"
//! role = "admin"
//!
//! [[channels]]
//! id = "chnl_general_chat"
//! name = "General Chat"
//! members = ["1", 2]
//! ```

use crate::error::StoreError;
use crate::group::GroupId;
use crate::identity::{RecordKey, Role, UserDirectory, UserId, UserRecord};
use crate::message::{generate_message_id, now_millis, NewMessage, StoredMessage};
use crate::store::ChatStore;
use async_trait::async_trait;
use courier_protocol::RawUserId;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Errors loading a seed file.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("Failed to read seed file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse seed file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Seed file contents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub channels: Vec<SeedChannel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub id: RecordKey,
    pub username: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub legacy_id: Option<RecordKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedChannel {
    pub id: GroupId,
    #[serde(default)]
    pub name: Option<String>,
    /// Member ids, in either encoding.
    #[serde(default)]
    pub members: Vec<RawUserId>,
}

#[derive(Debug, Clone)]
struct ChannelRecord {
    members: Vec<RawUserId>,
}

/// A persisted message together with the request that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub stored: StoredMessage,
    pub message: NewMessage,
}

/// In-memory implementation of [`UserDirectory`] and [`ChatStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<RecordKey, UserRecord>,
    channels: DashMap<GroupId, ChannelRecord>,
    messages: DashMap<String, MessageRecord>,
    /// File id to message id.
    file_links: DashMap<String, String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from seed data.
    #[must_use]
    pub fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        for user in seed.users {
            store.add_user(UserRecord {
                key: user.id,
                legacy_id: user.legacy_id,
                username: user.username,
                role: user.role,
            });
        }
        for channel in seed.channels {
            store.add_channel(channel.id, channel.members);
        }
        store
    }

    /// Load a seed file from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let content = std::fs::read_to_string(path)?;
        let seed: Seed = toml::from_str(&content)?;
        info!(
            path = %path.display(),
            users = seed.users.len(),
            channels = seed.channels.len(),
            "Loaded seed data"
        );
        Ok(Self::from_seed(seed))
    }

    pub fn add_user(&self, record: UserRecord) {
        self.users.insert(record.key.clone(), record);
    }

    pub fn remove_user(&self, key: &RecordKey) {
        self.users.remove(key);
    }

    /// Create or replace a channel with the given member list.
    pub fn add_channel(&self, id: impl Into<GroupId>, members: Vec<RawUserId>) {
        let id = id.into();
        debug!(channel = %id, members = members.len(), "Channel stored");
        self.channels.insert(id, ChannelRecord { members });
    }

    pub fn remove_channel(&self, id: &str) {
        self.channels.remove(id);
    }

    /// Persisted messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<MessageRecord> {
        let mut all: Vec<MessageRecord> = self.messages.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| {
            a.stored
                .created_at
                .cmp(&b.stored.created_at)
                .then_with(|| a.stored.id.cmp(&b.stored.id))
        });
        all
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Message a file was linked to, if any.
    #[must_use]
    pub fn linked_message(&self, file_id: &str) -> Option<String> {
        self.file_links.get(file_id).map(|m| m.value().clone())
    }

    fn find_exact(&self, key: &RecordKey) -> Option<UserRecord> {
        self.users.get(key).map(|r| r.value().clone())
    }
}

fn member_matches(member: &RawUserId, user: &UserId) -> bool {
    member.to_text() == user.as_str()
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_by_key(&self, key: &RecordKey) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.find_exact(key))
    }

    async fn find_any(&self, raw: &RawUserId) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|entry| {
                let record = entry.value();
                record.key.matches(raw) || record.legacy_id.as_ref().is_some_and(|l| l.matches(raw))
            })
            .map(|entry| entry.value().clone()))
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let stored = StoredMessage {
            id: generate_message_id(message.conversation.id_prefix()),
            created_at: now_millis(),
        };
        self.messages.insert(
            stored.id.clone(),
            MessageRecord {
                stored: stored.clone(),
                message,
            },
        );
        Ok(stored)
    }

    async fn memberships_for(&self, user: &UserId) -> Result<Vec<GroupId>, StoreError> {
        let mut channels: Vec<GroupId> = self
            .channels
            .iter()
            .filter(|entry| entry.members.iter().any(|m| member_matches(m, user)))
            .map(|entry| entry.key().clone())
            .collect();
        channels.sort();
        Ok(channels)
    }

    async fn channel_exists(&self, channel: &str) -> Result<bool, StoreError> {
        Ok(self.channels.contains_key(channel))
    }

    async fn user_exists(&self, user: &UserId) -> Result<bool, StoreError> {
        if self.users.contains_key(&RecordKey::Text(user.as_str().to_string())) {
            return Ok(true);
        }
        Ok(user
            .as_str()
            .parse::<i64>()
            .is_ok_and(|n| self.users.contains_key(&RecordKey::Numeric(n))))
    }

    async fn link_files_to_message(
        &self,
        file_ids: &[String],
        message: &StoredMessage,
    ) -> Result<(), StoreError> {
        for file_id in file_ids {
            self.file_links.insert(file_id.clone(), message.id.clone());
        }
        Ok(())
    }
}
