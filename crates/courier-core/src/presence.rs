//! Presence directory: which connections belong to which user.
//!
//! Every worker reads and writes the same directory. Entries carry a lease:
//! a worker refreshes the leases of its live connections periodically, and
//! lookups ignore entries whose lease has lapsed. A worker that dies without
//! running its cleanup stops attracting deliveries once its leases expire.

use crate::error::RelayError;
use crate::identity::UserId;
use crate::message::now_millis;
use async_trait::async_trait;
use courier_protocol::ConnectionId;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Shared connection ↔ user mapping.
///
/// `register` overwrites, `unregister` of an absent key is a no-op.
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    async fn register(&self, connection: &ConnectionId, user: &UserId) -> Result<(), RelayError>;

    /// Extend the leases of live connections, re-creating lapsed entries.
    async fn refresh(&self, entries: &[(ConnectionId, UserId)]) -> Result<(), RelayError>;

    async fn unregister(&self, connection: &ConnectionId) -> Result<(), RelayError>;

    async fn connections_for(&self, user: &UserId) -> Result<HashSet<ConnectionId>, RelayError>;

    async fn user_for(&self, connection: &ConnectionId) -> Result<Option<UserId>, RelayError>;

    /// Drop entries whose lease lapsed. Returns how many were removed.
    ///
    /// Backends that expire entries on their own keep the default.
    async fn prune_expired(&self) -> Result<usize, RelayError> {
        Ok(0)
    }

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// A single presence entry.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    /// Registration time in milliseconds since the epoch.
    pub joined_at: u64,
    last_seen: Instant,
}

impl PresenceEntry {
    #[must_use]
    pub fn new(connection_id: ConnectionId, user_id: UserId) -> Self {
        Self {
            connection_id,
            user_id,
            joined_at: now_millis(),
            last_seen: Instant::now(),
        }
    }

    /// Renew the lease.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Whether the lease lapsed.
    #[must_use]
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.last_seen.elapsed() > ttl
    }
}

/// Process-local presence directory.
///
/// Shared between workers only when they run in one process (tests and the
/// `single` mode). Multi-process deployments use the Redis backend.
#[derive(Debug, Default)]
pub struct MemoryPresence {
    by_connection: DashMap<ConnectionId, PresenceEntry>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    /// Lease length; `None` disables expiry.
    ttl: Option<Duration>,
}

impl MemoryPresence {
    /// Directory without leases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory whose entries lapse after `ttl` without a refresh.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_connection.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_connection.is_empty()
    }

    fn expired(&self, entry: &PresenceEntry) -> bool {
        self.ttl.is_some_and(|ttl| entry.is_stale(ttl))
    }

    fn insert(&self, connection: &ConnectionId, user: &UserId) {
        let previous = self
            .by_connection
            .insert(connection.clone(), PresenceEntry::new(connection.clone(), user.clone()));

        if let Some(previous) = previous {
            if previous.user_id != *user {
                self.detach_from_user(&previous.user_id, connection);
            }
        }

        self.by_user
            .entry(user.clone())
            .or_default()
            .insert(connection.clone());
    }

    fn remove(&self, connection: &ConnectionId) -> Option<PresenceEntry> {
        let (_, entry) = self.by_connection.remove(connection)?;
        self.detach_from_user(&entry.user_id, connection);
        Some(entry)
    }

    fn detach_from_user(&self, user: &UserId, connection: &ConnectionId) {
        let now_empty = match self.by_user.get_mut(user) {
            Some(mut set) => {
                set.remove(connection);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_user.remove_if(user, |_, set| set.is_empty());
        }
    }
}

#[async_trait]
impl PresenceDirectory for MemoryPresence {
    async fn register(&self, connection: &ConnectionId, user: &UserId) -> Result<(), RelayError> {
        self.insert(connection, user);
        debug!(connection = %connection, user = %user, "Presence: registered");
        Ok(())
    }

    async fn refresh(&self, entries: &[(ConnectionId, UserId)]) -> Result<(), RelayError> {
        for (connection, user) in entries {
            let renewed = match self.by_connection.get_mut(connection) {
                Some(mut entry) if entry.user_id == *user => {
                    entry.touch();
                    true
                }
                _ => false,
            };
            if !renewed {
                self.insert(connection, user);
            }
        }
        Ok(())
    }

    async fn unregister(&self, connection: &ConnectionId) -> Result<(), RelayError> {
        if self.remove(connection).is_some() {
            debug!(connection = %connection, "Presence: unregistered");
        }
        Ok(())
    }

    async fn connections_for(&self, user: &UserId) -> Result<HashSet<ConnectionId>, RelayError> {
        let candidates: Vec<ConnectionId> = match self.by_user.get(user) {
            Some(set) => set.iter().cloned().collect(),
            None => return Ok(HashSet::new()),
        };

        let mut live = HashSet::with_capacity(candidates.len());
        let mut lapsed = Vec::new();
        for connection in candidates {
            match self.by_connection.get(&connection) {
                Some(entry) if !self.expired(&entry) => {
                    live.insert(connection);
                }
                _ => lapsed.push(connection),
            }
        }

        for connection in &lapsed {
            self.remove(connection);
        }
        Ok(live)
    }

    async fn user_for(&self, connection: &ConnectionId) -> Result<Option<UserId>, RelayError> {
        Ok(self
            .by_connection
            .get(connection)
            .filter(|entry| !self.expired(entry))
            .map(|entry| entry.user_id.clone()))
    }

    async fn prune_expired(&self) -> Result<usize, RelayError> {
        let Some(ttl) = self.ttl else {
            return Ok(0);
        };

        let stale: Vec<ConnectionId> = self
            .by_connection
            .iter()
            .filter(|e| e.is_stale(ttl))
            .map(|e| e.key().clone())
            .collect();

        for id in &stale {
            self.remove(id);
            debug!(connection = %id, "Presence: pruned expired entry");
        }
        Ok(stale.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let presence = MemoryPresence::new();
        let alice = UserId::from("1");

        presence.register(&conn("c1"), &alice).await.unwrap();
        presence.register(&conn("c2"), &alice).await.unwrap();

        let conns = presence.connections_for(&alice).await.unwrap();
        assert_eq!(conns.len(), 2);
        assert_eq!(presence.user_for(&conn("c1")).await.unwrap(), Some(alice.clone()));

        presence.unregister(&conn("c1")).await.unwrap();
        presence.unregister(&conn("c1")).await.unwrap();

        let conns = presence.connections_for(&alice).await.unwrap();
        assert_eq!(conns, HashSet::from([conn("c2")]));
        assert_eq!(presence.user_for(&conn("c1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_register_overwrites() {
        let presence = MemoryPresence::new();
        let alice = UserId::from("1");
        let bob = UserId::from("2");

        presence.register(&conn("c1"), &alice).await.unwrap();
        presence.register(&conn("c1"), &alice).await.unwrap();
        assert_eq!(presence.len(), 1);

        presence.register(&conn("c1"), &bob).await.unwrap();
        assert!(presence.connections_for(&alice).await.unwrap().is_empty());
        assert_eq!(presence.user_for(&conn("c1")).await.unwrap(), Some(bob));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leases_lapse_without_refresh() {
        let presence = MemoryPresence::with_ttl(Duration::from_secs(90));
        let alice = UserId::from("1");

        presence.register(&conn("live"), &alice).await.unwrap();
        presence.register(&conn("orphan"), &alice).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        presence
            .refresh(&[(conn("live"), alice.clone())])
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;

        let conns = presence.connections_for(&alice).await.unwrap();
        assert_eq!(conns, HashSet::from([conn("live")]));
        assert_eq!(presence.user_for(&conn("orphan")).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_recreates_lapsed_entry() {
        let presence = MemoryPresence::with_ttl(Duration::from_secs(10));
        let alice = UserId::from("1");

        presence.register(&conn("c1"), &alice).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(presence.prune_expired().await.unwrap(), 1);
        assert!(presence.is_empty());

        presence.refresh(&[(conn("c1"), alice.clone())]).await.unwrap();
        assert_eq!(presence.user_for(&conn("c1")).await.unwrap(), Some(alice));
    }
}
