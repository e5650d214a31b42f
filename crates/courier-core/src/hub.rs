//! Local hub: the live connections held by this worker and their group
//! memberships.
//!
//! The hub only knows about sockets in this process. Cross-worker delivery
//! is the broadcaster's job; the hub is where it ends up on each worker.

use crate::group::{Group, GroupId};
use crate::identity::UserId;
use courier_protocol::{ConnectionId, ServerEvent};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Work items for a connection's session task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Write an event to the client.
    Event(Arc<ServerEvent>),
    /// Re-run membership sync.
    Resync,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Hub errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Group name cannot be empty")]
    EmptyGroup,

    #[error("Maximum groups reached")]
    MaxGroupsReached,

    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of distinct groups on this worker.
    pub max_groups: usize,
    /// Maximum groups a single connection may join.
    pub max_subscriptions_per_connection: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_groups: 10_000,
            max_subscriptions_per_connection: 500,
        }
    }
}

struct LocalConnection {
    user: UserId,
    tx: OutboundSender,
}

/// Live connections and groups on this worker.
pub struct LocalHub {
    connections: DashMap<ConnectionId, LocalConnection>,
    groups: DashMap<GroupId, Group>,
    /// Connection id to the groups it joined.
    subscriptions: DashMap<ConnectionId, HashSet<GroupId>>,
    config: HubConfig,
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            connections: DashMap::new(),
            groups: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
        }
    }

    /// Register a live connection.
    pub fn attach(&self, connection: ConnectionId, user: UserId, tx: OutboundSender) {
        debug!(connection = %connection, user = %user, "Attached to hub");
        self.subscriptions.entry(connection.clone()).or_default();
        self.connections
            .insert(connection, LocalConnection { user, tx });
    }

    /// Remove a connection and all its group memberships.
    pub fn detach(&self, connection: &ConnectionId) -> Option<UserId> {
        self.leave_all(connection);
        self.subscriptions.remove(connection);
        let (_, local) = self.connections.remove(connection)?;
        debug!(connection = %connection, user = %local.user, "Detached from hub");
        Some(local.user)
    }

    /// Join a group. Returns `true` if newly joined.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown connections, empty names, or when
    /// limits are exceeded. Any other channel id is accepted as-is.
    pub fn join(&self, connection: &ConnectionId, group: &str) -> Result<bool, HubError> {
        if group.is_empty() {
            return Err(HubError::EmptyGroup);
        }

        if !self.connections.contains_key(connection) {
            return Err(HubError::UnknownConnection(connection.clone()));
        }

        {
            let mut subs = self.subscriptions.entry(connection.clone()).or_default();
            if subs.contains(group) {
                return Ok(false);
            }
            if subs.len() >= self.config.max_subscriptions_per_connection {
                return Err(HubError::MaxSubscriptionsReached);
            }
            if !self.groups.contains_key(group) && self.groups.len() >= self.config.max_groups {
                return Err(HubError::MaxGroupsReached);
            }
            subs.insert(group.to_string());
        }

        self.groups
            .entry(group.to_string())
            .or_insert_with(|| {
                debug!(group = %group, "Creating group");
                Group::new(group)
            })
            .add(connection.clone());

        Ok(true)
    }

    /// Leave a group. Returns `true` if the connection was a member.
    pub fn leave(&self, connection: &ConnectionId, group: &str) -> bool {
        let was_member = self
            .subscriptions
            .get_mut(connection)
            .is_some_and(|mut subs| subs.remove(group));

        if was_member {
            self.remove_from_group(connection, group);
        }
        was_member
    }

    /// Leave every group. Returns the groups left.
    pub fn leave_all(&self, connection: &ConnectionId) -> Vec<GroupId> {
        let left: Vec<GroupId> = match self.subscriptions.get_mut(connection) {
            Some(mut subs) => subs.drain().collect(),
            None => return Vec::new(),
        };

        for group in &left {
            self.remove_from_group(connection, group);
        }
        if !left.is_empty() {
            debug!(connection = %connection, groups = left.len(), "Left all groups");
        }
        left
    }

    fn remove_from_group(&self, connection: &ConnectionId, group: &str) {
        let now_empty = match self.groups.get_mut(group) {
            Some(mut entry) => {
                entry.remove(connection);
                entry.is_empty()
            }
            None => false,
        };
        if now_empty && self.groups.remove_if(group, |_, g| g.is_empty()).is_some() {
            debug!(group = %group, "Deleted empty group");
        }
    }

    /// Groups a connection is subscribed to.
    #[must_use]
    pub fn groups_of(&self, connection: &ConnectionId) -> BTreeSet<GroupId> {
        self.subscriptions
            .get(connection)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_local(&self, connection: &ConnectionId) -> bool {
        self.connections.contains_key(connection)
    }

    /// Hand work to one local connection. Returns `false` if it is not here
    /// or its session has ended.
    pub fn send(&self, connection: &ConnectionId, item: Outbound) -> bool {
        match self.connections.get(connection) {
            Some(local) => local.tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Deliver an event to every local member of a group except `except`.
    ///
    /// Returns the number of connections the event was handed to.
    pub fn send_to_group(
        &self,
        group: &str,
        event: Arc<ServerEvent>,
        except: Option<&ConnectionId>,
    ) -> usize {
        let targets: Vec<OutboundSender> = match self.groups.get(group) {
            Some(entry) => entry
                .members_except(except)
                .filter_map(|c| self.connections.get(c).map(|l| l.tx.clone()))
                .collect(),
            None => return 0,
        };

        let delivered = targets
            .iter()
            .filter(|tx| tx.send(Outbound::Event(event.clone())).is_ok())
            .count();
        trace!(group = %group, recipients = delivered, "Group delivery");
        delivered
    }

    /// Local connections of a user.
    #[must_use]
    pub fn user_connections(&self, user: &UserId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|e| e.user == *user)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Every local connection with its user, for lease refresh.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ConnectionId, UserId)> {
        self.connections
            .iter()
            .map(|e| (e.key().clone(), e.user.clone()))
            .collect()
    }

    #[must_use]
    pub fn member_count(&self, group: &str) -> usize {
        self.groups.get(group).map(|g| g.member_count()).unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connection_count: self.connections.len(),
            group_count: self.groups.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub connection_count: usize,
    pub group_count: usize,
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach(hub: &LocalHub, id: &str, user: &str) -> (ConnectionId, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from(id);
        hub.attach(id.clone(), UserId::from(user), tx);
        (id, rx)
    }

    #[test]
    fn test_join_leave() {
        let hub = LocalHub::new();
        let (c1, _rx) = attach(&hub, "c1", "1");

        assert_eq!(hub.join(&c1, "chnl_general"), Ok(true));
        assert_eq!(hub.join(&c1, "chnl_general"), Ok(false));
        assert_eq!(hub.member_count("chnl_general"), 1);

        assert!(hub.leave(&c1, "chnl_general"));
        assert!(!hub.leave(&c1, "chnl_general"));
        assert_eq!(hub.stats().group_count, 0);
    }

    #[test]
    fn test_join_requires_attached_connection() {
        let hub = LocalHub::new();
        let ghost = ConnectionId::from("ghost");
        assert_eq!(
            hub.join(&ghost, "chnl_general"),
            Err(HubError::UnknownConnection(ghost))
        );
    }

    #[test]
    fn test_empty_group_and_limits() {
        let hub = LocalHub::with_config(HubConfig {
            max_groups: 10,
            max_subscriptions_per_connection: 1,
        });
        let (c1, _rx) = attach(&hub, "c1", "1");

        assert_eq!(hub.join(&c1, ""), Err(HubError::EmptyGroup));
        hub.join(&c1, "a").unwrap();
        assert_eq!(hub.join(&c1, "b"), Err(HubError::MaxSubscriptionsReached));
    }

    #[test]
    fn test_store_channel_ids_are_opaque() {
        let hub = LocalHub::new();
        let (c1, _rx) = attach(&hub, "c1", "1");

        let long = "x".repeat(300);
        for name in ["café", "$announcements", "日本語", long.as_str()] {
            assert_eq!(hub.join(&c1, name), Ok(true));
            assert_eq!(hub.member_count(name), 1);
        }
    }

    #[test]
    fn test_send_to_group_skips_sender() {
        let hub = LocalHub::new();
        let (c1, mut rx1) = attach(&hub, "c1", "1");
        let (c2, mut rx2) = attach(&hub, "c2", "2");
        let (c3, mut rx3) = attach(&hub, "c3", "2");
        for c in [&c1, &c2, &c3] {
            hub.join(c, "chnl_general").unwrap();
        }

        let event = Arc::new(ServerEvent::info("hello"));
        assert_eq!(hub.send_to_group("chnl_general", event, Some(&c1)), 2);

        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(Outbound::Event(_))));
        assert!(matches!(rx3.try_recv(), Ok(Outbound::Event(_))));
    }

    #[test]
    fn test_detach_cleans_everything() {
        let hub = LocalHub::new();
        let (c1, _rx) = attach(&hub, "c1", "1");
        hub.join(&c1, "a").unwrap();
        hub.join(&c1, "b").unwrap();

        assert_eq!(hub.detach(&c1), Some(UserId::from("1")));
        assert!(!hub.is_local(&c1));
        assert!(hub.groups_of(&c1).is_empty());
        assert_eq!(
            hub.stats(),
            HubStats {
                connection_count: 0,
                group_count: 0,
                total_subscriptions: 0
            }
        );
        assert_eq!(hub.detach(&c1), None);
    }

    #[test]
    fn test_user_connections_and_snapshot() {
        let hub = LocalHub::new();
        let (_c1, _rx1) = attach(&hub, "c1", "1");
        let (_c2, _rx2) = attach(&hub, "c2", "2");
        let (_c3, _rx3) = attach(&hub, "c3", "2");

        let mut bobs = hub.user_connections(&UserId::from("2"));
        bobs.sort();
        assert_eq!(bobs, vec![ConnectionId::from("c2"), ConnectionId::from("c3")]);
        assert_eq!(hub.snapshot().len(), 3);
    }

    #[test]
    fn test_send_to_closed_session() {
        let hub = LocalHub::new();
        let (c1, rx) = attach(&hub, "c1", "1");
        drop(rx);

        assert!(!hub.send(&c1, Outbound::Resync));
        assert!(!hub.send(&ConnectionId::from("nope"), Outbound::Resync));
    }
}
