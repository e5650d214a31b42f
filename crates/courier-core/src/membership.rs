//! Channel membership sync.
//!
//! Mirrors a user's persisted channel list into the local group memberships
//! of one connection.

use crate::error::{with_deadline, RelayError};
use crate::group::GroupId;
use crate::hub::LocalHub;
use crate::identity::UserId;
use crate::store::ChatStore;
use courier_protocol::ConnectionId;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct MembershipSync {
    store: Arc<dyn ChatStore>,
    hub: Arc<LocalHub>,
    timeout: Duration,
}

impl MembershipSync {
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, hub: Arc<LocalHub>, timeout: Duration) -> Self {
        Self {
            store,
            hub,
            timeout,
        }
    }

    /// Make the connection's groups equal to the user's persisted channels.
    ///
    /// Groups no longer in the list are left, new ones are joined. Running
    /// it twice without a membership change is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Unavailable` if the store cannot be read. The
    /// connection's groups are left untouched in that case.
    pub async fn sync(
        &self,
        connection: &ConnectionId,
        user: &UserId,
    ) -> Result<BTreeSet<GroupId>, RelayError> {
        let desired: BTreeSet<GroupId> =
            with_deadline(self.timeout, self.store.memberships_for(user))
                .await
                .map_err(|e| {
                    warn!(connection = %connection, user = %user, error = %e, "Membership lookup failed");
                    RelayError::Unavailable("Could not load channels".into())
                })?
                .into_iter()
                .collect();

        let current = self.hub.groups_of(connection);
        for stale in current.difference(&desired) {
            self.hub.leave(connection, stale);
        }

        for group in &desired {
            if let Err(e) = self.hub.join(connection, group) {
                warn!(connection = %connection, channel = %group, error = %e, "Could not join channel");
            }
        }

        let joined = self.hub.groups_of(connection);
        debug!(connection = %connection, user = %user, channels = joined.len(), "Membership synced");
        Ok(joined)
    }

    /// Drop every group membership of the connection.
    pub fn clear(&self, connection: &ConnectionId) -> Vec<GroupId> {
        self.hub.leave_all(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use courier_protocol::RawUserId;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<MemoryStore>, Arc<LocalHub>, MembershipSync, ConnectionId) {
        let store = Arc::new(MemoryStore::new());
        store.add_channel("chnl_general", vec![RawUserId::from("1"), RawUserId::from(2)]);
        store.add_channel("chnl_tech", vec![RawUserId::from(1)]);

        let hub = Arc::new(LocalHub::new());
        let sync = MembershipSync::new(store.clone(), hub.clone(), Duration::from_secs(1));

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = ConnectionId::from("c1");
        hub.attach(conn.clone(), UserId::from("1"), tx);
        (store, hub, sync, conn)
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let (_store, _hub, sync, conn) = setup();
        let user = UserId::from("1");

        let first = sync.sync(&conn, &user).await.unwrap();
        let second = sync.sync(&conn, &user).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first.into_iter().collect::<Vec<_>>(),
            vec!["chnl_general".to_string(), "chnl_tech".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sync_leaves_removed_channels() {
        let (store, hub, sync, conn) = setup();
        let user = UserId::from("1");
        sync.sync(&conn, &user).await.unwrap();

        store.add_channel("chnl_tech", vec![RawUserId::from(5)]);
        store.add_channel("chnl_new", vec![RawUserId::from(1)]);
        let groups = sync.sync(&conn, &user).await.unwrap();

        assert!(!groups.contains("chnl_tech"));
        assert!(groups.contains("chnl_new"));
        assert_eq!(hub.member_count("chnl_tech"), 0);
    }

    #[tokio::test]
    async fn test_clear_unsubscribes_all() {
        let (_store, hub, sync, conn) = setup();
        sync.sync(&conn, &UserId::from("1")).await.unwrap();

        assert_eq!(sync.clear(&conn).len(), 2);
        assert!(hub.groups_of(&conn).is_empty());
    }

    #[tokio::test]
    async fn test_sync_joins_non_ascii_channel() {
        let (store, hub, sync, conn) = setup();
        store.add_channel("café", vec![RawUserId::from(1)]);

        let groups = sync.sync(&conn, &UserId::from("1")).await.unwrap();

        assert!(groups.contains("café"));
        assert_eq!(hub.member_count("café"), 1);
    }
}
