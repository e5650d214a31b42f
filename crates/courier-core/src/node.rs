//! One worker's view of the delivery layer, assembled from its collaborators.

use crate::bus::EventBus;
use crate::error::RelayError;
use crate::fanout::Broadcaster;
use crate::handshake::{Handshake, HandshakeConfig};
use crate::hub::{HubConfig, LocalHub};
use crate::identity::{IdentityResolver, UserDirectory};
use crate::membership::MembershipSync;
use crate::presence::PresenceDirectory;
use crate::router::EventRouter;
use crate::store::{AuthVerifier, ChatStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name used in logs, e.g. `worker-0`.
    pub node_id: String,
    /// Deadline for every collaborator call.
    pub store_timeout: Duration,
    pub hub: HubConfig,
    pub handshake: HandshakeConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "worker-0".to_string(),
            store_timeout: Duration::from_secs(5),
            hub: HubConfig::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}

/// External collaborators of a node.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn UserDirectory>,
    pub store: Arc<dyn ChatStore>,
    pub auth: Arc<dyn AuthVerifier>,
    pub presence: Arc<dyn PresenceDirectory>,
    pub bus: Arc<dyn EventBus>,
}

/// A worker node.
pub struct Node {
    config: NodeConfig,
    hub: Arc<LocalHub>,
    presence: Arc<dyn PresenceDirectory>,
    resolver: IdentityResolver,
    broadcaster: Arc<Broadcaster>,
    handshake: Handshake,
    router: EventRouter,
}

impl Node {
    #[must_use]
    pub fn new(config: NodeConfig, collaborators: Collaborators) -> Arc<Self> {
        let Collaborators {
            directory,
            store,
            auth,
            presence,
            bus,
        } = collaborators;

        info!(
            node = %config.node_id,
            presence = presence.name(),
            bus = bus.name(),
            "Assembling node"
        );

        let hub = Arc::new(LocalHub::with_config(config.hub.clone()));
        let resolver = IdentityResolver::new(directory, config.store_timeout);
        let broadcaster = Arc::new(Broadcaster::new(
            config.node_id.clone(),
            hub.clone(),
            presence.clone(),
            bus,
        ));
        let membership = MembershipSync::new(store.clone(), hub.clone(), config.store_timeout);
        let handshake = Handshake::new(
            resolver.clone(),
            auth,
            presence.clone(),
            hub.clone(),
            membership,
            config.handshake.clone(),
        );
        let router = EventRouter::new(
            resolver.clone(),
            store,
            broadcaster.clone(),
            config.store_timeout,
        );

        Arc::new(Self {
            config,
            hub,
            presence,
            resolver,
            broadcaster,
            handshake,
            router,
        })
    }

    /// Start consuming the bus.
    pub fn start(&self) -> JoinHandle<()> {
        self.broadcaster.spawn_dispatcher()
    }

    /// Renew the presence leases of every local connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence directory rejects the refresh.
    pub async fn refresh_presence(&self) -> Result<usize, RelayError> {
        let entries = self.hub.snapshot();
        if entries.is_empty() {
            return Ok(0);
        }
        self.presence.refresh(&entries).await?;
        debug!(node = %self.config.node_id, leases = entries.len(), "Presence leases refreshed");
        Ok(entries.len())
    }

    /// Drop presence entries whose leases lapsed, for backends that do not
    /// expire them on their own.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence directory cannot be reached.
    pub async fn prune_presence(&self) -> Result<usize, RelayError> {
        let pruned = self.presence.prune_expired().await?;
        if pruned > 0 {
            debug!(node = %self.config.node_id, pruned, "Expired presence entries pruned");
        }
        Ok(pruned)
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<dyn PresenceDirectory> {
        &self.presence
    }

    #[must_use]
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    #[must_use]
    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    #[must_use]
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    #[must_use]
    pub fn router(&self) -> &EventRouter {
        &self.router
    }
}
