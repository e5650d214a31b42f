//! Cross-worker event bus.
//!
//! Every worker publishes envelopes to the bus and every worker subscribes to
//! all of them, including its own. The dispatcher in [`crate::fanout`] turns
//! received envelopes into local deliveries.

use crate::error::RelayError;
use crate::group::GroupId;
use crate::identity::UserId;
use async_trait::async_trait;
use courier_protocol::{ConnectionId, ServerEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Default capacity of in-process bus queues.
pub const DEFAULT_BUS_CAPACITY: usize = 4096;

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Envelope {
    /// Deliver to every member of a group, skipping `except`.
    Group {
        group: GroupId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        except: Option<ConnectionId>,
        event: ServerEvent,
    },
    /// Deliver to one connection, wherever it lives.
    Connection {
        connection: ConnectionId,
        event: ServerEvent,
    },
    /// Re-run membership sync for every connection of a user.
    Resync { user: UserId },
}

impl Envelope {
    /// Topic suffix, appended to the bus prefix by networked backends.
    #[must_use]
    pub fn topic(&self) -> String {
        match self {
            Envelope::Group { group, .. } => format!("group:{group}"),
            Envelope::Connection { connection, .. } => format!("conn:{connection}"),
            Envelope::Resync { user } => format!("resync:{user}"),
        }
    }
}

/// Publish/subscribe transport between workers.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// # Errors
    ///
    /// Returns `RelayError::Bus` when the envelope cannot be handed off.
    async fn publish(&self, envelope: Envelope) -> Result<(), RelayError>;

    /// Receive every envelope published by any worker from now on.
    fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Bus connecting workers inside one process.
#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Arc<Envelope>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), RelayError> {
        trace!(topic = %envelope.topic(), "Publishing envelope");
        // No subscribers just means no worker is listening yet.
        let _ = self.sender.send(Arc::new(envelope));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
