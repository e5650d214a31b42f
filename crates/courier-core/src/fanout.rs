//! Fan-out broadcaster.
//!
//! Callers address groups, connections or users; whether a target connection
//! lives on this worker or another one is decided here and nowhere else.

use crate::bus::{Envelope, EventBus};
use crate::error::RelayError;
use crate::hub::{LocalHub, Outbound};
use crate::identity::UserId;
use crate::presence::PresenceDirectory;
use courier_protocol::{ConnectionId, ServerEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Result of addressing a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed off to this many live connections.
    Delivered(usize),
    /// The user has no live connection; nothing was sent.
    Unreachable,
}

impl Delivery {
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Delivery::Unreachable)
    }
}

/// Emits events to groups, connections and users across all workers.
pub struct Broadcaster {
    node_id: String,
    hub: Arc<LocalHub>,
    presence: Arc<dyn PresenceDirectory>,
    bus: Arc<dyn EventBus>,
}

impl Broadcaster {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        hub: Arc<LocalHub>,
        presence: Arc<dyn PresenceDirectory>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            hub,
            presence,
            bus,
        }
    }

    /// Emit to every subscribed connection on every worker, skipping
    /// `except`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Bus` if the envelope cannot be published.
    pub async fn emit_to_group(
        &self,
        group: &str,
        event: ServerEvent,
        except: Option<&ConnectionId>,
    ) -> Result<(), RelayError> {
        trace!(node = %self.node_id, group = %group, event = event.name(), "Emit to group");
        self.bus
            .publish(Envelope::Group {
                group: group.to_string(),
                except: except.cloned(),
                event,
            })
            .await
    }

    /// Emit to one connection, locally if it lives here, else over the bus.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Bus` if a remote delivery cannot be published.
    pub async fn emit_to_connection(
        &self,
        connection: &ConnectionId,
        event: ServerEvent,
    ) -> Result<(), RelayError> {
        if self.hub.is_local(connection) {
            self.hub.send(connection, Outbound::Event(Arc::new(event)));
            return Ok(());
        }

        self.bus
            .publish(Envelope::Connection {
                connection: connection.clone(),
                event,
            })
            .await
    }

    /// Emit to every live connection of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if presence cannot be read or the bus rejects a
    /// publish.
    pub async fn emit_to_user(&self, user: &UserId, event: ServerEvent) -> Result<Delivery, RelayError> {
        self.emit_all_to_user(user, vec![event]).await
    }

    /// Emit several events, in order, to every live connection of a user.
    ///
    /// # Errors
    ///
    /// Same as [`Broadcaster::emit_to_user`].
    pub async fn emit_all_to_user(
        &self,
        user: &UserId,
        events: Vec<ServerEvent>,
    ) -> Result<Delivery, RelayError> {
        let connections = self.presence.connections_for(user).await?;
        if connections.is_empty() {
            debug!(user = %user, "No live connection for user");
            return Ok(Delivery::Unreachable);
        }

        for connection in &connections {
            for event in &events {
                self.emit_to_connection(connection, event.clone()).await?;
            }
        }
        Ok(Delivery::Delivered(connections.len()))
    }

    /// Ask every worker to re-run membership sync for a user's connections.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Bus` if the request cannot be published.
    pub async fn request_resync(&self, user: &UserId) -> Result<(), RelayError> {
        debug!(user = %user, "Requesting membership resync");
        self.bus.publish(Envelope::Resync { user: user.clone() }).await
    }

    /// Deliver a received envelope to the local connections it targets.
    ///
    /// Returns the number of local connections reached.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        match envelope {
            Envelope::Group {
                group,
                except,
                event,
            } => self
                .hub
                .send_to_group(group, Arc::new(event.clone()), except.as_ref()),
            Envelope::Connection { connection, event } => {
                usize::from(self.hub.send(connection, Outbound::Event(Arc::new(event.clone()))))
            }
            Envelope::Resync { user } => self
                .hub
                .user_connections(user)
                .iter()
                .filter(|c| self.hub.send(c, Outbound::Resync))
                .count(),
        }
    }

    /// Subscribe to the bus and dispatch envelopes until it closes.
    ///
    /// The subscription is taken before this returns, so nothing published
    /// afterwards is missed.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            debug!(node = %this.node_id, bus = this.bus.name(), "Dispatcher started");
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        this.dispatch(&envelope);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(node = %this.node_id, skipped, "Dispatcher lagged, envelopes dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(node = %this.node_id, "Dispatcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::hub::OutboundReceiver;
    use crate::presence::MemoryPresence;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Worker {
        hub: Arc<LocalHub>,
        broadcaster: Arc<Broadcaster>,
    }

    fn worker(name: &str, presence: &Arc<MemoryPresence>, bus: &Arc<LocalBus>) -> Worker {
        let hub = Arc::new(LocalHub::new());
        let broadcaster = Arc::new(Broadcaster::new(
            name,
            hub.clone(),
            presence.clone(),
            bus.clone(),
        ));
        broadcaster.spawn_dispatcher();
        Worker { hub, broadcaster }
    }

    async fn connect(w: &Worker, presence: &MemoryPresence, id: &str, user: &str) -> OutboundReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from(id);
        let user = UserId::from(user);
        presence.register(&id, &user).await.unwrap();
        w.hub.attach(id, user, tx);
        rx
    }

    async fn next_event(rx: &mut OutboundReceiver) -> Arc<ServerEvent> {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Outbound::Event(event))) => event,
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emit_to_user_reaches_every_worker() {
        let presence = Arc::new(MemoryPresence::new());
        let bus = Arc::new(LocalBus::new());
        let a = worker("a", &presence, &bus);
        let b = worker("b", &presence, &bus);

        let mut phone = connect(&a, &presence, "phone", "2").await;
        let mut laptop = connect(&b, &presence, "laptop", "2").await;

        let delivery = a
            .broadcaster
            .emit_to_user(&UserId::from("2"), ServerEvent::info("ping"))
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Delivered(2));
        assert_eq!(*next_event(&mut phone).await, ServerEvent::info("ping"));
        assert_eq!(*next_event(&mut laptop).await, ServerEvent::info("ping"));
    }

    #[tokio::test]
    async fn test_emit_to_offline_user_is_unreachable() {
        let presence = Arc::new(MemoryPresence::new());
        let bus = Arc::new(LocalBus::new());
        let a = worker("a", &presence, &bus);

        let delivery = a
            .broadcaster
            .emit_to_user(&UserId::from("9"), ServerEvent::info("x"))
            .await
            .unwrap();
        assert!(delivery.is_unreachable());
    }

    #[tokio::test]
    async fn test_group_emit_crosses_workers_and_skips_sender() {
        let presence = Arc::new(MemoryPresence::new());
        let bus = Arc::new(LocalBus::new());
        let a = worker("a", &presence, &bus);
        let b = worker("b", &presence, &bus);

        let mut sender = connect(&a, &presence, "s", "1").await;
        let mut peer = connect(&b, &presence, "p", "2").await;
        a.hub.join(&ConnectionId::from("s"), "chnl_general").unwrap();
        b.hub.join(&ConnectionId::from("p"), "chnl_general").unwrap();

        a.broadcaster
            .emit_to_group(
                "chnl_general",
                ServerEvent::info("hi"),
                Some(&ConnectionId::from("s")),
            )
            .await
            .unwrap();

        assert_eq!(*next_event(&mut peer).await, ServerEvent::info("hi"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sender.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resync_reaches_remote_connections() {
        let presence = Arc::new(MemoryPresence::new());
        let bus = Arc::new(LocalBus::new());
        let a = worker("a", &presence, &bus);
        let b = worker("b", &presence, &bus);

        let mut rx = connect(&b, &presence, "c", "3").await;
        a.broadcaster.request_resync(&UserId::from("3")).await.unwrap();

        let item = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(item, Some(Outbound::Resync)));
    }
}
