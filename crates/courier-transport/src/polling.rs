//! Long-polling fallback transport.
//!
//! Each session owns a queue of server events. `poll` waits for the queue
//! to fill (up to the configured wait) and drains it; `push` feeds one
//! client event into the session's inbound stream. Removing a session drops
//! its inbound sender, which ends the stream and lets the session driver run
//! its disconnect cleanup.

use async_trait::async_trait;
use courier_protocol::{ClientEvent, ConnectionId, ServerEvent};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::traits::{Connection, EventSink, EventStream, Inbound, TransportError, TransportKind};

#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// How long a poll waits for events before returning empty.
    pub poll_wait: Duration,
    /// Maximum events returned by one poll.
    pub max_batch: usize,
    /// Queued outbound events per session; older events are dropped past this.
    pub max_queued: usize,
    /// Inbound events buffered per session.
    pub inbound_capacity: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_secs(25),
            max_batch: 100,
            max_queued: 1_000,
            inbound_capacity: 64,
        }
    }
}

struct Slot {
    queue: Mutex<VecDeque<ServerEvent>>,
    notify: Notify,
    closed: AtomicBool,
    max_queued: usize,
}

struct Session {
    slot: Arc<Slot>,
    inbound: mpsc::Sender<Inbound>,
    last_seen: Instant,
}

/// Registry of live polling sessions.
pub struct PollingSessions {
    sessions: DashMap<ConnectionId, Session>,
    config: PollingConfig,
}

impl PollingSessions {
    #[must_use]
    pub fn new(config: PollingConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Open a session and return its connection.
    pub fn open(&self, id: ConnectionId, remote_addr: Option<String>) -> Connection {
        let slot = Arc::new(Slot {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            max_queued: self.config.max_queued,
        });
        let (inbound, rx) = mpsc::channel(self.config.inbound_capacity);

        self.sessions.insert(
            id.clone(),
            Session {
                slot: slot.clone(),
                inbound,
                last_seen: Instant::now(),
            },
        );
        debug!(connection = %id, "Polling session opened");

        Connection {
            id,
            kind: TransportKind::Polling,
            remote_addr,
            sink: Box::new(PollingSink { slot }),
            stream: Box::new(PollingStream { rx }),
        }
    }

    /// Submit one client event to a session.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSession` if the session does not exist, or
    /// `ConnectionClosed` if its driver has stopped reading.
    pub async fn push(&self, id: &ConnectionId, event: ClientEvent) -> Result<(), TransportError> {
        let inbound = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| TransportError::UnknownSession(id.to_string()))?;
            session.last_seen = Instant::now();
            session.inbound.clone()
        };
        inbound
            .send(Inbound::Event(event))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for queued events and drain them.
    ///
    /// Returns an empty batch if nothing arrived within the poll wait.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSession` for unknown sessions and `ConnectionClosed`
    /// once the server has closed the session and its queue is drained.
    pub async fn poll(&self, id: &ConnectionId) -> Result<Vec<ServerEvent>, TransportError> {
        let slot = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| TransportError::UnknownSession(id.to_string()))?;
            session.last_seen = Instant::now();
            let _ = session.inbound.try_send(Inbound::Heartbeat);
            session.slot.clone()
        };

        let deadline = Instant::now() + self.config.poll_wait;
        loop {
            let notified = slot.notify.notified();
            {
                let mut queue = slot.queue.lock().await;
                if !queue.is_empty() {
                    let n = queue.len().min(self.config.max_batch);
                    return Ok(queue.drain(..n).collect());
                }
            }
            if slot.closed.load(Ordering::Acquire) {
                self.sessions.remove(id);
                return Err(TransportError::ConnectionClosed);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Remove a session. Its stream ends and the driver cleans up.
    pub fn close(&self, id: &ConnectionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            debug!(connection = %id, "Polling session closed by client");
        }
        removed
    }

    /// Remove sessions that have not been polled within `timeout`.
    pub fn reap_idle(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let mut reaped = Vec::new();
        self.sessions.retain(|id, session| {
            let alive = now.duration_since(session.last_seen) < timeout;
            if !alive {
                reaped.push(id.clone());
            }
            alive
        });
        if !reaped.is_empty() {
            info!(count = reaped.len(), "Reaped idle polling sessions");
        }
        reaped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

struct PollingSink {
    slot: Arc<Slot>,
}

#[async_trait]
impl EventSink for PollingSink {
    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError> {
        if self.slot.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        {
            let mut queue = self.slot.queue.lock().await;
            if queue.len() >= self.slot.max_queued {
                queue.pop_front();
            }
            queue.push_back(event.clone());
        }
        self.slot.notify.notify_one();
        Ok(())
    }

    /// Pending events stay pollable. The reason is dropped.
    async fn close(&mut self, _reason: Option<String>) -> Result<(), TransportError> {
        self.slot.closed.store(true, Ordering::Release);
        self.slot.notify.notify_one();
        Ok(())
    }
}

struct PollingStream {
    rx: mpsc::Receiver<Inbound>,
}

#[async_trait]
impl EventStream for PollingStream {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::PingPayload;

    fn sessions() -> PollingSessions {
        PollingSessions::new(PollingConfig {
            poll_wait: Duration::from_millis(200),
            max_batch: 2,
            max_queued: 3,
            inbound_capacity: 8,
        })
    }

    #[tokio::test]
    async fn test_poll_returns_queued_events_in_batches() {
        let sessions = sessions();
        let id = ConnectionId::from("p1");
        let mut conn = sessions.open(id.clone(), None);

        for i in 0..3 {
            conn.sink.send(&ServerEvent::info(format!("e{i}"))).await.unwrap();
        }

        let first = sessions.poll(&id).await.unwrap();
        assert_eq!(first, vec![ServerEvent::info("e0"), ServerEvent::info("e1")]);
        let second = sessions.poll(&id).await.unwrap();
        assert_eq!(second, vec![ServerEvent::info("e2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_empty() {
        let sessions = sessions();
        let id = ConnectionId::from("p1");
        let _conn = sessions.open(id.clone(), None);

        assert!(sessions.poll(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_send() {
        let sessions = Arc::new(sessions());
        let id = ConnectionId::from("p1");
        let mut conn = sessions.open(id.clone(), None);

        let waiter = {
            let sessions = sessions.clone();
            let id = id.clone();
            tokio::spawn(async move { sessions.poll(&id).await })
        };
        tokio::task::yield_now().await;
        conn.sink.send(&ServerEvent::info("late")).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, vec![ServerEvent::info("late")]);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let sessions = sessions();
        let id = ConnectionId::from("p1");
        let mut conn = sessions.open(id.clone(), None);

        for i in 0..5 {
            conn.sink.send(&ServerEvent::info(format!("e{i}"))).await.unwrap();
        }
        let mut all = sessions.poll(&id).await.unwrap();
        all.extend(sessions.poll(&id).await.unwrap());
        assert_eq!(
            all,
            vec![ServerEvent::info("e2"), ServerEvent::info("e3"), ServerEvent::info("e4")]
        );
    }

    #[tokio::test]
    async fn test_push_reaches_stream() {
        let sessions = sessions();
        let id = ConnectionId::from("p1");
        let mut conn = sessions.open(id.clone(), None);

        let event = ClientEvent::Ping(PingPayload { timestamp: Some(1) });
        sessions.push(&id, event.clone()).await.unwrap();
        assert_eq!(conn.stream.recv().await.unwrap(), Some(Inbound::Event(event)));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let sessions = sessions();
        let id = ConnectionId::from("missing");
        assert!(matches!(
            sessions.poll(&id).await,
            Err(TransportError::UnknownSession(_))
        ));
        assert!(sessions
            .push(&id, ClientEvent::Ping(PingPayload::default()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let sessions = sessions();
        let id = ConnectionId::from("p1");
        let mut conn = sessions.open(id.clone(), None);

        assert!(sessions.close(&id));
        assert_eq!(conn.stream.recv().await.unwrap(), None);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_server_close_drains_then_ends() {
        let sessions = sessions();
        let id = ConnectionId::from("p1");
        let mut conn = sessions.open(id.clone(), None);

        conn.sink.send(&ServerEvent::error("User not found")).await.unwrap();
        conn.sink.close(Some("User not found".into())).await.unwrap();
        assert!(conn.sink.send(&ServerEvent::info("late")).await.is_err());
        assert_eq!(
            sessions.poll(&id).await.unwrap(),
            vec![ServerEvent::error("User not found")]
        );
        assert!(matches!(
            sessions.poll(&id).await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle_sessions() {
        let sessions = sessions();
        let stale = ConnectionId::from("stale");
        let fresh = ConnectionId::from("fresh");
        let mut stale_conn = sessions.open(stale.clone(), None);
        let _fresh_conn = sessions.open(fresh.clone(), None);

        tokio::time::advance(Duration::from_secs(30)).await;
        sessions
            .push(&fresh, ClientEvent::Ping(PingPayload::default()))
            .await
            .unwrap();

        let reaped = sessions.reap_idle(Duration::from_secs(20));
        assert_eq!(reaped, vec![stale]);
        assert_eq!(sessions.len(), 1);
        assert_eq!(stale_conn.stream.recv().await.unwrap(), None);
    }
}
