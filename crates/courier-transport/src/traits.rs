//! Transport abstraction for Courier.
//!
//! A connection is split into two halves so the session driver can wait on
//! inbound events and outbound deliveries at the same time.

use async_trait::async_trait;
use courier_protocol::{ClientEvent, ConnectionId, ServerEvent};
use std::fmt;
use thiserror::Error;

/// Which transport carries a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    Polling,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Polling session does not exist or was reaped.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Inbound message exceeds the configured limit.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame could not be decoded into an event.
    #[error("Protocol error: {0}")]
    Protocol(#[from] courier_protocol::ProtocolError),
}

impl TransportError {
    /// Whether the connection is unusable after this error.
    ///
    /// Malformed or oversized events are reported to the client and the
    /// connection stays open.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::Protocol(_) | TransportError::MessageTooLarge { .. }
        )
    }
}

/// Something received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A decoded client event.
    Event(ClientEvent),
    /// Keepalive traffic with no event attached.
    Heartbeat,
}

/// Outbound half of a connection.
#[async_trait]
pub trait EventSink: Send {
    /// Deliver one event to the client.
    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError>;

    /// Close the connection, optionally telling the client why.
    async fn close(&mut self, reason: Option<String>) -> Result<(), TransportError>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait EventStream: Send {
    /// Receive the next inbound item.
    ///
    /// Returns `None` once the client has gone away.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// An accepted client connection.
pub struct Connection {
    pub id: ConnectionId,
    pub kind: TransportKind,
    pub remote_addr: Option<String>,
    pub sink: Box<dyn EventSink>,
    pub stream: Box<dyn EventStream>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}
