//! # courier-transport
//!
//! Transport adapters for Courier.
//!
//! - **WebSocket** - Text (JSON) or binary (MessagePack) frames over axum
//! - **Polling** - Long-polling fallback for clients that cannot hold a socket
//!
//! Every transport hands the server a [`Connection`]: an [`EventSink`] for
//! server events and an [`EventStream`] of client events, so the session
//! driver does not care how the bytes travel.
//!
//! ```rust,ignore
//! use courier_transport::{Connection, Inbound};
//!
//! async fn drive(mut conn: Connection) {
//!     while let Ok(Some(Inbound::Event(event))) = conn.stream.recv().await {
//!         // Route event
//!     }
//! }
//! ```

pub mod traits;

#[cfg(feature = "polling")]
pub mod polling;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, EventSink, EventStream, Inbound, TransportError, TransportKind};

#[cfg(feature = "polling")]
pub use polling::{PollingConfig, PollingSessions};

#[cfg(feature = "websocket")]
pub use websocket::{websocket_connection, WebSocketConfig};
