//! # courier-protocol
//!
//! Wire protocol definitions for the Courier chat delivery layer.
//!
//! This crate defines the events exchanged between chat clients and Courier
//! workers, the identifiers they carry, and the codecs used on the wire.
//!
//! ## Events
//!
//! - `message` / `grpMessage` - Direct and channel messages
//! - `fileSendNotify` / `grpFileSendNotify` - File-share notices
//! - `authenticate` - Identity re-assertion on a joined connection
//! - `messageSent` / `filesUploaded` / `info` / `error` - Replies to the sender
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, ClientEvent, PingPayload};
//!
//! let event = ClientEvent::Ping(PingPayload { timestamp: Some(1) });
//! let text = codec::encode_text(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_text(&text).unwrap();
//! assert_eq!(decoded, event);
//! ```

pub mod codec;
pub mod events;
pub mod ids;
pub mod version;

pub use codec::{Encoding, ProtocolError};
pub use events::{
    AuthenticatePayload, ChannelFileNoticePayload, ChannelMessagePayload, ChannelsSyncedPayload,
    ClientEvent, ConnectedPayload, DeliveredFiles, DeliveredMessage, DirectFileNoticePayload,
    DirectMessagePayload, FileRef, FilesUploadedPayload, MessageSentPayload, NotificationPayload,
    PingPayload, ServerEvent, UploadedFiles,
};
pub use ids::{ConnectionId, RawUserId};
pub use version::{Version, PROTOCOL_VERSION};
