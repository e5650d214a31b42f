//! Event types for the Courier protocol.
//!
//! Every event travels as an object of the form
//! `{"event": "<name>", "data": <payload>}`. Payload fields are camelCase.

use crate::ids::{ConnectionId, RawUserId};
use serde::{Deserialize, Serialize};

/// A reference to a file record that already exists in the file store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    /// File record id.
    #[serde(default, alias = "_id", alias = "fileId", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Original file name.
    #[serde(default, alias = "filename", skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Download location.
    #[serde(default, alias = "url", skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Size in bytes.
    #[serde(default, alias = "size", skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// The `uploadedFiles` field, which clients send either as a bare list or
/// wrapped as `{ "data": [...] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UploadedFiles {
    /// A bare list of file references.
    List(Vec<FileRef>),
    /// A list wrapped in an upload response object.
    Wrapped {
        /// The wrapped list.
        data: Vec<FileRef>,
    },
}

impl UploadedFiles {
    /// Borrow the file references regardless of the outer shape.
    #[must_use]
    pub fn files(&self) -> &[FileRef] {
        match self {
            UploadedFiles::List(files) | UploadedFiles::Wrapped { data: files } => files,
        }
    }
}

impl Default for UploadedFiles {
    fn default() -> Self {
        UploadedFiles::List(Vec::new())
    }
}

/// `authenticate` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    /// Identity hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<RawUserId>,
}

/// `message` payload sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<RawUserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<RawUserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Previously uploaded files to attach.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
}

/// `grpMessage` payload sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<RawUserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
}

/// `fileSendNotify` payload sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectFileNoticePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<RawUserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<RawUserId>,
    #[serde(default)]
    pub uploaded_files: UploadedFiles,
    /// Optional message text bundled with the files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// `grpFileSendNotify` payload sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelFileNoticePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<RawUserId>,
    #[serde(default)]
    pub uploaded_files: UploadedFiles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Keepalive payload, shared by `ping` and `pong`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Re-assert identity on a joined connection.
    #[serde(rename = "authenticate")]
    Authenticate(AuthenticatePayload),

    /// Direct (1:1) message.
    #[serde(rename = "message")]
    DirectMessage(DirectMessagePayload),

    /// Channel message.
    #[serde(rename = "grpMessage")]
    ChannelMessage(ChannelMessagePayload),

    /// Notify a direct-message peer about uploaded files.
    #[serde(rename = "fileSendNotify")]
    DirectFileNotice(DirectFileNoticePayload),

    /// Notify a channel about uploaded files.
    #[serde(rename = "grpFileSendNotify")]
    ChannelFileNotice(ChannelFileNoticePayload),

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping(PingPayload),
}

impl ClientEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Authenticate(_) => "authenticate",
            ClientEvent::DirectMessage(_) => "message",
            ClientEvent::ChannelMessage(_) => "grpMessage",
            ClientEvent::DirectFileNotice(_) => "fileSendNotify",
            ClientEvent::ChannelFileNotice(_) => "grpFileSendNotify",
            ClientEvent::Ping(_) => "ping",
        }
    }
}

/// `connected` payload: the handshake succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: ConnectionId,
    /// Canonical user id.
    pub user_id: String,
    pub username: String,
    /// Recommended heartbeat interval in milliseconds.
    pub heartbeat: u32,
    /// Negotiated protocol version.
    pub version: String,
}

/// `channelsSynced` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsSyncedPayload {
    pub channels: Vec<String>,
}

/// A persisted message as delivered to recipients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredMessage {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
    /// Persistence timestamp in milliseconds since the epoch.
    pub timestamp: u64,
}

/// A file-share notice as delivered to recipients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredFiles {
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    pub files: Vec<FileRef>,
    /// Set when the notice was bundled with message content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// `notification` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub content: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

/// `messageSent` payload: acknowledgment to the sender.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentPayload {
    pub success: bool,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// `filesUploaded` payload: acknowledgment of a file-share notice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesUploadedPayload {
    pub file_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected(ConnectedPayload),

    #[serde(rename = "channelsSynced")]
    ChannelsSynced(ChannelsSyncedPayload),

    #[serde(rename = "message")]
    DirectMessage(DeliveredMessage),

    #[serde(rename = "grpMessage")]
    ChannelMessage(DeliveredMessage),

    #[serde(rename = "fileSendNotify")]
    DirectFileNotice(DeliveredFiles),

    #[serde(rename = "grpFileSendNotify")]
    ChannelFileNotice(DeliveredFiles),

    #[serde(rename = "notification")]
    Notification(NotificationPayload),

    #[serde(rename = "messageSent")]
    MessageSent(MessageSentPayload),

    #[serde(rename = "filesUploaded")]
    FilesUploaded(FilesUploadedPayload),

    /// Informational notice, e.g. "recipient offline".
    #[serde(rename = "info")]
    Info(String),

    /// Short human-readable error.
    #[serde(rename = "error")]
    Error(String),

    #[serde(rename = "pong")]
    Pong(PingPayload),
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::ChannelsSynced(_) => "channelsSynced",
            ServerEvent::DirectMessage(_) => "message",
            ServerEvent::ChannelMessage(_) => "grpMessage",
            ServerEvent::DirectFileNotice(_) => "fileSendNotify",
            ServerEvent::ChannelFileNotice(_) => "grpFileSendNotify",
            ServerEvent::Notification(_) => "notification",
            ServerEvent::MessageSent(_) => "messageSent",
            ServerEvent::FilesUploaded(_) => "filesUploaded",
            ServerEvent::Info(_) => "info",
            ServerEvent::Error(_) => "error",
            ServerEvent::Pong(_) => "pong",
        }
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(message.into())
    }

    /// Create an `info` event.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        ServerEvent::Info(message.into())
    }

    /// Create a `channelsSynced` event.
    #[must_use]
    pub fn channels_synced<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ServerEvent::ChannelsSynced(ChannelsSyncedPayload {
            channels: channels.into_iter().map(Into::into).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_names() {
        let ping = ClientEvent::Ping(PingPayload::default());
        assert_eq!(ping.name(), "ping");

        let msg = ClientEvent::ChannelMessage(ChannelMessagePayload::default());
        assert_eq!(msg.name(), "grpMessage");
    }

    #[test]
    fn test_channel_message_wire_shape() {
        let raw = json!({
            "event": "grpMessage",
            "data": {"channelId": "general", "senderId": 1, "content": "hi"}
        });

        let event: ClientEvent = serde_json::from_value(raw).unwrap();
        match event {
            ClientEvent::ChannelMessage(payload) => {
                assert_eq!(payload.channel_id.as_deref(), Some("general"));
                assert_eq!(payload.sender_id, Some(RawUserId::Number(1)));
                assert_eq!(payload.content.as_deref(), Some("hi"));
                assert!(payload.file_ids.is_empty());
            }
            other => panic!("Expected grpMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_uploaded_files_both_shapes() {
        let listed: UploadedFiles =
            serde_json::from_value(json!([{"_id": "file_1", "filename": "a.png", "size": 10}]))
                .unwrap();
        let wrapped: UploadedFiles =
            serde_json::from_value(json!({"data": [{"fileId": "file_1", "url": "http://x/a"}]}))
                .unwrap();

        assert_eq!(listed.files()[0].id.as_deref(), Some("file_1"));
        assert_eq!(listed.files()[0].file_name.as_deref(), Some("a.png"));
        assert_eq!(listed.files()[0].file_size, Some(10));
        assert_eq!(wrapped.files()[0].id.as_deref(), Some("file_1"));
        assert_eq!(wrapped.files()[0].file_url.as_deref(), Some("http://x/a"));
    }

    #[test]
    fn test_missing_optional_fields_still_decode() {
        let event: ClientEvent =
            serde_json::from_value(json!({"event": "message", "data": {}})).unwrap();
        assert_eq!(
            event,
            ClientEvent::DirectMessage(DirectMessagePayload::default())
        );
    }

    #[test]
    fn test_server_error_is_plain_string() {
        let value = serde_json::to_value(ServerEvent::error("User not found")).unwrap();
        assert_eq!(value, json!({"event": "error", "data": "User not found"}));
    }

    #[test]
    fn test_notification_type_field() {
        let event = ServerEvent::Notification(NotificationPayload {
            kind: "message".into(),
            title: "New Message".into(),
            content: "alice sent you a message.".into(),
            sender_id: "3".into(),
            chat_id: None,
        });
        let value = serde_json::to_value(event).unwrap();
        assert_eq!(value["data"]["type"], "message");
        assert!(value["data"].get("chatId").is_none());
    }
}
