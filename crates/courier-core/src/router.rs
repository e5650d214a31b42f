//! Message and file event router.
//!
//! Each inbound event moves through
//! `Received → Validated → Persisted → FannedOut → Acked`, or stops at
//! `Rejected` / `PersistFailed`. Persistence always happens before fan-out,
//! so an event that failed to persist was never delivered to anyone.

use crate::error::{with_deadline, RelayError};
use crate::fanout::{Broadcaster, Delivery};
use crate::identity::{Identity, IdentityResolver, UserId};
use crate::message::{Conversation, NewMessage, StoredMessage};
use crate::store::ChatStore;
use courier_protocol::{
    AuthenticatePayload, ChannelFileNoticePayload, ChannelMessagePayload, ClientEvent,
    ConnectionId, DeliveredFiles, DeliveredMessage, DirectFileNoticePayload,
    DirectMessagePayload, FileRef, FilesUploadedPayload, MessageSentPayload,
    NotificationPayload, RawUserId, ServerEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MISSING_MESSAGE_DATA: &str = "Missing required message data";
pub const CHANNEL_NOT_FOUND: &str = "Channel doesn't exist";
pub const RECEIVER_NOT_FOUND: &str = "Receiver doesn't exist";
pub const RECEIVER_OFFLINE_MESSAGE: &str = "Receiver is offline, but message is sent.";
pub const RECEIVER_OFFLINE_FILES: &str = "Receiver is offline, but file notification is sent.";
pub const FILES_NOT_LINKED: &str = "Message saved, but its files could not be attached.";

/// Where an event's processing stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStage {
    Received,
    Validated,
    Persisted,
    FannedOut,
    Acked,
    Rejected,
    PersistFailed,
}

/// What the session should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Directive {
    #[default]
    None,
    /// Re-run membership sync for this connection.
    ResyncMembership,
    /// The session is corrupted; close the connection.
    Terminate,
}

/// Result of routing one event.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteOutcome {
    pub stage: EventStage,
    /// Events to send back on the originating connection, in order.
    pub replies: Vec<ServerEvent>,
    pub directive: Directive,
    /// Outcome of user-addressed delivery, when there was one.
    pub delivery: Option<Delivery>,
}

impl RouteOutcome {
    fn acked(replies: Vec<ServerEvent>) -> Self {
        Self {
            stage: EventStage::Acked,
            replies,
            directive: Directive::None,
            delivery: None,
        }
    }

    fn with_delivery(mut self, delivery: Option<Delivery>) -> Self {
        self.delivery = delivery;
        self
    }
}

/// A routing failure: the stage it happened at and the reply to send.
#[derive(Debug)]
struct Failure {
    stage: EventStage,
    reply: String,
    directive: Directive,
}

impl Failure {
    fn rejected(reply: impl Into<String>) -> Self {
        Self {
            stage: EventStage::Rejected,
            reply: reply.into(),
            directive: Directive::None,
        }
    }

    fn terminate(reply: impl Into<String>) -> Self {
        Self {
            stage: EventStage::Rejected,
            reply: reply.into(),
            directive: Directive::Terminate,
        }
    }

    fn undelivered(error: &RelayError) -> Self {
        warn!(error = %error, "Fan-out failed after persistence");
        Self {
            stage: EventStage::Persisted,
            reply: "Message saved but could not be delivered".into(),
            directive: Directive::None,
        }
    }
}

impl From<RelayError> for Failure {
    fn from(error: RelayError) -> Self {
        let stage = match error {
            RelayError::PersistFailed(_) => EventStage::PersistFailed,
            _ => EventStage::Rejected,
        };
        Self {
            stage,
            reply: error.to_string(),
            directive: Directive::None,
        }
    }
}

impl From<Failure> for RouteOutcome {
    fn from(failure: Failure) -> Self {
        Self {
            stage: failure.stage,
            replies: vec![ServerEvent::error(failure.reply)],
            directive: failure.directive,
            delivery: None,
        }
    }
}

/// The connection an event arrived on.
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    pub connection: &'a ConnectionId,
    pub identity: &'a Identity,
}

/// Validates, persists and fans out client events.
pub struct EventRouter {
    resolver: IdentityResolver,
    store: Arc<dyn ChatStore>,
    broadcaster: Arc<Broadcaster>,
    timeout: Duration,
}

impl EventRouter {
    #[must_use]
    pub fn new(
        resolver: IdentityResolver,
        store: Arc<dyn ChatStore>,
        broadcaster: Arc<Broadcaster>,
        timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            store,
            broadcaster,
            timeout,
        }
    }

    /// Route one event from a joined connection.
    pub async fn route(&self, origin: Origin<'_>, event: ClientEvent) -> RouteOutcome {
        let name = event.name();
        debug!(connection = %origin.connection, event = name, stage = ?EventStage::Received, "Routing event");

        let result = match event {
            ClientEvent::ChannelMessage(payload) => self.channel_message(origin, payload).await,
            ClientEvent::DirectMessage(payload) => self.direct_message(origin, payload).await,
            ClientEvent::ChannelFileNotice(payload) => self.channel_files(origin, payload).await,
            ClientEvent::DirectFileNotice(payload) => self.direct_files(origin, payload).await,
            ClientEvent::Authenticate(payload) => self.authenticate(origin, payload).await,
            ClientEvent::Ping(payload) => Ok(RouteOutcome::acked(vec![ServerEvent::Pong(payload)])),
        };

        match result {
            Ok(outcome) => outcome,
            Err(failure) => {
                debug!(
                    connection = %origin.connection,
                    event = name,
                    stage = ?failure.stage,
                    reason = %failure.reply,
                    "Event not completed"
                );
                failure.into()
            }
        }
    }

    async fn channel_message(
        &self,
        origin: Origin<'_>,
        payload: ChannelMessagePayload,
    ) -> Result<RouteOutcome, Failure> {
        let ChannelMessagePayload {
            channel_id: Some(channel_id),
            sender_id: Some(sender_id),
            content: Some(content),
            file_ids,
        } = payload
        else {
            return Err(Failure::rejected(MISSING_MESSAGE_DATA));
        };
        if channel_id.is_empty() || content.is_empty() {
            return Err(Failure::rejected(MISSING_MESSAGE_DATA));
        }

        self.check_sender(origin, Some(&sender_id)).await?;
        self.require_channel(&channel_id).await?;
        self.require_session_user(origin).await?;

        let conversation = Conversation::Channel(channel_id.clone());
        let Persisted {
            stored,
            files_linked,
        } = self
            .persist(origin, conversation, content.clone(), &file_ids)
            .await?;

        let identity = origin.identity;
        let delivered = DeliveredMessage {
            message_id: stored.id.clone(),
            channel_id: Some(channel_id.clone()),
            sender_id: identity.user_id.to_string(),
            sender_name: identity.username.clone(),
            receiver_id: None,
            content,
            file_ids: if files_linked { file_ids } else { Vec::new() },
            timestamp: stored.created_at,
        };
        let notification = ServerEvent::Notification(NotificationPayload {
            kind: "message".into(),
            title: "New Message".into(),
            content: format!("{} sent a message in channel {}", identity.username, channel_id),
            sender_id: identity.user_id.to_string(),
            chat_id: Some(channel_id.clone()),
        });

        for event in [ServerEvent::ChannelMessage(delivered), notification] {
            self.broadcaster
                .emit_to_group(&channel_id, event, Some(origin.connection))
                .await
                .map_err(|e| Failure::undelivered(&e))?;
        }

        info!(
            connection = %origin.connection,
            user = %identity.user_id,
            channel = %channel_id,
            message = %stored.id,
            "Channel message delivered"
        );
        let mut replies = vec![ServerEvent::MessageSent(MessageSentPayload {
            success: true,
            message_id: stored.id,
            channel_id: Some(channel_id),
        })];
        if !files_linked {
            replies.push(ServerEvent::info(FILES_NOT_LINKED));
        }
        Ok(RouteOutcome::acked(replies))
    }

    async fn direct_message(
        &self,
        origin: Origin<'_>,
        payload: DirectMessagePayload,
    ) -> Result<RouteOutcome, Failure> {
        let DirectMessagePayload {
            sender_id: Some(sender_id),
            receiver_id: Some(receiver_id),
            content: Some(content),
            file_ids,
        } = payload
        else {
            return Err(Failure::rejected(MISSING_MESSAGE_DATA));
        };
        if content.is_empty() {
            return Err(Failure::rejected(MISSING_MESSAGE_DATA));
        }

        self.check_sender(origin, Some(&sender_id)).await?;
        let receiver = self.require_receiver(&receiver_id).await?;
        self.require_session_user(origin).await?;

        let conversation = Conversation::Direct(receiver.user_id.clone());
        let Persisted {
            stored,
            files_linked,
        } = self
            .persist(origin, conversation, content.clone(), &file_ids)
            .await?;

        let identity = origin.identity;
        let delivered = DeliveredMessage {
            message_id: stored.id.clone(),
            channel_id: None,
            sender_id: identity.user_id.to_string(),
            sender_name: identity.username.clone(),
            receiver_id: Some(receiver.user_id.to_string()),
            content,
            file_ids: if files_linked { file_ids } else { Vec::new() },
            timestamp: stored.created_at,
        };
        let notification = ServerEvent::Notification(NotificationPayload {
            kind: "message".into(),
            title: "New Message".into(),
            content: format!("{} sent you a message.", identity.username),
            sender_id: identity.user_id.to_string(),
            chat_id: None,
        });

        let delivery = self
            .broadcaster
            .emit_all_to_user(
                &receiver.user_id,
                vec![ServerEvent::DirectMessage(delivered), notification],
            )
            .await
            .map_err(|e| Failure::undelivered(&e))?;

        let mut replies = Vec::with_capacity(3);
        if delivery.is_unreachable() {
            replies.push(ServerEvent::info(RECEIVER_OFFLINE_MESSAGE));
        }
        replies.push(ServerEvent::MessageSent(MessageSentPayload {
            success: true,
            message_id: stored.id.clone(),
            channel_id: None,
        }));
        if !files_linked {
            replies.push(ServerEvent::info(FILES_NOT_LINKED));
        }

        info!(
            connection = %origin.connection,
            user = %identity.user_id,
            receiver = %receiver.user_id,
            message = %stored.id,
            ?delivery,
            "Direct message handled"
        );
        Ok(RouteOutcome::acked(replies).with_delivery(Some(delivery)))
    }

    async fn channel_files(
        &self,
        origin: Origin<'_>,
        payload: ChannelFileNoticePayload,
    ) -> Result<RouteOutcome, Failure> {
        let Some(channel_id) = payload.channel_id.filter(|c| !c.is_empty()) else {
            return Err(Failure::rejected("Missing channel"));
        };
        let file_ids = validate_files(payload.uploaded_files.files())?;

        self.check_sender(origin, payload.user_id.as_ref()).await?;
        self.require_channel(&channel_id).await?;
        self.require_session_user(origin).await?;

        let content = payload.content.filter(|c| !c.is_empty());
        let persisted = match &content {
            Some(text) => {
                let conversation = Conversation::Channel(channel_id.clone());
                Some(self.persist(origin, conversation, text.clone(), &file_ids).await?)
            }
            None => None,
        };
        let message_id = persisted.as_ref().map(|p| p.stored.id.clone());

        let identity = origin.identity;
        let notice = DeliveredFiles {
            sender_id: identity.user_id.to_string(),
            sender_name: identity.username.clone(),
            channel_id: Some(channel_id.clone()),
            receiver_id: None,
            files: payload.uploaded_files.files().to_vec(),
            message_id,
            content,
        };
        self.broadcaster
            .emit_to_group(
                &channel_id,
                ServerEvent::ChannelFileNotice(notice),
                Some(origin.connection),
            )
            .await
            .map_err(|e| Failure::undelivered(&e))?;

        debug!(connection = %origin.connection, channel = %channel_id, files = file_ids.len(), "Channel file notice delivered");
        let mut replies = vec![ServerEvent::FilesUploaded(FilesUploadedPayload {
            file_ids,
            channel_id: Some(channel_id),
            receiver_id: None,
        })];
        if persisted.is_some_and(|p| !p.files_linked) {
            replies.push(ServerEvent::info(FILES_NOT_LINKED));
        }
        Ok(RouteOutcome::acked(replies))
    }

    async fn direct_files(
        &self,
        origin: Origin<'_>,
        payload: DirectFileNoticePayload,
    ) -> Result<RouteOutcome, Failure> {
        let Some(receiver_raw) = payload.receiver.as_ref() else {
            return Err(Failure::rejected("Missing receiver"));
        };
        let file_ids = validate_files(payload.uploaded_files.files())?;

        self.check_sender(origin, payload.sender.as_ref()).await?;
        let receiver = self.require_receiver(receiver_raw).await?;
        self.require_session_user(origin).await?;

        let content = payload.content.filter(|c| !c.is_empty());
        let persisted = match &content {
            Some(text) => {
                let conversation = Conversation::Direct(receiver.user_id.clone());
                Some(self.persist(origin, conversation, text.clone(), &file_ids).await?)
            }
            None => None,
        };
        let message_id = persisted.as_ref().map(|p| p.stored.id.clone());

        let identity = origin.identity;
        let notice = DeliveredFiles {
            sender_id: identity.user_id.to_string(),
            sender_name: identity.username.clone(),
            channel_id: None,
            receiver_id: Some(receiver.user_id.to_string()),
            files: payload.uploaded_files.files().to_vec(),
            message_id,
            content,
        };
        let delivery = self
            .broadcaster
            .emit_to_user(&receiver.user_id, ServerEvent::DirectFileNotice(notice))
            .await
            .map_err(|e| Failure::undelivered(&e))?;

        let mut replies = Vec::with_capacity(3);
        if delivery.is_unreachable() {
            replies.push(ServerEvent::info(RECEIVER_OFFLINE_FILES));
        }
        replies.push(ServerEvent::FilesUploaded(FilesUploadedPayload {
            file_ids,
            channel_id: None,
            receiver_id: Some(receiver.user_id.to_string()),
        }));
        if persisted.is_some_and(|p| !p.files_linked) {
            replies.push(ServerEvent::info(FILES_NOT_LINKED));
        }
        Ok(RouteOutcome::acked(replies).with_delivery(Some(delivery)))
    }

    async fn authenticate(
        &self,
        origin: Origin<'_>,
        payload: AuthenticatePayload,
    ) -> Result<RouteOutcome, Failure> {
        if let Some(raw) = payload.user_id.as_ref().filter(|r| !r.is_blank()) {
            let asserted = self.resolver.resolve(raw).await.map_err(|e| {
                warn!(connection = %origin.connection, raw = %raw, "Identity no longer resolvable");
                Failure::terminate(e.to_string())
            })?;
            if asserted.user_id != origin.identity.user_id {
                warn!(
                    connection = %origin.connection,
                    user = %origin.identity.user_id,
                    asserted = %asserted.user_id,
                    "Connection asserted a different identity"
                );
                return Err(Failure::terminate("Identity does not match this connection"));
            }
        }

        let mut outcome = RouteOutcome::acked(Vec::new());
        outcome.directive = Directive::ResyncMembership;
        Ok(outcome)
    }

    /// A payload sender that resolves to someone else is refused. One that
    /// does not resolve at all is ignored; the session identity is used.
    async fn check_sender(&self, origin: Origin<'_>, sender: Option<&RawUserId>) -> Result<(), Failure> {
        let Some(raw) = sender else {
            return Ok(());
        };
        match self.resolver.resolve(raw).await {
            Ok(resolved) if resolved.user_id != origin.identity.user_id => {
                warn!(
                    connection = %origin.connection,
                    user = %origin.identity.user_id,
                    claimed = %resolved.user_id,
                    "Sender mismatch"
                );
                Err(Failure::rejected("Sender does not match authenticated user"))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(connection = %origin.connection, raw = %raw, error = %e, "Sender not resolvable, using session identity");
                Ok(())
            }
        }
    }

    async fn require_channel(&self, channel_id: &str) -> Result<(), Failure> {
        let exists = with_deadline(self.timeout, self.store.channel_exists(channel_id))
            .await
            .map_err(|e| {
                warn!(channel = %channel_id, error = %e, "Channel lookup failed");
                RelayError::Unavailable("Could not verify channel".into())
            })?;
        if exists {
            Ok(())
        } else {
            Err(RelayError::ReferenceNotFound(CHANNEL_NOT_FOUND.into()).into())
        }
    }

    async fn require_receiver(&self, raw: &RawUserId) -> Result<Identity, Failure> {
        self.resolver
            .resolve(raw)
            .await
            .map_err(|_| RelayError::ReferenceNotFound(RECEIVER_NOT_FOUND.into()).into())
    }

    /// The session's user must still exist; if not, the session is corrupted.
    async fn require_session_user(&self, origin: Origin<'_>) -> Result<(), Failure> {
        let user: &UserId = &origin.identity.user_id;
        let exists = with_deadline(self.timeout, self.store.user_exists(user))
            .await
            .map_err(|e| {
                warn!(user = %user, error = %e, "User lookup failed");
                RelayError::Unavailable("Could not verify sender".into())
            })?;
        if exists {
            Ok(())
        } else {
            warn!(connection = %origin.connection, user = %user, "Session user vanished");
            Err(Failure::terminate("User not found"))
        }
    }

    /// Save the message, then attach its files.
    ///
    /// Once the message is saved it is part of history, so a failure to
    /// attach files is reported through `files_linked` rather than as a
    /// persistence failure.
    async fn persist(
        &self,
        origin: Origin<'_>,
        conversation: Conversation,
        content: String,
        file_ids: &[String],
    ) -> Result<Persisted, Failure> {
        let message = NewMessage {
            conversation,
            sender: origin.identity.user_id.clone(),
            content,
        };

        let stored = with_deadline(self.timeout, self.store.create_message(message))
            .await
            .map_err(|e| {
                warn!(connection = %origin.connection, error = %e, "Message persistence failed");
                RelayError::PersistFailed("Failed to save message".into())
            })?;

        let mut files_linked = true;
        if !file_ids.is_empty() {
            if let Err(e) =
                with_deadline(self.timeout, self.store.link_files_to_message(file_ids, &stored)).await
            {
                warn!(message = %stored.id, files = file_ids.len(), error = %e, "Linking files failed");
                files_linked = false;
            }
        }

        debug!(connection = %origin.connection, message = %stored.id, stage = ?EventStage::Persisted, "Persisted");
        Ok(Persisted {
            stored,
            files_linked,
        })
    }
}

/// A saved message.
struct Persisted {
    stored: StoredMessage,
    /// `false` if the message was saved but attaching its files failed.
    files_linked: bool,
}

/// Every notice needs at least one file, and every file needs an id.
fn validate_files(files: &[FileRef]) -> Result<Vec<String>, Failure> {
    if files.is_empty() {
        return Err(Failure::rejected("No files to share"));
    }
    files
        .iter()
        .map(|f| {
            f.id
                .clone()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| Failure::rejected("File reference without id"))
        })
        .collect()
}
