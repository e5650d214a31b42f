//! Connection handshake and connection lifecycle.
//!
//! `Pending → Authenticating → Joined → Closed`; any failure while
//! authenticating goes straight to `Closed`. A [`JoinedConnection`] owns the
//! presence entry and group memberships of one connection and releases them
//! in [`JoinedConnection::close`], or on drop if close was skipped.

use crate::error::RelayError;
use crate::group::GroupId;
use crate::hub::{LocalHub, OutboundSender};
use crate::identity::{Identity, IdentityResolver};
use crate::membership::MembershipSync;
use crate::presence::PresenceDirectory;
use crate::store::AuthVerifier;
use courier_protocol::{ConnectionId, RawUserId, Version, PROTOCOL_VERSION};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cookie names that may carry a session token, in lookup order.
pub const TOKEN_COOKIES: [&str; 2] = ["user", "token"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Authenticating,
    Joined,
    Closed,
}

/// Inputs collected from connection setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Identity hint from the connection parameters.
    pub identity_hint: Option<RawUserId>,
    /// Session token from a cookie or bearer header.
    pub token: Option<String>,
    /// Protocol version the client asked for.
    pub client_version: Option<Version>,
}

impl HandshakeRequest {
    /// Build a request, treating blank hints and tokens as absent.
    #[must_use]
    pub fn new(identity_hint: Option<RawUserId>, token: Option<String>) -> Self {
        Self {
            identity_hint: identity_hint.filter(|h| !h.is_blank()),
            token: token.filter(|t| !t.trim().is_empty()),
            client_version: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: Option<Version>) -> Self {
        self.client_version = version;
        self
    }
}

/// Extract a session token from a `Cookie` header value.
#[must_use]
pub fn token_from_cookie(header: &str) -> Option<String> {
    let pairs: Vec<(&str, &str)> = header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .collect();

    TOKEN_COOKIES.iter().find_map(|name| {
        pairs
            .iter()
            .find(|(key, value)| key == name && !value.is_empty())
            .map(|(_, value)| value.to_string())
    })
}

/// Extract a bearer token from an `Authorization` header value.
#[must_use]
pub fn token_from_authorization(header: &str) -> Option<String> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct HandshakeConfig {
    /// Refuse connections that only present an identity hint.
    pub require_token: bool,
}

/// Accepts connections.
pub struct Handshake {
    resolver: IdentityResolver,
    auth: Arc<dyn AuthVerifier>,
    presence: Arc<dyn PresenceDirectory>,
    hub: Arc<LocalHub>,
    membership: MembershipSync,
    config: HandshakeConfig,
}

impl Handshake {
    #[must_use]
    pub fn new(
        resolver: IdentityResolver,
        auth: Arc<dyn AuthVerifier>,
        presence: Arc<dyn PresenceDirectory>,
        hub: Arc<LocalHub>,
        membership: MembershipSync,
        config: HandshakeConfig,
    ) -> Self {
        Self {
            resolver,
            auth,
            presence,
            hub,
            membership,
            config,
        }
    }

    /// Authenticate a connection, register its presence and attach it to
    /// the local hub.
    ///
    /// # Errors
    ///
    /// Returns the reason the connection must be refused. Nothing is left
    /// registered when this fails.
    pub async fn accept(
        &self,
        connection: ConnectionId,
        request: HandshakeRequest,
        tx: OutboundSender,
    ) -> Result<JoinedConnection, RelayError> {
        debug!(connection = %connection, state = ?HandshakeState::Authenticating, "Handshake started");

        let identity = match self.authenticate(&request).await {
            Ok(identity) => identity,
            Err(e) => {
                info!(connection = %connection, reason = %e, kind = e.kind(), "Handshake rejected");
                return Err(e);
            }
        };

        self.presence
            .register(&connection, &identity.user_id)
            .await
            .map_err(|e| {
                warn!(connection = %connection, error = %e, "Presence registration failed");
                e
            })?;
        self.hub
            .attach(connection.clone(), identity.user_id.clone(), tx);

        info!(
            connection = %connection,
            user = %identity.user_id,
            username = %identity.username,
            "Connection joined"
        );

        Ok(JoinedConnection {
            id: connection,
            identity,
            state: HandshakeState::Joined,
            groups: BTreeSet::new(),
            presence: self.presence.clone(),
            hub: self.hub.clone(),
            membership: self.membership.clone(),
        })
    }

    async fn authenticate(&self, request: &HandshakeRequest) -> Result<Identity, RelayError> {
        if let Some(version) = request.client_version {
            if !version.is_compatible_with(&PROTOCOL_VERSION) {
                return Err(RelayError::ValidationFailed(format!(
                    "Unsupported protocol version {version}"
                )));
            }
        }

        let from_hint = match &request.identity_hint {
            Some(hint) => Some(self.resolver.resolve(hint).await?),
            None => None,
        };

        let from_token = match &request.token {
            Some(token) => {
                let claims = self.auth.verify(token).await?;
                Some(self.resolver.resolve(&claims.subject).await?)
            }
            None => None,
        };

        match (from_hint, from_token) {
            (Some(hint), Some(token)) if hint.user_id != token.user_id => Err(
                RelayError::InvalidToken("Identity does not match session token".into()),
            ),
            (Some(_), None) if self.config.require_token => {
                Err(RelayError::InvalidToken("Authentication required".into()))
            }
            (Some(identity), _) | (None, Some(identity)) => Ok(identity),
            (None, None) => Err(RelayError::InvalidToken("Authentication required".into())),
        }
    }
}

/// A connection that completed the handshake.
pub struct JoinedConnection {
    id: ConnectionId,
    identity: Identity,
    state: HandshakeState,
    groups: BTreeSet<GroupId>,
    presence: Arc<dyn PresenceDirectory>,
    hub: Arc<LocalHub>,
    membership: MembershipSync,
}

impl JoinedConnection {
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Groups recorded by the last successful sync.
    #[must_use]
    pub fn groups(&self) -> &BTreeSet<GroupId> {
        &self.groups
    }

    /// Mirror the persisted channel list into this connection's groups.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Unavailable` if the store cannot be read.
    pub async fn sync_membership(&mut self) -> Result<&BTreeSet<GroupId>, RelayError> {
        self.groups = self
            .membership
            .sync(&self.id, &self.identity.user_id)
            .await?;
        Ok(&self.groups)
    }

    /// Release the presence entry and every group membership.
    pub async fn close(mut self) {
        self.release_local();
        if let Err(e) = self.presence.unregister(&self.id).await {
            warn!(connection = %self.id, error = %e, "Presence cleanup failed");
        }
        info!(connection = %self.id, user = %self.identity.user_id, "Connection closed");
    }

    fn release_local(&mut self) {
        self.state = HandshakeState::Closed;
        let left = self.membership.clear(&self.id);
        debug!(connection = %self.id, channels = left.len(), "Unsubscribed from channels");
        self.groups.clear();
        self.hub.detach(&self.id);
    }
}

impl Drop for JoinedConnection {
    fn drop(&mut self) {
        if self.state == HandshakeState::Closed {
            return;
        }

        warn!(connection = %self.id, "Connection dropped without close, cleaning up");
        self.release_local();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let presence = self.presence.clone();
            let id = self.id.clone();
            handle.spawn(async move {
                if let Err(e) = presence.unregister(&id).await {
                    warn!(connection = %id, error = %e, "Presence cleanup failed");
                }
            });
        }
    }
}

impl std::fmt::Debug for JoinedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinedConnection")
            .field("id", &self.id)
            .field("user", &self.identity.user_id)
            .field("state", &self.state)
            .field("groups", &self.groups)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{RecordKey, Role, UserId, UserRecord};
    use crate::memory::MemoryStore;
    use crate::presence::MemoryPresence;
    use crate::store::Claims;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Accepts tokens of the form `valid:<raw id>`.
    struct PrefixVerifier;

    #[async_trait]
    impl AuthVerifier for PrefixVerifier {
        async fn verify(&self, token: &str) -> Result<Claims, RelayError> {
            let subject = token
                .strip_prefix("valid:")
                .ok_or_else(|| RelayError::InvalidToken("Invalid token".into()))?;
            let subject = subject
                .parse::<i64>()
                .map(RawUserId::Number)
                .unwrap_or_else(|_| RawUserId::from(subject));
            Ok(Claims {
                subject,
                username: None,
                role: None,
            })
        }
    }

    struct Fixture {
        handshake: Handshake,
        presence: Arc<MemoryPresence>,
        hub: Arc<LocalHub>,
    }

    fn fixture(require_token: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        for (id, name) in [(1, "rushi"), (2, "psy")] {
            store.add_user(UserRecord {
                key: RecordKey::Numeric(id),
                legacy_id: None,
                username: name.into(),
                role: Role::User,
            });
        }
        store.add_channel("chnl_general_chat", vec![RawUserId::from("1")]);

        let presence = Arc::new(MemoryPresence::new());
        let hub = Arc::new(LocalHub::new());
        let timeout = Duration::from_secs(1);
        let handshake = Handshake::new(
            IdentityResolver::new(store.clone(), timeout),
            Arc::new(PrefixVerifier),
            presence.clone(),
            hub.clone(),
            MembershipSync::new(store, hub.clone(), timeout),
            HandshakeConfig { require_token },
        );
        Fixture {
            handshake,
            presence,
            hub,
        }
    }

    async fn accept(f: &Fixture, id: &str, request: HandshakeRequest) -> Result<JoinedConnection, RelayError> {
        let (tx, _rx) = mpsc::unbounded_channel();
        f.handshake.accept(ConnectionId::from(id), request, tx).await
    }

    #[tokio::test]
    async fn test_presence_exists_only_while_joined() {
        let f = fixture(false);
        let id = ConnectionId::from("c1");
        assert_eq!(f.presence.user_for(&id).await.unwrap(), None);

        let mut joined = accept(&f, "c1", HandshakeRequest::new(Some("1".into()), None))
            .await
            .unwrap();
        assert_eq!(joined.state(), HandshakeState::Joined);
        assert_eq!(f.presence.user_for(&id).await.unwrap(), Some(UserId::from("1")));

        joined.sync_membership().await.unwrap();
        assert_eq!(joined.groups().len(), 1);

        joined.close().await;
        assert_eq!(f.presence.user_for(&id).await.unwrap(), None);
        assert!(!f.hub.is_local(&id));
        assert_eq!(f.hub.member_count("chnl_general_chat"), 0);
    }

    #[tokio::test]
    async fn test_rejected_handshake_leaves_nothing_behind() {
        let f = fixture(false);

        let err = accept(&f, "c1", HandshakeRequest::new(Some(RawUserId::from(404)), None))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "User not found");

        let err = accept(&f, "c2", HandshakeRequest::default()).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidToken(_)));

        assert!(f.presence.is_empty());
        assert_eq!(f.hub.stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_hint_and_token_in_different_encodings_agree() {
        let f = fixture(true);

        let joined = accept(
            &f,
            "c1",
            HandshakeRequest::new(Some(RawUserId::from("1")), Some("valid:1".into())),
        )
        .await
        .unwrap();
        assert_eq!(joined.identity().user_id, UserId::from("1"));
        joined.close().await;
    }

    #[tokio::test]
    async fn test_hint_and_token_for_different_users_rejected() {
        let f = fixture(false);

        let err = accept(
            &f,
            "c1",
            HandshakeRequest::new(Some(RawUserId::from(1)), Some("valid:2".into())),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_require_token_refuses_hint_only() {
        let f = fixture(true);

        assert!(accept(&f, "c1", HandshakeRequest::new(Some("1".into()), None))
            .await
            .is_err());
        let joined = accept(&f, "c2", HandshakeRequest::new(None, Some("valid:2".into())))
            .await
            .unwrap();
        assert_eq!(joined.identity().username, "psy");
        joined.close().await;
    }

    #[tokio::test]
    async fn test_incompatible_protocol_version() {
        let f = fixture(false);
        let request = HandshakeRequest::new(Some("1".into()), None)
            .with_version(Some(Version::new(2, 0)));

        let err = accept(&f, "c1", request).await.unwrap_err();
        assert!(matches!(err, RelayError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_drop_without_close_still_cleans_up() {
        let f = fixture(false);
        let joined = accept(&f, "c1", HandshakeRequest::new(Some("2".into()), None))
            .await
            .unwrap();
        drop(joined);

        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(f.presence.is_empty());
        assert!(!f.hub.is_local(&ConnectionId::from("c1")));
    }

    #[test]
    fn test_token_extraction() {
        assert_eq!(
            token_from_cookie("theme=dark; user=abc.def; token=zzz"),
            Some("abc.def".into())
        );
        assert_eq!(token_from_cookie("token=zzz"), Some("zzz".into()));
        assert_eq!(token_from_cookie("user=; theme=dark"), None);
        assert_eq!(token_from_authorization("Bearer abc"), Some("abc".into()));
        assert_eq!(token_from_authorization("Basic abc"), None);
    }
}
