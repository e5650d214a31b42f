//! Redis-backed presence directory.
//!
//! Layout, for a prefix `courier`:
//!
//! - `courier:conn:{connection}`: string holding the user id, with a `PX`
//!   expiry equal to the lease.
//! - `courier:user:{user}`: sorted set of connection ids scored by lease
//!   expiry in milliseconds. Expired members are trimmed on read.

use crate::error::RelayError;
use crate::identity::UserId;
use crate::message::now_millis;
use crate::presence::PresenceDirectory;
use async_trait::async_trait;
use courier_protocol::ConnectionId;
use redis::aio::MultiplexedConnection;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Presence directory shared by every worker through Redis.
#[derive(Clone)]
pub struct RedisPresence {
    conn: MultiplexedConnection,
    prefix: String,
    ttl: Duration,
}

fn presence_error(e: redis::RedisError) -> RelayError {
    RelayError::Presence(e.to_string())
}

impl RedisPresence {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Presence` if the connection cannot be opened.
    pub async fn connect(url: &str, prefix: impl Into<String>, ttl: Duration) -> Result<Self, RelayError> {
        let client = redis::Client::open(url).map_err(presence_error)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(presence_error)?;
        let prefix = prefix.into();
        info!(prefix = %prefix, ttl_ms = ttl.as_millis() as u64, "Connected to Redis presence directory");
        Ok(Self { conn, prefix, ttl })
    }

    fn conn_key(&self, connection: &ConnectionId) -> String {
        format!("{}:conn:{}", self.prefix, connection)
    }

    fn user_key(&self, user: &str) -> String {
        format!("{}:user:{}", self.prefix, user)
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    /// Append the writes that (re)establish one lease.
    fn lease(&self, pipe: &mut redis::Pipeline, connection: &ConnectionId, user: &UserId) {
        let ttl = self.ttl_ms();
        let expiry = now_millis() + ttl;
        let user_key = self.user_key(user.as_str());

        pipe.cmd("SET")
            .arg(self.conn_key(connection))
            .arg(user.as_str())
            .arg("PX")
            .arg(ttl)
            .ignore();
        pipe.cmd("ZADD")
            .arg(&user_key)
            .arg(expiry)
            .arg(connection.as_str())
            .ignore();
        pipe.cmd("PEXPIRE").arg(&user_key).arg(ttl).ignore();
    }
}

#[async_trait]
impl PresenceDirectory for RedisPresence {
    async fn register(&self, connection: &ConnectionId, user: &UserId) -> Result<(), RelayError> {
        let mut conn = self.conn.clone();

        let previous: Option<String> = redis::cmd("GET")
            .arg(self.conn_key(connection))
            .query_async(&mut conn)
            .await
            .map_err(presence_error)?;

        let mut pipe = redis::pipe();
        if let Some(previous) = previous.filter(|p| p != user.as_str()) {
            pipe.cmd("ZREM")
                .arg(self.user_key(&previous))
                .arg(connection.as_str())
                .ignore();
        }
        self.lease(&mut pipe, connection, user);

        let () = pipe.query_async(&mut conn).await.map_err(presence_error)?;
        debug!(connection = %connection, user = %user, "Presence: registered");
        Ok(())
    }

    async fn refresh(&self, entries: &[(ConnectionId, UserId)]) -> Result<(), RelayError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (connection, user) in entries {
            self.lease(&mut pipe, connection, user);
        }
        let () = pipe.query_async(&mut conn).await.map_err(presence_error)?;
        Ok(())
    }

    async fn unregister(&self, connection: &ConnectionId) -> Result<(), RelayError> {
        let mut conn = self.conn.clone();
        let key = self.conn_key(connection);

        let user: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(presence_error)?;

        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(&key).ignore();
        if let Some(user) = &user {
            pipe.cmd("ZREM")
                .arg(self.user_key(user))
                .arg(connection.as_str())
                .ignore();
        }
        let () = pipe.query_async(&mut conn).await.map_err(presence_error)?;

        if user.is_some() {
            debug!(connection = %connection, "Presence: unregistered");
        }
        Ok(())
    }

    async fn connections_for(&self, user: &UserId) -> Result<HashSet<ConnectionId>, RelayError> {
        let mut conn = self.conn.clone();
        let key = self.user_key(user.as_str());
        let now = now_millis();

        let (live,): (Vec<String>,) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(format!("({now}"))
            .ignore()
            .cmd("ZRANGEBYSCORE")
            .arg(&key)
            .arg(now)
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .map_err(presence_error)?;

        Ok(live.into_iter().map(ConnectionId::from).collect())
    }

    async fn user_for(&self, connection: &ConnectionId) -> Result<Option<UserId>, RelayError> {
        let mut conn = self.conn.clone();
        let user: Option<String> = redis::cmd("GET")
            .arg(self.conn_key(connection))
            .query_async(&mut conn)
            .await
            .map_err(presence_error)?;
        Ok(user.map(UserId::from))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
