//! Redis pub/sub event bus.
//!
//! Envelopes are published as JSON on `{prefix}:{topic}`; every worker
//! `PSUBSCRIBE`s to `{prefix}:*` and forwards what it receives to its local
//! dispatcher. Publishes are batched into pipelines. The connection is
//! re-established with exponential backoff when it drops.

use crate::bus::{Envelope, EventBus};
use crate::error::RelayError;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const MAX_PIPELINE_SIZE: usize = 64;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

struct Publish {
    channel: String,
    payload: String,
}

/// Cross-process bus over Redis pub/sub.
pub struct RedisBus {
    prefix: String,
    cmd_tx: mpsc::UnboundedSender<Publish>,
    sender: broadcast::Sender<Arc<Envelope>>,
}

impl RedisBus {
    /// Start the bus. The Redis connection is established in the background.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Bus` if the URL is invalid.
    pub fn spawn(url: &str, prefix: impl Into<String>, capacity: usize) -> Result<Arc<Self>, RelayError> {
        let client = redis::Client::open(url).map_err(|e| RelayError::Bus(e.to_string()))?;
        let prefix = prefix.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (sender, _) = broadcast::channel(capacity);

        tokio::spawn(listener_task(client, prefix.clone(), cmd_rx, sender.clone()));

        Ok(Arc::new(Self {
            prefix,
            cmd_tx,
            sender,
        }))
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), RelayError> {
        let payload =
            serde_json::to_string(&envelope).map_err(|e| RelayError::Bus(e.to_string()))?;
        let channel = format!("{}:{}", self.prefix, envelope.topic());
        self.cmd_tx
            .send(Publish { channel, payload })
            .map_err(|_| RelayError::Bus("bus listener stopped".into()))
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct RunError {
    /// Whether the connection was established before failing.
    connected: bool,
    message: String,
}

impl RunError {
    fn before_connect(e: impl std::fmt::Display) -> Self {
        Self {
            connected: false,
            message: e.to_string(),
        }
    }

    fn after_connect(e: impl std::fmt::Display) -> Self {
        Self {
            connected: true,
            message: e.to_string(),
        }
    }
}

async fn listener_task(
    client: redis::Client,
    prefix: String,
    mut cmd_rx: mpsc::UnboundedReceiver<Publish>,
    sender: broadcast::Sender<Arc<Envelope>>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match connect_and_run(&client, &prefix, &mut cmd_rx, &sender).await {
            Ok(()) => {
                debug!("Redis bus shutting down");
                return;
            }
            Err(e) => {
                if e.connected {
                    backoff = INITIAL_BACKOFF;
                }
                warn!(error = %e.message, retry_ms = backoff.as_millis() as u64, "Redis bus disconnected");
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
            }
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

async fn connect_and_run(
    client: &redis::Client,
    prefix: &str,
    cmd_rx: &mut mpsc::UnboundedReceiver<Publish>,
    sender: &broadcast::Sender<Arc<Envelope>>,
) -> Result<(), RunError> {
    let mut pub_conn = client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(RunError::before_connect)?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(RunError::before_connect)?;

    let pattern = format!("{prefix}:*");
    pubsub
        .psubscribe(&pattern)
        .await
        .map_err(RunError::before_connect)?;
    info!(pattern = %pattern, "Redis bus connected");

    let pub_task = async {
        let mut batch: Vec<Publish> = Vec::with_capacity(MAX_PIPELINE_SIZE);
        loop {
            match cmd_rx.recv().await {
                Some(first) => batch.push(first),
                None => return Ok(()),
            }
            while batch.len() < MAX_PIPELINE_SIZE {
                match cmd_rx.try_recv() {
                    Ok(next) => batch.push(next),
                    Err(_) => break,
                }
            }

            let mut pipe = redis::pipe();
            for publish in &batch {
                pipe.cmd("PUBLISH")
                    .arg(&publish.channel)
                    .arg(&publish.payload)
                    .ignore();
            }
            let result: redis::RedisResult<()> = pipe.query_async(&mut pub_conn).await;
            if let Err(e) = result {
                warn!(dropped = batch.len(), error = %e, "Redis publish failed");
                return Err(RunError::after_connect(e));
            }
            batch.clear();
        }
    };

    let msg_stream = pubsub.into_on_message();
    tokio::pin!(msg_stream);

    let sub_task = async {
        while let Some(msg) = msg_stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Unreadable bus payload");
                    continue;
                }
            };
            match serde_json::from_str::<Envelope>(&payload) {
                Ok(envelope) => {
                    let _ = sender.send(Arc::new(envelope));
                }
                Err(e) => {
                    warn!(channel = %msg.get_channel_name(), error = %e, "Malformed bus envelope");
                }
            }
        }
        Err(RunError::after_connect("message stream ended"))
    };

    tokio::select! {
        result = pub_task => result,
        result = sub_task => result,
    }
}
