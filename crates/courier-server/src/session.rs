//! Per-connection session driver.
//!
//! Runs the handshake, announces the connection, mirrors its channel
//! memberships, then serves inbound events and outbound deliveries in
//! arrival order until the client leaves, the session is terminated, or it
//! goes idle. Cleanup runs on every exit path.

use crate::handlers::AppState;
use crate::metrics::{self, ConnectionMetricsGuard};
use courier_core::{Directive, HandshakeRequest, JoinedConnection, Origin, Outbound};
use courier_protocol::{ClientEvent, ConnectedPayload, ServerEvent, PROTOCOL_VERSION};
use courier_transport::{Connection, EventSink, Inbound};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Why a session loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    ClientGone,
    Terminated,
    Idle,
    SendFailed,
}

/// Drive one connection from handshake to cleanup.
pub async fn run(state: Arc<AppState>, mut conn: Connection, request: HandshakeRequest) {
    let node = state.node.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut joined = match node.handshake().accept(conn.id.clone(), request, tx).await {
        Ok(joined) => joined,
        Err(e) => {
            metrics::record_handshake_rejected(e.kind());
            let _ = conn.sink.send(&ServerEvent::error(e.to_string())).await;
            let _ = conn.sink.close(None).await;
            return;
        }
    };
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connected = ServerEvent::Connected(ConnectedPayload {
        connection_id: conn.id.clone(),
        user_id: joined.identity().user_id.to_string(),
        username: joined.identity().username.clone(),
        heartbeat: u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
        version: PROTOCOL_VERSION.to_string(),
    });
    info!(
        connection = %conn.id,
        user = %joined.identity().user_id,
        transport = %conn.kind,
        "Connection joined"
    );

    let exit = if conn.sink.send(&connected).await.is_err() {
        Exit::SendFailed
    } else if !resync(&mut joined, conn.sink.as_mut()).await {
        Exit::SendFailed
    } else {
        serve(&state, &mut conn, &mut joined, &mut rx).await
    };

    debug!(connection = %conn.id, reason = ?exit, "Session ended");
    joined.close().await;
    let _ = conn.sink.close(None).await;
    metrics::set_hub_stats(&node.hub().stats());
}

async fn serve(
    state: &AppState,
    conn: &mut Connection,
    joined: &mut JoinedConnection,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Exit {
    let idle = state.config.idle_timeout();
    let deadline = tokio::time::sleep(idle);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(Outbound::Event(event)) => {
                    if conn.sink.send(&event).await.is_err() {
                        return Exit::SendFailed;
                    }
                }
                Some(Outbound::Resync) => {
                    if !resync(joined, conn.sink.as_mut()).await {
                        return Exit::SendFailed;
                    }
                }
                None => return Exit::ClientGone,
            },

            inbound = conn.stream.recv() => {
                deadline.as_mut().reset(tokio::time::Instant::now() + idle);
                match inbound {
                    Ok(Some(Inbound::Event(event))) => {
                        match handle_event(state, conn.sink.as_mut(), joined, event).await {
                            Some(exit) => return exit,
                            None => continue,
                        }
                    }
                    Ok(Some(Inbound::Heartbeat)) => {}
                    Ok(None) => return Exit::ClientGone,
                    Err(e) if !e.is_fatal() => {
                        if conn.sink.send(&ServerEvent::error(e.to_string())).await.is_err() {
                            return Exit::SendFailed;
                        }
                    }
                    Err(e) => {
                        debug!(connection = %conn.id, error = %e, "Transport failed");
                        return Exit::ClientGone;
                    }
                }
            },

            () = &mut deadline => {
                info!(connection = %conn.id, idle_ms = idle.as_millis() as u64, "Closing idle connection");
                let _ = conn.sink.close(Some("Idle timeout".into())).await;
                return Exit::Idle;
            }
        }
    }
}

/// Route one event and apply its outcome. Returns an exit if the session
/// must end.
async fn handle_event(
    state: &AppState,
    sink: &mut dyn EventSink,
    joined: &mut JoinedConnection,
    event: ClientEvent,
) -> Option<Exit> {
    let name = event.name();
    let path = delivery_path(&event);
    let started = Instant::now();

    let outcome = state
        .node
        .router()
        .route(
            Origin {
                connection: joined.id(),
                identity: joined.identity(),
            },
            event,
        )
        .await;
    metrics::record_event(name, path, outcome.stage, outcome.delivery, started.elapsed());

    for reply in &outcome.replies {
        if sink.send(reply).await.is_err() {
            return Some(Exit::SendFailed);
        }
    }

    match outcome.directive {
        Directive::None => None,
        Directive::ResyncMembership => (!resync(joined, sink).await).then_some(Exit::SendFailed),
        Directive::Terminate => {
            warn!(connection = %joined.id(), event = name, "Terminating corrupted session");
            let reason = outcome
                .replies
                .iter()
                .find_map(|reply| match reply {
                    ServerEvent::Error(message) => Some(message.clone()),
                    _ => None,
                });
            let _ = sink.close(reason).await;
            Some(Exit::Terminated)
        }
    }
}

/// Fan-out path an event takes, for metrics.
fn delivery_path(event: &ClientEvent) -> &'static str {
    match event {
        ClientEvent::ChannelMessage(_) | ClientEvent::ChannelFileNotice(_) => "group",
        ClientEvent::DirectMessage(_) | ClientEvent::DirectFileNotice(_) => "user",
        _ => "connection",
    }
}

/// Re-run membership sync and report the result to the client. Returns
/// `false` if the client can no longer be written to.
async fn resync(joined: &mut JoinedConnection, sink: &mut dyn EventSink) -> bool {
    let reply = match joined.sync_membership().await {
        Ok(groups) => ServerEvent::channels_synced(groups.iter().cloned()),
        Err(e) => {
            warn!(connection = %joined.id(), error = %e, "Membership sync failed");
            ServerEvent::error(e.to_string())
        }
    };
    sink.send(&reply).await.is_ok()
}
