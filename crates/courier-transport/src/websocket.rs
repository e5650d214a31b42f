//! WebSocket transport over axum.
//!
//! Text frames carry JSON events and binary frames carry length-prefixed
//! MessagePack events. Replies use the encoding of the most recent inbound
//! frame.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use courier_protocol::{codec, ClientEvent, ConnectionId, Encoding, ServerEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::traits::{Connection, EventSink, EventStream, Inbound, TransportError, TransportKind};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Encoding chosen by the client's last frame. `true` means binary.
#[derive(Debug, Default, Clone)]
struct SharedEncoding(Arc<AtomicBool>);

impl SharedEncoding {
    fn get(&self) -> Encoding {
        if self.0.load(Ordering::Relaxed) {
            Encoding::Binary
        } else {
            Encoding::Text
        }
    }

    fn set(&self, encoding: Encoding) {
        self.0.store(encoding == Encoding::Binary, Ordering::Relaxed);
    }
}

/// Wrap an upgraded axum socket into a [`Connection`].
#[must_use]
pub fn websocket_connection(
    socket: WebSocket,
    id: ConnectionId,
    remote_addr: Option<String>,
    config: &WebSocketConfig,
) -> Connection {
    let (tx, rx) = socket.split();
    let encoding = SharedEncoding::default();

    Connection {
        id,
        kind: TransportKind::WebSocket,
        remote_addr,
        sink: Box::new(WebSocketSink {
            tx,
            encoding: encoding.clone(),
            open: true,
        }),
        stream: Box::new(WebSocketEventStream {
            rx,
            encoding,
            max_message_size: config.max_message_size,
        }),
    }
}

/// Encode an event as a WebSocket message.
fn encode_message(event: &ServerEvent, encoding: Encoding) -> Result<Message, TransportError> {
    Ok(match encoding {
        Encoding::Text => Message::Text(codec::encode_text(event)?),
        Encoding::Binary => Message::Binary(codec::encode(event)?.to_vec()),
    })
}

/// Decode one WebSocket message.
///
/// `Ok(None)` means the peer closed the socket.
fn decode_message(
    message: Message,
    max_message_size: usize,
) -> Result<Option<(Inbound, Option<Encoding>)>, TransportError> {
    let size = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    if size > max_message_size {
        return Err(TransportError::MessageTooLarge {
            size,
            max: max_message_size,
        });
    }

    match message {
        Message::Text(text) => {
            let event: ClientEvent = codec::decode_text(&text)?;
            Ok(Some((Inbound::Event(event), Some(Encoding::Text))))
        }
        Message::Binary(data) => {
            let event: ClientEvent = codec::decode(&data)?;
            Ok(Some((Inbound::Event(event), Some(Encoding::Binary))))
        }
        Message::Ping(_) | Message::Pong(_) => Ok(Some((Inbound::Heartbeat, None))),
        Message::Close(frame) => {
            debug!(?frame, "Received close frame");
            Ok(None)
        }
    }
}

struct WebSocketSink {
    tx: SplitSink<WebSocket, Message>,
    encoding: SharedEncoding,
    open: bool,
}

#[async_trait]
impl EventSink for WebSocketSink {
    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        let message = encode_message(event, self.encoding.get())?;
        self.tx
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, reason: Option<String>) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }
        let frame = reason.map(|reason| CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        });
        self.tx
            .send(Message::Close(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

struct WebSocketEventStream {
    rx: SplitStream<WebSocket>,
    encoding: SharedEncoding,
    max_message_size: usize,
}

#[async_trait]
impl EventStream for WebSocketEventStream {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.rx.next().await {
            Some(Ok(message)) => match decode_message(message, self.max_message_size) {
                Ok(Some((inbound, encoding))) => {
                    if let Some(encoding) = encoding {
                        self.encoding.set(encoding);
                    }
                    Ok(Some(inbound))
                }
                Ok(None) => Ok(None),
                Err(e) => {
                    warn!(error = %e, "Rejected inbound frame");
                    Err(e)
                }
            },
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::{PingPayload, RawUserId};

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[test]
    fn test_decode_text_frame() {
        let text = r#"{"event":"authenticate","data":{"userId":7}}"#;
        let (inbound, encoding) = decode_message(Message::Text(text.into()), 1024)
            .unwrap()
            .unwrap();
        assert_eq!(encoding, Some(Encoding::Text));
        match inbound {
            Inbound::Event(ClientEvent::Authenticate(p)) => {
                assert_eq!(p.user_id, Some(RawUserId::from(7)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_binary_frame() {
        let event = ClientEvent::Ping(PingPayload {
            timestamp: Some(42),
        });
        let data = codec::encode(&event).unwrap();
        let (inbound, encoding) = decode_message(Message::Binary(data.to_vec()), 1024)
            .unwrap()
            .unwrap();
        assert_eq!(encoding, Some(Encoding::Binary));
        assert_eq!(inbound, Inbound::Event(event));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let text = "x".repeat(100);
        let err = decode_message(Message::Text(text), 10).unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { size: 100, max: 10 }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_malformed_text_is_protocol_error() {
        let err = decode_message(Message::Text("not json".into()), 1024).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn test_control_frames() {
        let (inbound, encoding) = decode_message(Message::Ping(vec![1]), 1024)
            .unwrap()
            .unwrap();
        assert_eq!(inbound, Inbound::Heartbeat);
        assert_eq!(encoding, None);
        assert!(decode_message(Message::Close(None), 1024).unwrap().is_none());
    }

    #[test]
    fn test_reply_encoding_follows_client() {
        let shared = SharedEncoding::default();
        assert_eq!(shared.get(), Encoding::Text);
        shared.set(Encoding::Binary);
        assert_eq!(shared.clone().get(), Encoding::Binary);

        let event = ServerEvent::info("hi");
        assert!(matches!(
            encode_message(&event, Encoding::Text).unwrap(),
            Message::Text(t) if t.contains("\"info\"")
        ));
        assert!(matches!(
            encode_message(&event, Encoding::Binary).unwrap(),
            Message::Binary(_)
        ));
    }
}
