//! WebSocket bridge to a mesh gateway.
//!
//! The gateway owns the radio and relays JSON envelopes: the harness sends
//! `mesh.send` frames and receives a `mesh.packet` frame for every packet
//! the radio hears. Only IP-addressed targets can be bridged.

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use meshtenna_common::models::{ConnectionType, InboundEvent, OutboundProbe};
use meshtenna_common::protocol::{Envelope, MESH_PACKET, MESH_SEND, MeshPacketPayload, MeshSendPayload};

use super::{EVENT_CHANNEL_CAPACITY, Opened, Session, Transport, TransportError, TransportTarget};

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Port assumed when the configured host has none.
pub const DEFAULT_GATEWAY_PORT: u16 = 4403;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeTransport;

/// Build the gateway URL for a configured host. Full `ws://`/`wss://` URLs
/// pass through untouched.
pub fn gateway_url(host: &str) -> String {
    let host = host.trim();
    if host.starts_with("ws://") || host.starts_with("wss://") {
        return host.to_string();
    }
    if host.contains(':') {
        format!("ws://{host}/mesh")
    } else {
        format!("ws://{host}:{DEFAULT_GATEWAY_PORT}/mesh")
    }
}

impl Transport for BridgeTransport {
    type Session = BridgeSession;

    async fn open(&self, target: &TransportTarget) -> Result<Opened<BridgeSession>, TransportError> {
        let host = match target {
            TransportTarget::Tcp { host } => host,
            TransportTarget::Ble { .. } => {
                return Err(TransportError::Unsupported(ConnectionType::Ble));
            }
        };

        let url = gateway_url(host);
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;
        let (sink, stream) = ws.split();

        tracing::info!(%url, "gateway bridge connected");

        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_loop(stream, tx));

        Ok(Opened {
            session: BridgeSession {
                sink,
                reader,
                closed: false,
            },
            events,
        })
    }
}

pub struct BridgeSession {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
    closed: bool,
}

impl Session for BridgeSession {
    async fn send(&mut self, probe: &OutboundProbe) -> Result<u32, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let envelope = Envelope::new(MESH_SEND, MeshSendPayload::from(probe))?;
        let json = serde_json::to_string(&envelope)?;
        self.sink.send(Message::Text(json.into())).await?;
        Ok(probe.correlation_id)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reader.abort();
        // A stalled socket must not hold up the stop path.
        let close = self.sink.send(Message::Close(None));
        if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
            tracing::warn!("gateway close frame timed out");
        }
        tracing::info!("gateway bridge closed");
        Ok(())
    }
}

/// Forward every inbound packet until the socket or the receiver goes away.
async fn read_loop(mut stream: SplitStream<WsStream>, tx: mpsc::Sender<InboundEvent>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let Some(event) = parse_frame(&text) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("gateway closed connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "gateway read error");
                break;
            }
            _ => {} // Ping/Pong handled by tungstenite
        }
    }
}

/// Decode one gateway frame into an inbound event, if it is a packet.
pub fn parse_frame(raw: &str) -> Option<InboundEvent> {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("invalid frame from gateway: {e}");
            return None;
        }
    };

    if envelope.msg_type != MESH_PACKET {
        tracing::trace!(msg_type = %envelope.msg_type, "ignoring gateway frame");
        return None;
    }

    match envelope.parse_payload::<MeshPacketPayload>() {
        Ok(packet) => packet.into_event(),
        Err(e) => {
            tracing::warn!("malformed mesh.packet payload: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_url_from_host() {
        assert_eq!(gateway_url("192.168.1.40"), "ws://192.168.1.40:4403/mesh");
        assert_eq!(gateway_url("gw.local:8080"), "ws://gw.local:8080/mesh");
        assert_eq!(gateway_url(" wss://gw.example/mesh "), "wss://gw.example/mesh");
    }

    #[test]
    fn parse_frame_accepts_packets_only() {
        let packet = Envelope::new(
            MESH_PACKET,
            serde_json::json!({"fromId": "!0000beef", "decoded": {"requestId": 5}, "rxRssi": -100}),
        )
        .unwrap();
        let event = parse_frame(&serde_json::to_string(&packet).unwrap()).unwrap();
        assert_eq!(event.sender_id, "!0000beef");
        assert_eq!(event.correlation_id, Some(5));
        assert_eq!(event.rssi, Some(-100));
        assert_eq!(event.snr, None);

        let other = Envelope::new("node.info", serde_json::json!({})).unwrap();
        assert!(parse_frame(&serde_json::to_string(&other).unwrap()).is_none());
        assert!(parse_frame("not json").is_none());
    }

    #[tokio::test]
    async fn ble_targets_are_unsupported() {
        let target = TransportTarget::Ble {
            device: "Meshtastic_12ab".into(),
        };
        assert!(matches!(
            BridgeTransport.open(&target).await,
            Err(TransportError::Unsupported(ConnectionType::Ble))
        ));
    }
}
