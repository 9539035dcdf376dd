//! Gateway bridge against a local WebSocket server.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use meshtenna_agent::transport::bridge::BridgeTransport;
use meshtenna_agent::transport::{Opened, Session, Transport, TransportError, TransportTarget};
use meshtenna_common::models::{OutboundProbe, ProbePayload};
use meshtenna_common::protocol::{Envelope, MESH_PACKET, MESH_SEND, MeshSendPayload};

fn probe(id: u32) -> OutboundProbe {
    OutboundProbe {
        correlation_id: id,
        destination: "!a1b2c3d4".into(),
        payload: ProbePayload::Text("antenna test".into()),
        want_ack: true,
    }
}

fn frame(msg_type: &str, payload: serde_json::Value) -> Message {
    let envelope = Envelope::new(msg_type, payload).unwrap();
    Message::Text(serde_json::to_string(&envelope).unwrap().into())
}

#[tokio::test]
async fn probe_goes_out_and_ack_comes_back() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let gateway = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let msg = ws.next().await.unwrap().unwrap();
        let envelope: Envelope = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(envelope.msg_type, MESH_SEND);
        let sent: MeshSendPayload = envelope.parse_payload().unwrap();

        // Unrelated traffic first, then the routing ACK.
        ws.send(frame("node.info", serde_json::json!({"num": 1})))
            .await
            .unwrap();
        ws.send(frame(
            MESH_PACKET,
            serde_json::json!({"fromId": "!0badc0de", "rxRssi": -120}),
        ))
        .await
        .unwrap();
        ws.send(frame(
            MESH_PACKET,
            serde_json::json!({
                "fromId": sent.to,
                "decoded": {"requestId": sent.id, "portnum": "ROUTING_APP"},
                "rxRssi": -77,
                "rxSnr": 5.5,
            }),
        ))
        .await
        .unwrap();

        // Hold the socket open until the harness closes it.
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
        sent
    });

    let target = TransportTarget::Tcp {
        host: addr.to_string(),
    };
    let Opened {
        mut session,
        mut events,
    } = BridgeTransport.open(&target).await.unwrap();

    let id = session.send(&probe(4242)).await.unwrap();
    assert_eq!(id, 4242);

    let chatter = events.recv().await.unwrap();
    assert_eq!(chatter.sender_id, "!0badc0de");
    assert_eq!(chatter.correlation_id, None);

    let ack = events.recv().await.unwrap();
    assert_eq!(ack.sender_id, "!a1b2c3d4");
    assert_eq!(ack.correlation_id, Some(4242));
    assert_eq!(ack.rssi, Some(-77));
    assert_eq!(ack.snr, Some(5.5));

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert!(matches!(
        session.send(&probe(1)).await,
        Err(TransportError::Closed)
    ));

    let sent = gateway.await.unwrap();
    assert_eq!(sent.text.as_deref(), Some("antenna test"));
    assert!(sent.want_ack);
}

#[tokio::test]
async fn unreachable_gateway_fails_to_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let target = TransportTarget::Tcp {
        host: addr.to_string(),
    };
    assert!(matches!(
        BridgeTransport.open(&target).await,
        Err(TransportError::Connect(_))
    ));
}
