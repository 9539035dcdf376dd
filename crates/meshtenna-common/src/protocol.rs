//! JSON messages exchanged with the mesh gateway bridge, and the status
//! snapshots published to whatever renders the harness state.
//!
//! Gateway frames share a common envelope format: `{"id", "type", "ts",
//! "payload"}`. The harness sends `mesh.send` and receives `mesh.packet`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{InboundEvent, OutboundProbe, ProbePayload};

/// Message type of an outbound probe frame.
pub const MESH_SEND: &str = "mesh.send";
/// Message type of an inbound packet frame.
pub const MESH_PACKET: &str = "mesh.packet";

// ── Envelope ────────────────────────────────────────────────────────

/// The outer envelope for all gateway messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message ID (UUIDv7, time-ordered).
    pub id: String,
    /// Message type (dotted namespace, e.g. "mesh.packet").
    #[serde(rename = "type")]
    pub msg_type: String,
    /// ISO 8601 timestamp.
    pub ts: DateTime<Utc>,
    /// Type-specific payload.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create a new envelope with a fresh UUIDv7 and current timestamp.
    pub fn new(msg_type: impl Into<String>, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::now_v7().to_string(),
            msg_type: msg_type.into(),
            ts: Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Parse the payload into a concrete type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ── Harness → Gateway ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSendPayload {
    /// Packet id the gateway must use on air, echoed back as `requestId`.
    pub id: u32,
    /// Destination node id (`!xxxxxxxx`).
    pub to: String,
    pub want_ack: bool,
    /// Text for a visible message; absent for an empty data packet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl From<&OutboundProbe> for MeshSendPayload {
    fn from(probe: &OutboundProbe) -> Self {
        Self {
            id: probe.correlation_id,
            to: probe.destination.clone(),
            want_ack: probe.want_ack,
            text: match &probe.payload {
                ProbePayload::Text(text) => Some(text.clone()),
                ProbePayload::Empty => None,
            },
        }
    }
}

// ── Gateway → Harness ───────────────────────────────────────────────

/// A received packet as forwarded by the gateway, using the radio
/// firmware's field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshPacketPayload {
    #[serde(default)]
    pub from_id: Option<String>,
    #[serde(default)]
    pub decoded: Option<DecodedPayload>,
    #[serde(default)]
    pub rx_rssi: Option<i32>,
    #[serde(default)]
    pub rx_snr: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedPayload {
    #[serde(default)]
    pub request_id: Option<u32>,
    #[serde(default)]
    pub portnum: Option<String>,
}

impl MeshPacketPayload {
    /// Convert into a strict inbound event. Packets without a sender are
    /// dropped since they can never be correlated.
    pub fn into_event(self) -> Option<InboundEvent> {
        let sender_id = self.from_id.filter(|id| !id.is_empty())?;
        Some(InboundEvent {
            sender_id,
            correlation_id: self.decoded.and_then(|d| d.request_id),
            rssi: self.rx_rssi,
            snr: self.rx_snr,
        })
    }
}

// ── Presentation ────────────────────────────────────────────────────

/// Gateway connection state as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Phase of the probe scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    #[default]
    Idle,
    Connecting,
    ConnectionFailed,
    Armed,
    Sending,
    Counting,
    Stopped,
}

/// Snapshot of a test run, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub phase: SchedulerPhase,
    pub connection: ConnectionStatus,
    /// Seconds until the next probe; `None` when no countdown is shown.
    pub countdown: Option<u32>,
    /// Elapsed run time, `HH:MM:SS`.
    pub elapsed: String,
    pub sent: u64,
    pub acked: u64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            phase: SchedulerPhase::Idle,
            connection: ConnectionStatus::Disconnected,
            countdown: None,
            elapsed: "00:00:00".into(),
            sent: 0,
            acked: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A transient, non-fatal notification for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}
