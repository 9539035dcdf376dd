//! Data models for the antenna test harness.
//!
//! `Sample` mirrors one row of the `results` table. The remaining types
//! describe probes in flight and the derived score rows handed to the
//! presentation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node name recorded when the gateway does not report one.
pub const UNKNOWN_NODE_NAME: &str = "Unknown Node";

// ── Connection type ─────────────────────────────────────────────────

/// How the harness reaches its gateway radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// IP-addressed gateway (host or host:port).
    Tcp,
    /// Short-range wireless device, addressed by name.
    Ble,
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionType::Tcp => write!(f, "TCP"),
            ConnectionType::Ble => write!(f, "BLE"),
        }
    }
}

impl std::str::FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(ConnectionType::Tcp),
            "ble" => Ok(ConnectionType::Ble),
            other => Err(format!("unknown connection type: {other}")),
        }
    }
}

// ── Sample ──────────────────────────────────────────────────────────

/// One acknowledged probe together with the link quality it was received at.
///
/// Samples are created only when an acknowledgment matches the outstanding
/// probe and are never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub antenna_name: String,
    pub url: String,
    pub notes: String,
    pub location: String,
    pub node_name: String,
    pub node_id: String,
    pub connection_type: ConnectionType,
    pub address: String,
    /// Local wall-clock time, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
    pub rssi: Option<i32>,
    pub snr: Option<f64>,
}

// ── Radio events ────────────────────────────────────────────────────

/// An inbound packet as reported by the transport.
///
/// Every field except the sender may be absent; absence is explicit rather
/// than a missing map key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub sender_id: String,
    #[serde(default)]
    pub correlation_id: Option<u32>,
    #[serde(default)]
    pub rssi: Option<i32>,
    #[serde(default)]
    pub snr: Option<f64>,
}

/// The single probe awaiting acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub correlation_id: u32,
    pub destination_node_id: String,
    pub sent_at: DateTime<Utc>,
}

/// What a probe carries on air.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum ProbePayload {
    /// A text message visible on the destination node.
    Text(String),
    /// An empty data packet, invisible to users of the destination node.
    Empty,
}

/// A probe handed to the transport for transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundProbe {
    pub correlation_id: u32,
    pub destination: String,
    pub payload: ProbePayload,
    pub want_ack: bool,
}

// ── Score rows ──────────────────────────────────────────────────────

/// One antenna row of the results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntennaScore {
    pub antenna_name: String,
    pub location: String,
    pub url: String,
    pub notes: String,
    pub avg_rssi: f64,
    pub score: f64,
}

/// One location row of the locations table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationScore {
    pub location: String,
    pub avg_snr: f64,
    pub score: f64,
    /// Antenna that recorded the strongest single RSSI sample here.
    pub best_antenna: Option<String>,
}
