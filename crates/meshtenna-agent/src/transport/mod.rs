//! Transport boundary to the gateway radio.
//!
//! A [`Transport`] opens a [`Session`] to a [`TransportTarget`] and hands
//! back a bounded receiver of [`InboundEvent`]s. The harness never speaks
//! the radio protocol itself; implementations do.
//!
//! - [`bridge::BridgeTransport`] - WebSocket link to a mesh gateway
//! - [`sim::SimTransport`] - simulated radio for `--simulate` runs

pub mod bridge;
pub mod sim;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use meshtenna_common::models::{ConnectionType, InboundEvent, OutboundProbe};

/// Capacity of the inbound event channel handed out by every transport.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0} transport is not supported on this platform")]
    Unsupported(ConnectionType),
    #[error("send failed: {0}")]
    Send(String),
    #[error("session closed")]
    Closed,
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where the gateway radio lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportTarget {
    Tcp { host: String },
    Ble { device: String },
}

impl TransportTarget {
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            TransportTarget::Tcp { .. } => ConnectionType::Tcp,
            TransportTarget::Ble { .. } => ConnectionType::Ble,
        }
    }

    /// Host or device name, as recorded in samples.
    pub fn address(&self) -> &str {
        match self {
            TransportTarget::Tcp { host } => host,
            TransportTarget::Ble { device } => device,
        }
    }
}

impl std::fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.connection_type(), self.address())
    }
}

/// An open session returned by [`Transport::open`].
pub struct Opened<S> {
    pub session: S,
    /// Every packet the radio hears, delivered at any time.
    pub events: mpsc::Receiver<InboundEvent>,
}

pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    fn open(
        &self,
        target: &TransportTarget,
    ) -> impl Future<Output = Result<Opened<Self::Session>, TransportError>> + Send;
}

pub trait Session: Send + 'static {
    /// Transmit a probe. Returns the packet id used on air, which
    /// acknowledgments echo back.
    fn send(
        &mut self,
        probe: &OutboundProbe,
    ) -> impl Future<Output = Result<u32, TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
