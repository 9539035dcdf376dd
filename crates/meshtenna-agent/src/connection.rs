//! Connection lifecycle for the gateway session.
//!
//! Opens at most one transport session at a time, publishes every status
//! transition on a watch channel, and never retries on its own.

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use meshtenna_common::models::{InboundEvent, OutboundProbe};
use meshtenna_common::protocol::ConnectionStatus;

use crate::transport::{Opened, Session, Transport, TransportError, TransportTarget};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    session: Option<T::Session>,
    status: watch::Sender<ConnectionStatus>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            transport,
            session: None,
            status,
        }
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Open a session and return the inbound event stream.
    ///
    /// On failure the status becomes `Error(reason)`; no retry is attempted.
    pub async fn connect(
        &mut self,
        target: &TransportTarget,
    ) -> Result<mpsc::Receiver<InboundEvent>, ConnectionError> {
        if self.session.is_some() {
            return Err(ConnectionError::AlreadyConnected);
        }

        self.status.send_replace(ConnectionStatus::Connecting);
        tracing::info!(%target, "connecting to gateway");

        match self.transport.open(target).await {
            Ok(Opened { session, events }) => {
                self.session = Some(session);
                self.status.send_replace(ConnectionStatus::Connected);
                tracing::info!(%target, "gateway connected");
                Ok(events)
            }
            Err(e) => {
                tracing::warn!(%target, error = %e, "gateway connection failed");
                self.status
                    .send_replace(ConnectionStatus::Error(format!("Connection error: {e}")));
                Err(e.into())
            }
        }
    }

    /// Transmit a probe through the live session.
    pub async fn send(&mut self, probe: &OutboundProbe) -> Result<u32, ConnectionError> {
        let session = self.session.as_mut().ok_or(ConnectionError::NotConnected)?;
        Ok(session.send(probe).await?)
    }

    /// Record a session-level failure without tearing the session down.
    pub fn report_error(&self, reason: impl Into<String>) {
        self.status.send_replace(ConnectionStatus::Error(reason.into()));
    }

    /// Mark a session that recovered from a reported error as healthy again.
    pub fn clear_error(&self) {
        if self.session.is_some() {
            self.status.send_if_modified(|status| {
                if matches!(status, ConnectionStatus::Error(_)) {
                    *status = ConnectionStatus::Connected;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Close the session if there is one. Always ends `Disconnected`.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                tracing::warn!(error = %e, "error while closing gateway session");
            } else {
                tracing::info!("gateway disconnected");
            }
        }
        self.status.send_replace(ConnectionStatus::Disconnected);
    }
}
