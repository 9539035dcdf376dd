//! Simulated radio.
//!
//! Acknowledges probes after a short, jittered delay with randomized but
//! plausible link quality, and optionally mixes in unrelated mesh chatter
//! so the correlator has something to discard. Used by `--simulate` runs
//! and tests.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use meshtenna_common::models::{InboundEvent, OutboundProbe};

use super::{EVENT_CHANNEL_CAPACITY, Opened, Session, Transport, TransportError, TransportTarget};

/// Node id the simulated chatter claims to come from.
pub const CHATTER_NODE_ID: &str = "!0badc0de";

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Chance that a probe is acknowledged, 0.0..=1.0.
    pub ack_probability: f64,
    /// Minimum delay before the acknowledgment arrives.
    pub ack_delay: Duration,
    /// Additional random delay on top of `ack_delay`.
    pub jitter: Duration,
    pub rssi_dbm: RangeInclusive<i32>,
    pub snr_db: RangeInclusive<f64>,
    /// Emit one unrelated packet per probe.
    pub chatter: bool,
    /// Fail every connection attempt.
    pub refuse_connect: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ack_probability: 0.85,
            ack_delay: Duration::from_millis(1500),
            jitter: Duration::from_millis(2500),
            rssi_dbm: -118..=-60,
            snr_db: -12.0..=9.5,
            chatter: true,
            refuse_connect: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimTransport {
    config: Arc<SimConfig>,
}

impl SimTransport {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Transport for SimTransport {
    type Session = SimSession;

    async fn open(&self, target: &TransportTarget) -> Result<Opened<SimSession>, TransportError> {
        if self.config.refuse_connect {
            return Err(TransportError::Connect(format!(
                "simulated radio refused {target}"
            )));
        }

        tracing::info!(%target, "simulated radio session opened");
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Opened {
            session: SimSession {
                config: self.config.clone(),
                tx,
                in_flight: Vec::new(),
                closed: false,
            },
            events,
        })
    }
}

pub struct SimSession {
    config: Arc<SimConfig>,
    tx: mpsc::Sender<InboundEvent>,
    in_flight: Vec<JoinHandle<()>>,
    closed: bool,
}

/// What the simulated air will deliver for one probe.
struct Reply {
    delay: Duration,
    ack: Option<InboundEvent>,
    chatter: Option<InboundEvent>,
}

fn roll_reply(config: &SimConfig, probe: &OutboundProbe) -> Reply {
    let mut rng = rand::rng();

    let jitter_ms = config.jitter.as_millis() as u64;
    let delay = config.ack_delay + Duration::from_millis(rng.random_range(0..=jitter_ms));

    let ack = rng
        .random_bool(config.ack_probability.clamp(0.0, 1.0))
        .then(|| InboundEvent {
            sender_id: probe.destination.clone(),
            correlation_id: Some(probe.correlation_id),
            rssi: Some(rng.random_range(config.rssi_dbm.clone())),
            snr: Some((rng.random_range(config.snr_db.clone()) * 4.0).round() / 4.0),
        });

    let chatter = config.chatter.then(|| InboundEvent {
        sender_id: CHATTER_NODE_ID.into(),
        correlation_id: None,
        rssi: Some(rng.random_range(config.rssi_dbm.clone())),
        snr: Some(rng.random_range(config.snr_db.clone())),
    });

    Reply {
        delay,
        ack,
        chatter,
    }
}

impl Session for SimSession {
    async fn send(&mut self, probe: &OutboundProbe) -> Result<u32, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let reply = roll_reply(&self.config, probe);
        let tx = self.tx.clone();
        self.in_flight.retain(|h| !h.is_finished());
        self.in_flight.push(tokio::spawn(async move {
            if let Some(chatter) = reply.chatter {
                let _ = tx.send(chatter).await;
            }
            tokio::time::sleep(reply.delay).await;
            if let Some(ack) = reply.ack {
                let _ = tx.send(ack).await;
            }
        }));

        tracing::debug!(
            id = probe.correlation_id,
            to = %probe.destination,
            "simulated probe transmitted"
        );
        Ok(probe.correlation_id)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
        self.closed = true;
        tracing::info!("simulated radio session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtenna_common::models::ProbePayload;

    fn probe(id: u32) -> OutboundProbe {
        OutboundProbe {
            correlation_id: id,
            destination: "!a1b2c3d4".into(),
            payload: ProbePayload::Empty,
            want_ack: true,
        }
    }

    fn target() -> TransportTarget {
        TransportTarget::Tcp {
            host: "sim".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledges_with_echoed_id() {
        let transport = SimTransport::new(SimConfig {
            ack_probability: 1.0,
            chatter: false,
            rssi_dbm: -90..=-90,
            snr_db: 5.0..=5.0,
            ..SimConfig::default()
        });
        let Opened {
            mut session,
            mut events,
        } = transport.open(&target()).await.unwrap();

        assert_eq!(session.send(&probe(42)).await.unwrap(), 42);
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.sender_id, "!a1b2c3d4");
        assert_eq!(ev.correlation_id, Some(42));
        assert_eq!(ev.rssi, Some(-90));
        assert_eq!(ev.snr, Some(5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn chatter_arrives_without_correlation() {
        let transport = SimTransport::new(SimConfig {
            ack_probability: 0.0,
            chatter: true,
            ..SimConfig::default()
        });
        let Opened {
            mut session,
            mut events,
        } = transport.open(&target()).await.unwrap();

        session.send(&probe(1)).await.unwrap();
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.sender_id, CHATTER_NODE_ID);
        assert_eq!(ev.correlation_id, None);
    }

    #[tokio::test]
    async fn refused_connection_and_closed_session_error() {
        let refused = SimTransport::new(SimConfig {
            refuse_connect: true,
            ..SimConfig::default()
        });
        assert!(matches!(
            refused.open(&target()).await,
            Err(TransportError::Connect(_))
        ));

        let Opened { mut session, .. } = SimTransport::default().open(&target()).await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(
            session.send(&probe(1)).await,
            Err(TransportError::Closed)
        ));
    }
}
