//! Acknowledgment correlation.
//!
//! The transport delivers inbound packets at any time. A single consumer
//! task owns the outstanding-probe slot and is the only place that slot is
//! read or written: the scheduler arms it through a command channel, and
//! inbound events are matched against it. Only one probe is ever tracked,
//! so an acknowledgment for a superseded probe can never match.

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use meshtenna_common::models::{ConnectionType, InboundEvent, ProbeRequest, Sample};
use meshtenna_common::protocol::Notice;

use crate::config::TestConfig;
use crate::persistence::PersistenceQueue;
use crate::samples;
use crate::storage::Storage;

const COMMAND_CHANNEL_CAPACITY: usize = 8;
const MATCH_CHANNEL_CAPACITY: usize = 16;

/// Session metadata stamped onto every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleContext {
    pub antenna_name: String,
    pub url: String,
    pub notes: String,
    pub location: String,
    pub node_name: String,
    pub connection_type: ConnectionType,
    pub address: String,
}

impl SampleContext {
    pub fn from_config(config: &TestConfig) -> Self {
        Self {
            antenna_name: config.antenna_name.clone(),
            url: config.url.clone(),
            notes: config.notes.clone(),
            location: config.location.clone(),
            node_name: config.node_name.clone(),
            connection_type: config.target.connection_type(),
            address: config.target.address().to_string(),
        }
    }

    pub fn build_sample(&self, event: &InboundEvent, timestamp: String) -> Sample {
        Sample {
            antenna_name: self.antenna_name.clone(),
            url: self.url.clone(),
            notes: self.notes.clone(),
            location: self.location.clone(),
            node_name: self.node_name.clone(),
            node_id: event.sender_id.clone(),
            connection_type: self.connection_type,
            address: self.address.clone(),
            timestamp,
            rssi: event.rssi,
            snr: event.snr,
        }
    }
}

/// Local wall-clock time in the sample timestamp format.
pub fn sample_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ── Matching ────────────────────────────────────────────────────────

/// The single-slot rendezvous between the last probe and its ACK.
#[derive(Debug)]
pub struct Correlator {
    destination: String,
    outstanding: Option<ProbeRequest>,
}

impl Correlator {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            outstanding: None,
        }
    }

    pub fn outstanding(&self) -> Option<&ProbeRequest> {
        self.outstanding.as_ref()
    }

    /// Track a new probe, retiring any unacknowledged one first.
    /// Returns the retired probe.
    pub fn arm(&mut self, probe: ProbeRequest) -> Option<ProbeRequest> {
        let retired = self.outstanding.take();
        self.outstanding = Some(probe);
        retired
    }

    pub fn clear(&mut self) -> Option<ProbeRequest> {
        self.outstanding.take()
    }

    /// Take the outstanding probe if `event` acknowledges it.
    pub fn offer(&mut self, event: &InboundEvent) -> Option<ProbeRequest> {
        let probe = self.outstanding.as_ref()?;
        let matches = event.sender_id == self.destination
            && event.correlation_id == Some(probe.correlation_id);
        if matches {
            self.outstanding.take()
        } else {
            None
        }
    }
}

// ── Task ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CorrelatorCommand {
    Arm(ProbeRequest),
    Clear,
}

/// A correlated acknowledgment and the sample it produced.
#[derive(Debug, Clone)]
pub struct AckMatch {
    pub probe: ProbeRequest,
    pub sample: Sample,
    /// Whether the sample reached storage.
    pub persisted: bool,
}

pub struct AckCorrelator<S> {
    correlator: Correlator,
    context: SampleContext,
    persistence: PersistenceQueue<S>,
    notices: broadcast::Sender<Notice>,
}

impl<S: Storage> AckCorrelator<S> {
    pub fn new(
        destination: impl Into<String>,
        context: SampleContext,
        persistence: PersistenceQueue<S>,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        Self {
            correlator: Correlator::new(destination),
            context,
            persistence,
            notices,
        }
    }

    /// Start consuming `events` on a dedicated task.
    pub fn spawn(self, events: mpsc::Receiver<InboundEvent>) -> CorrelatorHandle {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (match_tx, matches) = mpsc::channel(MATCH_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(command_rx, events, match_tx));
        CorrelatorHandle {
            commands,
            matches,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<CorrelatorCommand>,
        mut events: mpsc::Receiver<InboundEvent>,
        matches: mpsc::Sender<AckMatch>,
    ) {
        loop {
            tokio::select! {
                // Commands first, so a probe armed before its ACK arrived
                // is in the slot when the ACK is examined.
                biased;

                cmd = commands.recv() => match cmd {
                    Some(CorrelatorCommand::Arm(probe)) => {
                        if let Some(retired) = self.correlator.arm(probe) {
                            tracing::debug!(id = retired.correlation_id, "probe superseded without ACK");
                        }
                    }
                    Some(CorrelatorCommand::Clear) => {
                        self.correlator.clear();
                    }
                    None => break,
                },

                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(found) = self.handle_event(&event).await {
                            let _ = matches.send(found).await;
                        }
                    }
                    None => {
                        tracing::info!("inbound event stream ended");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_event(&mut self, event: &InboundEvent) -> Option<AckMatch> {
        let Some(probe) = self.correlator.offer(event) else {
            tracing::debug!(
                from = %event.sender_id,
                id = ?event.correlation_id,
                "discarding uncorrelated packet"
            );
            return None;
        };

        let sample = self.context.build_sample(event, sample_timestamp());
        let persisted = self.persistence.write(samples::insert(&sample)).await > 0;

        if persisted {
            tracing::info!(
                id = probe.correlation_id,
                rssi = ?sample.rssi,
                snr = ?sample.snr,
                "ACK received and logged"
            );
            let _ = self.notices.send(Notice::info("ACK received and logged"));
        } else {
            tracing::warn!(id = probe.correlation_id, "ACK matched but sample was not stored");
            let _ = self
                .notices
                .send(Notice::error("Error while inserting data"));
        }

        Some(AckMatch {
            probe,
            sample,
            persisted,
        })
    }
}

/// Scheduler-side handle to the running correlator task.
pub struct CorrelatorHandle {
    commands: mpsc::Sender<CorrelatorCommand>,
    matches: mpsc::Receiver<AckMatch>,
    task: JoinHandle<()>,
}

impl CorrelatorHandle {
    pub async fn arm(&self, probe: ProbeRequest) {
        if self.commands.send(CorrelatorCommand::Arm(probe)).await.is_err() {
            tracing::debug!("correlator gone, probe not armed");
        }
    }

    pub async fn clear(&self) {
        let _ = self.commands.send(CorrelatorCommand::Clear).await;
    }

    /// Next correlated acknowledgment. `None` once the correlator stopped.
    pub async fn next_match(&mut self) -> Option<AckMatch> {
        self.matches.recv().await
    }

    /// Matches already delivered, without waiting.
    pub fn try_next_match(&mut self) -> Option<AckMatch> {
        self.matches.try_recv().ok()
    }

    /// Stop the task and wait for it to finish its current event.
    pub async fn shutdown(self) {
        let CorrelatorHandle {
            commands,
            matches,
            task,
        } = self;
        drop(commands);
        drop(matches);
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "correlator task failed");
        }
    }
}
