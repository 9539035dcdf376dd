//! The probe loop.
//!
//! One run connects, then alternates between sending a probe and counting
//! down the interval one second at a time until stopped. Every suspension
//! point also watches the stop signal, so a stop takes effect within the
//! current second: the countdown is abandoned, no further probe goes out,
//! the session is closed and all counters are reset.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};

use meshtenna_common::models::{OutboundProbe, ProbeRequest};
use meshtenna_common::protocol::{Notice, SchedulerPhase, SessionStatus};

use crate::config::TestConfig;
use crate::connection::{ConnectionError, ConnectionManager};
use crate::correlator::{AckCorrelator, AckMatch, CorrelatorHandle, SampleContext};
use crate::persistence::PersistenceQueue;
use crate::storage::Storage;
use crate::transport::Transport;

const NOTICE_CHANNEL_CAPACITY: usize = 32;
const TICK: Duration = Duration::from_secs(1);

pub const STOPPED_BY_USER: &str = "Test stopped by user.";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("connection failed: {0}")]
    Connect(#[source] ConnectionError),
}

/// Counters and timers of the current run.
#[derive(Debug, Clone, Default)]
pub struct TestSession {
    pub running: bool,
    pub interval_seconds: u32,
    pub sent_count: u64,
    pub ack_count: u64,
    pub start_time: Option<Instant>,
}

impl TestSession {
    fn start(&mut self, interval_seconds: u32) {
        *self = Self {
            running: true,
            interval_seconds,
            sent_count: 0,
            ack_count: 0,
            start_time: Some(Instant::now()),
        };
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What a finished run achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    pub sent: u64,
    pub acked: u64,
    pub elapsed: Duration,
}

/// `HH:MM:SS`; hours keep counting past 99.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Fresh nonzero packet id, distinct from the previous one.
fn next_correlation_id(previous: Option<u32>) -> u32 {
    let mut rng = rand::rng();
    loop {
        let id = rng.random_range(1..=u32::MAX);
        if Some(id) != previous {
            return id;
        }
    }
}

/// Resolves once a stop is requested. A dropped sender never stops the run.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let closed = stop.wait_for(|stopped| *stopped).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

enum Flow {
    Continue,
    Stopped,
}

pub struct ProbeScheduler<T: Transport, S> {
    config: TestConfig,
    connection: ConnectionManager<T>,
    persistence: PersistenceQueue<S>,
    session: TestSession,
    last_id: Option<u32>,
    status: watch::Sender<SessionStatus>,
    notices: broadcast::Sender<Notice>,
}

impl<T: Transport, S: Storage> ProbeScheduler<T, S> {
    pub fn new(config: TestConfig, transport: T, persistence: PersistenceQueue<S>) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            config,
            connection: ConnectionManager::new(transport),
            persistence,
            session: TestSession::default(),
            last_id: None,
            status,
            notices,
        }
    }

    /// Status snapshots, refreshed at least once per second while running.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn session(&self) -> &TestSession {
        &self.session
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Execute one test run until `stop` turns true.
    ///
    /// Returns an error only when the connection could not be opened; the
    /// scheduler is back in `Idle` either way.
    pub async fn run(
        &mut self,
        mut stop: watch::Receiver<bool>,
    ) -> Result<SessionSummary, SchedulerError> {
        let target = self.config.target.clone();
        self.publish(SchedulerPhase::Connecting, None);
        tracing::info!(
            antenna = %self.config.antenna_name,
            location = %self.config.location,
            destination = %self.config.destination_node_id,
            interval = self.config.interval_seconds,
            "starting test"
        );

        let connected = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => None,
            result = self.connection.connect(&target) => Some(result),
        };

        let events = match connected {
            Some(Ok(events)) => events,
            Some(Err(e)) => {
                self.publish(SchedulerPhase::ConnectionFailed, None);
                self.notify(Notice::error(format!("Connection error: {e}")));
                self.publish(SchedulerPhase::Idle, None);
                return Err(SchedulerError::Connect(e));
            }
            None => {
                // The in-flight connect was dropped; make sure nothing lingers.
                self.connection.disconnect().await;
                self.notify(Notice::info(STOPPED_BY_USER));
                self.publish(SchedulerPhase::Idle, None);
                tracing::info!("test stopped while connecting");
                return Ok(SessionSummary::default());
            }
        };

        let mut correlator = AckCorrelator::new(
            self.config.destination_node_id.clone(),
            SampleContext::from_config(&self.config),
            self.persistence.clone(),
            self.notices.clone(),
        )
        .spawn(events);

        self.session.start(self.config.interval_seconds);
        self.publish(SchedulerPhase::Armed, None);

        loop {
            if *stop.borrow() {
                break;
            }
            if let Flow::Stopped = self.send_probe(&mut stop, &correlator).await {
                break;
            }
            if let Flow::Stopped = self.count_down(&mut stop, &mut correlator).await {
                break;
            }
        }

        Ok(self.finish(correlator).await)
    }

    /// Arm the correlator and transmit one probe. A stop abandons whatever
    /// is still in flight.
    async fn send_probe(
        &mut self,
        stop: &mut watch::Receiver<bool>,
        correlator: &CorrelatorHandle,
    ) -> Flow {
        self.publish(SchedulerPhase::Sending, None);

        let correlation_id = next_correlation_id(self.last_id);
        self.last_id = Some(correlation_id);
        let destination = self.config.destination_node_id.clone();

        // Armed before sending so an immediate ACK finds its probe.
        let armed = correlator.arm(ProbeRequest {
            correlation_id,
            destination_node_id: destination.clone(),
            sent_at: Utc::now(),
        });
        tokio::select! {
            biased;
            _ = stop_requested(stop) => return Flow::Stopped,
            _ = armed => {}
        }

        let probe = OutboundProbe {
            correlation_id,
            destination,
            payload: self.config.payload.clone(),
            want_ack: true,
        };

        let sent = tokio::select! {
            biased;
            _ = stop_requested(stop) => {
                tracing::info!(id = correlation_id, "stop requested during send, probe abandoned");
                return Flow::Stopped;
            }
            result = self.connection.send(&probe) => result,
        };

        match sent {
            Ok(on_air) => {
                self.session.sent_count += 1;
                self.connection.clear_error();
                if on_air != correlation_id {
                    tracing::debug!(requested = correlation_id, on_air, "transport chose its own packet id");
                    self.last_id = Some(on_air);
                    let rearmed = correlator.arm(ProbeRequest {
                        correlation_id: on_air,
                        destination_node_id: probe.destination.clone(),
                        sent_at: Utc::now(),
                    });
                    tokio::select! {
                        biased;
                        _ = stop_requested(stop) => return Flow::Stopped,
                        _ = rearmed => {}
                    }
                }
                tracing::info!(
                    id = on_air,
                    to = %probe.destination,
                    sent = self.session.sent_count,
                    "probe sent"
                );
            }
            Err(e) => {
                correlator.clear().await;
                tracing::warn!(error = %e, "probe send failed");
                self.connection.report_error(format!("Error: {e}"));
                self.notify(Notice::error(format!("Error: {e}")));
            }
        }
        Flow::Continue
    }

    async fn count_down(
        &mut self,
        stop: &mut watch::Receiver<bool>,
        correlator: &mut CorrelatorHandle,
    ) -> Flow {
        let mut remaining = self.session.interval_seconds;
        let mut ticks = tokio::time::interval_at(Instant::now() + TICK, TICK);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.publish(SchedulerPhase::Counting, Some(remaining));

        while remaining > 0 {
            tokio::select! {
                biased;
                _ = stop_requested(stop) => return Flow::Stopped,
                Some(found) = correlator.next_match() => {
                    self.record_ack(found);
                    self.publish(SchedulerPhase::Counting, Some(remaining));
                }
                _ = ticks.tick() => {
                    remaining -= 1;
                    tracing::trace!(remaining, "countdown");
                    self.publish(SchedulerPhase::Counting, Some(remaining));
                }
            }
        }
        Flow::Continue
    }

    fn record_ack(&mut self, found: AckMatch) {
        self.session.ack_count += 1;
        tracing::debug!(
            id = found.probe.correlation_id,
            persisted = found.persisted,
            acked = self.session.ack_count,
            "ack counted"
        );
    }

    async fn finish(&mut self, mut correlator: CorrelatorHandle) -> SessionSummary {
        self.publish(SchedulerPhase::Stopped, None);

        while let Some(found) = correlator.try_next_match() {
            self.record_ack(found);
        }
        correlator.clear().await;
        correlator.shutdown().await;
        self.connection.disconnect().await;

        let summary = SessionSummary {
            sent: self.session.sent_count,
            acked: self.session.ack_count,
            elapsed: self.session.elapsed(),
        };
        self.session.reset();
        self.last_id = None;

        tracing::info!(
            sent = summary.sent,
            acked = summary.acked,
            elapsed = %format_elapsed(summary.elapsed),
            "test stopped"
        );
        self.notify(Notice::info(STOPPED_BY_USER));
        self.publish(SchedulerPhase::Idle, None);
        summary
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn publish(&self, phase: SchedulerPhase, countdown: Option<u32>) {
        let snapshot = SessionStatus {
            phase,
            connection: self.connection.status(),
            countdown,
            elapsed: format_elapsed(self.session.elapsed()),
            sent: self.session.sent_count,
            acked: self.session.ack_count,
        };
        self.status.send_replace(snapshot);
    }
}
