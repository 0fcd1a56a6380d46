//! Transport adapter around one `Estimator`.
//!
//! Messages are consumed by a single task in arrival order. Each message
//! is processed on the blocking pool, since a due RUL prediction may wait
//! on the predictor for up to its timeout. Outbound messages go through
//! one ordered queue to one publisher task, so the messages of a sample
//! are never reordered even though publishing runs concurrently with the
//! next sample.

use futures::{Stream, StreamExt};
use shared::logger::{log_cycle_completed, log_status};
use shared::nats::EventSink;
use shared::types::{encode, RulMessage, SocMessage, SohMessage, TelemetryPayload};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{self, JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NatsSettings;
use crate::engine::{Estimator, Event};

const PUBLISH_QUEUE_DEPTH: usize = 1024;
/// Consecutive rejected intervals between two stall warnings.
const STALL_WARN_EVERY: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    pub soc: String,
    pub soh: String,
    pub rul: String,
}

impl From<&NatsSettings> for Subjects {
    fn from(settings: &NatsSettings) -> Self {
        Self {
            soc: settings.soc_subject.clone(),
            soh: settings.soh_subject.clone(),
            rul: settings.rul_subject.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Where sample timestamps come from. Fixed by the first accepted
/// message for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// The stream carries its own `timestamp` field (replay).
    Payload,
    /// Samples are stamped on arrival.
    Arrival,
}

pub struct Session {
    estimator: Estimator,
    subjects: Subjects,
    started: Instant,
    clock: Option<Clock>,
    rejected_intervals: u64,
}

impl Session {
    pub fn new(estimator: Estimator, subjects: Subjects) -> Self {
        Self {
            estimator,
            subjects,
            started: Instant::now(),
            clock: None,
            rejected_intervals: 0,
        }
    }

    pub fn estimator(&self) -> &Estimator {
        &self.estimator
    }

    pub fn clock(&self) -> Option<Clock> {
        self.clock
    }

    /// Samples dropped in a row for a non-advancing timestamp.
    pub fn rejected_intervals(&self) -> u64 {
        self.rejected_intervals
    }

    /// Decodes and processes one telemetry message. Malformed messages and
    /// degenerate intervals are dropped without touching the state.
    pub fn handle_message(&mut self, payload: &[u8]) -> Vec<Publication> {
        let mut decoded = match TelemetryPayload::decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Dropping malformed telemetry");
                return Vec::new();
            }
        };

        let clock = *self.clock.get_or_insert(match decoded.timestamp {
            Some(_) => Clock::Payload,
            None => Clock::Arrival,
        });
        match clock {
            Clock::Payload if decoded.timestamp.is_none() => {
                warn!("Dropping unstamped telemetry on a stamped stream");
                return Vec::new();
            }
            Clock::Arrival => decoded.timestamp = None,
            Clock::Payload => {}
        }

        let sample = decoded.into_sample(self.started.elapsed().as_secs_f64());
        let events = match self.estimator.ingest(&sample) {
            Ok(events) => events,
            Err(e) => {
                self.rejected_intervals += 1;
                if self.rejected_intervals % STALL_WARN_EVERY == 0 {
                    warn!(
                        rejected = self.rejected_intervals,
                        last_sample_time = ?self.estimator.state().last_sample_time,
                        "Sample timestamps are not advancing, telemetry is being dropped"
                    );
                } else {
                    debug!(error = %e, "Dropping sample");
                }
                return Vec::new();
            }
        };
        self.rejected_intervals = 0;

        let mut publications = Vec::with_capacity(events.len());
        for event in &events {
            self.report(event);
            if let Some(publication) = self.publication(event) {
                publications.push(publication);
            }
        }

        let state = self.estimator.state();
        log_status(state.soc, state.soh, state.rul);
        publications
    }

    fn report(&self, event: &Event) {
        match event {
            Event::ChargeCycleStarted => info!("Charge start detected, SoC reset to 100%"),
            Event::DischargeCycleStarted => info!("Discharge cycle started"),
            Event::DischargeCycleCompleted {
                cycle,
                measured_capacity_ah,
            } => log_cycle_completed(*cycle, *measured_capacity_ah, self.estimator.state().soh),
            Event::RulUpdated(rul) => info!(rul, "New RUL prediction"),
            Event::RulSkipped(e) => warn!(error = %e, "RUL unavailable for this update"),
            Event::SohUpdated(_) | Event::SocUpdated(_) => {}
        }
    }

    fn publication(&self, event: &Event) -> Option<Publication> {
        let (subject, encoded) = match event {
            Event::SocUpdated(soc) => (&self.subjects.soc, encode(&SocMessage::new(*soc))),
            Event::SohUpdated(soh) => (&self.subjects.soh, encode(&SohMessage::new(*soh))),
            Event::RulUpdated(rul) => (&self.subjects.rul, encode(&RulMessage { rul: *rul })),
            _ => return None,
        };

        match encoded {
            Ok(payload) => Some(Publication {
                subject: subject.clone(),
                payload,
            }),
            Err(e) => {
                error!(subject = %subject, error = %e, "Cannot encode outbound message");
                None
            }
        }
    }
}

async fn publish_loop(mut queue: mpsc::Receiver<Publication>, sink: Arc<dyn EventSink>) {
    while let Some(publication) = queue.recv().await {
        if let Err(e) = sink.publish(&publication.subject, publication.payload).await {
            warn!(error = %e, "Publish failed");
        }
    }

    if let Err(e) = sink.flush().await {
        warn!(error = %e, "Flush on shutdown failed");
    }
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown token fired.
    Shutdown,
    /// The telemetry stream ended on its own.
    StreamClosed,
    /// The publisher task went away.
    PublisherStopped,
}

pub struct Stopped {
    pub session: Session,
    pub reason: StopReason,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("estimator task failed: {0}")]
    Worker(#[from] JoinError),
}

/// Consumes `messages` until the stream ends or `shutdown` fires, then
/// drains the publish queue and flushes the sink.
pub async fn run<S, P>(
    mut session: Session,
    mut messages: S,
    sink: Arc<dyn EventSink>,
    shutdown: CancellationToken,
) -> Result<Stopped, SessionError>
where
    S: Stream<Item = P> + Unpin,
    P: AsRef<[u8]> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_DEPTH);
    let publisher = tokio::spawn(publish_loop(rx, sink));

    let reason = 'consume: loop {
        let payload = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                break 'consume StopReason::Shutdown;
            }
            next = messages.next() => match next {
                Some(payload) => payload,
                None => {
                    warn!("Telemetry subscription closed");
                    break 'consume StopReason::StreamClosed;
                }
            },
        };

        let handled = task::spawn_blocking(move || {
            let publications = session.handle_message(payload.as_ref());
            (session, publications)
        })
        .await;

        let publications = match handled {
            Ok((returned, publications)) => {
                session = returned;
                publications
            }
            Err(e) => {
                error!(error = %e, "Estimator task failed");
                drop(tx);
                if let Err(e) = publisher.await {
                    error!(error = %e, "Publisher task failed");
                }
                return Err(SessionError::Worker(e));
            }
        };

        for publication in publications {
            if tx.send(publication).await.is_err() {
                error!("Publisher stopped");
                break 'consume StopReason::PublisherStopped;
            }
        }
    };

    drop(tx);
    if let Err(e) = publisher.await {
        error!(error = %e, "Publisher task failed");
    }

    let state = session.estimator().state();
    info!(
        soc = %format!("{:.2}", state.soc),
        soh = %format!("{:.2}", state.soh),
        cycles = state.completed_cycles(),
        reason = ?reason,
        "Estimator stopped"
    );
    Ok(Stopped { session, reason })
}
