//! Scenario tests for the online estimator
//!
//! Full discharge/recharge cycles are driven through the public API and
//! through the transport adapter with an in-memory sink.

use std::sync::Arc;

use estimator_service::engine::Event;
use estimator_service::predictor::{MinMaxScaler, PredictorError, SequenceModel};
use estimator_service::{
    ArtifactPredictor, Estimator, EstimatorParams, RulPredictor, Session, StopReason, Subjects,
};
use integration_tests::{to_payload, CycleStream, Lcg};
use parking_lot::Mutex;
use shared::nats::EventSink;
use shared::types::{RulMessage, Sample, SohMessage};
use shared::ChannelError;
use tokio_util::sync::CancellationToken;

const NOMINAL_AH: f64 = 2.2;

// =============================================================================
// Helpers
// =============================================================================

/// Returns `100 - 10 * mean(window)` and keeps every normalized window.
#[derive(Clone)]
struct DeterministicPredictor {
    length: usize,
    windows: Arc<Mutex<Vec<Vec<f64>>>>,
}

impl DeterministicPredictor {
    fn new(length: usize) -> Self {
        Self {
            length,
            windows: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl RulPredictor for DeterministicPredictor {
    fn sequence_length(&self) -> usize {
        self.length
    }

    fn normalize(&self, window: &[f64]) -> Result<Vec<f64>, PredictorError> {
        Ok(window.iter().map(|c| c / NOMINAL_AH).collect())
    }

    fn predict(&self, normalized: &[f64]) -> Result<f64, PredictorError> {
        self.windows.lock().push(normalized.to_vec());
        let mean = normalized.iter().sum::<f64>() / normalized.len() as f64;
        Ok(100.0 - 10.0 * mean)
    }
}

fn params(sequence_length: usize) -> EstimatorParams {
    EstimatorParams {
        sequence_length,
        history_retention: 64,
        ..EstimatorParams::default()
    }
}

/// Feeds every sample and returns the events of each one.
fn drive(estimator: &mut Estimator, samples: &[Sample]) -> Vec<Vec<Event>> {
    samples
        .iter()
        .map(|sample| estimator.ingest(sample).expect("fixture timestamps are increasing"))
        .collect()
}

fn count(events: &[Vec<Event>], predicate: impl Fn(&Event) -> bool) -> usize {
    events.iter().flatten().filter(|e| predicate(e)).count()
}

// =============================================================================
// Single cycle
// =============================================================================

#[test]
fn test_one_cycle_gives_one_soh_update_and_no_rul() {
    let predictor = DeterministicPredictor::new(10);
    let mut estimator = Estimator::new(params(10), Some(Box::new(predictor.clone())));
    let stream = CycleStream::new().cycle(NOMINAL_AH);

    let events = drive(&mut estimator, stream.samples());

    assert_eq!(count(&events, |e| matches!(e, Event::SohUpdated(_))), 1);
    assert_eq!(count(&events, |e| matches!(e, Event::RulUpdated(_))), 0);
    assert_eq!(count(&events, |e| *e == Event::ChargeCycleStarted), 1);
    assert!(predictor.windows.lock().is_empty());

    let state = estimator.state();
    assert_eq!(state.rul, None);
    assert_eq!(state.completed_cycles(), 1);
    let measured = state.capacity_history.latest().unwrap();
    assert!((state.soh - measured / NOMINAL_AH * 100.0).abs() < 1e-9);
    assert!(state.soh > 97.9 && state.soh < 98.1);
    // Recharged.
    assert_eq!(state.soc, 100.0);
}

#[test]
fn test_every_sample_ends_with_soc_update() {
    let mut estimator = Estimator::new(params(10), None);
    let stream = CycleStream::new().cycle(NOMINAL_AH);

    for events in drive(&mut estimator, stream.samples()) {
        assert!(matches!(events.last(), Some(Event::SocUpdated(_))));
        assert_eq!(count(&[events.clone()], |e| matches!(e, Event::SocUpdated(_))), 1);
    }
}

#[test]
fn test_incomplete_cycle_is_not_recorded() {
    let mut estimator = Estimator::new(params(10), None);
    // Stops around 55% SoC, never reaching "empty".
    let stream = CycleStream::new().cycle(1.0);

    let events = drive(&mut estimator, stream.samples());

    assert_eq!(count(&events, |e| matches!(e, Event::SohUpdated(_))), 0);
    let state = estimator.state();
    assert!(state.capacity_history.is_empty());
    assert!(state.in_discharge_cycle);
    assert_eq!(state.soh, 100.0);
}

// =============================================================================
// History and RUL
// =============================================================================

#[test]
fn test_history_grows_once_per_completed_cycle() {
    let mut estimator = Estimator::new(params(10), None);
    let mut stream = CycleStream::new();
    let mut fed = 0;

    for cycle in 1..=4 {
        stream = stream.cycle(NOMINAL_AH);
        let fresh = &stream.samples()[fed..];
        let events = drive(&mut estimator, fresh);
        fed = stream.samples().len();

        assert_eq!(count(&events, |e| matches!(e, Event::DischargeCycleCompleted { .. })), 1);
        assert_eq!(estimator.state().capacity_history.len(), cycle);
    }
}

#[test]
fn test_l_identical_cycles_emit_exactly_one_rul() {
    const L: usize = 3;
    let predictor = DeterministicPredictor::new(L);
    let mut estimator = Estimator::new(params(L), Some(Box::new(predictor.clone())));
    let stream = CycleStream::new().cycles(L, NOMINAL_AH);

    let events = drive(&mut estimator, stream.samples());

    let rul_samples: Vec<&Vec<Event>> = events
        .iter()
        .filter(|evs| evs.iter().any(|e| matches!(e, Event::RulUpdated(_))))
        .collect();
    assert_eq!(rul_samples.len(), 1);

    // Emitted by the sample completing the L-th cycle, after its SoH update.
    let completing = rul_samples[0];
    assert!(completing
        .iter()
        .any(|e| matches!(e, Event::DischargeCycleCompleted { cycle: L, .. })));
    let soh_at = completing.iter().position(|e| matches!(e, Event::SohUpdated(_))).unwrap();
    let rul_at = completing.iter().position(|e| matches!(e, Event::RulUpdated(_))).unwrap();
    assert!(soh_at < rul_at);

    let capacities: Vec<f64> = estimator.state().capacity_history.retained().copied().collect();
    assert_eq!(capacities.len(), L);
    assert!(capacities.iter().all(|c| *c == capacities[0]));

    let windows = predictor.windows.lock();
    assert_eq!(windows.len(), 1);
    let expected = (100.0 - 10.0 * capacities[0] / NOMINAL_AH).trunc() as u32;
    assert_eq!(estimator.state().rul, Some(expected));
}

#[test]
fn test_rul_recomputed_on_each_later_cycle() {
    const L: usize = 3;
    let predictor = DeterministicPredictor::new(L);
    let mut estimator = Estimator::new(params(L), Some(Box::new(predictor.clone())));
    let stream = CycleStream::new().cycles(5, NOMINAL_AH);

    let events = drive(&mut estimator, stream.samples());

    let ruls: Vec<u32> = events
        .iter()
        .flatten()
        .filter_map(|e| match e {
            Event::RulUpdated(rul) => Some(*rul),
            _ => None,
        })
        .collect();
    assert_eq!(ruls.len(), 3);
    // Identical windows, identical predictions.
    assert!(ruls.iter().all(|r| *r == ruls[0]));

    let windows = predictor.windows.lock();
    assert_eq!(windows.len(), 3);
    assert!(windows.iter().all(|w| w.len() == L && *w == windows[0]));
}

#[test]
fn test_trained_artifact_drives_rul() {
    const L: usize = 2;
    let artifact = ArtifactPredictor::new(
        MinMaxScaler::new(1.0, 2.2),
        SequenceModel::Linear {
            weights: vec![-100.0, -200.0],
            bias: 500.0,
        },
        L,
    )
    .unwrap();
    let mut estimator = Estimator::new(params(L), Some(Box::new(artifact)));
    let stream = CycleStream::new().cycles(L, NOMINAL_AH);

    drive(&mut estimator, stream.samples());

    let state = estimator.state();
    let capacity = state.capacity_history.latest().unwrap();
    let normalized = (capacity - 1.0) / (2.2 - 1.0);
    let expected = (500.0 - 300.0 * normalized).trunc() as u32;
    assert_eq!(state.rul, Some(expected));
}

// =============================================================================
// Invariants under arbitrary streams
// =============================================================================

#[test]
fn test_soc_and_soh_stay_bounded() {
    let mut rng = Lcg::new(0x5eed);
    let mut estimator = Estimator::new(params(4), Some(Box::new(DeterministicPredictor::new(4))));
    let mut clock = 0.0;
    let mut last_cycles = 0;

    for _ in 0..20_000 {
        // Occasional duplicate timestamps.
        let dt = if rng.next_f64() < 0.05 { 0.0 } else { rng.next_f64() * 120.0 };
        clock += dt;
        let current = rng.next_f64() * 12.0 - 7.0;
        let sample = Sample {
            current,
            voltage: 3.0 + rng.next_f64() * 1.2,
            temperature: 20.0 + rng.next_f64() * 15.0,
            timestamp: clock,
        };

        let before = estimator.state().clone();
        match estimator.ingest(&sample) {
            Ok(_) => {
                let state = estimator.state();
                assert!((0.0..=100.0).contains(&state.soc), "soc = {}", state.soc);
                assert!((0.0..=100.0).contains(&state.soh), "soh = {}", state.soh);
                assert!(state.accumulated_discharge_ah >= 0.0);
                let cycles = state.completed_cycles();
                assert!(cycles == last_cycles || cycles == last_cycles + 1);
                last_cycles = cycles;
            }
            Err(_) => assert_eq!(estimator.state(), &before),
        }
    }
}

// =============================================================================
// Through the transport adapter
// =============================================================================

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait::async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.published.lock().push((subject.to_string(), payload));
        Ok(())
    }
}

#[tokio::test]
async fn test_adapter_publishes_per_subject() {
    const L: usize = 2;
    let subjects = Subjects {
        soc: "twin.soc".into(),
        soh: "twin.soh".into(),
        rul: "twin.rul".into(),
    };
    let estimator = Estimator::new(params(L), Some(Box::new(DeterministicPredictor::new(L))));
    let session = Session::new(estimator, subjects);

    let samples = CycleStream::new().cycles(3, NOMINAL_AH).into_samples();
    let mut payloads: Vec<Vec<u8>> = samples.iter().map(to_payload).collect();
    payloads.insert(10, b"{\"courant\": null}".to_vec());

    let sink = Arc::new(RecordingSink::default());
    let stopped = estimator_service::session::run(
        session,
        futures::stream::iter(payloads),
        sink.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(stopped.reason, StopReason::StreamClosed);
    let session = stopped.session;

    let published = sink.published.lock();
    let on = |subject: &str| published.iter().filter(|(s, _)| s == subject).count();
    assert_eq!(on("twin.soc"), samples.len());
    assert_eq!(on("twin.soh"), 3);
    assert_eq!(on("twin.rul"), 2);

    // SoH precedes RUL, which precedes that sample's SoC.
    let first_rul = published.iter().position(|(s, _)| s == "twin.rul").unwrap();
    assert_eq!(published[first_rul - 1].0, "twin.soh");
    assert_eq!(published[first_rul + 1].0, "twin.soc");

    let soh: SohMessage = serde_json::from_slice(&published[first_rul - 1].1).unwrap();
    assert!((soh.soh - session.estimator().state().soh).abs() <= 0.005);
    let rul: RulMessage = serde_json::from_slice(&published[first_rul].1).unwrap();
    assert_eq!(Some(rul.rul), session.estimator().state().rul);
}
