//! Online battery estimator.
//!
//! State of charge is coulomb-counted on every sample. State of health is
//! measured once per completed discharge cycle from the charge actually
//! drawn between "full" and "empty", and each measurement feeds the
//! capacity history read by the RUL predictor.
//!
//! The recharge heuristic forces SoC back to 100% when charging resumes
//! near depletion. SoC therefore always restarts from the nominal capacity
//! and does not show capacity fade; SoH is the signal that does.

use serde::{Deserialize, Serialize};
use shared::types::Sample;
use thiserror::Error;

use crate::history::CapacityHistory;
use crate::predictor::{estimate_rul, PredictorError, RulPredictor};

const SECONDS_PER_HOUR: f64 = 3600.0;

/// SoC above which the battery counts as full (%).
pub const FULL_SOC_PERCENT: f64 = 98.0;
/// SoC below which a discharge cycle is complete (%).
pub const EMPTY_SOC_PERCENT: f64 = 2.0;
/// SoC below which resumed charging resets SoC to 100% (%).
pub const RECHARGE_SOC_PERCENT: f64 = 5.0;
/// Charge current that counts as "charging resumed" (A).
pub const RECHARGE_CURRENT_A: f64 = 0.5;
/// Discharge current that opens a discharge cycle (A, negative).
pub const DISCHARGE_CURRENT_A: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub full_soc: f64,
    pub empty_soc: f64,
    pub recharge_soc: f64,
    pub recharge_current: f64,
    pub discharge_current: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            full_soc: FULL_SOC_PERCENT,
            empty_soc: EMPTY_SOC_PERCENT,
            recharge_soc: RECHARGE_SOC_PERCENT,
            recharge_current: RECHARGE_CURRENT_A,
            discharge_current: DISCHARGE_CURRENT_A,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorParams {
    pub nominal_capacity_ah: f64,
    /// Window length L fed to the predictor.
    pub sequence_length: usize,
    pub history_retention: usize,
    pub thresholds: Thresholds,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            nominal_capacity_ah: 2.2,
            sequence_length: 10,
            history_retention: 512,
            thresholds: Thresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorState {
    /// Percent of nominal capacity, within [0, 100].
    pub soc: f64,
    /// Percent of nominal capacity, within [0, 100].
    pub soh: f64,
    pub rul: Option<u32>,
    pub last_sample_time: Option<f64>,
    pub in_discharge_cycle: bool,
    /// Ah drawn since the current discharge cycle started.
    pub accumulated_discharge_ah: f64,
    pub capacity_history: CapacityHistory,
    pub last_voltage: Option<f64>,
    pub last_temperature: Option<f64>,
}

impl EstimatorState {
    pub fn new(history_retention: usize) -> Self {
        Self {
            soc: 100.0,
            soh: 100.0,
            rul: None,
            last_sample_time: None,
            in_discharge_cycle: false,
            accumulated_discharge_ah: 0.0,
            capacity_history: CapacityHistory::new(history_retention),
            last_voltage: None,
            last_temperature: None,
        }
    }

    pub fn completed_cycles(&self) -> usize {
        self.capacity_history.len()
    }
}

/// What a processed sample produced, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Charging resumed near depletion; SoC was reset to 100%.
    ChargeCycleStarted,
    DischargeCycleStarted,
    DischargeCycleCompleted { cycle: usize, measured_capacity_ah: f64 },
    SohUpdated(f64),
    RulUpdated(u32),
    /// A RUL was due but the predictor failed; the previous value stands.
    RulSkipped(PredictorError),
    /// Always the last event of a processed sample.
    SocUpdated(f64),
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("sample interval of {dt}s is not positive")]
pub struct DegenerateIntervalError {
    pub dt: f64,
}

/// Applies one sample to `state` and returns the next state with the
/// events it produced. A non-positive interval leaves `state` untouched.
pub fn process_sample(
    state: &EstimatorState,
    sample: &Sample,
    params: &EstimatorParams,
    predictor: Option<&dyn RulPredictor>,
) -> Result<(EstimatorState, Vec<Event>), DegenerateIntervalError> {
    let mut next = state.clone();
    let events = apply_sample(&mut next, sample, params, predictor)?;
    Ok((next, events))
}

/// In-place form of [`process_sample`]. The interval is validated before
/// anything is written, so a rejected sample leaves `state` unchanged.
pub fn apply_sample(
    state: &mut EstimatorState,
    sample: &Sample,
    params: &EstimatorParams,
    predictor: Option<&dyn RulPredictor>,
) -> Result<Vec<Event>, DegenerateIntervalError> {
    let limits = &params.thresholds;

    let dt = match state.last_sample_time {
        Some(last) => {
            let dt = sample.timestamp - last;
            // Also catches NaN.
            if !(dt > 0.0) {
                return Err(DegenerateIntervalError { dt });
            }
            Some(dt)
        }
        None => None,
    };

    let mut events = Vec::new();
    state.last_sample_time = Some(sample.timestamp);
    state.last_voltage = Some(sample.voltage);
    state.last_temperature = Some(sample.temperature);

    // First sample: baseline only.
    let Some(dt) = dt else {
        events.push(Event::SocUpdated(state.soc));
        return Ok(events);
    };

    let current = sample.current;

    if state.soc < limits.recharge_soc && current > limits.recharge_current {
        state.soc = 100.0;
        events.push(Event::ChargeCycleStarted);
    }

    let delta_charge_ah = current * dt / SECONDS_PER_HOUR;
    let delta_soc = delta_charge_ah / params.nominal_capacity_ah * 100.0;
    state.soc = (state.soc + delta_soc).clamp(0.0, 100.0);

    if state.soc > limits.full_soc && current < limits.discharge_current && !state.in_discharge_cycle {
        state.in_discharge_cycle = true;
        state.accumulated_discharge_ah = 0.0;
        events.push(Event::DischargeCycleStarted);
    }

    // Charging blips inside a cycle are ignored, not subtracted.
    if state.in_discharge_cycle && current < 0.0 {
        state.accumulated_discharge_ah += delta_charge_ah.abs();
    }

    let mut appended = false;
    if state.soc < limits.empty_soc && state.in_discharge_cycle {
        state.in_discharge_cycle = false;
        let measured = state.accumulated_discharge_ah;

        if measured > 0.0 {
            state.soh = (measured / params.nominal_capacity_ah * 100.0).clamp(0.0, 100.0);
            state.capacity_history.push(measured);
            appended = true;

            events.push(Event::DischargeCycleCompleted {
                cycle: state.capacity_history.len(),
                measured_capacity_ah: measured,
            });
            events.push(Event::SohUpdated(state.soh));
        }
    }

    if appended && state.capacity_history.len() >= params.sequence_length {
        if let Some(predictor) = predictor {
            match state.capacity_history.window(params.sequence_length) {
                Some(window) => match estimate_rul(predictor, &window) {
                    Ok(rul) => {
                        state.rul = Some(rul);
                        events.push(Event::RulUpdated(rul));
                    }
                    Err(e) => events.push(Event::RulSkipped(e)),
                },
                None => events.push(Event::RulSkipped(PredictorError::ShapeMismatch {
                    expected: params.sequence_length,
                    actual: state.capacity_history.retained().count(),
                })),
            }
        }
    }

    events.push(Event::SocUpdated(state.soc));
    Ok(events)
}

/// Owns one estimator state and serializes every mutation through
/// `ingest`.
pub struct Estimator {
    state: EstimatorState,
    params: EstimatorParams,
    predictor: Option<Box<dyn RulPredictor>>,
}

impl Estimator {
    pub fn new(params: EstimatorParams, predictor: Option<Box<dyn RulPredictor>>) -> Self {
        Self {
            state: EstimatorState::new(params.history_retention),
            params,
            predictor,
        }
    }

    pub fn ingest(&mut self, sample: &Sample) -> Result<Vec<Event>, DegenerateIntervalError> {
        apply_sample(&mut self.state, sample, &self.params, self.predictor.as_deref())
    }

    pub fn state(&self) -> &EstimatorState {
        &self.state
    }

    pub fn params(&self) -> &EstimatorParams {
        &self.params
    }

    pub fn has_predictor(&self) -> bool {
        self.predictor.is_some()
    }
}
