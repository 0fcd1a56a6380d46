//! Telemetry fixtures for the scenario tests.
//!
//! Streams mimic a bench rig: a constant-current discharge sampled every
//! two seconds for as long as the cell's real capacity lasts, then a short
//! constant-current charge, then a pause.

use shared::types::Sample;

pub const DISCHARGE_CURRENT_A: f64 = -1.5;
pub const CHARGE_CURRENT_A: f64 = 1.0;
pub const DISCHARGE_STEP_S: f64 = 2.0;
pub const CHARGE_STEP_S: f64 = 1.0;
pub const CHARGE_SAMPLES: usize = 10;
pub const PAUSE_S: f64 = 5.0;

pub struct CycleStream {
    clock: f64,
    samples: Vec<Sample>,
}

impl CycleStream {
    /// Starts with one idle sample so the estimator has its baseline
    /// before the first cycle.
    pub fn new() -> Self {
        let mut stream = Self {
            clock: 0.0,
            samples: Vec::new(),
        };
        stream.emit(0.0, 4.2, 25.0);
        stream
    }

    fn emit(&mut self, current: f64, voltage: f64, temperature: f64) {
        self.samples.push(Sample {
            current,
            voltage,
            temperature,
            timestamp: self.clock,
        });
    }

    /// Discharges `capacity_ah` then recharges.
    pub fn cycle(mut self, capacity_ah: f64) -> Self {
        let duration = capacity_ah / DISCHARGE_CURRENT_A.abs() * 3600.0;
        let steps = (duration / DISCHARGE_STEP_S) as usize;
        let voltage_drop = (4.2 - 3.0) / steps.max(1) as f64;

        self.clock += PAUSE_S;
        let mut voltage = 4.2;
        let mut temperature = 25.0;
        for step in 0..steps {
            if step > 0 {
                self.clock += DISCHARGE_STEP_S;
            }
            voltage -= voltage_drop;
            temperature += 0.01;
            self.emit(DISCHARGE_CURRENT_A, voltage, temperature);
        }

        for i in 0..CHARGE_SAMPLES {
            self.clock += CHARGE_STEP_S;
            self.emit(CHARGE_CURRENT_A, 3.0 + i as f64 * 0.12, 28.0);
        }
        self
    }

    pub fn cycles(self, count: usize, capacity_ah: f64) -> Self {
        (0..count).fold(self, |stream, _| stream.cycle(capacity_ah))
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }
}

impl Default for CycleStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a sample the way a replaying source would.
pub fn to_payload(sample: &Sample) -> Vec<u8> {
    format!(
        r#"{{"courant": {}, "tension": {}, "temperature": {}, "timestamp": {}}}"#,
        sample.current, sample.voltage, sample.temperature, sample.timestamp
    )
    .into_bytes()
}

/// Deterministic pseudo-random generator for fuzz-style streams.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Uniform in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}
