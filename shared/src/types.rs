//! Wire contract between the telemetry source, the estimator and observers.
//!
//! Inbound field names are the ones the telemetry source emits
//! (`courant`, `tension`, `temperature`); outbound messages carry one value
//! each and are published on their own subject.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::DecodeError;

/// One telemetry reading. Current is signed, negative while discharging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Amperes.
    pub current: f64,
    /// Volts.
    pub voltage: f64,
    /// Degrees Celsius.
    pub temperature: f64,
    /// Monotonic seconds.
    pub timestamp: f64,
}

/// Raw telemetry payload as published by the source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(rename = "courant")]
    pub current: f64,
    #[serde(rename = "tension")]
    pub voltage: f64,
    pub temperature: f64,
    /// Only present on replayed streams. Live sources leave it out and the
    /// receiver stamps the sample on arrival.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl TelemetryPayload {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let decoded: TelemetryPayload = serde_json::from_slice(payload)?;

        if !decoded.current.is_finite() {
            return Err(DecodeError::NonFinite("courant"));
        }
        if !decoded.voltage.is_finite() {
            return Err(DecodeError::NonFinite("tension"));
        }
        if !decoded.temperature.is_finite() {
            return Err(DecodeError::NonFinite("temperature"));
        }
        if matches!(decoded.timestamp, Some(t) if !t.is_finite()) {
            return Err(DecodeError::NonFinite("timestamp"));
        }

        Ok(decoded)
    }

    /// Builds a sample, preferring the payload's own timestamp over the
    /// arrival time.
    pub fn into_sample(self, arrival_secs: f64) -> Sample {
        Sample {
            current: self.current,
            voltage: self.voltage,
            temperature: self.temperature,
            timestamp: self.timestamp.unwrap_or(arrival_secs),
        }
    }
}

/// Rounds to the two-decimal precision used on the outbound subjects.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SocMessage {
    pub soc: f64,
}

impl SocMessage {
    pub fn new(soc: f64) -> Self {
        Self { soc: round2(soc) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SohMessage {
    pub soh: f64,
}

impl SohMessage {
    pub fn new(soh: f64) -> Self {
        Self { soh: round2(soh) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulMessage {
    pub rul: u32,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}
