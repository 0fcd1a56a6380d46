use config::{Environment, File};
use serde::Deserialize;
use shared::nats::NatsOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::{EstimatorParams, Thresholds};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    pub url: String,
    pub telemetry_subject: String,
    pub soc_subject: String,
    pub soh_subject: String,
    pub rul_subject: String,
    pub connect_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            telemetry_subject: "batterie.telemetrie".to_string(),
            soc_subject: "batterie.jumeau.soc".to_string(),
            soh_subject: "batterie.jumeau.soh".to_string(),
            rul_subject: "batterie.jumeau.rul".to_string(),
            connect_timeout_ms: 5_000,
            reconnect_base_ms: 100,
            reconnect_max_ms: 30_000,
        }
    }
}

impl NatsSettings {
    pub fn options(&self) -> NatsOptions {
        NatsOptions {
            url: self.url.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_base: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatterySettings {
    pub nominal_capacity_ah: f64,
    pub sequence_length: usize,
    pub history_retention: usize,
}

impl Default for BatterySettings {
    fn default() -> Self {
        let params = EstimatorParams::default();
        Self {
            nominal_capacity_ah: params.nominal_capacity_ah,
            sequence_length: params.sequence_length,
            history_retention: params.history_retention,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredictorSettings {
    pub model_path: PathBuf,
    pub scaler_path: PathBuf,
    pub timeout_ms: u64,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("rul_model.json"),
            scaler_path: PathBuf::from("scaler.json"),
            timeout_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub json: bool,
}

/// Static startup configuration. Read once, never reloaded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub nats: NatsSettings,
    pub battery: BatterySettings,
    pub thresholds: Thresholds,
    pub predictor: PredictorSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Defaults, then `estimator.toml` (or `path`), then `ESTIMATOR_*`
    /// variables, e.g. `ESTIMATOR_BATTERY__SEQUENCE_LENGTH=12`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = config::Config::builder();
        let builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("estimator").required(false)),
        };

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("ESTIMATOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let battery = &self.battery;
        if !(battery.nominal_capacity_ah.is_finite() && battery.nominal_capacity_ah > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "nominal_capacity_ah must be positive, got {}",
                battery.nominal_capacity_ah
            )));
        }
        if battery.sequence_length == 0 {
            return Err(ConfigError::Invalid("sequence_length must be at least 1".into()));
        }
        if battery.history_retention < battery.sequence_length {
            return Err(ConfigError::Invalid(format!(
                "history_retention ({}) must hold a full window of {}",
                battery.history_retention, battery.sequence_length
            )));
        }

        let t = &self.thresholds;
        let ordered = 0.0 <= t.empty_soc
            && t.empty_soc < t.recharge_soc
            && t.recharge_soc < t.full_soc
            && t.full_soc <= 100.0;
        if !ordered {
            return Err(ConfigError::Invalid(format!(
                "thresholds must satisfy 0 <= empty ({}) < recharge ({}) < full ({}) <= 100",
                t.empty_soc, t.recharge_soc, t.full_soc
            )));
        }
        if t.discharge_current >= 0.0 {
            return Err(ConfigError::Invalid("discharge_current must be negative".into()));
        }
        if t.recharge_current <= 0.0 {
            return Err(ConfigError::Invalid("recharge_current must be positive".into()));
        }

        if self.predictor.timeout_ms == 0 {
            return Err(ConfigError::Invalid("predictor timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn params(&self) -> EstimatorParams {
        EstimatorParams {
            nominal_capacity_ah: self.battery.nominal_capacity_ah,
            sequence_length: self.battery.sequence_length,
            history_retention: self.battery.history_retention,
            thresholds: self.thresholds,
        }
    }

    pub fn predictor_timeout(&self) -> Duration {
        Duration::from_millis(self.predictor.timeout_ms)
    }
}
