//! RUL predictor contract.
//!
//! A predictor takes the last L measured capacities, normalizes them with
//! the transform fitted at training time, and returns the remaining useful
//! life in cycles. The transform is only ever loaded, never refitted.

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictorLoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("incompatible artifact: {0}")]
    Incompatible(String),
    #[error("cannot start predictor worker: {0}")]
    Worker(#[source] std::io::Error),
}

/// Failure of a single prediction. The update goes out without a RUL.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredictorError {
    #[error("window has {actual} steps, predictor expects {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("predictor produced a non-finite value")]
    NonFinite,
    #[error("prediction exceeded {0:?}")]
    Timeout(Duration),
    #[error("predictor still busy with an earlier window")]
    Busy,
    #[error("predictor unavailable: {0}")]
    Unavailable(String),
}

/// Sequence-in, scalar-out capability. Any trained model (or a stub) can
/// sit behind it.
pub trait RulPredictor: Send + Sync {
    fn sequence_length(&self) -> usize;

    fn normalize(&self, window: &[f64]) -> Result<Vec<f64>, PredictorError>;

    /// Raw prediction for one normalized window (1 × L × 1).
    fn predict(&self, normalized: &[f64]) -> Result<f64, PredictorError>;
}

/// Normalizes, predicts, and converts the output to whole cycles.
pub fn estimate_rul(predictor: &dyn RulPredictor, window: &[f64]) -> Result<u32, PredictorError> {
    let expected = predictor.sequence_length();
    if window.len() != expected {
        return Err(PredictorError::ShapeMismatch {
            expected,
            actual: window.len(),
        });
    }
    let normalized = predictor.normalize(window)?;
    rul_from_prediction(predictor.predict(&normalized)?)
}

/// Truncates toward zero and floors at zero.
pub fn rul_from_prediction(prediction: f64) -> Result<u32, PredictorError> {
    if !prediction.is_finite() {
        return Err(PredictorError::NonFinite);
    }
    Ok(prediction.trunc().max(0.0) as u32)
}

/// Min-max transform persisted next to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub data_min: f64,
    pub data_max: f64,
    #[serde(default = "default_feature_range")]
    pub feature_range: (f64, f64),
}

fn default_feature_range() -> (f64, f64) {
    (0.0, 1.0)
}

impl MinMaxScaler {
    pub fn new(data_min: f64, data_max: f64) -> Self {
        Self {
            data_min,
            data_max,
            feature_range: default_feature_range(),
        }
    }

    pub fn validate(&self) -> Result<(), PredictorLoadError> {
        let (lo, hi) = self.feature_range;
        let values = [self.data_min, self.data_max, lo, hi];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(PredictorLoadError::Incompatible("scaler holds non-finite values".into()));
        }
        if self.data_max < self.data_min {
            return Err(PredictorLoadError::Incompatible("scaler data_max < data_min".into()));
        }
        if hi <= lo {
            return Err(PredictorLoadError::Incompatible("scaler feature_range is empty".into()));
        }
        Ok(())
    }

    pub fn transform(&self, value: f64) -> f64 {
        let (lo, hi) = self.feature_range;
        let range = self.data_max - self.data_min;
        // A constant training feature keeps a unit scale.
        let range = if range == 0.0 { 1.0 } else { range };
        (value - self.data_min) / range * (hi - lo) + lo
    }
}

/// Serialized model architectures the estimator can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SequenceModel {
    /// `bias + Σ weights[i] * x[i]` over the window.
    Linear { weights: Vec<f64>, bias: f64 },
}

impl SequenceModel {
    pub fn sequence_length(&self) -> usize {
        match self {
            SequenceModel::Linear { weights, .. } => weights.len(),
        }
    }

    pub fn forward(&self, input: &[f64]) -> Result<f64, PredictorError> {
        match self {
            SequenceModel::Linear { weights, bias } => {
                if input.len() != weights.len() {
                    return Err(PredictorError::ShapeMismatch {
                        expected: weights.len(),
                        actual: input.len(),
                    });
                }
                let out = weights.iter().zip(input).fold(*bias, |acc, (w, x)| acc + w * x);
                if out.is_finite() {
                    Ok(out)
                } else {
                    Err(PredictorError::NonFinite)
                }
            }
        }
    }
}

/// A model and its scaler, loaded from the training artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactPredictor {
    scaler: MinMaxScaler,
    model: SequenceModel,
}

impl ArtifactPredictor {
    pub fn new(
        scaler: MinMaxScaler,
        model: SequenceModel,
        sequence_length: usize,
    ) -> Result<Self, PredictorLoadError> {
        scaler.validate()?;
        if model.sequence_length() != sequence_length {
            return Err(PredictorLoadError::Incompatible(format!(
                "model window is {} steps, configured sequence length is {}",
                model.sequence_length(),
                sequence_length
            )));
        }
        Ok(Self { scaler, model })
    }

    pub fn load(
        model_path: &Path,
        scaler_path: &Path,
        sequence_length: usize,
    ) -> Result<Self, PredictorLoadError> {
        let model: SequenceModel = read_artifact(model_path)?;
        let scaler: MinMaxScaler = read_artifact(scaler_path)?;
        Self::new(scaler, model, sequence_length)
    }

    pub fn scaler(&self) -> &MinMaxScaler {
        &self.scaler
    }
}

fn read_artifact<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, PredictorLoadError> {
    let raw = std::fs::read(path).map_err(|source| PredictorLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| PredictorLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl RulPredictor for ArtifactPredictor {
    fn sequence_length(&self) -> usize {
        self.model.sequence_length()
    }

    fn normalize(&self, window: &[f64]) -> Result<Vec<f64>, PredictorError> {
        Ok(window.iter().map(|&v| self.scaler.transform(v)).collect())
    }

    fn predict(&self, normalized: &[f64]) -> Result<f64, PredictorError> {
        self.model.forward(normalized)
    }
}

struct PredictRequest {
    window: Vec<f64>,
    reply: Sender<Result<f64, PredictorError>>,
}

/// Runs `predict` on a dedicated worker thread and waits at most `timeout`.
///
/// At most one window is in flight. While the worker is still busy with an
/// earlier (timed-out) window, new windows are refused with `Busy` rather
/// than queued behind it.
pub struct BoundedPredictor {
    inner: Arc<dyn RulPredictor>,
    requests: Sender<PredictRequest>,
    in_flight: Arc<AtomicBool>,
    timeout: Duration,
}

impl BoundedPredictor {
    pub fn spawn(inner: Arc<dyn RulPredictor>, timeout: Duration) -> Result<Self, PredictorLoadError> {
        let (tx, rx) = channel::bounded::<PredictRequest>(1);
        let in_flight = Arc::new(AtomicBool::new(false));
        let worker = Arc::clone(&inner);
        let worker_flag = Arc::clone(&in_flight);

        thread::Builder::new()
            .name("rul-predictor".into())
            .spawn(move || {
                for request in rx {
                    let outcome = worker.predict(&request.window);
                    worker_flag.store(false, Ordering::Release);
                    // The caller may have given up already.
                    let _ = request.reply.send(outcome);
                }
            })
            .map_err(PredictorLoadError::Worker)?;

        Ok(Self {
            inner,
            requests: tx,
            in_flight,
            timeout,
        })
    }
}

impl RulPredictor for BoundedPredictor {
    fn sequence_length(&self) -> usize {
        self.inner.sequence_length()
    }

    fn normalize(&self, window: &[f64]) -> Result<Vec<f64>, PredictorError> {
        self.inner.normalize(window)
    }

    fn predict(&self, normalized: &[f64]) -> Result<f64, PredictorError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(PredictorError::Busy);
        }

        let (reply_tx, reply_rx) = channel::bounded(1);
        let request = PredictRequest {
            window: normalized.to_vec(),
            reply: reply_tx,
        };

        if self.requests.try_send(request).is_err() {
            self.in_flight.store(false, Ordering::Release);
            return Err(PredictorError::Unavailable("worker stopped".into()));
        }

        match reply_rx.recv_timeout(self.timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(PredictorError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(PredictorError::Unavailable("worker dropped the request".into()))
            }
        }
    }
}
