pub mod config;
pub mod engine;
pub mod history;
pub mod predictor;
pub mod session;


use std::sync::Arc;

pub use config::Settings;
pub use engine::{apply_sample, process_sample, Estimator, EstimatorParams, EstimatorState, Event, Thresholds};
pub use predictor::{ArtifactPredictor, BoundedPredictor, RulPredictor};
pub use session::{Session, SessionError, StopReason, Stopped, Subjects};

/// Loads the predictor artifacts named in `settings`. Any failure leaves
/// the estimator in SoC/SoH-only mode for the whole run.
pub fn load_predictor(settings: &Settings) -> Option<Box<dyn RulPredictor>> {
    let loaded = ArtifactPredictor::load(
        &settings.predictor.model_path,
        &settings.predictor.scaler_path,
        settings.battery.sequence_length,
    )
    .and_then(|artifact| BoundedPredictor::spawn(Arc::new(artifact), settings.predictor_timeout()));

    match loaded {
        Ok(predictor) => {
            tracing::info!(
                model = %settings.predictor.model_path.display(),
                scaler = %settings.predictor.scaler_path.display(),
                "RUL predictor loaded"
            );
            Some(Box::new(predictor))
        }
        Err(e) => {
            tracing::warn!(error = %e, "RUL predictor unavailable, running SoC/SoH only");
            None
        }
    }
}

pub fn build_estimator(settings: &Settings) -> Estimator {
    Estimator::new(settings.params(), load_predictor(settings))
}
