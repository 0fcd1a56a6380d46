//! Logging utilities

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Initialize the logger. `RUST_LOG` wins over the `info` default.
pub fn init_logger(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Log an outbound publication. Metadata only, never the payload.
pub fn log_publish(subject: &str, payload_size: usize) {
    debug!(subject = %subject, payload_size, "Publishing message");
}

/// Per-sample status line.
pub fn log_status(soc: f64, soh: f64, rul: Option<u32>) {
    match rul {
        Some(rul) => debug!(soc = %format!("{:.2}", soc), soh = %format!("{:.2}", soh), rul, "Twin status"),
        None => debug!(soc = %format!("{:.2}", soc), soh = %format!("{:.2}", soh), rul = "N/A", "Twin status"),
    }
}

/// Log a completed discharge cycle.
pub fn log_cycle_completed(cycle: usize, measured_capacity_ah: f64, soh: f64) {
    info!(
        cycle,
        measured_capacity_ah = %format!("{:.3}", measured_capacity_ah),
        soh = %format!("{:.2}", soh),
        "Discharge cycle completed"
    );
}
