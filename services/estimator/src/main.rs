use anyhow::Context;
use futures::StreamExt;
use shared::logger::init_logger;
use shared::nats::{EventSink, NatsClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use estimator_service::{build_estimator, session, Session, Settings, StopReason, Subjects};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref()).context("loading configuration")?;

    init_logger(settings.logging.json);
    tracing::info!(
        nominal_capacity_ah = settings.battery.nominal_capacity_ah,
        sequence_length = settings.battery.sequence_length,
        "Starting battery estimator"
    );

    let estimator = build_estimator(&settings);

    let client = Arc::new(
        NatsClient::connect(&settings.nats.options())
            .await
            .context("connecting to telemetry channel")?,
    );
    let subscriber = client
        .subscribe(&settings.nats.telemetry_subject)
        .await
        .context("subscribing to telemetry")?;
    tracing::info!(subject = %settings.nats.telemetry_subject, "Subscribed to telemetry");

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let sink: Arc<dyn EventSink> = client;
    let session = Session::new(estimator, Subjects::from(&settings.nats));
    let stopped = session::run(session, subscriber.map(|message| message.payload), sink, shutdown)
        .await
        .context("running estimator")?;

    match stopped.reason {
        StopReason::Shutdown => Ok(()),
        StopReason::StreamClosed => anyhow::bail!("telemetry subscription closed"),
        StopReason::PublisherStopped => anyhow::bail!("publisher stopped"),
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
