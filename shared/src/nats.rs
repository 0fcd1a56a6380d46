use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use std::time::Duration;

use crate::error::ChannelError;
use crate::logger::log_publish;

/// Destination for outbound twin messages.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), ChannelError>;

    async fn flush(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NatsOptions {
    pub url: String,
    pub connect_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            connect_timeout: Duration::from_secs(5),
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff, `base * 2^attempts`, capped at `max`.
pub fn reconnect_delay(attempts: usize, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempts.min(16) as u32);
    base.saturating_mul(factor).min(max)
}

pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connects once. The initial attempt is not retried: an unreachable
    /// server at startup is fatal. After that the client's connector
    /// retries without an attempt limit, pacing itself with
    /// `reconnect_delay`; the subscription only ends when the client is
    /// dropped.
    pub async fn connect(options: &NatsOptions) -> Result<Self, ChannelError> {
        let base = options.reconnect_base;
        let max = options.reconnect_max;

        let connect_options = ConnectOptions::new()
            .connection_timeout(options.connect_timeout)
            .reconnect_delay_callback(move |attempts| reconnect_delay(attempts, base, max))
            .event_callback(|event| async move {
                match event {
                    Event::Disconnected => tracing::warn!("NATS disconnected, reconnecting"),
                    Event::Connected => tracing::info!("NATS connected"),
                    other => tracing::debug!(event = ?other, "NATS event"),
                }
            });

        let client = connect_options
            .connect(options.url.as_str())
            .await
            .map_err(|e| ChannelError::Connect {
                url: options.url.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(url = %options.url, "Connected to NATS");

        Ok(Self { client })
    }

    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber, ChannelError> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| ChannelError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl EventSink for NatsClient {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        log_publish(subject, payload.len());

        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| ChannelError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn flush(&self) -> Result<(), ChannelError> {
        self.client
            .flush()
            .await
            .map_err(|e| ChannelError::Flush(e.to_string()))
    }
}
