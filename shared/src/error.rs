//! Error taxonomy for the wire and transport layers.

use thiserror::Error;

/// A telemetry message that could not be turned into a sample.
///
/// Always local: the message is dropped and processing continues.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("field `{0}` is not a finite number")]
    NonFinite(&'static str),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("cannot reach transport at {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("flush failed: {0}")]
    Flush(String),
}
