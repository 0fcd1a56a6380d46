pub mod error;
pub mod logger;
pub mod nats;
pub mod types;


pub use error::{ChannelError, DecodeError};
pub use nats::{EventSink, NatsClient, NatsOptions};
pub use types::{RulMessage, Sample, SocMessage, SohMessage, TelemetryPayload};
