//! Broker transports
//!
//! A transport owns one client session. It reports what happens on the wire
//! as [`TransportEvent`]s so that the owning connection can react (reconnect,
//! hand inbound publishes to the pipeline) without sharing state with the
//! transport's I/O task.

pub mod memory;
pub mod mqtt;

use chrono::{DateTime, Utc};

pub use memory::{MemoryBroker, MemoryTransport, MemoryTransportFactory};
pub use mqtt::{MqttTransport, MqttTransportFactory};

/// A publish received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundFrame {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Session-level events emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Broker acknowledged the session
    Connected,
    /// Session ended. `clean` is true only for a client-requested disconnect.
    Disconnected { clean: bool, reason: String },
    Message(InboundFrame),
}
