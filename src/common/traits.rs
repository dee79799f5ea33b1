//! Shared traits and interfaces
//!
//! The seams between the messaging core and the outside world: the broker
//! transport on one side, pluggable pipeline stages on the other. Keeping
//! them as traits lets every component run against the in-memory broker in
//! tests.

use crate::common::types::QoS;
use crate::errors::{PipelineError, TransportError};
use crate::pipeline::message::Message;
use crate::registry::BrokerEndpoint;
use crate::transport::TransportEvent;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// A single client session against one broker endpoint.
///
/// Implementations report connection changes and inbound publishes through
/// the event channel handed to their factory, never by calling back into the
/// owner directly.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the session and wait for the broker to acknowledge it
    async fn connect(&self) -> Result<(), TransportError>;

    /// Publish a payload on a topic
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Close the session cleanly
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Builds transports for a given endpoint
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        client_id: &str,
        endpoint: &BrokerEndpoint,
        events: UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Transport>;
}

/// First pipeline stage. A rejection is terminal for the message.
pub trait Validator: Send + Sync {
    fn validate(&self, message: &Message) -> Result<(), PipelineError>;
}

/// Second pipeline stage, applied in registration order
pub trait Transformer: Send + Sync {
    fn transform(&self, message: Message) -> Result<Message, PipelineError>;
}

/// What a processor decided about a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handled; nothing further
    Done,
    /// Handled; also deliver a copy to this topic
    Forward(String),
    /// Failed; eligible for retry
    Failed(String),
}

/// Final pipeline stage, applied in registration order
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, message: &Message) -> ProcessOutcome;
}
