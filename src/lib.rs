//! tablelink - messaging core for live casino table controllers
//!
//! Talks to the image-detection backend and shaker hardware over an MQTT
//! broker: multi-broker failover, a health-aware connection pool, a
//! priority message pipeline and detect-style request/response on top.

pub mod common;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod errors;
pub mod games;
pub mod link;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod transport;

pub use common::types::{
    ConnectionKind, ConnectionState, MessagePriority, MessageStatus, MessageType, QoS,
};
pub use config::{ConfigLoader, LinkConfig};
pub use connection::{ConnectionSettings, ReconnectPolicy, ResilientConnection};
pub use correlator::{CorrelationMode, DetectOutcome, RequestCorrelator};
pub use errors::{LinkError, LinkResult};
pub use games::{DetectParams, GameKind, RoundResult};
pub use link::TableLink;
pub use pipeline::{Message, MessagePipeline, PipelineConfig};
pub use pool::{ConnectionFilter, ConnectionPool, LoadBalancingStrategy, PoolConfig};
pub use registry::{BrokerEndpoint, EndpointRegistry, GameProfile};
