//! Error types for the table messaging core
//!
//! Every fallible internal step maps onto one of the categories below. Public
//! operations on the pool, pipeline and correlator keep their boolean or
//! optional return shapes; these errors are what gets logged and handed to
//! error callbacks.

use crate::common::types::MessagePriority;

/// Root error type for all tablelink operations
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Broker connection errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Local publish failures
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Message pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Low-level transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),
}

/// Errors raised while establishing or tracking broker connections
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("No broker endpoints configured")]
    NoEndpoints,

    #[error("All {attempted} broker endpoints failed")]
    AllEndpointsFailed { attempted: usize },

    #[error("Connect to {address} timed out after {timeout_ms}ms")]
    Timeout { address: String, timeout_ms: u64 },

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection pool exhausted (max {max})")]
    PoolExhausted { max: usize },

    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Reconnect gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Publish failures local to this client
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Client {client_id} is not connected")]
    NotConnected { client_id: String },

    #[error("Transport rejected publish: {0}")]
    Transport(String),
}

/// Message pipeline errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Malformed or non-conforming message; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transform failed: {0}")]
    Transform(String),

    /// Processor failure; retried with priority escalation
    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Queue for {priority} priority is full")]
    QueueFull { priority: MessagePriority },

    #[error("Pipeline is not processing")]
    Stopped,
}

impl PipelineError {
    /// Whether the failure may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Processing(_))
    }
}

/// Errors reported by a `Transport` implementation
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Transport closed")]
    Closed,
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        LinkError::Configuration(ConfigurationError::LoadFailed(e.to_string()))
    }
}

impl From<toml::de::Error> for LinkError {
    fn from(e: toml::de::Error) -> Self {
        LinkError::Configuration(ConfigurationError::LoadFailed(format!(
            "Failed to parse TOML: {}",
            e
        )))
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Configuration(ConfigurationError::LoadFailed(e.to_string()))
    }
}

// Convenience type alias for Results
pub type LinkResult<T> = Result<T, LinkError>;
