use crate::common::types::{MessagePriority, MessageStatus, MessageType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default retry budget for a new message
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A unit of work flowing through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub correlation_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        message_type: MessageType,
        priority: MessagePriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload: payload.into(),
            message_type,
            priority,
            correlation_id: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            error_message: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Payload as UTF-8, if it is
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Payload decoded as JSON, if it is
    pub fn payload_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }

    /// Fresh message carrying the same payload to another topic
    pub fn forward_to(&self, topic: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload: self.payload.clone(),
            message_type: self.message_type,
            priority: self.priority,
            correlation_id: self.correlation_id.clone(),
            retry_count: 0,
            max_retries: self.max_retries,
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            error_message: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
