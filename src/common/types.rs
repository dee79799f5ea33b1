//! Shared type definitions for the messaging core
//!
//! Small enums used by the pool, pipeline and correlator alike.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a broker connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Maintenance,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Maintenance => "maintenance",
        };
        write!(f, "{}", s)
    }
}

/// Role a pooled connection plays for its game
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Primary,
    Secondary,
    Backup,
    Test,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Primary => write!(f, "primary"),
            ConnectionKind::Secondary => write!(f, "secondary"),
            ConnectionKind::Backup => write!(f, "backup"),
            ConnectionKind::Test => write!(f, "test"),
        }
    }
}

/// Classification of a pipeline message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Command,
    Response,
    Status,
    Error,
    Heartbeat,
    Notification,
}

/// Processing priority. Ordering follows urgency: `Low < Critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl MessagePriority {
    /// Scan order used by the processing loop
    pub const DESCENDING: [MessagePriority; 4] = [
        MessagePriority::Critical,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    /// Queue slot for this level
    pub fn index(self) -> usize {
        self as usize
    }

    /// One level more urgent, saturating at `Critical`
    pub fn escalate(self) -> Self {
        match self {
            MessagePriority::Low => MessagePriority::Normal,
            MessagePriority::Normal => MessagePriority::High,
            MessagePriority::High | MessagePriority::Critical => MessagePriority::Critical,
        }
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessagePriority::Low => write!(f, "low"),
            MessagePriority::Normal => write!(f, "normal"),
            MessagePriority::High => write!(f, "high"),
            MessagePriority::Critical => write!(f, "critical"),
        }
    }
}

/// Processing status of a pipeline message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Failed)
    }
}

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<u8> for QoS {
    fn from(level: u8) -> Self {
        match level {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_escalation_saturates() {
        assert_eq!(MessagePriority::Low.escalate(), MessagePriority::Normal);
        assert_eq!(MessagePriority::Normal.escalate(), MessagePriority::High);
        assert_eq!(MessagePriority::High.escalate(), MessagePriority::Critical);
        assert_eq!(MessagePriority::Critical.escalate(), MessagePriority::Critical);
    }

    #[test]
    fn test_descending_scan_order() {
        let order: Vec<usize> = MessagePriority::DESCENDING.iter().map(|p| p.index()).collect();
        assert_eq!(order, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
        assert_eq!(ConnectionState::Maintenance.to_string(), "maintenance");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(MessageStatus::Completed.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::Retrying.is_terminal());
    }
}
