//! Stock validators

use super::message::Message;
use crate::common::traits::Validator;
use crate::errors::PipelineError;
use serde_json::Value;

/// Requires the payload to be a UTF-8 JSON object
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPayloadValidator;

impl Validator for JsonPayloadValidator {
    fn validate(&self, message: &Message) -> Result<(), PipelineError> {
        match serde_json::from_slice::<Value>(&message.payload) {
            Ok(Value::Object(_)) => Ok(()),
            Ok(_) => Err(PipelineError::Validation(format!(
                "payload on {} is not a JSON object",
                message.topic
            ))),
            Err(e) => Err(PipelineError::Validation(format!(
                "payload on {} is not JSON: {}",
                message.topic, e
            ))),
        }
    }
}

/// Rejects empty topics and wildcards on concrete messages
#[derive(Debug, Default, Clone, Copy)]
pub struct TopicValidator;

impl Validator for TopicValidator {
    fn validate(&self, message: &Message) -> Result<(), PipelineError> {
        if message.topic.trim().is_empty() {
            return Err(PipelineError::Validation("empty topic".to_string()));
        }
        if message.topic.contains('+') || message.topic.contains('#') {
            return Err(PipelineError::Validation(format!(
                "wildcard in concrete topic {}",
                message.topic
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{MessagePriority, MessageType};

    fn msg(topic: &str, payload: &[u8]) -> Message {
        Message::new(topic, payload.to_vec(), MessageType::Notification, MessagePriority::Normal)
    }

    #[test]
    fn test_json_validator() {
        let v = JsonPayloadValidator;
        assert!(v.validate(&msg("t", br#"{"command":"detect"}"#)).is_ok());
        assert!(v.validate(&msg("t", b"[1,2,3]")).is_err());
        assert!(v.validate(&msg("t", b"\xff\xfe")).is_err());
    }

    #[test]
    fn test_topic_validator() {
        let v = TopicValidator;
        assert!(v.validate(&msg("a/b", b"{}")).is_ok());
        assert!(v.validate(&msg("", b"{}")).is_err());
        assert!(v.validate(&msg("a/+/b", b"{}")).is_err());
        assert!(v.validate(&msg("a/#", b"{}")).is_err());
    }
}
