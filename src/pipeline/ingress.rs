//! Boundary adapter from broker publishes to pipeline messages
//!
//! Connections push raw [`InboundFrame`]s into a channel; the ingress task
//! classifies each one and enqueues it.

use super::message::Message;
use super::MessagePipeline;
use crate::common::types::{MessagePriority, MessageType};
use crate::transport::InboundFrame;
use serde_json::Value;
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle};
use tracing::{debug, warn};

/// Type, priority and correlation id inferred for an inbound publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub correlation_id: Option<String>,
}

/// Classify a frame. `status_topic` is the game's status topic, if any.
pub fn classify(frame: &InboundFrame, status_topic: Option<&str>) -> Classification {
    let json: Option<Value> = serde_json::from_slice(&frame.payload).ok();
    let object = json.as_ref().and_then(Value::as_object);

    let correlation_id = object
        .and_then(|o| o.get("arg"))
        .and_then(|arg| arg.get("round_id"))
        .and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    let has_key = |key: &str| object.map(|o| o.contains_key(key)).unwrap_or(false);
    let error_flagged = object
        .and_then(|o| o.get("error"))
        .map(|e| match e {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(true),
            Value::String(s) => !s.is_empty() && s != "0",
            _ => true,
        })
        .unwrap_or(false);

    let (message_type, priority) = if has_key("response") {
        (MessageType::Response, MessagePriority::High)
    } else if has_key("command") {
        (MessageType::Command, MessagePriority::Normal)
    } else if status_topic == Some(frame.topic.as_str()) {
        (MessageType::Status, MessagePriority::Normal)
    } else if frame.topic.contains("heartbeat") {
        (MessageType::Heartbeat, MessagePriority::Low)
    } else if error_flagged {
        (MessageType::Error, MessagePriority::High)
    } else {
        (MessageType::Notification, MessagePriority::Normal)
    };

    Classification {
        message_type,
        priority,
        correlation_id,
    }
}

/// Turn a frame into a pipeline message
pub fn to_message(pipeline: &MessagePipeline, frame: InboundFrame, status_topic: Option<&str>) -> Message {
    let class = classify(&frame, status_topic);
    pipeline.create_message(
        frame.topic,
        frame.payload,
        class.message_type,
        class.priority,
        class.correlation_id,
    )
}

/// Drain `frames` into `pipeline` until every sender is gone
pub fn spawn_ingress(
    pipeline: MessagePipeline,
    mut frames: UnboundedReceiver<InboundFrame>,
    status_topic: Option<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let topic = frame.topic.clone();
            let message = to_message(&pipeline, frame, status_topic.as_deref());
            debug!(
                "Inbound {:?}/{} on {}",
                message.message_type, message.priority, topic
            );
            if !pipeline.enqueue(message) {
                warn!("Inbound message on {} dropped", topic);
            }
        }
        debug!("Ingress channel closed");
    })
}
