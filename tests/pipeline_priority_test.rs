//! Priority ordering, validation and retry behaviour of the pipeline

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tablelink::{
    common::traits::{ProcessOutcome, Processor, Validator},
    errors::PipelineError,
    pipeline::{ingress, JsonPayloadValidator, Message, MessagePipeline, PipelineConfig},
    transport::InboundFrame,
    MessagePriority, MessageStatus, MessageType,
};
use tokio::sync::mpsc;

struct RejectTopic(&'static str);

impl Validator for RejectTopic {
    fn validate(&self, message: &Message) -> Result<(), PipelineError> {
        if message.topic == self.0 {
            Err(PipelineError::Validation(format!("{} is not accepted", self.0)))
        } else {
            Ok(())
        }
    }
}

struct CountingFailure {
    calls: Arc<Mutex<Vec<MessagePriority>>>,
}

#[async_trait]
impl Processor for CountingFailure {
    async fn process(&self, message: &Message) -> ProcessOutcome {
        self.calls.lock().unwrap().push(message.priority);
        ProcessOutcome::Failed("detector offline".to_string())
    }
}

fn failures_sink(pipeline: &MessagePipeline) -> Arc<Mutex<Vec<Message>>> {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    pipeline.on_error(move |m, _| sink.lock().unwrap().push(m.clone()));
    failures
}

#[test]
fn test_dequeue_order_is_critical_to_low() {
    let pipeline = MessagePipeline::new(PipelineConfig::default());
    for priority in [
        MessagePriority::Low,
        MessagePriority::Normal,
        MessagePriority::High,
        MessagePriority::Critical,
    ] {
        let msg = pipeline.create_message("t", b"{}".to_vec(), MessageType::Notification, priority, None);
        assert!(pipeline.enqueue(msg));
    }

    let order: Vec<MessagePriority> = std::iter::from_fn(|| pipeline.dequeue())
        .map(|m| m.priority)
        .collect();
    assert_eq!(
        order,
        vec![
            MessagePriority::Critical,
            MessagePriority::High,
            MessagePriority::Normal,
            MessagePriority::Low
        ]
    );
}

#[tokio::test]
async fn test_tick_takes_one_message_per_level() {
    let pipeline = MessagePipeline::new(PipelineConfig::default());
    for _ in 0..3 {
        pipeline.enqueue(pipeline.create_message("t", b"{}".to_vec(), MessageType::Status, MessagePriority::Low, None));
    }
    pipeline.enqueue(pipeline.create_message("t", b"{}".to_vec(), MessageType::Status, MessagePriority::Critical, None));

    assert_eq!(pipeline.process_tick().await, 2);
    assert_eq!(pipeline.queue_depth(MessagePriority::Low), 2);
    assert_eq!(pipeline.process_tick().await, 1);
    assert_eq!(pipeline.stats().completed, 3);
}

#[tokio::test]
async fn test_validation_failure_is_terminal_without_retry() {
    let pipeline = MessagePipeline::new(PipelineConfig::default());
    pipeline.add_validator(RejectTopic("test/invalid"));
    let calls = Arc::new(Mutex::new(Vec::new()));
    pipeline.add_processor(CountingFailure { calls: calls.clone() });
    let failures = failures_sink(&pipeline);

    let msg = pipeline.create_message("test/invalid", b"{}".to_vec(), MessageType::Command, MessagePriority::Normal, None);
    pipeline.enqueue(msg);
    while pipeline.process_tick().await > 0 {}

    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].status, MessageStatus::Failed);
    assert_eq!(failures[0].retry_count, 0);
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(pipeline.stats().retried, 0);
}

#[tokio::test]
async fn test_processing_failure_escalates_and_stops_at_budget() {
    let pipeline = MessagePipeline::new(PipelineConfig {
        default_max_retries: 2,
        ..Default::default()
    });
    let calls = Arc::new(Mutex::new(Vec::new()));
    pipeline.add_processor(CountingFailure { calls: calls.clone() });
    let failures = failures_sink(&pipeline);

    let msg = pipeline.create_message("t", b"{}".to_vec(), MessageType::Command, MessagePriority::Normal, None);
    pipeline.enqueue(msg);
    while pipeline.process_tick().await > 0 {}

    assert_eq!(
        *calls.lock().unwrap(),
        vec![MessagePriority::Normal, MessagePriority::High, MessagePriority::Critical]
    );
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].retry_count, 2);
    assert!(failures[0].error_message.as_deref().unwrap_or("").contains("detector offline"));
    assert!(pipeline.dequeue().is_none());
}

#[tokio::test]
async fn test_ingress_classifies_and_enqueues() {
    let pipeline = MessagePipeline::new(PipelineConfig::default());
    pipeline.add_validator(JsonPayloadValidator);
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ingress::spawn_ingress(pipeline.clone(), rx, Some("sbo/status".to_string()));

    tx.send(InboundFrame::new(
        "sbo/response",
        br#"{"response":"result","arg":{"round_id":"R1","res":[1,2,3],"err":0}}"#.to_vec(),
    ))
    .unwrap();
    tx.send(InboundFrame::new("sbo/status", br#"{"state":"idle"}"#.to_vec()))
        .unwrap();
    drop(tx);
    handle.await.unwrap();

    assert_eq!(pipeline.queue_depth(MessagePriority::High), 1);
    assert_eq!(pipeline.queue_depth(MessagePriority::Normal), 1);

    while pipeline.process_tick().await > 0 {}
    let response = pipeline
        .find_in_history(|m| m.message_type == MessageType::Response)
        .unwrap();
    assert_eq!(response.correlation_id.as_deref(), Some("R1"));
    assert!(pipeline
        .find_in_history(|m| m.message_type == MessageType::Status)
        .is_some());
}
