//! Priority message pipeline
//!
//! Messages wait in one of four bounded queues. Each processing tick takes
//! at most one message from every level, most urgent first, and runs it
//! through validators, transformers and processors in registration order.
//! Processor failures are retried one priority level higher until the
//! message's retry budget is spent. Completed messages go to a bounded
//! history that the request correlator reads.

pub mod ingress;
pub mod message;
pub mod queue;
pub mod routing;
pub mod validators;

pub use message::Message;
pub use queue::PriorityQueues;
pub use routing::{topic_matches, RouteTable};
pub use validators::{JsonPayloadValidator, TopicValidator};

use crate::common::traits::{ProcessOutcome, Processor, Transformer, Validator};
use crate::common::types::{MessagePriority, MessageStatus, MessageType};
use crate::errors::PipelineError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each priority queue
    pub max_queue_size: usize,
    pub max_history_size: usize,
    pub default_max_retries: u32,
    /// Pause between processing ticks
    pub tick_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_history_size: 100,
            default_max_retries: message::DEFAULT_MAX_RETRIES,
            tick_interval_ms: 10,
        }
    }
}

/// Counters since the pipeline was created
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub forwarded: u64,
    /// Indexed by `MessagePriority::index` (low .. critical)
    pub queue_depths: [usize; 4],
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    forwarded: AtomicU64,
}

pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;
pub type PipelineErrorCallback = Arc<dyn Fn(&Message, &PipelineError) + Send + Sync>;

#[derive(Default)]
struct Stages {
    validators: Vec<Arc<dyn Validator>>,
    transformers: Vec<Arc<dyn Transformer>>,
    processors: Vec<Arc<dyn Processor>>,
    message_callbacks: Vec<MessageCallback>,
    error_callbacks: Vec<PipelineErrorCallback>,
}

/// Priority-queued validate/transform/process/route pipeline
#[derive(Clone)]
pub struct MessagePipeline {
    config: PipelineConfig,
    queues: Arc<PriorityQueues>,
    stages: Arc<RwLock<Stages>>,
    routes: Arc<RwLock<RouteTable>>,
    history: Arc<Mutex<VecDeque<Message>>>,
    processing: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl MessagePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            queues: Arc::new(PriorityQueues::new(config.max_queue_size)),
            stages: Arc::new(RwLock::new(Stages::default())),
            routes: Arc::new(RwLock::new(RouteTable::new())),
            history: Arc::new(Mutex::new(VecDeque::with_capacity(config.max_history_size))),
            processing: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Build a message with this pipeline's default retry budget
    pub fn create_message(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        message_type: MessageType,
        priority: MessagePriority,
        correlation_id: Option<String>,
    ) -> Message {
        let mut message = Message::new(topic, payload, message_type, priority)
            .with_max_retries(self.config.default_max_retries);
        message.correlation_id = correlation_id;
        message
    }

    /// Queue a message at its priority. A full queue drops it.
    pub fn enqueue(&self, message: Message) -> bool {
        let id = message.id.clone();
        match self.queues.push(message) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Dropping message {}: {} (capacity {})",
                    id,
                    e,
                    self.queues.capacity()
                );
                false
            }
        }
    }

    /// Take the next message in strict priority order
    pub fn dequeue(&self) -> Option<Message> {
        self.queues.pop_highest()
    }

    pub fn add_validator<V: Validator + 'static>(&self, validator: V) {
        self.with_stages(|s| s.validators.push(Arc::new(validator)));
    }

    pub fn add_transformer<T: Transformer + 'static>(&self, transformer: T) {
        self.with_stages(|s| s.transformers.push(Arc::new(transformer)));
    }

    pub fn add_processor<P: Processor + 'static>(&self, processor: P) {
        self.with_stages(|s| s.processors.push(Arc::new(processor)));
    }

    /// Called with every completed message
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.with_stages(|s| s.message_callbacks.push(Arc::new(callback)));
    }

    /// Called with every message that reaches `Failed`
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&Message, &PipelineError) + Send + Sync + 'static,
    {
        self.with_stages(|s| s.error_callbacks.push(Arc::new(callback)));
    }

    /// Forward completed messages whose topic matches `source_pattern`
    pub fn add_route(&self, source_pattern: &str, destination_topic: &str) {
        let mut routes = self
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        routes.add(source_pattern, destination_topic);
        debug!("Route added: {} -> {}", source_pattern, destination_topic);
    }

    fn with_stages(&self, f: impl FnOnce(&mut Stages)) {
        let mut stages = self
            .stages
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stages);
    }

    fn snapshot_stages(&self) -> Stages {
        let stages = self
            .stages
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Stages {
            validators: stages.validators.clone(),
            transformers: stages.transformers.clone(),
            processors: stages.processors.clone(),
            message_callbacks: stages.message_callbacks.clone(),
            error_callbacks: stages.error_callbacks.clone(),
        }
    }

    /// Run one tick: at most one message from each level, critical first.
    /// Returns how many messages were handled.
    pub async fn process_tick(&self) -> usize {
        let mut handled = 0;
        for priority in MessagePriority::DESCENDING {
            if let Some(message) = self.queues.pop(priority) {
                self.process_message(message).await;
                handled += 1;
            }
        }
        handled
    }

    /// Process until [`MessagePipeline::stop_processing`] is called
    pub async fn process_messages(&self) {
        if self.processing.swap(true, Ordering::SeqCst) {
            warn!("Message pipeline is already processing");
            return;
        }
        info!("Message pipeline processing started");
        let tick = Duration::from_millis(self.config.tick_interval_ms);
        while self.processing.load(Ordering::SeqCst) {
            self.process_tick().await;
            sleep(tick).await;
        }
        info!("Message pipeline processing stopped");
    }

    /// Run [`MessagePipeline::process_messages`] on its own task
    pub fn spawn_processing(&self) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.process_messages().await })
    }

    pub fn stop_processing(&self) {
        self.processing.store(false, Ordering::SeqCst);
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Run one message through every stage. Returns the status it ended in
    /// (`Retrying` when it was re-queued).
    pub async fn process_message(&self, mut message: Message) -> MessageStatus {
        let stages = self.snapshot_stages();
        message.status = MessageStatus::Processing;

        for validator in &stages.validators {
            if let Err(e) = validator.validate(&message) {
                return self.fail(message, e, &stages);
            }
        }

        for transformer in &stages.transformers {
            let original = message.clone();
            match transformer.transform(message) {
                Ok(transformed) => message = transformed,
                Err(e) => return self.fail(original, e, &stages),
            }
        }

        let mut forwards = Vec::new();
        for processor in &stages.processors {
            match processor.process(&message).await {
                ProcessOutcome::Done => {}
                ProcessOutcome::Forward(topic) => forwards.push(topic),
                ProcessOutcome::Failed(reason) => {
                    return self.retry_or_fail(message, PipelineError::Processing(reason), &stages);
                }
            }
        }

        for topic in forwards {
            self.forward(&message, &topic);
        }
        let destination = self
            .routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .resolve(&message.topic)
            .map(str::to_string);
        if let Some(destination) = destination {
            self.forward(&message, &destination);
        }

        message.status = MessageStatus::Completed;
        message.processed_at = Some(Utc::now());
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        debug!("Message {} on {} completed", message.id, message.topic);

        for callback in &stages.message_callbacks {
            callback(&message);
        }
        self.record_history(message);
        MessageStatus::Completed
    }

    fn forward(&self, message: &Message, topic: &str) {
        let forwarded = message.forward_to(topic);
        debug!("Forwarding {} from {} to {}", message.id, message.topic, topic);
        if self.enqueue(forwarded) {
            self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn retry_or_fail(&self, mut message: Message, err: PipelineError, stages: &Stages) -> MessageStatus {
        if !err.is_retryable() || !message.can_retry() {
            return self.fail(message, err, stages);
        }

        message.retry_count += 1;
        message.priority = message.priority.escalate();
        message.status = MessageStatus::Retrying;
        message.error_message = Some(err.to_string());
        debug!(
            "Retrying message {} ({}/{}) at {} priority",
            message.id, message.retry_count, message.max_retries, message.priority
        );

        let retry = message.clone();
        if self.enqueue(retry) {
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            MessageStatus::Retrying
        } else {
            self.fail(message, err, stages)
        }
    }

    fn fail(&self, mut message: Message, err: PipelineError, stages: &Stages) -> MessageStatus {
        message.status = MessageStatus::Failed;
        message.processed_at = Some(Utc::now());
        message.error_message = Some(err.to_string());
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            "Message {} on {} failed after {} retries: {}",
            message.id, message.topic, message.retry_count, err
        );
        for callback in &stages.error_callbacks {
            callback(&message, &err);
        }
        MessageStatus::Failed
    }

    fn record_history(&self, message: Message) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while history.len() >= self.config.max_history_size.max(1) {
            history.pop_front();
        }
        history.push_back(message);
    }

    /// Completed messages, oldest first
    pub fn history(&self) -> Vec<Message> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Most recent completed message satisfying `predicate`
    pub fn find_in_history<F>(&self, predicate: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .find(|m| predicate(m))
            .cloned()
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn queue_depth(&self, priority: MessagePriority) -> usize {
        self.queues.len(priority)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            queue_depths: self.queues.depths(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct AlwaysFails;

    #[async_trait]
    impl Processor for AlwaysFails {
        async fn process(&self, _message: &Message) -> ProcessOutcome {
            ProcessOutcome::Failed("backend busy".to_string())
        }
    }

    struct ForwardTo(&'static str);

    #[async_trait]
    impl Processor for ForwardTo {
        async fn process(&self, message: &Message) -> ProcessOutcome {
            if message.topic == self.0 {
                ProcessOutcome::Done
            } else {
                ProcessOutcome::Forward(self.0.to_string())
            }
        }
    }

    struct Uppercase;

    impl Transformer for Uppercase {
        fn transform(&self, mut message: Message) -> Result<Message, PipelineError> {
            message.payload = message.payload.to_ascii_uppercase();
            Ok(message)
        }
    }

    fn pipeline() -> MessagePipeline {
        MessagePipeline::new(PipelineConfig::default())
    }

    fn note(p: &MessagePipeline, topic: &str, priority: MessagePriority) -> Message {
        p.create_message(topic, b"{}".to_vec(), MessageType::Notification, priority, None)
    }

    #[test]
    fn test_queue_full_drops() {
        let p = MessagePipeline::new(PipelineConfig {
            max_queue_size: 2,
            ..Default::default()
        });
        assert!(p.enqueue(note(&p, "a", MessagePriority::Normal)));
        assert!(p.enqueue(note(&p, "b", MessagePriority::Normal)));
        assert!(!p.enqueue(note(&p, "c", MessagePriority::Normal)));

        let stats = p.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.queue_depths[MessagePriority::Normal.index()], 2);
    }

    #[tokio::test]
    async fn test_transform_then_history() {
        let p = pipeline();
        p.add_transformer(Uppercase);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        p.on_message(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let msg = p.create_message("t", b"abc".to_vec(), MessageType::Status, MessagePriority::Low, None);
        assert_eq!(p.process_message(msg).await, MessageStatus::Completed);

        let history = p.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload, b"ABC".to_vec());
        assert!(history[0].processed_at.is_some());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_escalates_until_budget_spent() {
        let p = pipeline();
        p.add_processor(AlwaysFails);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        p.on_error(move |m, _| sink.lock().unwrap().push(m.clone()));

        p.enqueue(note(&p, "t", MessagePriority::Low));

        let mut priorities = Vec::new();
        while let Some(msg) = p.dequeue() {
            priorities.push(msg.priority);
            p.process_message(msg).await;
        }

        assert_eq!(
            priorities,
            vec![
                MessagePriority::Low,
                MessagePriority::Normal,
                MessagePriority::High,
                MessagePriority::Critical
            ]
        );
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].retry_count, 3);
        assert_eq!(failures[0].status, MessageStatus::Failed);
        assert_eq!(p.stats().retried, 3);
        assert!(p.history().is_empty());
    }

    #[tokio::test]
    async fn test_processor_forward_and_route() {
        let p = pipeline();
        p.add_processor(ForwardTo("audit/all"));
        p.add_route("table/+/result", "settlement/results");

        let msg = p
            .create_message("table/1/result", b"{}".to_vec(), MessageType::Response, MessagePriority::High, Some("R1".into()));
        assert_eq!(p.process_message(msg).await, MessageStatus::Completed);

        let first = p.dequeue().unwrap();
        let second = p.dequeue().unwrap();
        let topics = vec![first.topic.clone(), second.topic.clone()];
        assert!(topics.contains(&"audit/all".to_string()));
        assert!(topics.contains(&"settlement/results".to_string()));
        assert_eq!(first.correlation_id.as_deref(), Some("R1"));
        assert_eq!(first.priority, MessagePriority::High);
        assert_eq!(p.stats().forwarded, 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let p = MessagePipeline::new(PipelineConfig {
            max_history_size: 3,
            ..Default::default()
        });
        for i in 0..5 {
            p.process_message(note(&p, &format!("t/{}", i), MessagePriority::Normal))
                .await;
        }
        let topics: Vec<String> = p.history().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["t/2", "t/3", "t/4"]);
        assert_eq!(
            p.find_in_history(|m| m.topic.ends_with('3')).map(|m| m.topic),
            Some("t/3".to_string())
        );
    }

    #[tokio::test]
    async fn test_process_loop_stops() {
        let p = pipeline();
        let handle = p.spawn_processing();
        p.enqueue(note(&p, "t", MessagePriority::Normal));

        for _ in 0..100 {
            if p.stats().completed == 1 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(p.stats().completed, 1);

        p.stop_processing();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!p.is_processing());
    }
}
