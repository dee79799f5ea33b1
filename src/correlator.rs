//! Request/response over publish/subscribe
//!
//! `detect` publishes a game-specific command and polls the pipeline history
//! for the backend's correlated result. When the deadline passes it tells
//! the backend to abandon the round and hands back the game's placeholder
//! result with `success == true` and `timed_out == true`, so callers always
//! get a well-typed result.

use crate::common::types::{MessagePriority, MessageType, QoS};
use crate::connection::ResilientConnection;
use crate::games::{DetectCommand, DetectParams, DetectResponse, GameKind, RoundResult};
use crate::pipeline::{topic_matches, Message, MessagePipeline};
use crate::pool::{ConnectionFilter, ConnectionPool};
use crate::registry::GameProfile;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Where outbound commands are published
#[derive(Clone)]
pub enum Outbound {
    /// Any pooled connection matching the filter, reopened from `profile`
    /// when none is left
    Pool {
        pool: ConnectionPool,
        filter: ConnectionFilter,
        profile: GameProfile,
    },
    /// One always-open connection
    Primary(Arc<ResilientConnection>),
}

impl Outbound {
    pub(crate) async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> bool {
        match self {
            Outbound::Pool {
                pool,
                filter,
                profile,
            } => {
                if !pool.ensure_for_profile(profile, filter).await {
                    warn!("No broker reachable for {}", profile.game_code);
                    return false;
                }
                pool.publish_any(filter, topic, payload, qos).await
            }
            Outbound::Primary(conn) => conn.publish(topic, payload, qos, false).await,
        }
    }
}

/// How a response is matched to the outstanding request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrelationMode {
    /// `arg.round_id` must equal the requested round
    #[default]
    RoundId,
    /// First result received after the command was sent
    FirstResult,
}

/// Result of a `detect` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectOutcome {
    pub success: bool,
    pub result: RoundResult,
    /// No correlated response arrived; `result` is the game's placeholder
    pub timed_out: bool,
}

impl DetectOutcome {
    /// `(success, result)` pair
    pub fn into_pair(self) -> (bool, RoundResult) {
        (self.success, self.result)
    }
}

pub struct RequestCorrelator {
    game: GameKind,
    command_topic: String,
    response_topic: String,
    timeout: Duration,
    poll_interval: Duration,
    mode: CorrelationMode,
    outbound: Outbound,
    pipeline: MessagePipeline,
}

impl RequestCorrelator {
    pub fn new(
        profile: &GameProfile,
        game: GameKind,
        outbound: Outbound,
        pipeline: MessagePipeline,
        poll_interval: Duration,
    ) -> Self {
        Self {
            game,
            command_topic: profile.command_topic.clone(),
            response_topic: profile.response_topic.clone(),
            timeout: Duration::from_secs(profile.timeout_seconds),
            poll_interval,
            mode: CorrelationMode::default(),
            outbound,
            pipeline,
        }
    }

    pub fn with_mode(mut self, mode: CorrelationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn game(&self) -> GameKind {
        self.game
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Publish a command on the game's command topic. Urgent commands go
    /// out at least once.
    pub async fn send_command<T: Serialize>(&self, command: &T, priority: MessagePriority) -> bool {
        let payload = match serde_json::to_vec(command) {
            Ok(p) => p,
            Err(e) => {
                warn!("Command for {} could not be encoded: {}", self.command_topic, e);
                return false;
            }
        };
        let qos = if priority >= MessagePriority::High {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        };
        let sent = self.outbound.publish(&self.command_topic, payload, qos).await;
        if sent {
            debug!("Command sent on {} ({} priority)", self.command_topic, priority);
        }
        sent
    }

    /// Ask the backend for a round's outcome and wait for it
    pub async fn detect(&self, round_id: &str, params: &DetectParams) -> DetectOutcome {
        let sent_at = Utc::now();
        let command = DetectCommand::detect(self.game, round_id, params);
        if !self.send_command(&command, MessagePriority::High).await {
            warn!("Detect command for round {} was not delivered", round_id);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(response) = self.find_response(round_id, sent_at) {
                return self.outcome_from(round_id, response);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }

        warn!(
            "No {} result for round {} within {:?}; using default",
            self.game, round_id, self.timeout
        );
        if !self
            .send_command(&DetectCommand::timeout(round_id), MessagePriority::Normal)
            .await
        {
            warn!("Timeout notice for round {} was not delivered", round_id);
        }

        DetectOutcome {
            success: true,
            result: self.game.default_result(),
            timed_out: true,
        }
    }

    fn find_response(&self, round_id: &str, sent_at: DateTime<Utc>) -> Option<DetectResponse> {
        let is_candidate = |m: &Message| {
            m.message_type == MessageType::Response && topic_matches(&m.topic, &self.response_topic)
        };

        match self.mode {
            // Acks or status replies for the same round must not hide its result
            CorrelationMode::RoundId => self
                .pipeline
                .find_in_history(|m| {
                    is_candidate(m)
                        && m.correlation_id.as_deref() == Some(round_id)
                        && DetectResponse::parse(&m.payload)
                            .map(|r| r.is_result() && r.matches_round(round_id))
                            .unwrap_or(false)
                })
                .and_then(|m| DetectResponse::parse(&m.payload)),
            CorrelationMode::FirstResult => self
                .pipeline
                .history()
                .into_iter()
                .filter(|m| is_candidate(m) && m.created_at >= sent_at)
                .filter_map(|m| DetectResponse::parse(&m.payload))
                .find(|r| r.is_result()),
        }
    }

    fn outcome_from(&self, round_id: &str, response: DetectResponse) -> DetectOutcome {
        if response.arg.err != 0 {
            warn!("Backend reported error {} for round {}", response.arg.err, round_id);
            return DetectOutcome {
                success: false,
                result: self.game.default_result(),
                timed_out: false,
            };
        }
        match response.result(self.game) {
            Some(result) => {
                info!("Round {} result: {}", round_id, result);
                DetectOutcome {
                    success: true,
                    result,
                    timed_out: false,
                }
            }
            None => {
                warn!(
                    "Round {} result has the wrong shape for {}: {}",
                    round_id, self.game, response.arg.res
                );
                DetectOutcome {
                    success: false,
                    result: self.game.default_result(),
                    timed_out: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSettings;
    use crate::pipeline::PipelineConfig;
    use crate::registry::{BrokerEndpoint, EndpointRegistry};
    use crate::transport::MemoryBroker;
    use tokio::sync::mpsc;

    fn profile() -> GameProfile {
        EndpointRegistry::profile_from_json_str(
            r#"{
                "clientIdPrefix": "t",
                "gameCode": "SBO-001",
                "commandTopic": "sbo/command",
                "responseTopic": "sbo/response",
                "timeoutSeconds": 1,
                "endpoints": [{"address": "10.0.0.1", "port": 1883}]
            }"#,
        )
        .unwrap()
    }

    async fn primary(broker: &MemoryBroker) -> Arc<ResilientConnection> {
        let conn = ResilientConnection::new(
            "primary",
            BrokerEndpoint::new("10.0.0.1", 1883),
            broker.factory(),
            ConnectionSettings::default(),
            mpsc::unbounded_channel().0,
        );
        assert!(conn.connect().await);
        conn
    }

    fn response(round_id: &str, res: &str, err: i64) -> Message {
        let payload = format!(
            r#"{{"response":"result","arg":{{"round_id":"{}","res":{},"err":{}}}}}"#,
            round_id, res, err
        );
        Message::new("sbo/response", payload.into_bytes(), MessageType::Response, MessagePriority::High)
            .with_correlation_id(round_id)
    }

    #[tokio::test]
    async fn test_result_already_in_history() {
        let broker = MemoryBroker::new();
        let pipeline = MessagePipeline::new(PipelineConfig::default());
        pipeline.process_message(response("R7", "[2,3,5]", 0)).await;

        let correlator = RequestCorrelator::new(
            &profile(),
            GameKind::Sicbo,
            Outbound::Primary(primary(&broker).await),
            pipeline,
            Duration::from_millis(10),
        );
        let outcome = correlator.detect("R7", &DetectParams::new("cam")).await;
        assert_eq!(outcome.into_pair(), (true, RoundResult::Dice(vec![2, 3, 5])));

        let sent = broker.published_on("sbo/command");
        assert_eq!(sent.len(), 1);
        let cmd: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(cmd["command"], "detect");
        assert_eq!(cmd["arg"]["round_id"], "R7");
    }

    #[tokio::test]
    async fn test_later_ack_does_not_hide_result() {
        let broker = MemoryBroker::new();
        let pipeline = MessagePipeline::new(PipelineConfig::default());
        pipeline.process_message(response("R1", "[1,2,3]", 0)).await;
        let ack = Message::new(
            "sbo/response",
            br#"{"response":"ack","arg":{"round_id":"R1"}}"#.to_vec(),
            MessageType::Response,
            MessagePriority::High,
        )
        .with_correlation_id("R1");
        pipeline.process_message(ack).await;

        let correlator = RequestCorrelator::new(
            &profile(),
            GameKind::Sicbo,
            Outbound::Primary(primary(&broker).await),
            pipeline,
            Duration::from_millis(10),
        )
        .with_timeout(Duration::from_millis(200));
        let outcome = correlator.detect("R1", &DetectParams::new("cam")).await;
        assert!(!outcome.timed_out);
        assert_eq!(outcome.into_pair(), (true, RoundResult::Dice(vec![1, 2, 3])));
    }

    #[tokio::test]
    async fn test_out_of_range_result_is_not_success() {
        let broker = MemoryBroker::new();
        let pipeline = MessagePipeline::new(PipelineConfig::default());
        pipeline.process_message(response("R5", "99", 0)).await;

        let correlator = RequestCorrelator::new(
            &profile(),
            GameKind::Roulette,
            Outbound::Primary(primary(&broker).await),
            pipeline,
            Duration::from_millis(10),
        );
        let outcome = correlator.detect("R5", &DetectParams::new("cam")).await;
        assert!(!outcome.success);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.result, RoundResult::Number(-1));
    }

    #[tokio::test]
    async fn test_backend_error_is_not_success() {
        let broker = MemoryBroker::new();
        let pipeline = MessagePipeline::new(PipelineConfig::default());
        pipeline.process_message(response("R8", "[0,0,0]", 2)).await;

        let correlator = RequestCorrelator::new(
            &profile(),
            GameKind::Sicbo,
            Outbound::Primary(primary(&broker).await),
            pipeline,
            Duration::from_millis(10),
        );
        let outcome = correlator.detect("R8", &DetectParams::new("cam")).await;
        assert!(!outcome.success);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_returns_default_and_notifies() {
        let broker = MemoryBroker::new();
        let pipeline = MessagePipeline::new(PipelineConfig::default());
        let correlator = RequestCorrelator::new(
            &profile(),
            GameKind::Sicbo,
            Outbound::Primary(primary(&broker).await),
            pipeline,
            Duration::from_millis(20),
        )
        .with_timeout(Duration::from_millis(150));

        let started = Instant::now();
        let outcome = correlator.detect("R9", &DetectParams::new("cam")).await;
        let elapsed = started.elapsed();

        assert!(outcome.success);
        assert!(outcome.timed_out);
        assert_eq!(outcome.result, RoundResult::Dice(vec![0, 0, 0]));
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(400));

        let sent = broker.published_on("sbo/command");
        assert_eq!(sent.len(), 2);
        let notice: serde_json::Value = serde_json::from_slice(&sent[1]).unwrap();
        assert_eq!(notice["command"], "timeout");
        assert_eq!(notice["arg"]["round_id"], "R9");
    }

    #[tokio::test]
    async fn test_first_result_mode_ignores_older_responses() {
        let broker = MemoryBroker::new();
        let pipeline = MessagePipeline::new(PipelineConfig::default());
        pipeline.process_message(response("OLD", "[1,1,1]", 0)).await;

        let correlator = RequestCorrelator::new(
            &profile(),
            GameKind::Sicbo,
            Outbound::Primary(primary(&broker).await),
            pipeline.clone(),
            Duration::from_millis(10),
        )
        .with_mode(CorrelationMode::FirstResult)
        .with_timeout(Duration::from_secs(2));

        let feeder = pipeline.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            feeder.process_message(response("ANY", "[6,6,6]", 0)).await;
        });

        let outcome = correlator.detect("R10", &DetectParams::new("cam")).await;
        assert_eq!(outcome.result, RoundResult::Dice(vec![6, 6, 6]));
        assert!(!outcome.timed_out);
    }
}
