//! Per-game entry point
//!
//! `TableLink` wires one game profile to a connection pool (or a single
//! primary connection), the inbound pipeline and the request correlator.
//! Game controllers construct one, `start` it, and then only use
//! `publish`, `send_command` and `detect`.

use crate::common::traits::TransportFactory;
use crate::common::types::{ConnectionKind, MessagePriority, QoS};
use crate::config::LinkConfig;
use crate::connection::ResilientConnection;
use crate::correlator::{CorrelationMode, DetectOutcome, Outbound, RequestCorrelator};
use crate::errors::{ConnectionError, LinkResult};
use crate::games::{DetectParams, GameKind};
use crate::pipeline::{ingress, MessagePipeline};
use crate::pool::{ConnectionFilter, ConnectionPool};
use crate::registry::GameProfile;
use crate::transport::InboundFrame;
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver},
        Mutex,
    },
    task::JoinHandle,
};
use tracing::{info, warn};

enum Backend {
    Pool(ConnectionPool),
    Primary(Arc<ResilientConnection>),
}

pub struct TableLink {
    profile: GameProfile,
    game: GameKind,
    connections: usize,
    backend: Backend,
    pipeline: MessagePipeline,
    outbound: Outbound,
    correlator: RequestCorrelator,
    inbound: Mutex<Option<UnboundedReceiver<InboundFrame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TableLink {
    pub fn new(
        profile: GameProfile,
        config: &LinkConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> LinkResult<Self> {
        profile.validate()?;
        let game = profile.game_kind()?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pipeline = MessagePipeline::new(config.pipeline.clone());
        let settings = config.connection_settings();

        let (backend, outbound) = if config.detect.use_pool {
            let pool = ConnectionPool::new(config.pool.clone(), settings, factory, inbound_tx);
            let filter = ConnectionFilter::any().with_tag(profile.game_code.clone());
            let outbound = Outbound::Pool {
                pool: pool.clone(),
                filter,
                profile: profile.clone(),
            };
            (Backend::Pool(pool), outbound)
        } else {
            let endpoint = profile
                .ordered_endpoints()
                .into_iter()
                .next()
                .ok_or(ConnectionError::NoEndpoints)?;
            let conn = ResilientConnection::new(
                profile.client_id("primary"),
                endpoint,
                factory,
                settings,
                inbound_tx,
            );
            (Backend::Primary(conn.clone()), Outbound::Primary(conn))
        };

        let correlator = RequestCorrelator::new(
            &profile,
            game,
            outbound.clone(),
            pipeline.clone(),
            config.poll_interval(),
        );

        Ok(Self {
            profile,
            game,
            connections: 1,
            backend,
            pipeline,
            outbound,
            correlator,
            inbound: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Number of pooled connections opened by `start`
    pub fn with_connections(mut self, connections: usize) -> Self {
        self.connections = connections.max(1);
        self
    }

    pub fn with_correlation_mode(mut self, mode: CorrelationMode) -> Self {
        self.correlator = self.correlator.with_mode(mode);
        self
    }

    pub fn profile(&self) -> &GameProfile {
        &self.profile
    }

    pub fn game(&self) -> GameKind {
        self.game
    }

    pub fn pipeline(&self) -> &MessagePipeline {
        &self.pipeline
    }

    pub fn pool(&self) -> Option<&ConnectionPool> {
        match self.backend {
            Backend::Pool(ref pool) => Some(pool),
            Backend::Primary(_) => None,
        }
    }

    pub fn primary(&self) -> Option<&Arc<ResilientConnection>> {
        match self.backend {
            Backend::Primary(ref conn) => Some(conn),
            Backend::Pool(_) => None,
        }
    }

    /// Open connections, subscribe the game's inbound topics and start the
    /// ingress, processing and pool loops
    pub async fn start(&self) -> LinkResult<()> {
        if let Some(rx) = self.inbound.lock().await.take() {
            let status_topic = self.profile.status_topic.clone();
            let ingress = ingress::spawn_ingress(self.pipeline.clone(), rx, status_topic);
            let processing = self.pipeline.spawn_processing();
            self.tasks.lock().await.extend([ingress, processing]);
        }

        let topics = self.profile.inbound_topics();
        match self.backend {
            Backend::Pool(ref pool) => {
                for topic in &topics {
                    pool.subscribe_all(topic, QoS::AtLeastOnce).await;
                }
                let tags = self.profile.pool_tags();
                let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                let mut opened = 0;
                for n in 0..self.connections {
                    let kind = if n == 0 {
                        ConnectionKind::Primary
                    } else {
                        ConnectionKind::Secondary
                    };
                    if pool.create_for_profile(&self.profile, kind, &tags).await.is_some() {
                        opened += 1;
                    }
                }
                if opened == 0 {
                    return Err(ConnectionError::AllEndpointsFailed {
                        attempted: self.profile.endpoints.len(),
                    }
                    .into());
                }
                pool.start().await;
                info!(
                    "{} link started with {}/{} pooled connection(s)",
                    self.profile.game_code, opened, self.connections
                );
            }
            Backend::Primary(ref conn) => {
                for topic in &topics {
                    conn.subscribe(topic, QoS::AtLeastOnce).await;
                }
                let endpoint = conn.connect_any(&self.profile.endpoints).await?;
                info!(
                    "{} link started on primary connection to {}",
                    self.profile.game_code,
                    endpoint.broker_address()
                );
            }
        }
        Ok(())
    }

    /// Stop processing and close every connection
    pub async fn stop(&self) {
        self.pipeline.stop_processing();
        match self.backend {
            Backend::Pool(ref pool) => pool.stop().await,
            Backend::Primary(ref conn) => conn.disconnect().await,
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            // Ingress waits on a channel the backend still holds
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("{} link task ended abnormally: {}", self.profile.game_code, e);
                }
            }
        }
        info!("{} link stopped", self.profile.game_code);
    }

    /// Publish raw bytes on any topic
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> bool {
        self.outbound.publish(topic, payload, qos).await
    }

    /// Publish a command on the game's command topic
    pub async fn send_command<T: Serialize>(&self, command: &T, priority: MessagePriority) -> bool {
        self.correlator.send_command(command, priority).await
    }

    /// Request the outcome of a round, waiting up to the profile timeout
    pub async fn detect(&self, round_id: &str, params: &DetectParams) -> DetectOutcome {
        self.correlator.detect(round_id, params).await
    }
}
