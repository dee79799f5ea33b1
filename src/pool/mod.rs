//! Connection pool with health-aware load balancing
//!
//! The pool owns every [`ResilientConnection`] it creates. Callers receive a
//! [`ConnectionHandle`] (id + shared connection) and never the record itself.
//! Two background loops run while the pool is started:
//! - health checks: publish-and-measure on a private topic per connection
//! - idle cleanup: drop connections unused for longer than `max_idle_secs`

pub mod balancer;
pub mod metrics;

pub use balancer::{LoadBalancer, LoadBalancingStrategy};
pub use metrics::ConnectionMetrics;

use crate::common::traits::TransportFactory;
use crate::common::types::{ConnectionKind, ConnectionState, QoS};
use crate::connection::{ConnectionSettings, ResilientConnection};
use crate::errors::{ConnectionError, LinkError, LinkResult, PublishError};
use crate::registry::{BrokerEndpoint, GameProfile};
use crate::transport::InboundFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{broadcast, mpsc::UnboundedSender, Mutex, RwLock},
    task::JoinHandle,
    time::interval,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pool sizing, background loop cadence and balancing strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub health_check_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_idle_secs: u64,
    pub strategy: LoadBalancingStrategy,
    /// Health probes go to `<prefix>/<connection id>`
    pub health_topic_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            health_check_interval_secs: 30,
            cleanup_interval_secs: 60,
            max_idle_secs: 300,
            strategy: LoadBalancingStrategy::RoundRobin,
            health_topic_prefix: "tablelink/health".to_string(),
        }
    }
}

/// Pool-owned bookkeeping for one connection
pub struct ConnectionRecord {
    pub id: String,
    pub endpoint: BrokerEndpoint,
    pub kind: ConnectionKind,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub state: ConnectionState,
    pub metrics: ConnectionMetrics,
    connection: Arc<ResilientConnection>,
}

impl ConnectionRecord {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            client_id: self.connection.client_id().to_string(),
            broker_address: self.endpoint.broker_address(),
            kind: self.kind,
            tags: self.tags.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            state: self.state,
            metrics: self.metrics.clone(),
        }
    }

    /// Pull the transport-level state unless the pool has overridden it
    fn refresh_state(&mut self) {
        match self.state {
            ConnectionState::Maintenance => {}
            ConnectionState::Failed if !self.metrics.is_healthy => {}
            _ => self.state = self.connection.state(),
        }
        self.metrics.reconnect_count = self.connection.reconnect_count();
    }

    fn matches(&self, filter: &ConnectionFilter) -> bool {
        if let Some(ref broker) = filter.broker {
            if &self.endpoint.broker_address() != broker {
                return false;
            }
        }
        if let Some(kind) = filter.kind {
            if self.kind != kind {
                return false;
            }
        }
        filter.tags.iter().all(|t| self.tags.contains(t))
    }
}

/// Read-only view of a record
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub client_id: String,
    pub broker_address: String,
    pub kind: ConnectionKind,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub state: ConnectionState,
    pub metrics: ConnectionMetrics,
}

/// What a caller gets back from [`ConnectionPool::get_connection`]
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub broker_address: String,
    pub connection: Arc<ResilientConnection>,
}

/// Selection predicate. Empty fields match everything; all tags must be present.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
    pub broker: Option<String>,
    pub kind: Option<ConnectionKind>,
    pub tags: Vec<String>,
}

impl ConnectionFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_broker(mut self, broker_address: impl Into<String>) -> Self {
        self.broker = Some(broker_address.into());
        self
    }

    pub fn with_kind(mut self, kind: ConnectionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Aggregate view over the pool
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub by_state: HashMap<ConnectionState, usize>,
    pub total_messages: u64,
    pub total_errors: u64,
}

/// Invoked with the connection id and the failure
pub type PoolErrorCallback = Arc<dyn Fn(&str, &LinkError) + Send + Sync>;

#[derive(Default)]
struct PoolRegistry {
    /// Insertion order; round-robin walks candidates in this order
    records: Vec<ConnectionRecord>,
    by_broker: HashMap<String, Vec<String>>,
}

impl PoolRegistry {
    fn get_mut(&mut self, id: &str) -> Option<&mut ConnectionRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    fn remove(&mut self, id: &str) -> Option<ConnectionRecord> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        let record = self.records.remove(pos);
        let broker = record.endpoint.broker_address();
        if let Some(ids) = self.by_broker.get_mut(&broker) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_broker.remove(&broker);
            }
        }
        Some(record)
    }
}

/// Connection pool and load balancer
#[derive(Clone)]
pub struct ConnectionPool {
    config: PoolConfig,
    settings: ConnectionSettings,
    factory: Arc<dyn TransportFactory>,
    inbound: UnboundedSender<InboundFrame>,
    registry: Arc<RwLock<PoolRegistry>>,
    balancer: Arc<LoadBalancer>,
    default_topics: Arc<RwLock<Vec<(String, QoS)>>>,
    error_callbacks: Arc<RwLock<Vec<PoolErrorCallback>>>,
    running: Arc<AtomicBool>,
    shutdown_signal: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        settings: ConnectionSettings,
        factory: Arc<dyn TransportFactory>,
        inbound: UnboundedSender<InboundFrame>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        let balancer = Arc::new(LoadBalancer::new(config.strategy));
        Self {
            config,
            settings,
            factory,
            inbound,
            registry: Arc::new(RwLock::new(PoolRegistry::default())),
            balancer,
            default_topics: Arc::new(RwLock::new(Vec::new())),
            error_callbacks: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_signal: shutdown_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a callback for health-check and publish failures
    pub async fn on_error<F>(&self, callback: F)
    where
        F: Fn(&str, &LinkError) + Send + Sync + 'static,
    {
        self.error_callbacks.write().await.push(Arc::new(callback));
    }

    /// Subscribe every current and future connection to a topic
    pub async fn subscribe_all(&self, topic: &str, qos: QoS) -> usize {
        {
            let mut topics = self.default_topics.write().await;
            if !topics.iter().any(|(t, _)| t == topic) {
                topics.push((topic.to_string(), qos));
            }
        }
        let connections: Vec<Arc<ResilientConnection>> = self
            .registry
            .read()
            .await
            .records
            .iter()
            .map(|r| r.connection.clone())
            .collect();

        let mut active = 0;
        for conn in connections {
            if conn.subscribe(topic, qos).await {
                active += 1;
            }
        }
        active
    }

    /// Connect a new client to `endpoint` and track it.
    /// `None` when the pool is full or the broker is unreachable.
    pub async fn create_connection(
        &self,
        client_id: &str,
        endpoint: BrokerEndpoint,
        kind: ConnectionKind,
        tags: &[&str],
    ) -> Option<String> {
        if let Err(e) = self.check_capacity().await {
            warn!("Rejecting connection {}: {}", client_id, e);
            return None;
        }

        let conn = self.new_connection(client_id, endpoint).await;
        if !conn.connect().await {
            warn!(
                "Connection {} to {} could not be established",
                client_id,
                conn.broker_address()
            );
            return None;
        }
        self.admit(conn, kind, tags).await
    }

    /// Create a connection for a game profile, failing over across its
    /// endpoints in priority order
    pub async fn create_for_profile(
        &self,
        profile: &GameProfile,
        kind: ConnectionKind,
        tags: &[&str],
    ) -> Option<String> {
        if let Err(e) = self.check_capacity().await {
            warn!("Rejecting connection for {}: {}", profile.game_code, e);
            return None;
        }

        let endpoints = profile.ordered_endpoints();
        let first = endpoints.first()?.clone();
        let suffix = Uuid::new_v4().simple().to_string();
        let client_id = profile.client_id(&suffix[..8]);
        let conn = self.new_connection(&client_id, first).await;

        match conn.connect_any(&endpoints).await {
            Ok(_) => self.admit(conn, kind, tags).await,
            Err(e) => {
                error!("No broker available for {}: {}", profile.game_code, e);
                None
            }
        }
    }

    /// Reopen a connection for `profile` when nothing outside maintenance
    /// matches `filter`, e.g. after idle cleanup emptied the pool
    pub async fn ensure_for_profile(&self, profile: &GameProfile, filter: &ConnectionFilter) -> bool {
        let available = self
            .registry
            .read()
            .await
            .records
            .iter()
            .any(|r| r.state != ConnectionState::Maintenance && r.matches(filter));
        if available {
            return true;
        }

        info!("No pooled connection left for {}; reopening", profile.game_code);
        let tags = profile.pool_tags();
        let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
        self.create_for_profile(profile, ConnectionKind::Primary, &tags)
            .await
            .is_some()
    }

    async fn check_capacity(&self) -> LinkResult<()> {
        let current = self.registry.read().await.records.len();
        if current >= self.config.max_connections {
            return Err(ConnectionError::PoolExhausted {
                max: self.config.max_connections,
            }
            .into());
        }
        Ok(())
    }

    async fn new_connection(&self, client_id: &str, endpoint: BrokerEndpoint) -> Arc<ResilientConnection> {
        let conn = ResilientConnection::new(
            client_id,
            endpoint,
            self.factory.clone(),
            self.settings,
            self.inbound.clone(),
        );
        let topics = self.default_topics.read().await.clone();
        for (topic, qos) in topics {
            // Recorded now, replayed by connect
            conn.subscribe(&topic, qos).await;
        }
        conn
    }

    async fn admit(
        &self,
        conn: Arc<ResilientConnection>,
        kind: ConnectionKind,
        tags: &[&str],
    ) -> Option<String> {
        let endpoint = conn.endpoint();
        let broker = endpoint.broker_address();
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let mut registry = self.registry.write().await;
        // Capacity may have been taken while connecting
        if registry.records.len() >= self.config.max_connections {
            drop(registry);
            warn!(
                "Connection pool filled while {} was connecting (max {})",
                conn.client_id(),
                self.config.max_connections
            );
            conn.disconnect().await;
            return None;
        }

        registry.records.push(ConnectionRecord {
            id: id.clone(),
            endpoint,
            kind,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at: now,
            last_used_at: now,
            state: conn.state(),
            metrics: ConnectionMetrics::default(),
            connection: conn.clone(),
        });
        registry
            .by_broker
            .entry(broker.clone())
            .or_default()
            .push(id.clone());

        info!(
            "Pooled connection {} ({}, {}) to {} [{}/{}]",
            id,
            conn.client_id(),
            kind,
            broker,
            registry.records.len(),
            self.config.max_connections
        );
        Some(id)
    }

    /// Select a connection matching `filter` using the configured strategy.
    ///
    /// Unhealthy connections are skipped unless every candidate is
    /// unhealthy, in which case the first candidate is returned.
    /// Connections in maintenance are never returned.
    pub async fn get_connection(&self, filter: &ConnectionFilter) -> Option<ConnectionHandle> {
        let mut registry = self.registry.write().await;
        for record in registry.records.iter_mut() {
            record.refresh_state();
        }

        let candidates: Vec<usize> = registry
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state != ConnectionState::Maintenance && r.matches(filter))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            debug!("No pooled connection matches {:?}", filter);
            return None;
        }

        let healthy: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| registry.records[i].metrics.is_healthy)
            .collect();

        let chosen = if healthy.is_empty() {
            warn!(
                "All {} candidate connections are unhealthy; using the first",
                candidates.len()
            );
            candidates[0]
        } else {
            let metrics: Vec<&ConnectionMetrics> =
                healthy.iter().map(|&i| &registry.records[i].metrics).collect();
            let picked = self.balancer.select(&metrics)?;
            healthy[picked]
        };

        let record = &mut registry.records[chosen];
        record.last_used_at = Utc::now();
        Some(ConnectionHandle {
            id: record.id.clone(),
            broker_address: record.endpoint.broker_address(),
            connection: record.connection.clone(),
        })
    }

    /// Publish through a pooled connection, updating its metrics
    pub async fn publish(&self, id: &str, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> bool {
        let conn = {
            let mut registry = self.registry.write().await;
            match registry.get_mut(id) {
                Some(record) => {
                    record.last_used_at = Utc::now();
                    record.connection.clone()
                }
                None => {
                    warn!("Publish on unknown connection {}", id);
                    return false;
                }
            }
        };

        let result = conn.try_publish(topic, payload, qos, retain).await;
        let ok = result.is_ok();

        if let Some(record) = self.registry.write().await.get_mut(id) {
            if ok {
                record.metrics.record_message();
            } else {
                record.metrics.record_error();
            }
        }

        if let Err(e) = result {
            warn!("Publish to {} via {} failed: {}", topic, id, e);
            self.notify_error(id, &LinkError::from(e)).await;
        }
        ok
    }

    /// Pick a connection with `filter` and publish through it
    pub async fn publish_any(
        &self,
        filter: &ConnectionFilter,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> bool {
        match self.get_connection(filter).await {
            Some(handle) => self.publish(&handle.id, topic, payload, qos, false).await,
            None => {
                warn!("No connection available to publish on {}", topic);
                false
            }
        }
    }

    /// Disconnect and forget a connection
    pub async fn remove_connection(&self, id: &str) -> bool {
        let removed = self.registry.write().await.remove(id);
        match removed {
            Some(record) => {
                record.connection.disconnect().await;
                info!("Removed connection {} ({})", id, record.endpoint.broker_address());
                true
            }
            None => false,
        }
    }

    /// Put a connection into or out of maintenance
    pub async fn set_maintenance(&self, id: &str, enabled: bool) -> bool {
        let mut registry = self.registry.write().await;
        let Some(record) = registry.get_mut(id) else {
            return false;
        };
        if enabled {
            record.state = ConnectionState::Maintenance;
            warn!("Connection {} entering maintenance mode", id);
        } else {
            record.state = record.connection.state();
            info!("Connection {} exiting maintenance mode", id);
        }
        true
    }

    /// Probe every connection once
    pub async fn health_check_once(&self) {
        let targets: Vec<(String, Arc<ResilientConnection>)> = self
            .registry
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.state != ConnectionState::Maintenance)
            .map(|r| (r.id.clone(), r.connection.clone()))
            .collect();

        for (id, conn) in targets {
            let topic = format!("{}/{}", self.config.health_topic_prefix, id);
            let payload = serde_json::json!({ "ping": Utc::now().timestamp_millis() }).to_string();

            let started = Instant::now();
            let result = conn
                .try_publish(&topic, payload.into_bytes(), QoS::AtMostOnce, false)
                .await;
            let elapsed = started.elapsed();

            let failure = {
                let mut registry = self.registry.write().await;
                let Some(record) = registry.get_mut(&id) else { continue };
                match result {
                    Ok(()) => {
                        record.metrics.record_check_success(elapsed);
                        record.state = conn.state();
                        None
                    }
                    Err(e) => {
                        match e {
                            PublishError::NotConnected { .. } => record.metrics.record_check_exception(),
                            PublishError::Transport(_) => record.metrics.record_check_failure(),
                        }
                        record.state = ConnectionState::Failed;
                        Some(e)
                    }
                }
            };

            match failure {
                None => debug!("Health check ok for {} in {:?}", id, elapsed),
                Some(e) => {
                    warn!("Health check failed for {}: {}", id, e);
                    self.notify_error(&id, &LinkError::from(e)).await;
                }
            }
        }
    }

    /// Remove connections idle for longer than `max_idle_secs`
    pub async fn cleanup_idle_once(&self) -> usize {
        let max_idle = chrono::Duration::seconds(self.config.max_idle_secs as i64);
        let now = Utc::now();
        let idle: Vec<String> = self
            .registry
            .read()
            .await
            .records
            .iter()
            .filter(|r| now - r.last_used_at > max_idle)
            .map(|r| r.id.clone())
            .collect();

        let mut removed = 0;
        for id in idle {
            if self.remove_connection(&id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Idle cleanup removed {} connection(s)", removed);
        }
        removed
    }

    /// Start the health-check and idle-cleanup loops
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let health = self.spawn_loop(
            "health check",
            Duration::from_secs(self.config.health_check_interval_secs),
            |pool| async move { pool.health_check_once().await },
        );
        let cleanup = self.spawn_loop(
            "idle cleanup",
            Duration::from_secs(self.config.cleanup_interval_secs),
            |pool| async move {
                pool.cleanup_idle_once().await;
            },
        );
        self.tasks.lock().await.extend([health, cleanup]);
        info!("Connection pool started ({} strategy)", self.balancer.strategy());
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, body: F) -> JoinHandle<()>
    where
        F: Fn(ConnectionPool) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let pool = self.clone();
        let mut shutdown = self.shutdown_signal.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !pool.running.load(Ordering::SeqCst) {
                            break;
                        }
                        body(pool.clone()).await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("Pool {} loop stopped", name);
        })
    }

    /// Stop background loops and disconnect every connection
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Connection pool stop requested while not running");
        }
        let _ = self.shutdown_signal.send(());
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Pool background task ended abnormally: {}", e);
            }
        }

        let records: Vec<ConnectionRecord> = {
            let mut registry = self.registry.write().await;
            registry.by_broker.clear();
            registry.records.drain(..).collect()
        };
        let count = records.len();
        futures::future::join_all(records.iter().map(|r| r.connection.disconnect())).await;
        info!("Connection pool stopped; disconnected {} connection(s)", count);
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn connection_ids(&self) -> Vec<String> {
        self.registry
            .read()
            .await
            .records
            .iter()
            .map(|r| r.id.clone())
            .collect()
    }

    /// Ids of connections to one broker (`host:port`)
    pub async fn connections_for_broker(&self, broker_address: &str) -> Vec<String> {
        self.registry
            .read()
            .await
            .by_broker
            .get(broker_address)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn connection_info(&self, id: &str) -> Option<ConnectionInfo> {
        let mut registry = self.registry.write().await;
        let record = registry.get_mut(id)?;
        record.refresh_state();
        Some(record.info())
    }

    pub async fn stats(&self) -> PoolStats {
        let mut registry = self.registry.write().await;
        let mut stats = PoolStats::default();
        for record in registry.records.iter_mut() {
            record.refresh_state();
            stats.total += 1;
            if record.metrics.is_healthy {
                stats.healthy += 1;
            } else {
                stats.unhealthy += 1;
            }
            *stats.by_state.entry(record.state).or_insert(0) += 1;
            stats.total_messages += record.metrics.message_count;
            stats.total_errors += record.metrics.error_count;
        }
        stats
    }

    async fn notify_error(&self, id: &str, err: &LinkError) {
        let callbacks = self.error_callbacks.read().await.clone();
        for callback in callbacks {
            callback(id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn pool_with(broker: &MemoryBroker, config: PoolConfig) -> ConnectionPool {
        let (tx, _rx) = mpsc::unbounded_channel();
        ConnectionPool::new(config, ConnectionSettings::default(), broker.factory(), tx)
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let broker = MemoryBroker::new();
        let pool = pool_with(
            &broker,
            PoolConfig {
                max_connections: 2,
                ..Default::default()
            },
        );

        for i in 0..2 {
            let endpoint = BrokerEndpoint::new(format!("10.0.0.{}", i), 1883);
            assert!(pool
                .create_connection(&format!("c{}", i), endpoint, ConnectionKind::Primary, &[])
                .await
                .is_some());
        }
        let extra = pool
            .create_connection("c9", BrokerEndpoint::new("10.0.0.9", 1883), ConnectionKind::Primary, &[])
            .await;
        assert!(extra.is_none());
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_unreachable_broker_not_pooled() {
        let broker = MemoryBroker::new();
        broker.set_reachable("10.0.0.1:1883", false);
        let pool = pool_with(&broker, PoolConfig::default());

        let id = pool
            .create_connection("c1", BrokerEndpoint::new("10.0.0.1", 1883), ConnectionKind::Primary, &[])
            .await;
        assert!(id.is_none());
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_filter_by_kind_and_broker() {
        let broker = MemoryBroker::new();
        let pool = pool_with(&broker, PoolConfig::default());
        let primary = pool
            .create_connection("p", BrokerEndpoint::new("10.0.0.1", 1883), ConnectionKind::Primary, &["sicbo"])
            .await
            .unwrap();
        let backup = pool
            .create_connection("b", BrokerEndpoint::new("10.0.0.2", 1883), ConnectionKind::Backup, &["sicbo"])
            .await
            .unwrap();

        let h = pool
            .get_connection(&ConnectionFilter::any().with_kind(ConnectionKind::Backup))
            .await
            .unwrap();
        assert_eq!(h.id, backup);

        let h = pool
            .get_connection(&ConnectionFilter::any().with_broker("10.0.0.1:1883"))
            .await
            .unwrap();
        assert_eq!(h.id, primary);

        assert!(pool
            .get_connection(&ConnectionFilter::any().with_tag("baccarat"))
            .await
            .is_none());
        assert_eq!(pool.connections_for_broker("10.0.0.2:1883").await, vec![backup]);
    }

    #[tokio::test]
    async fn test_maintenance_never_selected_and_not_checked() {
        let broker = MemoryBroker::new();
        let pool = pool_with(&broker, PoolConfig::default());
        let id = pool
            .create_connection("c1", BrokerEndpoint::new("10.0.0.1", 1883), ConnectionKind::Primary, &[])
            .await
            .unwrap();

        assert!(pool.set_maintenance(&id, true).await);
        assert!(pool.get_connection(&ConnectionFilter::any()).await.is_none());

        pool.health_check_once().await;
        assert!(broker.published().is_empty());

        assert!(pool.set_maintenance(&id, false).await);
        assert!(pool.get_connection(&ConnectionFilter::any()).await.is_some());
    }

    #[tokio::test]
    async fn test_health_check_failure_fires_callbacks() {
        let broker = MemoryBroker::new();
        let pool = pool_with(&broker, PoolConfig::default());
        let id = pool
            .create_connection("c1", BrokerEndpoint::new("10.0.0.1", 1883), ConnectionKind::Primary, &[])
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        pool.on_error(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        pool.health_check_once().await;
        let info = pool.connection_info(&id).await.unwrap();
        assert!(info.metrics.is_healthy);
        assert_eq!(info.metrics.response_time_samples.len(), 1);

        broker.set_rejecting_publishes("10.0.0.1:1883", true);
        pool.health_check_once().await;
        let info = pool.connection_info(&id).await.unwrap();
        assert!(!info.metrics.is_healthy);
        assert_eq!(info.state, ConnectionState::Failed);
        assert!((info.metrics.health_score - 0.8).abs() < 1e-9);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_cleanup_and_stats() {
        let broker = MemoryBroker::new();
        let pool = pool_with(
            &broker,
            PoolConfig {
                max_idle_secs: 0,
                ..Default::default()
            },
        );
        let id = pool
            .create_connection("c1", BrokerEndpoint::new("10.0.0.1", 1883), ConnectionKind::Primary, &[])
            .await
            .unwrap();
        assert!(pool.publish(&id, "t", b"x".to_vec(), QoS::AtMostOnce, false).await);

        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.by_state.get(&ConnectionState::Connected), Some(&1));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.cleanup_idle_once().await, 1);
        assert!(pool.is_empty().await);
        assert!(!broker.is_connected("c1"));
    }

    #[tokio::test]
    async fn test_stop_disconnects_everything() {
        let broker = MemoryBroker::new();
        let pool = pool_with(&broker, PoolConfig::default());
        for i in 0..3 {
            pool.create_connection(
                &format!("c{}", i),
                BrokerEndpoint::new(format!("10.0.0.{}", i), 1883),
                ConnectionKind::Secondary,
                &[],
            )
            .await
            .unwrap();
        }
        pool.start().await;
        assert!(pool.is_running());

        pool.stop().await;
        assert!(!pool.is_running());
        assert_eq!(broker.session_count(), 0);
        assert!(pool.is_empty().await);
    }
}
