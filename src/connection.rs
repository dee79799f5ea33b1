//! Resilient broker connection
//!
//! Wraps one transport session with automatic reconnect. An unclean
//! disconnect schedules reconnect attempts with exponential backoff; every
//! topic subscribed on the connection is replayed after each successful
//! (re)connect. Only an explicit [`ResilientConnection::disconnect`] stops
//! the connection without passing through `Failed`.

use crate::common::traits::{Transport, TransportFactory};
use crate::common::types::{ConnectionState, QoS};
use crate::config::ReconnectConfig;
use crate::errors::{ConnectionError, LinkError, LinkResult, PublishError};
use crate::registry::BrokerEndpoint;
use crate::transport::{InboundFrame, TransportEvent};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

/// Backoff schedule for reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.reconnect_delay_secs),
            max_delay: Duration::from_secs(config.max_reconnect_delay_secs),
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failed
    /// attempts: `min(base * 2^(failures-1), max)`. The first attempt after a
    /// drop waits `base`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Connection tuning shared by every connection a pool creates
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A client session against one broker that survives network drops
pub struct ResilientConnection {
    client_id: String,
    endpoint: RwLock<BrokerEndpoint>,
    factory: Arc<dyn TransportFactory>,
    settings: ConnectionSettings,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    state: RwLock<ConnectionState>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    auto_reconnect: AtomicBool,
    reconnecting: AtomicBool,
    failed_attempts: AtomicU32,
    reconnect_count: AtomicU64,
    events_tx: UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<TransportEvent>>>,
    inbound: UnboundedSender<InboundFrame>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientConnection {
    /// Build a disconnected connection. Inbound publishes are forwarded to
    /// `inbound` once connected.
    pub fn new(
        client_id: impl Into<String>,
        endpoint: BrokerEndpoint,
        factory: Arc<dyn TransportFactory>,
        settings: ConnectionSettings,
        inbound: UnboundedSender<InboundFrame>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            client_id: client_id.into(),
            endpoint: RwLock::new(endpoint),
            factory,
            settings,
            transport: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            subscriptions: Mutex::new(Vec::new()),
            auto_reconnect: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
            failed_attempts: AtomicU32::new(0),
            reconnect_count: AtomicU64::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            inbound,
            pump: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> BrokerEndpoint {
        match self.endpoint.read() {
            Ok(e) => e.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn broker_address(&self) -> String {
        self.endpoint().broker_address()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().map(|s| *s).unwrap_or(ConnectionState::Failed)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Topics that will be replayed on the next (re)connect
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .map(|subs| subs.iter().map(|(t, _)| t.clone()).collect())
            .unwrap_or_default()
    }

    /// Consecutive failed reconnect attempts since the last success
    pub fn reconnect_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    /// Successful reconnects over the connection's lifetime
    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    /// Connect to the configured endpoint. Re-enables auto-reconnect.
    pub async fn connect(self: &Arc<Self>) -> bool {
        self.auto_reconnect.store(true, Ordering::SeqCst);
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Client {} failed to connect: {}", self.client_id, e);
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    /// Try endpoints in ascending priority until one accepts the session.
    /// Returns the endpoint that was connected.
    pub async fn connect_any(self: &Arc<Self>, endpoints: &[BrokerEndpoint]) -> LinkResult<BrokerEndpoint> {
        if endpoints.is_empty() {
            return Err(ConnectionError::NoEndpoints.into());
        }
        let mut ordered = endpoints.to_vec();
        ordered.sort_by_key(|e| e.priority);

        self.auto_reconnect.store(true, Ordering::SeqCst);
        for endpoint in &ordered {
            self.set_endpoint(endpoint.clone());
            match self.try_connect().await {
                Ok(()) => return Ok(endpoint.clone()),
                Err(e) => warn!(
                    "Client {} could not use {}: {}",
                    self.client_id,
                    endpoint.broker_address(),
                    e
                ),
            }
        }

        self.set_state(ConnectionState::Disconnected);
        let err = ConnectionError::AllEndpointsFailed {
            attempted: ordered.len(),
        };
        error!("Client {}: {}", self.client_id, err);
        Err(err.into())
    }

    /// Publish on the live session. Never blocks on a dead connection.
    pub async fn try_publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        let transport = match self.live_transport() {
            Some(t) => t,
            None => {
                return Err(PublishError::NotConnected {
                    client_id: self.client_id.clone(),
                })
            }
        };
        transport
            .publish(topic, payload, qos, retain)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    /// Publish, logging instead of failing
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> bool {
        match self.try_publish(topic, payload, qos, retain).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                false
            }
        }
    }

    /// Subscribe now if connected; the topic is remembered either way and
    /// replayed after every reconnect. Returns whether the subscription is
    /// active on the broker right now.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> bool {
        if let Ok(mut subs) = self.subscriptions.lock() {
            match subs.iter_mut().find(|(t, _)| t == topic) {
                Some(existing) => existing.1 = qos,
                None => subs.push((topic.to_string(), qos)),
            }
        }

        let transport = match self.live_transport() {
            Some(t) => t,
            None => {
                debug!(
                    "Client {} not connected; deferring subscription to {}",
                    self.client_id, topic
                );
                return false;
            }
        };
        match transport.subscribe(topic, qos).await {
            Ok(()) => {
                debug!("Client {} subscribed to {}", self.client_id, topic);
                true
            }
            Err(e) => {
                warn!("Client {} failed to subscribe to {}: {}", self.client_id, topic, e);
                false
            }
        }
    }

    /// Close the session and stop reconnecting
    pub async fn disconnect(&self) {
        self.auto_reconnect.store(false, Ordering::SeqCst);
        self.close_transport().await;
        info!("Client {} disconnected", self.client_id);
    }

    async fn close_transport(&self) {
        let transport = self.transport.write().ok().and_then(|mut t| t.take());
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                warn!("Client {} disconnect error: {}", self.client_id, e);
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn live_transport(&self) -> Option<Arc<dyn Transport>> {
        if !self.is_connected() {
            return None;
        }
        self.transport.read().ok().and_then(|t| t.clone())
    }

    fn set_endpoint(&self, endpoint: BrokerEndpoint) {
        if let Ok(mut e) = self.endpoint.write() {
            *e = endpoint;
        }
    }

    fn set_state(&self, new_state: ConnectionState) {
        if let Ok(mut state) = self.state.write() {
            if *state != new_state {
                debug!("Client {}: {} -> {}", self.client_id, *state, new_state);
                *state = new_state;
            }
        }
    }

    async fn try_connect(self: &Arc<Self>) -> LinkResult<()> {
        self.ensure_pump();

        let endpoint = self.endpoint();
        let address = endpoint.broker_address();
        if self.state() != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }

        let transport = self
            .factory
            .create(&self.client_id, &endpoint, self.events_tx.clone());

        match timeout(self.settings.connect_timeout, transport.connect()).await {
            Err(_) => {
                let _ = transport.disconnect().await;
                Err(ConnectionError::Timeout {
                    address,
                    timeout_ms: self.settings.connect_timeout.as_millis() as u64,
                }
                .into())
            }
            Ok(Err(e)) => Err(ConnectionError::Refused(format!("{}: {}", address, e)).into()),
            Ok(Ok(())) => {
                if let Ok(mut slot) = self.transport.write() {
                    *slot = Some(transport.clone());
                }
                self.failed_attempts.store(0, Ordering::Relaxed);
                self.set_state(ConnectionState::Connected);
                info!("Client {} connected to {}", self.client_id, address);
                self.resubscribe(&transport).await;
                Ok(())
            }
        }
    }

    async fn resubscribe(&self, transport: &Arc<dyn Transport>) {
        let subs = self
            .subscriptions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        for (topic, qos) in subs {
            if let Err(e) = transport.subscribe(&topic, qos).await {
                warn!("Client {} failed to resubscribe to {}: {}", self.client_id, topic, e);
            }
        }
    }

    fn ensure_pump(self: &Arc<Self>) {
        let rx = match self.events_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(mut rx) = rx else { return };

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(conn) = weak.upgrade() else { break };
                conn.handle_event(event);
            }
        });
        if let Ok(mut pump) = self.pump.lock() {
            *pump = Some(handle);
        }
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                debug!("Client {} session acknowledged", self.client_id);
            }
            TransportEvent::Message(frame) => {
                if self.inbound.send(frame).is_err() {
                    debug!("Client {} inbound sink closed", self.client_id);
                }
            }
            TransportEvent::Disconnected { clean, reason } => {
                // Stale events from a replaced session are ignored
                if self.state() != ConnectionState::Connected {
                    return;
                }
                if clean {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                warn!("Client {} lost connection: {}", self.client_id, reason);
                if let Ok(mut slot) = self.transport.write() {
                    *slot = None;
                }
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.auto_reconnect.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        tokio::spawn(reconnect_loop(Arc::downgrade(self)));
    }
}

async fn reconnect_loop(weak: Weak<ResilientConnection>) {
    loop {
        let delay = {
            let Some(conn) = weak.upgrade() else { return };
            let failures = conn.failed_attempts.load(Ordering::Relaxed);
            if failures >= conn.settings.reconnect.max_attempts {
                let err = LinkError::from(ConnectionError::RetriesExhausted { attempts: failures });
                error!("Client {}: {}", conn.client_id, err);
                conn.set_state(ConnectionState::Failed);
                conn.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            conn.settings.reconnect.delay_for(failures)
        };

        sleep(delay).await;

        let Some(conn) = weak.upgrade() else { return };
        if !conn.auto_reconnect.load(Ordering::SeqCst) {
            conn.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        match conn.try_connect().await {
            Ok(()) => {
                conn.reconnecting.store(false, Ordering::SeqCst);
                // disconnect() may have run while the attempt was in flight
                if !conn.auto_reconnect.load(Ordering::SeqCst) {
                    conn.close_transport().await;
                    info!("Client {} closed a session opened after disconnect", conn.client_id);
                    return;
                }
                conn.reconnect_count.fetch_add(1, Ordering::Relaxed);
                info!("Client {} reconnected", conn.client_id);
                return;
            }
            Err(e) => {
                let failures = conn.failed_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Client {} reconnect attempt {} failed: {}",
                    conn.client_id, failures, e
                );
                conn.set_state(ConnectionState::Reconnecting);
            }
        }
    }
}

impl Drop for ResilientConnection {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}
