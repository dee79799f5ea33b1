//! In-process broker
//!
//! Routes publishes between transports created from the same
//! [`MemoryBroker`] using MQTT topic-filter rules. Sessions are clean: a
//! reconnecting client starts with no subscriptions. Endpoints can be made
//! unreachable or made to reject publishes to exercise failover and health
//! checks without a network.

use super::{InboundFrame, TransportEvent};
use crate::common::traits::{Transport, TransportFactory};
use crate::common::types::QoS;
use crate::errors::TransportError;
use crate::pipeline::routing::topic_matches;
use crate::registry::BrokerEndpoint;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

struct Session {
    address: String,
    filters: Vec<String>,
    events: UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct BrokerState {
    sessions: DashMap<String, Session>,
    unreachable: DashSet<String>,
    rejecting: DashSet<String>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory producing transports bound to this broker
    pub fn factory(&self) -> Arc<MemoryTransportFactory> {
        Arc::new(MemoryTransportFactory {
            broker: self.clone(),
        })
    }

    /// Make an endpoint (`host:port`) refuse connections. Going unreachable
    /// drops every live session on it uncleanly.
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if reachable {
            self.state.unreachable.remove(address);
            return;
        }
        self.state.unreachable.insert(address.to_string());

        let dropped: Vec<String> = self
            .state
            .sessions
            .iter()
            .filter(|s| s.value().address == address)
            .map(|s| s.key().clone())
            .collect();
        for client_id in dropped {
            self.drop_session(&client_id, "broker unreachable");
        }
    }

    /// Make an endpoint accept connections but fail every publish
    pub fn set_rejecting_publishes(&self, address: &str, rejecting: bool) {
        if rejecting {
            self.state.rejecting.insert(address.to_string());
        } else {
            self.state.rejecting.remove(address);
        }
    }

    /// End a session as if the network failed
    pub fn drop_session(&self, client_id: &str, reason: &str) -> bool {
        match self.state.sessions.remove(client_id) {
            Some((_, session)) => {
                let _ = session.events.send(TransportEvent::Disconnected {
                    clean: false,
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Publish from outside any session, e.g. a simulated backend
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.route(topic, payload.into());
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state.sessions.contains_key(client_id)
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }

    /// Filters currently held by a session
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<String> {
        self.state
            .sessions
            .get(client_id)
            .map(|s| s.filters.clone())
            .unwrap_or_default()
    }

    /// Every publish routed so far, in order
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        match self.state.published.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Payloads routed on exactly this topic
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p)
            .collect()
    }

    fn route(&self, topic: &str, payload: Vec<u8>) {
        if let Ok(mut log) = self.state.published.lock() {
            log.push((topic.to_string(), payload.clone()));
        }
        for session in self.state.sessions.iter() {
            if session.filters.iter().any(|f| topic_matches(topic, f)) {
                let frame = InboundFrame::new(topic, payload.clone());
                let _ = session.events.send(TransportEvent::Message(frame));
            }
        }
    }
}

/// One client session on a [`MemoryBroker`]
pub struct MemoryTransport {
    client_id: String,
    address: String,
    broker: MemoryBroker,
    events: UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    fn ensure_session(&self) -> Result<(), TransportError> {
        if self.broker.state.sessions.contains_key(&self.client_id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.broker.state.unreachable.contains(&self.address) {
            return Err(TransportError::Connect(format!(
                "{} is unreachable",
                self.address
            )));
        }
        self.broker.state.sessions.insert(
            self.client_id.clone(),
            Session {
                address: self.address.clone(),
                filters: Vec::new(),
                events: self.events.clone(),
            },
        );
        debug!("Memory session {} opened on {}", self.client_id, self.address);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _qos: QoS,
        _retain: bool,
    ) -> Result<(), TransportError> {
        self.ensure_session()?;
        if self.broker.state.rejecting.contains(&self.address) {
            return Err(TransportError::Publish(format!(
                "{} rejected publish to {}",
                self.address, topic
            )));
        }
        self.broker.route(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        match self.broker.state.sessions.get_mut(&self.client_id) {
            Some(mut session) => {
                if !session.filters.iter().any(|f| f == topic) {
                    session.filters.push(topic.to_string());
                }
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.broker.state.sessions.remove(&self.client_id).is_some() {
            let _ = self.events.send(TransportEvent::Disconnected {
                clean: true,
                reason: "client disconnect".to_string(),
            });
        }
        Ok(())
    }
}

/// Builds [`MemoryTransport`]s for one broker
pub struct MemoryTransportFactory {
    broker: MemoryBroker,
}

impl TransportFactory for MemoryTransportFactory {
    fn create(
        &self,
        client_id: &str,
        endpoint: &BrokerEndpoint,
        events: UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            client_id: client_id.to_string(),
            address: endpoint.broker_address(),
            broker: self.broker.clone(),
            events,
        })
    }
}
