//! MQTT 3.1.1 transport over `rumqttc`
//!
//! Each `connect` builds a fresh client and event loop. The event loop is
//! polled on its own task until the first error, at which point the task
//! reports an unclean disconnect and exits; reconnect pacing belongs to the
//! owning connection, not to rumqttc's internal retry.

use super::{InboundFrame, TransportEvent};
use crate::common::traits::{Transport, TransportFactory};
use crate::common::types::QoS;
use crate::errors::TransportError;
use crate::registry::BrokerEndpoint;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet,
    Transport as WireTransport,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc::UnboundedSender, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Request channel capacity handed to `AsyncClient::new`
const CLIENT_CAPACITY: usize = 64;

fn wire_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

pub struct MqttTransport {
    client_id: String,
    endpoint: BrokerEndpoint,
    events: UnboundedSender<TransportEvent>,
    client: Mutex<Option<AsyncClient>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    pub fn new(
        client_id: impl Into<String>,
        endpoint: BrokerEndpoint,
        events: UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            endpoint,
            events,
            client: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    async fn options(&self) -> Result<MqttOptions, TransportError> {
        let mut options = MqttOptions::new(
            self.client_id.clone(),
            self.endpoint.address.clone(),
            self.endpoint.port,
        );
        options.set_keep_alive(Duration::from_secs(self.endpoint.keep_alive_seconds.max(5)));
        options.set_clean_session(true);
        if self.endpoint.has_credentials() {
            options.set_credentials(
                self.endpoint.username.clone(),
                self.endpoint.password.clone(),
            );
        }

        if let Some(ref tls) = self.endpoint.tls {
            let transport = match tls.ca_cert_path {
                Some(ref path) => {
                    let ca = tokio::fs::read(path).await.map_err(|e| {
                        TransportError::Connect(format!("Failed to read CA bundle {}: {}", path, e))
                    })?;
                    WireTransport::tls(ca, None, None)
                }
                None => WireTransport::tls_with_default_config(),
            };
            options.set_transport(transport);
        }

        Ok(options)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let options = self.options().await?;
        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let events = self.events.clone();
        let client_id = self.client_id.clone();

        let handle = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Ok(()));
                            }
                            let _ = events.send(TransportEvent::Connected);
                        } else {
                            let reason = format!("broker refused session: {:?}", ack.code);
                            match ready.take() {
                                Some(tx) => {
                                    let _ = tx.send(Err(reason));
                                }
                                None => {
                                    let _ = events.send(TransportEvent::Disconnected {
                                        clean: false,
                                        reason,
                                    });
                                }
                            }
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let frame = InboundFrame::new(publish.topic.clone(), publish.payload.to_vec());
                        let _ = events.send(TransportEvent::Message(frame));
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        let _ = events.send(TransportEvent::Disconnected {
                            clean: true,
                            reason: "client disconnect".to_string(),
                        });
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        match ready.take() {
                            Some(tx) => {
                                let _ = tx.send(Err(e.to_string()));
                            }
                            None => {
                                warn!("MQTT event loop for {} failed: {}", client_id, e);
                                let _ = events.send(TransportEvent::Disconnected {
                                    clean: false,
                                    reason: e.to_string(),
                                });
                            }
                        }
                        break;
                    }
                }
            }
            debug!("MQTT event loop for {} exited", client_id);
        });

        if let Some(previous) = self.poller.lock().await.replace(handle) {
            previous.abort();
        }

        match ready_rx.await {
            Ok(Ok(())) => {
                *self.client.lock().await = Some(client);
                Ok(())
            }
            Ok(Err(reason)) => Err(TransportError::Connect(reason)),
            Err(_) => Err(TransportError::Connect("event loop ended before ConnAck".to_string())),
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(TransportError::Closed)?;
        client
            .try_publish(topic, wire_qos(qos), retain, payload)
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(TransportError::Closed)?;
        client
            .try_subscribe(topic, wire_qos(qos))
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let client = self.client.lock().await.take();
        match client {
            Some(client) => {
                if let Err(e) = client.try_disconnect() {
                    // Event loop already gone; nothing left to flush
                    debug!("Disconnect request for {} not queued: {}", self.client_id, e);
                    if let Some(handle) = self.poller.lock().await.take() {
                        handle.abort();
                    }
                }
                Ok(())
            }
            None => {
                if let Some(handle) = self.poller.lock().await.take() {
                    handle.abort();
                }
                Ok(())
            }
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.try_lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
    }
}

/// Builds [`MqttTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    fn create(
        &self,
        client_id: &str,
        endpoint: &BrokerEndpoint,
        events: UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Transport> {
        Arc::new(MqttTransport::new(client_id, endpoint.clone(), events))
    }
}
