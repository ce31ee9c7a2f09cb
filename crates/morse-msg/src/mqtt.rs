//! ---
//! morse_section: "02-messaging-ipc-data-model"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Envelope schema, codecs and delivery discipline."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
//! MQTT 3.1.1 transport backed by `rumqttc`.
//!
//! The event loop runs on its own task and forwards session events over a
//! channel, so publishes issued by the stage never wait on the stage's own
//! polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use morse_common::config::BrokerConfig;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{ConnectOptions, Delivery, Transport, TransportEvent};
use crate::{MessagingError, Result};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Broker session over a TCP MQTT connection.
pub struct MqttTransport {
    client: AsyncClient,
    client_id: String,
    events: mpsc::Receiver<TransportEvent>,
    closing: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl MqttTransport {
    /// Open a clean session against the configured broker.
    ///
    /// The connection is established lazily by the driver task; the first
    /// event observed is `Connected` or `Disconnected`.
    pub fn connect(broker: &BrokerConfig, options: ConnectOptions) -> Self {
        let mut mqtt = MqttOptions::new(options.client_id.clone(), broker.host.clone(), broker.port);
        mqtt.set_keep_alive(broker.keep_alive);
        mqtt.set_clean_session(true);
        if let Some(will) = options.last_will {
            mqtt.set_last_will(rumqttc::LastWill::new(
                will.topic,
                will.payload.to_vec(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }

        let (client, eventloop) = AsyncClient::new(mqtt, broker.channel_capacity);
        let (tx, events) = mpsc::channel(broker.channel_capacity);
        let closing = Arc::new(AtomicBool::new(false));
        let driver = tokio::spawn(drive(
            eventloop,
            tx,
            closing.clone(),
            broker.reconnect_delay,
            options.client_id.clone(),
        ));
        info!(client_id = %options.client_id, host = %broker.host, port = broker.port, "mqtt session starting");

        Self {
            client,
            client_id: options.client_id,
            events,
            closing,
            driver: Some(driver),
        }
    }
}

async fn drive(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<TransportEvent>,
    closing: Arc<AtomicBool>,
    reconnect_delay: Duration,
    client_id: String,
) {
    let mut connected_once = false;
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let reconnect = connected_once;
                connected_once = true;
                debug!(client_id = %client_id, reconnect, "broker accepted session");
                TransportEvent::Connected { reconnect }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Delivery(Delivery {
                topic: publish.topic,
                payload: publish.payload,
            }),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(client_id = %client_id, "disconnect flushed");
                return;
            }
            Ok(_) => continue,
            Err(err) => {
                if closing.load(Ordering::Acquire) {
                    return;
                }
                warn!(client_id = %client_id, error = %err, "mqtt connection error; retrying");
                if tx.send(TransportEvent::Disconnected(err.to_string())).await.is_err() {
                    return;
                }
                tokio::time::sleep(reconnect_delay).await;
                continue;
            }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&mut self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .await
            .map_err(|err| MessagingError::Transport(err.to_string()))
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|err| MessagingError::Transport(err.to_string()))
    }

    async fn poll(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        self.client
            .disconnect()
            .await
            .map_err(|err| MessagingError::Transport(err.to_string()))?;
        if let Some(driver) = self.driver.take() {
            // Drain so queued publishes (the Offline status) reach the broker.
            while tokio::time::timeout(DISCONNECT_TIMEOUT, self.events.recv())
                .await
                .ok()
                .flatten()
                .is_some()
            {}
            if tokio::time::timeout(DISCONNECT_TIMEOUT, driver).await.is_err() {
                warn!(client_id = %self.client_id, "mqtt driver did not stop in time");
            }
        }
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}
