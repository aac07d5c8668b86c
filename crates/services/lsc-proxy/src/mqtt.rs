//! MQTT transport for the bus
//!
//! [`MqttBus`] is the publish/subscribe handle; [`MqttConnection`] drives the
//! rumqttc event loop, turning CONNACKs and inbound publishes into
//! [`BusEvent`]s. Transport errors are retried; a broker refusal is not.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::bus::{BusError, BusEvent, MessageBus};
use crate::config::{BusConfig, MqttSettings};
use crate::shutdown::ShutdownToken;

/// Pause before polling again after a transport error
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Requests buffered while the connection is down
const REQUEST_CAPACITY: usize = 64;

/// Publish/subscribe handle
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

/// Connection driver; must be run for the handle to make progress
pub struct MqttConnection {
    eventloop: EventLoop,
    hostname: String,
    port: u16,
}

impl MqttBus {
    pub fn new(settings: &MqttSettings, bus: &BusConfig) -> (Self, MqttConnection) {
        let mut options = MqttOptions::new(&bus.client_id, &settings.hostname, settings.port);
        options.set_keep_alive(Duration::from_secs(bus.keep_alive_secs));
        options.set_credentials(&settings.username, &settings.password);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        (
            Self { client },
            MqttConnection {
                eventloop,
                hostname: settings.hostname.clone(),
                port: settings.port,
            },
        )
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BusError::Client(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BusError::Client(e.to_string()))
    }
}

impl MqttConnection {
    /// Poll the connection until shutdown
    ///
    /// Returns an error only when the broker refuses the connection or the
    /// event consumer has gone away.
    pub async fn run(
        mut self,
        events: mpsc::Sender<BusEvent>,
        shutdown: ShutdownToken,
    ) -> Result<(), BusError> {
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                polled = self.eventloop.poll() => polled,
            };

            let event = match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(BusError::Refused(format!("{:?}", ack.code)));
                    }
                    tracing::info!(
                        "Successfully connected to broker: {} on port {}",
                        self.hostname,
                        self.port
                    );
                    BusEvent::Connected
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => BusEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                },
                Ok(_) => continue,
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(BusError::Refused(format!("{:?}", code)));
                }
                Err(e) => {
                    tracing::warn!(
                        "MQTT connection to {}:{} failed: {}, retrying",
                        self.hostname,
                        self.port,
                        e
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue,
                    }
                }
            };

            if events.send(event).await.is_err() {
                return Err(BusError::Client("event consumer closed".to_string()));
            }
        }
    }
}
