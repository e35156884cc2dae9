//! MQTT transport backed by rumqttc

use super::transport::{Publisher, Transport, TransportEvent, TransportLink};
use crate::config::BrokerConfig;
use crate::peer_id::PeerId;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// MQTT broker transport.
///
/// Every `connect` builds a fresh client with a clean session. rumqttc's
/// own reconnect-on-poll behaviour is not used: the first event loop error
/// ends the session and is reported as `Disconnected`.
pub struct MqttTransport {
    config: BrokerConfig,
    client_id: String,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig, peer_id: &PeerId) -> Self {
        let client_id = format!("{}{}", config.client_id_prefix, peer_id);
        Self { config, client_id }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username, password);
        }

        if self.config.use_tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        options
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, subscriptions: &[String]) -> Result<TransportLink> {
        info!(
            "Connecting to MQTT broker {}:{} as {} (tls={})",
            self.config.host, self.config.port, self.client_id, self.config.use_tls
        );

        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), REQUEST_CHANNEL_CAPACITY);

        tokio::time::timeout(self.config.connect_timeout(), wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                Error::OperationTimeout(format!(
                    "MQTT connect to {}:{} timed out",
                    self.config.host, self.config.port
                ))
            })??;

        for topic in subscriptions {
            client
                .subscribe(topic.as_str(), QoS::AtMostOnce)
                .await
                .map_err(|e| Error::Transport(format!("Failed to subscribe to {}: {}", topic, e)))?;
        }

        let (event_tx, events) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        tokio::spawn(pump_events(eventloop, event_tx, closing.clone()));

        info!("MQTT connected: {}", self.client_id);

        Ok(TransportLink {
            publisher: Arc::new(MqttPublisher { client, closing }),
            events,
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("MQTT ConnAck: {:?}", ack.code);
                return Ok(());
            }
            Ok(_) => continue,
            Err(e) => return Err(Error::Transport(format!("MQTT connect failed: {}", e))),
        }
    }
}

async fn pump_events(
    mut eventloop: EventLoop,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    closing: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if event_tx.send(event).is_err() {
                    debug!("MQTT event receiver dropped, stopping pump");
                    return;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if !closing.load(Ordering::SeqCst) {
                    warn!("MQTT connection lost: {}", e);
                    let _ = event_tx.send(TransportEvent::Disconnected {
                        reason: e.to_string(),
                    });
                }
                return;
            }
        }
    }
}

struct MqttPublisher {
    client: AsyncClient,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::NotConnected("MQTT session closed".to_string()));
        }
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| Error::Transport(format!("Failed to publish to {}: {}", topic, e)))
    }

    async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The event loop may already be gone; nothing left to tear down then
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect after loop exit: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_uses_prefix() {
        let transport = MqttTransport::new(BrokerConfig::default(), &PeerId::new("peer_1234"));
        assert_eq!(transport.client_id(), "peerlink_peer_1234");
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_ms: 2000,
            ..Default::default()
        };
        let transport = MqttTransport::new(config, &PeerId::new("peer_x"));
        let err = transport
            .connect(&["webrtc/signaling".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
