//! MQTT client implementation

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::DirectorError;
use crate::events::ContainerChange;
use crate::mqtt::topics::{Notification, CONTAINER_CHANGED, NODE_CHANGED, NODE_INFO};

/// MQTT broker address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 8883,
            use_tls: true,
            ca_cert_path: None,
        }
    }
}

/// MQTT client wrapper
///
/// Awaiting methods take `&mut self`, the event loop is not `Sync`.
pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttClient {
    /// Create a new MQTT client
    pub async fn new(address: &MqttAddress, client_id: &str) -> Result<Self, DirectorError> {
        if address.host.is_empty() {
            return Err(DirectorError::MqttError("MQTT host is not configured".to_string()));
        }

        let mut options = MqttOptions::new(client_id, &address.host, address.port);
        options.set_keep_alive(Duration::from_secs(30));

        if address.use_tls {
            use rumqttc::{TlsConfiguration, Transport};
            use rustls::ClientConfig;
            use std::sync::Arc;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = address.ca_cert_path {
                let ca_pem = tokio::fs::read(ca_path)
                    .await
                    .map_err(|e| DirectorError::MqttError(format!("Failed to read CA cert {ca_path}: {e}")))?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        let (client, eventloop) = AsyncClient::new(options, 10);

        Ok(Self { client, eventloop })
    }

    /// Subscribe to both node notification topics
    pub async fn subscribe_notifications(&mut self) -> Result<(), DirectorError> {
        for topic in [NODE_CHANGED, NODE_INFO] {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| DirectorError::MqttError(e.to_string()))?;
            info!("Subscribed to: {}", topic);
        }
        Ok(())
    }

    pub async fn publish_notification(&mut self, notification: Notification) -> Result<(), DirectorError> {
        self.client
            .publish(
                notification.topic(),
                QoS::AtLeastOnce,
                false,
                notification.node_id().to_string(),
            )
            .await
            .map_err(|e| DirectorError::MqttError(e.to_string()))?;
        debug!("Published {:?}", notification);
        Ok(())
    }

    pub async fn publish_container_change(&mut self, change: &ContainerChange) -> Result<(), DirectorError> {
        let payload = serde_json::to_vec(change)?;
        self.client
            .publish(CONTAINER_CHANGED, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| DirectorError::MqttError(e.to_string()))?;
        debug!("Published container change to: {}", CONTAINER_CHANGED);
        Ok(())
    }

    /// Poll for events
    pub async fn poll(&mut self) -> Result<Option<MqttMessage>, DirectorError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = publish.topic.clone();
                let payload = publish.payload.to_vec();

                debug!("Received message on topic: {}", topic);

                Ok(Some(MqttMessage { topic, payload }))
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                Ok(None)
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("MQTT poll error: {}", e);
                Err(DirectorError::MqttError(e.to_string()))
            }
        }
    }

    /// Publish one notification and drive the connection until the broker
    /// acknowledged it
    pub async fn notify_once(
        mut self,
        notification: Notification,
        timeout: Duration,
    ) -> Result<(), DirectorError> {
        self.publish_notification(notification).await?;

        let acked = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(DirectorError::MqttError(e.to_string())),
                }
            }
        };
        tokio::time::timeout(timeout, acked)
            .await
            .map_err(|_| DirectorError::MqttError("Timed out waiting for the broker".to_string()))??;

        self.disconnect().await
    }

    /// Disconnect from broker
    pub async fn disconnect(&mut self) -> Result<(), DirectorError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| DirectorError::MqttError(e.to_string()))?;
        info!("MQTT disconnected");
        Ok(())
    }
}

/// MQTT message
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MqttMessage {
    pub fn notification(&self) -> Option<Notification> {
        Notification::parse(&self.topic, &self.payload)
    }
}
