//! Notification worker
//!
//! Forwards node notifications from the broker into the supervisors and
//! republishes local container changes.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::ContainerEvents;
use crate::mqtt::client::{MqttAddress, MqttClient};
use crate::mqtt::topics::Notification;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Notification worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// MQTT broker address
    pub broker_address: MqttAddress,

    pub client_id: String,

    /// Reconnect delay on failure
    pub reconnect: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            broker_address: MqttAddress::default(),
            client_id: format!("supercompose-director-{}", Uuid::new_v4()),
            reconnect: CooldownOptions {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
            },
        }
    }
}

/// Where incoming notifications go
#[derive(Debug, Clone)]
pub struct NotificationSinks {
    pub node_changed: mpsc::Sender<Uuid>,
    pub node_info: mpsc::Sender<Uuid>,
}

impl NotificationSinks {
    /// Hand a notification to the matching supervisor
    pub async fn dispatch(&self, notification: Notification) {
        let (sink, node_id) = match notification {
            Notification::NodeChanged(id) => (&self.node_changed, id),
            Notification::NodeInfo(id) => (&self.node_info, id),
        };
        if sink.send(node_id).await.is_err() {
            warn!("No listener for {:?}", notification);
        }
    }
}

/// Run the notification worker
pub async fn run<S, F>(
    options: &Options,
    sinks: &NotificationSinks,
    events: &ContainerEvents,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    if options.broker_address.host.is_empty() {
        info!("MQTT host not configured, notification worker will not start.");
        return;
    }

    info!("Notification worker starting...");

    let mut changes = events.subscribe();
    let mut reconnect_attempts: u32 = 0;

    loop {
        info!(
            "Connecting to MQTT broker: {}:{}",
            options.broker_address.host, options.broker_address.port
        );
        let connected = match MqttClient::new(&options.broker_address, &options.client_id).await {
            Ok(mut client) => match client.subscribe_notifications().await {
                Ok(()) => Some(client),
                Err(e) => {
                    error!("Failed to subscribe to notifications: {}", e);
                    None
                }
            },
            Err(e) => {
                error!("Failed to create MQTT client: {}", e);
                None
            }
        };

        if let Some(mut client) = connected {
            loop {
                tokio::select! {
                    _ = &mut shutdown_signal => {
                        info!("Notification worker shutting down...");
                        let _ = client.disconnect().await;
                        return;
                    }
                    polled = client.poll() => match polled {
                        Ok(Some(message)) => {
                            reconnect_attempts = 0;
                            match message.notification() {
                                Some(notification) => sinks.dispatch(notification).await,
                                None => debug!("Ignoring message on topic: {}", message.topic),
                            }
                        }
                        Ok(None) => reconnect_attempts = 0,
                        Err(e) => {
                            warn!("MQTT poll error: {}, reconnecting...", e);
                            break;
                        }
                    },
                    change = changes.recv() => match change {
                        Ok(change) => {
                            if let Err(e) = client.publish_container_change(&change).await {
                                warn!("Failed to publish container change: {}", e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Dropped {} container changes", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Container change channel closed");
                            changes = events.subscribe();
                        }
                    },
                }
            }
        }

        let delay = calc_exp_backoff(&options.reconnect, reconnect_attempts);
        reconnect_attempts = reconnect_attempts.saturating_add(1);
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Notification worker shutting down...");
                return;
            }
            _ = sleep_fn(delay) => {}
        }
    }
}
