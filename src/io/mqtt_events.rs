//! MQTT publisher for route events
//!
//! Bridges the engine's outbound channel to the notification dispatcher:
//! - <prefix>/events - Route and attendance events
//! - <prefix>/metrics - Periodic metrics snapshots (QoS 0)
//!
//! Attendance-bearing events go out at QoS 1 so a dropped connection cannot
//! lose a pickup or absence notice; informational events are QoS 0.

use crate::infra::config::Config;
use crate::io::event_channel::OutboundMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives messages from the event channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<OutboundMessage>,
    events_topic: String,
    metrics_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<OutboundMessage>) -> Self {
        let client_id = format!("ridecheck-{}-{}", config.bus_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_events_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_events_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_events_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, events_topic: config.events_topic(), metrics_topic: config.metrics_topic() }
    }

    /// Run the publisher loop until shutdown, then drain what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(events = %self.events_topic, metrics = %self.metrics_topic, "mqtt_events_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_events_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.publish_message(msg).await,
                    None => {
                        info!("mqtt_events_channel_closed");
                        return;
                    }
                },
            }
        }
    }

    async fn publish_message(&self, msg: OutboundMessage) {
        let (topic, qos, kind) = match &msg {
            OutboundMessage::Event(payload) => {
                let qos =
                    if payload.event.is_attendance() { QoS::AtLeastOnce } else { QoS::AtMostOnce };
                (&self.events_topic, qos, payload.event.as_str())
            }
            OutboundMessage::Metrics(_) => (&self.metrics_topic, QoS::AtMostOnce, "metrics"),
        };

        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(kind = %kind, error = %e, "mqtt_events_serialize_failed");
                return;
            }
        };

        if let Err(e) = self.client.publish(topic, qos, false, json.as_bytes()).await {
            if qos == QoS::AtLeastOnce {
                error!(kind = %kind, error = %e, "mqtt_events_publish_failed");
            } else {
                debug!(kind = %kind, error = %e, "mqtt_events_publish_failed");
            }
        }
    }
}
