//! MQTT publisher for egress events
//!
//! Publishes pipeline output to MQTT topics for downstream consumers:
//! - junctions/updates - Reconciled store with density summary (QoS 0)
//! - junctions/nearby - Junctions near the configured centre (QoS 0)
//! - junctions/emergencies - Emergency vehicle notifications (QoS 1)
//! - junctions/enrichment - Analysis, prediction and voice alert text (QoS 0)
//! - traffic_history/{junctionId}/{timestampMillis} - History records (QoS 1)

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    eventloop_task: JoinHandle<()>,
    rx: mpsc::Receiver<EgressMessage>,
    updates_topic: String,
    nearby_topic: String,
    emergencies_topic: String,
    enrichment_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("{}-egress-{}", config.site_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);
        mqttoptions.set_max_packet_size(4 * 1024 * 1024, 4 * 1024 * 1024);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        let eventloop_task = tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            eventloop_task,
            rx,
            updates_topic: config.egress_updates_topic().to_string(),
            nearby_topic: config.egress_nearby_topic().to_string(),
            emergencies_topic: config.egress_emergencies_topic().to_string(),
            enrichment_topic: config.egress_enrichment_topic().to_string(),
        }
    }

    /// Run the publisher loop
    ///
    /// Processes messages from the channel and publishes to MQTT.
    /// Runs until shutdown signal is received or every sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            updates = %self.updates_topic,
            nearby = %self.nearby_topic,
            emergencies = %self.emergencies_topic,
            enrichment = %self.enrichment_topic,
            "mqtt_egress_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        break;
                    }
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.publish_message(msg).await,
                    None => {
                        info!("mqtt_egress_channel_closed");
                        break;
                    }
                },
            }
        }

        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "mqtt_egress_disconnect_failed");
        }
        // Give the eventloop a moment to flush queued publishes and the DISCONNECT
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.eventloop_task.abort();
    }

    async fn publish_message(&self, msg: EgressMessage) {
        match msg {
            EgressMessage::Update(payload) => {
                self.publish_json(&self.updates_topic, QoS::AtMostOnce, &payload, "update").await;
            }
            EgressMessage::Nearby(payload) => {
                self.publish_json(&self.nearby_topic, QoS::AtMostOnce, &payload, "nearby").await;
            }
            EgressMessage::Emergency(payload) => {
                // At-least-once: operators must see every emergency
                self.publish_json(&self.emergencies_topic, QoS::AtLeastOnce, &payload, "emergency")
                    .await;
            }
            EgressMessage::Enrichment(payload) => {
                self.publish_json(&self.enrichment_topic, QoS::AtMostOnce, &payload, "enrichment")
                    .await;
            }
            EgressMessage::History(payload) => {
                self.publish_json(&payload.path, QoS::AtLeastOnce, &payload, "history").await;
            }
        }
    }

    async fn publish_json<T: Serialize>(&self, topic: &str, qos: QoS, payload: &T, kind: &str) {
        let json = match serde_json::to_vec(payload) {
            Ok(json) => json,
            Err(e) => {
                error!(kind = %kind, error = %e, "mqtt_egress_serialize_failed");
                return;
            }
        };
        if let Err(e) = self.client.publish(topic, qos, false, json).await {
            debug!(kind = %kind, topic = %topic, error = %e, "mqtt_egress_publish_failed");
        }
    }
}
