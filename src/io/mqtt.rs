//! MQTT feed - upstream junction snapshots over MQTT
//!
//! Each `open` creates its own client and eventloop task. The topic is
//! (re)subscribed on every ConnAck so a broker restart does not silently
//! stop the feed. Connection loss is reported once per outage.

use crate::domain::types::{epoch_ms, parse_snapshot, FeedError, FeedEvent};
use crate::infra::config::Config;
use crate::services::registry::{FeedConnection, TrafficFeed};
use anyhow::Context;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, SubscribeReasonCode,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct BrokerOptions {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    client_prefix: String,
}

/// `TrafficFeed` backed by an MQTT broker
pub struct MqttFeed {
    broker: BrokerOptions,
    connections: AtomicU64,
}

impl MqttFeed {
    pub fn new(config: &Config) -> Self {
        Self {
            broker: BrokerOptions {
                host: config.mqtt_host().to_string(),
                port: config.mqtt_port(),
                username: config.mqtt_username().map(str::to_string),
                password: config.mqtt_password().map(str::to_string),
                client_prefix: config.site_id().to_string(),
            },
            connections: AtomicU64::new(0),
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let seq = self.connections.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("{}-feed-{}-{}", self.broker.client_prefix, std::process::id(), seq);
        let mut options = MqttOptions::new(client_id, &self.broker.host, self.broker.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        // Full snapshots can be large
        options.set_max_packet_size(4 * 1024 * 1024, 4 * 1024 * 1024);

        if let (Some(username), Some(password)) = (&self.broker.username, &self.broker.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

impl TrafficFeed for MqttFeed {
    fn open(
        &self,
        topic: &str,
        events: mpsc::Sender<FeedEvent>,
    ) -> anyhow::Result<Box<dyn FeedConnection>> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("MQTT feed must be opened inside a Tokio runtime")?;

        let (client, eventloop) = AsyncClient::new(self.mqtt_options(), 100);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = runtime.spawn(run_feed(client.clone(), eventloop, topic.to_string(), events, stop_rx));

        info!(topic = %topic, host = %self.broker.host, port = %self.broker.port, "mqtt_feed_opening");
        Ok(Box::new(MqttConnection { stop: stop_tx, task }))
    }
}

/// Live MQTT subscription created by `MqttFeed::open`
struct MqttConnection {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FeedConnection for MqttConnection {
    fn close(self: Box<Self>) {
        // Drop does the work
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if self.stop.send(true).is_err() {
            // Feed task already gone
            self.task.abort();
        }
    }
}

async fn run_feed(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topic: String,
    events: mpsc::Sender<FeedEvent>,
    mut stop: watch::Receiver<bool>,
) {
    // Report each outage once, not on every reconnect attempt
    let mut outage_reported = false;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                // A dropped sender means nobody can stop us any more
                if changed.is_err() || *stop.borrow() {
                    disconnect(&client, &mut eventloop).await;
                    info!(topic = %topic, "mqtt_feed_closed");
                    return;
                }
            }
            result = eventloop.poll() => {
                let event = match result {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(topic = %topic, "mqtt_feed_connected");
                        outage_reported = false;
                        match client.try_subscribe(&topic, QoS::AtLeastOnce) {
                            Ok(()) => None,
                            Err(e) => {
                                error!(topic = %topic, error = %e, "mqtt_feed_subscribe_failed");
                                Some(FeedEvent::Error(FeedError::Transport(e.to_string())))
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        suback_error(&topic, &ack.return_codes).map(FeedEvent::Error)
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!(topic = %publish.topic, bytes = %publish.payload.len(), "mqtt_feed_publish");
                        Some(event_from_payload(&publish.payload))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        let feed_error = feed_error_from(&e);
                        let report = !outage_reported;
                        if report {
                            warn!(topic = %topic, error = %e, "mqtt_feed_connection_lost");
                            outage_reported = true;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        report.then_some(FeedEvent::Error(feed_error))
                    }
                };

                if let Some(event) = event {
                    if events.send(event).await.is_err() {
                        debug!(topic = %topic, "mqtt_feed_receiver_dropped");
                        disconnect(&client, &mut eventloop).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Send DISCONNECT and drive the eventloop until it goes out
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "mqtt_feed_disconnect_failed");
        return;
    }
    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_millis(500), drain).await;
}

/// Turn one publish payload into a feed event
pub fn event_from_payload(payload: &[u8]) -> FeedEvent {
    match parse_snapshot(payload, epoch_ms()) {
        Ok(snapshot) => FeedEvent::Snapshot(snapshot),
        Err(e) => FeedEvent::Error(e),
    }
}

fn feed_error_from(error: &ConnectionError) -> FeedError {
    match error {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword),
        ) => FeedError::Permission(format!("broker refused connection: {code:?}")),
        other => FeedError::Transport(other.to_string()),
    }
}

fn suback_error(topic: &str, codes: &[SubscribeReasonCode]) -> Option<FeedError> {
    codes
        .iter()
        .any(|c| matches!(c, SubscribeReasonCode::Failure))
        .then(|| FeedError::Permission(format!("subscription to {topic} refused")))
}
