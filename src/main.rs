//! Junction gateway - live traffic junction feed with enrichment
//!
//! Subscribes to the upstream junction feed, reconciles it into a keyed
//! store and fans updates out to the presentation bridge and history sinks.
//!
//! Module structure:
//! - `domain/` - Core types (JunctionRecord, feed wire format, geo helpers)
//! - `io/` - External interfaces (MQTT feed, Gemini, history, egress, Prometheus)
//! - `services/` - Business logic (Reconciler, Registry, Enrichment, Bridge)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use junction_gateway::domain::{GeoPoint, JunctionId, JunctionRecord};
use junction_gateway::infra::{Config, Metrics};
use junction_gateway::io::{
    create_egress_channel, GeminiClient, HistoryRecorder, HistorySink, JsonlHistory, MqttFeed,
    MqttPublisher,
};
use junction_gateway::services::enrichment::{EnrichmentError, EnrichmentKind, RequestId};
use junction_gateway::services::{
    BridgeOptions, EnrichmentDispatcher, Presentation, PresentationBridge, RegistryOptions,
    TextGenerator, TrafficRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Junction gateway - live traffic junction feed
#[derive(Parser, Debug)]
#[command(name = "junction-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

/// Presentation used when MQTT egress is disabled
struct LogPresentation;

impl Presentation for LogPresentation {
    fn on_update(&self, records: &[JunctionRecord]) {
        info!(junctions = %records.len(), "junctions_updated");
    }

    fn on_nearby(&self, centre: GeoPoint, records: &[JunctionRecord]) {
        info!(lat = %centre.lat, lon = %centre.lon, junctions = %records.len(), "junctions_nearby");
    }

    fn on_emergency(&self, record: &JunctionRecord) {
        warn!(
            junction = %record.junction_id,
            density = %record.vehicle_density,
            "emergency_vehicle_detected"
        );
    }

    fn on_analysis(&self, id: RequestId, text: &str) {
        info!(request_id = %id, text = %text, "traffic_analysis");
    }

    fn on_prediction(&self, id: RequestId, text: &str) {
        info!(request_id = %id, text = %text, "traffic_prediction");
    }

    fn on_voice_alert(&self, id: RequestId, junction_id: &JunctionId, text: &str) {
        info!(request_id = %id, junction = %junction_id, text = %text, "voice_alert");
    }

    fn on_enrichment_error(&self, id: RequestId, kind: EnrichmentKind, error: &EnrichmentError) {
        warn!(request_id = %id, kind = %kind.as_str(), error = %error, "enrichment_failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git = %env!("GIT_HASH"), "junction-gateway starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        feed_topic = %config.feed_topic(),
        proximity = ?config.proximity_centre(),
        radius_m = %config.proximity_radius_m(),
        enrichment = %config.enrichment_enabled(),
        egress = %config.egress_enabled(),
        history = %config.history_enabled(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let feed = Arc::new(MqttFeed::new(&config));
    let registry = TrafficRegistry::new(feed, RegistryOptions::from(&config), metrics.clone());

    let generator = GeminiClient::from_config(&config)
        .context("Failed to create Gemini client")?
        .map(|client| Arc::new(client) as Arc<dyn TextGenerator>);
    if generator.is_none() {
        info!("enrichment_disabled");
    }
    let dispatcher =
        EnrichmentDispatcher::new(generator, config.enrichment_timeout_ms(), metrics.clone());

    // Create MQTT egress channel and publisher (if enabled)
    let egress_sender = if config.egress_enabled() {
        let (egress_sender, egress_rx) = create_egress_channel(
            config.egress_buffer_size(),
            config.site_id().to_string(),
            metrics.clone(),
        );
        let publisher = MqttPublisher::new(&config, egress_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
        Some(egress_sender)
    } else {
        None
    };

    let presentation: Arc<dyn Presentation> = match &egress_sender {
        Some(sender) => Arc::new(sender.clone()),
        None => Arc::new(LogPresentation),
    };
    let bridge = PresentationBridge::new(presentation, dispatcher, BridgeOptions::from(&config));
    let bridge_handle = registry.subscribe(Arc::new(bridge));
    info!(handle = %bridge_handle, "presentation_subscribed");

    if config.history_enabled() {
        let mut sinks: Vec<Arc<dyn HistorySink>> = Vec::new();
        if !config.history_file().is_empty() {
            sinks.push(Arc::new(JsonlHistory::new(config.history_file(), metrics.clone())));
        }
        if config.history_mqtt() {
            match &egress_sender {
                Some(sender) => sinks.push(Arc::new(sender.clone())),
                None => warn!("history_mqtt_requires_egress"),
            }
        }
        if !sinks.is_empty() {
            let recorder = HistoryRecorder::new(sinks);
            info!(sinks = %recorder.sink_count(), "history_subscribed");
            registry.subscribe(Arc::new(recorder));
        }
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_registry = registry.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = junction_gateway::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                Some(prom_registry),
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        // First tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("shutdown_signal_received");

    // Closes the upstream feed before egress drains
    registry.unsubscribe_all();
    let _ = shutdown_tx.send(true);
    drop(egress_sender);

    // Let the egress publisher flush
    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("junction-gateway shutdown complete");
    Ok(())
}
