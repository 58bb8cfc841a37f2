//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::geo::GeoPoint;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_FEED_TOPIC: &str = "traffic_junctions";
pub const DEFAULT_PROXIMITY_RADIUS_M: f64 = 100.0;
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Topic carrying full junction snapshots
    #[serde(default = "default_feed_topic")]
    pub topic: String,
    /// Bounded queue between the MQTT eventloop and the registry
    #[serde(default = "default_feed_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { topic: default_feed_topic(), channel_capacity: default_feed_channel_capacity() }
    }
}

fn default_feed_topic() -> String {
    DEFAULT_FEED_TOPIC.to_string()
}

fn default_feed_channel_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Ignore records whose timestamp is older than the stored one
    #[serde(default = "default_true")]
    pub reject_stale: bool,
    /// Evict junctions not refreshed within this window (0 keeps them forever)
    #[serde(default)]
    pub evict_after_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { reject_stale: true, evict_after_secs: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProximityConfig {
    /// Centre latitude; proximity filtering is off unless both coordinates are set
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default = "default_radius_m")]
    pub radius_m: f64,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self { latitude: None, longitude: None, radius_m: default_radius_m() }
    }
}

fn default_radius_m() -> f64 {
    DEFAULT_PROXIMITY_RADIUS_M
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Falls back to the GEMINI_API_KEY environment variable
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_enrichment_timeout_ms")]
    pub timeout_ms: u64,
    /// Request pattern analysis and prediction on updates
    #[serde(default = "default_true")]
    pub analysis: bool,
    #[serde(default = "default_analysis_min_interval_ms")]
    pub analysis_min_interval_ms: u64,
    #[serde(default = "default_true")]
    pub voice_alerts: bool,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            model: default_model(),
            endpoint: default_endpoint(),
            timeout_ms: default_enrichment_timeout_ms(),
            analysis: true,
            analysis_min_interval_ms: default_analysis_min_interval_ms(),
            voice_alerts: true,
        }
    }
}

fn default_model() -> String {
    "gemini-pro".to_string()
}

fn default_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_enrichment_timeout_ms() -> u64 {
    30_000
}

fn default_analysis_min_interval_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// JSONL file for history records (empty disables the file sink)
    #[serde(default = "default_history_file")]
    pub file: String,
    /// Also publish history records over MQTT egress
    #[serde(default)]
    pub mqtt: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { enabled: true, file: default_history_file(), mqtt: false }
    }
}

fn default_history_file() -> String {
    "traffic_history.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_egress_buffer")]
    pub buffer_size: usize,
    #[serde(default = "default_updates_topic")]
    pub updates_topic: String,
    #[serde(default = "default_nearby_topic")]
    pub nearby_topic: String,
    #[serde(default = "default_emergencies_topic")]
    pub emergencies_topic: String,
    #[serde(default = "default_enrichment_topic")]
    pub enrichment_topic: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: default_egress_buffer(),
            updates_topic: default_updates_topic(),
            nearby_topic: default_nearby_topic(),
            emergencies_topic: default_emergencies_topic(),
            enrichment_topic: default_enrichment_topic(),
        }
    }
}

fn default_egress_buffer() -> usize {
    1000
}

fn default_updates_topic() -> String {
    "junctions/updates".to_string()
}

fn default_nearby_topic() -> String {
    "junctions/nearby".to_string()
}

fn default_emergencies_topic() -> String {
    "junctions/emergencies".to_string()
}

fn default_enrichment_topic() -> String {
    "junctions/enrichment".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Deployment identifier, used in MQTT client ids and metric labels
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "junction-gateway".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub proximity: ProximityConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    feed_topic: String,
    feed_channel_capacity: usize,
    store_reject_stale: bool,
    store_evict_after_secs: u64,
    proximity_centre: Option<GeoPoint>,
    proximity_radius_m: f64,
    enrichment_enabled: bool,
    enrichment_api_key: Option<String>,
    enrichment_model: String,
    enrichment_endpoint: String,
    enrichment_timeout_ms: u64,
    enrichment_analysis: bool,
    enrichment_analysis_min_interval_ms: u64,
    enrichment_voice_alerts: bool,
    history_enabled: bool,
    history_file: String,
    history_mqtt: bool,
    egress_enabled: bool,
    egress_buffer_size: usize,
    egress_updates_topic: String,
    egress_nearby_topic: String,
    egress_emergencies_topic: String,
    egress_enrichment_topic: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let enrichment = EnrichmentConfig::default();
        let history = HistoryConfig::default();
        let egress = EgressConfig::default();
        Self {
            site_id: default_site_id(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            feed_topic: default_feed_topic(),
            feed_channel_capacity: default_feed_channel_capacity(),
            store_reject_stale: true,
            store_evict_after_secs: 0,
            proximity_centre: None,
            proximity_radius_m: DEFAULT_PROXIMITY_RADIUS_M,
            enrichment_enabled: enrichment.enabled,
            enrichment_api_key: api_key_from_env(),
            enrichment_model: enrichment.model,
            enrichment_endpoint: enrichment.endpoint,
            enrichment_timeout_ms: enrichment.timeout_ms,
            enrichment_analysis: enrichment.analysis,
            enrichment_analysis_min_interval_ms: enrichment.analysis_min_interval_ms,
            enrichment_voice_alerts: enrichment.voice_alerts,
            history_enabled: history.enabled,
            history_file: history.file,
            history_mqtt: history.mqtt,
            egress_enabled: egress.enabled,
            egress_buffer_size: egress.buffer_size,
            egress_updates_topic: egress.updates_topic,
            egress_nearby_topic: egress.nearby_topic,
            egress_emergencies_topic: egress.emergencies_topic,
            egress_enrichment_topic: egress.enrichment_topic,
            metrics_interval_secs: default_metrics_interval(),
            prometheus_port: default_prometheus_port(),
            config_file: "default".to_string(),
        }
    }
}

fn api_key_from_env() -> Option<String> {
    env::var(GEMINI_API_KEY_ENV).ok().filter(|k| !k.trim().is_empty())
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, path.display().to_string())
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> anyhow::Result<Self> {
        let proximity = toml_config.proximity;
        let proximity_centre = match (proximity.latitude, proximity.longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            (None, None) => None,
            _ => anyhow::bail!("[proximity] needs both latitude and longitude"),
        };
        if !(proximity.radius_m.is_finite() && proximity.radius_m >= 0.0) {
            anyhow::bail!("[proximity] radius_m must be a non-negative number");
        }

        let enrichment = toml_config.enrichment;
        let api_key = enrichment.api_key.filter(|k| !k.trim().is_empty()).or_else(api_key_from_env);

        Ok(Self {
            site_id: toml_config.site.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            feed_topic: toml_config.feed.topic,
            feed_channel_capacity: toml_config.feed.channel_capacity,
            store_reject_stale: toml_config.store.reject_stale,
            store_evict_after_secs: toml_config.store.evict_after_secs,
            proximity_centre,
            proximity_radius_m: proximity.radius_m,
            enrichment_enabled: enrichment.enabled,
            enrichment_api_key: api_key,
            enrichment_model: enrichment.model,
            enrichment_endpoint: enrichment.endpoint,
            enrichment_timeout_ms: enrichment.timeout_ms,
            enrichment_analysis: enrichment.analysis,
            enrichment_analysis_min_interval_ms: enrichment.analysis_min_interval_ms,
            enrichment_voice_alerts: enrichment.voice_alerts,
            history_enabled: toml_config.history.enabled,
            history_file: toml_config.history.file,
            history_mqtt: toml_config.history.mqtt,
            egress_enabled: toml_config.egress.enabled,
            egress_buffer_size: toml_config.egress.buffer_size,
            egress_updates_topic: toml_config.egress.updates_topic,
            egress_nearby_topic: toml_config.egress.nearby_topic,
            egress_emergencies_topic: toml_config.egress.emergencies_topic,
            egress_enrichment_topic: toml_config.egress.enrichment_topic,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        })
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn feed_topic(&self) -> &str {
        &self.feed_topic
    }

    pub fn feed_channel_capacity(&self) -> usize {
        self.feed_channel_capacity
    }

    pub fn store_reject_stale(&self) -> bool {
        self.store_reject_stale
    }

    pub fn store_evict_after_secs(&self) -> u64 {
        self.store_evict_after_secs
    }

    pub fn proximity_centre(&self) -> Option<GeoPoint> {
        self.proximity_centre
    }

    pub fn proximity_radius_m(&self) -> f64 {
        self.proximity_radius_m
    }

    pub fn enrichment_enabled(&self) -> bool {
        self.enrichment_enabled
    }

    pub fn enrichment_api_key(&self) -> Option<&str> {
        self.enrichment_api_key.as_deref()
    }

    pub fn enrichment_model(&self) -> &str {
        &self.enrichment_model
    }

    pub fn enrichment_endpoint(&self) -> &str {
        &self.enrichment_endpoint
    }

    pub fn enrichment_timeout_ms(&self) -> u64 {
        self.enrichment_timeout_ms
    }

    pub fn enrichment_analysis(&self) -> bool {
        self.enrichment_analysis
    }

    pub fn enrichment_analysis_min_interval_ms(&self) -> u64 {
        self.enrichment_analysis_min_interval_ms
    }

    pub fn enrichment_voice_alerts(&self) -> bool {
        self.enrichment_voice_alerts
    }

    pub fn history_enabled(&self) -> bool {
        self.history_enabled
    }

    pub fn history_file(&self) -> &str {
        &self.history_file
    }

    pub fn history_mqtt(&self) -> bool {
        self.history_mqtt
    }

    pub fn egress_enabled(&self) -> bool {
        self.egress_enabled
    }

    pub fn egress_buffer_size(&self) -> usize {
        self.egress_buffer_size
    }

    pub fn egress_updates_topic(&self) -> &str {
        &self.egress_updates_topic
    }

    pub fn egress_nearby_topic(&self) -> &str {
        &self.egress_nearby_topic
    }

    pub fn egress_emergencies_topic(&self) -> &str {
        &self.egress_emergencies_topic
    }

    pub fn egress_enrichment_topic(&self) -> &str {
        &self.egress_enrichment_topic
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to toggle enrichment
    #[cfg(test)]
    pub fn with_enrichment_enabled(mut self, enabled: bool) -> Self {
        self.enrichment_enabled = enabled;
        self
    }

    /// Builder method for tests to set the API key
    #[cfg(test)]
    pub fn with_enrichment_api_key(mut self, key: &str) -> Self {
        self.enrichment_api_key = Some(key.to_string());
        self
    }

    #[cfg(test)]
    pub fn with_enrichment_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.enrichment_timeout_ms = timeout_ms;
        self
    }

    /// Builder method for tests to set the proximity centre
    #[cfg(test)]
    pub fn with_proximity_centre(mut self, centre: GeoPoint) -> Self {
        self.proximity_centre = Some(centre);
        self
    }
}
