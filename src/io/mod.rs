//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for the upstream junction feed
//! - `gemini` - HTTP client for text enrichment
//! - `history` - Write-only traffic history sinks
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `mqtt_egress` - MQTT publisher for egress events
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress_channel;
pub mod gemini;
pub mod history;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;

// Re-export commonly used types
pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender};
pub use gemini::GeminiClient;
pub use history::{history_path, HistoryRecorder, HistorySink, JsonlHistory};
pub use mqtt::MqttFeed;
pub use mqtt_egress::MqttPublisher;
