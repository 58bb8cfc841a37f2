//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to hand presentation events and history
//! records to the MQTT publisher. Uses a bounded mpsc channel to prevent
//! unbounded memory growth; when it is full the message is dropped and
//! counted.

use crate::domain::geo::GeoPoint;
use crate::domain::stats::DensityStats;
use crate::domain::types::{epoch_ms, JunctionId, JunctionRecord};
use crate::infra::metrics::Metrics;
use crate::io::history::{history_path, HistorySink};
use crate::services::bridge::Presentation;
use crate::services::enrichment::{EnrichmentError, EnrichmentKind, RequestId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Full reconciled store after an update
    Update(UpdatePayload),
    /// Junctions near the configured centre
    Nearby(NearbyPayload),
    /// Emergency vehicle at a junction
    Emergency(EmergencyPayload),
    /// Completed or failed text enrichment
    Enrichment(EnrichmentPayload),
    /// History record, published under its history path
    History(HistoryPayload),
}

impl EgressMessage {
    fn kind(&self) -> &'static str {
        match self {
            EgressMessage::Update(_) => "update",
            EgressMessage::Nearby(_) => "nearby",
            EgressMessage::Emergency(_) => "emergency",
            EgressMessage::Enrichment(_) => "enrichment",
            EgressMessage::History(_) => "history",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdatePayload {
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    pub junctions: Vec<JunctionRecord>,
    pub stats: DensityStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyPayload {
    pub site: String,
    pub ts: u64,
    pub centre: GeoPoint,
    pub junctions: Vec<JunctionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyPayload {
    pub site: String,
    pub ts: u64,
    pub junction: JunctionRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentPayload {
    pub site: String,
    pub ts: u64,
    /// Request id, time-ordered
    pub id: String,
    /// pattern_analysis, prediction or voice_alert
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub junction_id: Option<JunctionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPayload {
    /// Topic the record is published to
    #[serde(skip)]
    pub path: String,
    #[serde(flatten)]
    pub record: JunctionRecord,
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    metrics: Arc<Metrics>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, site_id, metrics }
    }

    fn send(&self, msg: EgressMessage) {
        let kind = msg.kind();
        if let Err(e) = self.tx.try_send(msg) {
            if matches!(e, mpsc::error::TrySendError::Full(_)) {
                self.metrics.record_egress_dropped();
            }
            debug!(kind = %kind, error = %e, "egress_dropped");
        }
    }

    fn send_enrichment(
        &self,
        id: RequestId,
        kind: EnrichmentKind,
        junction_id: Option<&JunctionId>,
        outcome: Result<&str, &EnrichmentError>,
    ) {
        let (text, error) = match outcome {
            Ok(text) => (Some(text.to_string()), None),
            Err(e) => (None, Some(e.to_string())),
        };
        self.send(EgressMessage::Enrichment(EnrichmentPayload {
            site: self.site_id.clone(),
            ts: epoch_ms(),
            id: id.to_string(),
            kind: kind.as_str(),
            junction_id: junction_id.cloned(),
            text,
            error,
        }));
    }
}

impl Presentation for EgressSender {
    fn on_update(&self, records: &[JunctionRecord]) {
        self.send(EgressMessage::Update(UpdatePayload {
            site: self.site_id.clone(),
            ts: epoch_ms(),
            junctions: records.to_vec(),
            stats: DensityStats::from_records(records),
        }));
    }

    fn on_nearby(&self, centre: GeoPoint, records: &[JunctionRecord]) {
        self.send(EgressMessage::Nearby(NearbyPayload {
            site: self.site_id.clone(),
            ts: epoch_ms(),
            centre,
            junctions: records.to_vec(),
        }));
    }

    fn on_emergency(&self, record: &JunctionRecord) {
        self.send(EgressMessage::Emergency(EmergencyPayload {
            site: self.site_id.clone(),
            ts: epoch_ms(),
            junction: record.clone(),
        }));
    }

    fn on_analysis(&self, id: RequestId, text: &str) {
        self.send_enrichment(id, EnrichmentKind::PatternAnalysis, None, Ok(text));
    }

    fn on_prediction(&self, id: RequestId, text: &str) {
        self.send_enrichment(id, EnrichmentKind::Prediction, None, Ok(text));
    }

    fn on_voice_alert(&self, id: RequestId, junction_id: &JunctionId, text: &str) {
        self.send_enrichment(id, EnrichmentKind::VoiceAlert, Some(junction_id), Ok(text));
    }

    fn on_enrichment_error(&self, id: RequestId, kind: EnrichmentKind, error: &EnrichmentError) {
        self.send_enrichment(id, kind, None, Err(error));
    }
}

impl HistorySink for EgressSender {
    fn log_history(&self, record: &JunctionRecord) {
        self.send(EgressMessage::History(HistoryPayload {
            path: history_path(record),
            record: record.clone(),
        }));
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
    metrics: Arc<Metrics>,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (EgressSender::new(tx, site_id, metrics), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_carries_stats() {
        let (sender, mut rx) = create_egress_channel(8, "blr".to_string(), Arc::new(Metrics::new()));
        sender.on_update(&[
            JunctionRecord::new("J1", 0.0, 0.0, 20),
            JunctionRecord::new("J2", 0.0, 0.0, 80),
        ]);

        match rx.try_recv().unwrap() {
            EgressMessage::Update(payload) => {
                assert_eq!(payload.site, "blr");
                assert_eq!(payload.junctions.len(), 2);
                let json = serde_json::to_value(&payload).unwrap();
                assert_eq!(json["junctions"][1]["junctionId"], "J2");
                assert!(json.get("stats").is_some());
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let metrics = Arc::new(Metrics::new());
        let (sender, _rx) = create_egress_channel(1, "blr".to_string(), metrics.clone());
        let record = JunctionRecord::new("J1", 0.0, 0.0, 90).with_emergency(true);

        sender.on_emergency(&record);
        sender.on_emergency(&record);
        sender.on_emergency(&record);

        assert_eq!(metrics.egress_dropped_total(), 2);
    }

    #[test]
    fn test_history_payload_path_and_body() {
        let (sender, mut rx) = create_egress_channel(8, "blr".to_string(), Arc::new(Metrics::new()));
        sender.log_history(&JunctionRecord::new("J7", 1.0, 2.0, 33).with_timestamp(42));

        match rx.try_recv().unwrap() {
            EgressMessage::History(payload) => {
                assert_eq!(payload.path, "traffic_history/J7/42");
                let json = serde_json::to_value(&payload).unwrap();
                assert_eq!(json["junctionId"], "J7");
                assert_eq!(json["timestamp"], 42);
                assert!(json.get("path").is_none());
            }
            other => panic!("expected history, got {other:?}"),
        }
    }

    #[test]
    fn test_enrichment_error_payload() {
        let (sender, mut rx) = create_egress_channel(8, "blr".to_string(), Arc::new(Metrics::new()));
        sender.on_enrichment_error(
            RequestId::new(),
            EnrichmentKind::Prediction,
            &EnrichmentError::Status(503),
        );

        match rx.try_recv().unwrap() {
            EgressMessage::Enrichment(payload) => {
                assert_eq!(payload.kind, "prediction");
                assert!(payload.text.is_none());
                assert!(payload.error.is_some());
            }
            other => panic!("expected enrichment, got {other:?}"),
        }
    }
}
