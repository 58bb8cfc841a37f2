//! End-to-end pipeline: feed -> registry -> bridge + history

use async_trait::async_trait;
use junction_gateway::domain::types::parse_snapshot;
use junction_gateway::domain::{FeedError, FeedEvent, GeoPoint, JunctionId, JunctionRecord};
use junction_gateway::infra::Metrics;
use junction_gateway::io::{HistoryRecorder, HistorySink, JsonlHistory};
use junction_gateway::services::enrichment::{EnrichmentError, EnrichmentKind, RequestId};
use junction_gateway::services::registry::FeedConnection;
use junction_gateway::services::{
    BridgeOptions, EnrichmentDispatcher, Presentation, PresentationBridge, RegistryOptions,
    TextGenerator, TrafficFeed, TrafficRegistry,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct MemoryConnection {
    closed: Arc<AtomicUsize>,
}

impl FeedConnection for MemoryConnection {
    fn close(self: Box<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MemoryFeed {
    closed: Arc<AtomicUsize>,
    sender: Mutex<Option<mpsc::Sender<FeedEvent>>>,
}

impl MemoryFeed {
    async fn push(&self, payload: &str) {
        let event = match parse_snapshot(payload.as_bytes(), 0) {
            Ok(snapshot) => FeedEvent::Snapshot(snapshot),
            Err(e) => FeedEvent::Error(e),
        };
        let sender = self.sender.lock().clone().unwrap();
        sender.send(event).await.unwrap();
    }
}

impl TrafficFeed for MemoryFeed {
    fn open(
        &self,
        _topic: &str,
        events: mpsc::Sender<FeedEvent>,
    ) -> anyhow::Result<Box<dyn FeedConnection>> {
        *self.sender.lock() = Some(events);
        Ok(Box::new(MemoryConnection { closed: self.closed.clone() }))
    }
}

struct Canned;

#[async_trait]
impl TextGenerator for Canned {
    async fn generate(&self, prompt: &str) -> Result<String, EnrichmentError> {
        Ok(format!("{} chars", prompt.len()))
    }

    fn backend_name(&self) -> &'static str {
        "canned"
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Shown {
    Update(Vec<String>),
    Nearby(Vec<String>),
    Emergency(String),
    Analysis,
    Prediction,
    VoiceAlert(String),
    EnrichmentError(EnrichmentKind),
}

struct Screen {
    tx: mpsc::UnboundedSender<Shown>,
}

fn ids(records: &[JunctionRecord]) -> Vec<String> {
    records.iter().map(|r| r.junction_id.to_string()).collect()
}

impl Presentation for Screen {
    fn on_update(&self, records: &[JunctionRecord]) {
        let _ = self.tx.send(Shown::Update(ids(records)));
    }

    fn on_nearby(&self, _centre: GeoPoint, records: &[JunctionRecord]) {
        let _ = self.tx.send(Shown::Nearby(ids(records)));
    }

    fn on_emergency(&self, record: &JunctionRecord) {
        let _ = self.tx.send(Shown::Emergency(record.junction_id.to_string()));
    }

    fn on_analysis(&self, _id: RequestId, _text: &str) {
        let _ = self.tx.send(Shown::Analysis);
    }

    fn on_prediction(&self, _id: RequestId, _text: &str) {
        let _ = self.tx.send(Shown::Prediction);
    }

    fn on_voice_alert(&self, _id: RequestId, junction_id: &JunctionId, _text: &str) {
        let _ = self.tx.send(Shown::VoiceAlert(junction_id.to_string()));
    }

    fn on_enrichment_error(&self, _id: RequestId, kind: EnrichmentKind, _error: &EnrichmentError) {
        let _ = self.tx.send(Shown::EnrichmentError(kind));
    }
}

#[derive(Default)]
struct Errors(Mutex<Vec<FeedError>>);

impl junction_gateway::services::Subscriber for Errors {
    fn on_update(&self, _records: &[JunctionRecord]) {}

    fn on_emergency(&self, _record: &JunctionRecord) {}

    fn on_error(&self, error: &FeedError) {
        self.0.lock().push(error.clone());
    }
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<Shown>, count: usize) -> Vec<Shown> {
    let mut shown = Vec::with_capacity(count);
    while shown.len() < count {
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        match next {
            Ok(Some(item)) => shown.push(item),
            _ => break,
        }
    }
    shown
}

const FIRST_PUSH: &str = r#"{
    "-A1": {"junctionId":"J1","latitude":12.9716,"longitude":77.5946,"vehicleDensity":85,
            "greenLightDuration":60,"timestamp":1000,"emergencyVehiclePresent":true},
    "-A2": {"junctionId":"J2","latitude":13.05,"longitude":77.70,"vehicleDensity":20,
            "greenLightDuration":30,"timestamp":1000,"emergencyVehiclePresent":false},
    "-A3": {"junctionId":"J3","latitude":"north"}
}"#;

#[tokio::test]
async fn test_feed_reaches_presentation_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let history_file = dir.path().join("history.jsonl");
    let metrics = Arc::new(Metrics::new());

    let feed = Arc::new(MemoryFeed::default());
    let registry = TrafficRegistry::new(feed.clone(), RegistryOptions::default(), metrics.clone());

    // History first so its writes land before the bridge sees the update
    let history: Arc<dyn HistorySink> = Arc::new(JsonlHistory::new(&history_file, metrics.clone()));
    registry.subscribe(Arc::new(HistoryRecorder::new(vec![history])));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = EnrichmentDispatcher::new(Some(Arc::new(Canned)), 1_000, metrics.clone());
    let options = BridgeOptions {
        centre: Some(GeoPoint::new(12.9716, 77.5946)),
        radius_m: 500.0,
        analysis: true,
        analysis_min_interval: Duration::from_secs(60),
        voice_alerts: true,
    };
    registry.subscribe(Arc::new(PresentationBridge::new(Arc::new(Screen { tx }), dispatcher, options)));
    assert!(registry.is_active());

    feed.push(FIRST_PUSH).await;

    let shown = collect(&mut rx, 6).await;
    assert_eq!(shown.len(), 6);
    assert_eq!(shown[0], Shown::Update(vec!["J1".to_string(), "J2".to_string()]));
    assert_eq!(shown[1], Shown::Nearby(vec!["J1".to_string()]));
    // Enrichment results arrive in any order
    assert!(shown.contains(&Shown::Emergency("J1".to_string())));
    assert!(shown.contains(&Shown::Analysis));
    assert!(shown.contains(&Shown::Prediction));
    assert!(shown.contains(&Shown::VoiceAlert("J1".to_string())));

    let content = std::fs::read_to_string(&history_file).unwrap();
    assert_eq!(content.lines().count(), 2);
    assert!(content.contains("traffic_history/J1/1000"));
    assert_eq!(metrics.malformed_total(), 1);

    // Only J2 moves forward; analysis stays throttled
    feed.push(
        r#"[
            {"junctionId":"J1","latitude":12.9716,"longitude":77.5946,"vehicleDensity":85,"timestamp":1000},
            {"junctionId":"J2","latitude":13.05,"longitude":77.70,"vehicleDensity":35,"timestamp":2000}
        ]"#,
    )
    .await;

    let shown = collect(&mut rx, 2).await;
    assert_eq!(shown[0], Shown::Update(vec!["J1".to_string(), "J2".to_string()]));
    assert_eq!(shown[1], Shown::Nearby(vec!["J1".to_string()]));

    let content = std::fs::read_to_string(&history_file).unwrap();
    assert_eq!(content.lines().count(), 3);
    assert!(content.contains("traffic_history/J2/2000"));

    let stored = registry.snapshot();
    assert_eq!(stored.len(), 2);
    let j2 = stored.iter().find(|r| r.junction_id.as_str() == "J2").unwrap();
    assert_eq!(j2.vehicle_density, 35);

    registry.unsubscribe_all();
    assert!(!registry.is_active());
    assert!(registry.snapshot().is_empty());
    assert_eq!(feed.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_payload_errors_reach_subscribers() {
    let metrics = Arc::new(Metrics::new());
    let feed = Arc::new(MemoryFeed::default());
    let registry = TrafficRegistry::new(feed.clone(), RegistryOptions::default(), metrics.clone());

    let errors = Arc::new(Errors::default());
    registry.subscribe(errors.clone());

    feed.push("not json").await;

    for _ in 0..100 {
        if !errors.0.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let seen = errors.0.lock().clone();
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], FeedError::Payload(_)));
    assert!(registry.is_active());
}
