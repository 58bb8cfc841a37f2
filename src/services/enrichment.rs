//! Enrichment dispatcher - asynchronous text generation over traffic state
//!
//! Each request becomes exactly one spawned task calling the configured
//! `TextGenerator` under a per-request timeout. There is no retry and no
//! coalescing. Every result carries the `RequestId` of its request so callers
//! can discard results that arrive after newer ones.

use crate::domain::types::JunctionRecord;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Enrichment errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnrichmentError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Server returned status {0}")]
    Status(u16),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Timed out after {0} ms")]
    Timeout(u64),
    #[error("Text generation is not configured")]
    NotConfigured,
}

/// Text generation capability behind the dispatcher
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a response for the given prompt
    async fn generate(&self, prompt: &str) -> Result<String, EnrichmentError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnrichmentKind {
    PatternAnalysis,
    Prediction,
    VoiceAlert,
}

impl EnrichmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentKind::PatternAnalysis => "pattern_analysis",
            EnrichmentKind::Prediction => "prediction",
            EnrichmentKind::VoiceAlert => "voice_alert",
        }
    }
}

#[derive(Debug, Clone)]
pub enum EnrichmentRequest {
    PatternAnalysis(Vec<JunctionRecord>),
    Prediction(Vec<JunctionRecord>),
    VoiceAlert(JunctionRecord),
}

impl EnrichmentRequest {
    pub fn kind(&self) -> EnrichmentKind {
        match self {
            EnrichmentRequest::PatternAnalysis(_) => EnrichmentKind::PatternAnalysis,
            EnrichmentRequest::Prediction(_) => EnrichmentKind::Prediction,
            EnrichmentRequest::VoiceAlert(_) => EnrichmentKind::VoiceAlert,
        }
    }

    pub fn prompt(&self) -> String {
        match self {
            EnrichmentRequest::PatternAnalysis(records) => pattern_prompt(records),
            EnrichmentRequest::Prediction(records) => prediction_prompt(records),
            EnrichmentRequest::VoiceAlert(record) => voice_alert_prompt(record),
        }
    }
}

pub fn pattern_prompt(records: &[JunctionRecord]) -> String {
    let mut prompt =
        String::from("Analyze the following traffic data and suggest the best route:\n");
    for r in records {
        let _ = writeln!(
            prompt,
            "Junction {}: Density={}, GreenLight={}s, Emergency={}",
            r.junction_id, r.vehicle_density, r.green_light_duration_secs, r.emergency_vehicle_present
        );
    }
    prompt
}

pub fn prediction_prompt(records: &[JunctionRecord]) -> String {
    let mut prompt = String::from(
        "Based on the following historical traffic data, predict traffic conditions for the next hour:\n",
    );
    for r in records {
        let _ = writeln!(
            prompt,
            "Time: {}, Junction {}: Density={}",
            r.timestamp_ms, r.junction_id, r.vehicle_density
        );
    }
    prompt
}

pub fn voice_alert_prompt(record: &JunctionRecord) -> String {
    format!(
        "Generate a concise voice alert for the following traffic condition: Junction {} has {}% congestion. {}",
        record.junction_id,
        record.vehicle_density,
        if record.emergency_vehicle_present { "Emergency vehicle detected!" } else { "" }
    )
}

/// Time-ordered identifier of one enrichment request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    pub id: RequestId,
    pub kind: EnrichmentKind,
    pub outcome: Result<String, EnrichmentError>,
}

/// Pending result of `EnrichmentDispatcher::dispatch`
pub struct EnrichmentTicket {
    id: RequestId,
    kind: EnrichmentKind,
    rx: oneshot::Receiver<EnrichmentResult>,
}

impl EnrichmentTicket {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> EnrichmentKind {
        self.kind
    }

    /// Wait for the single result of this request
    pub async fn wait(self) -> EnrichmentResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => EnrichmentResult {
                id: self.id,
                kind: self.kind,
                outcome: Err(EnrichmentError::UnexpectedResponse(
                    "enrichment task ended without a result".to_string(),
                )),
            },
        }
    }
}

#[derive(Clone)]
pub struct EnrichmentDispatcher {
    generator: Option<Arc<dyn TextGenerator>>,
    /// Per-request timeout, zero disables it
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl EnrichmentDispatcher {
    pub fn new(
        generator: Option<Arc<dyn TextGenerator>>,
        timeout_ms: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { generator, timeout: Duration::from_millis(timeout_ms), metrics }
    }

    pub fn is_configured(&self) -> bool {
        self.generator.is_some()
    }

    /// Start a request and return a ticket for its result
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dispatch(&self, request: EnrichmentRequest) -> EnrichmentTicket {
        let kind = request.kind();
        let (tx, rx) = oneshot::channel();
        let id = self.dispatch_with(request, move |result| {
            let _ = tx.send(result);
        });
        EnrichmentTicket { id, kind, rx }
    }

    /// Start a request and deliver its result to `callback` exactly once
    ///
    /// The callback runs on the spawned request task. Must be called from
    /// within a Tokio runtime.
    pub fn dispatch_with<F>(&self, request: EnrichmentRequest, callback: F) -> RequestId
    where
        F: FnOnce(EnrichmentResult) + Send + 'static,
    {
        let id = RequestId::new();
        let kind = request.kind();
        let prompt = request.prompt();
        let generator = self.generator.clone();
        let timeout = self.timeout;
        let metrics = self.metrics.clone();

        debug!(request_id = %id, kind = %kind.as_str(), prompt_len = %prompt.len(), "enrichment_dispatched");

        tokio::spawn(async move {
            let start = Instant::now();
            let outcome = match generator {
                Some(generator) => run_generator(generator.as_ref(), &prompt, timeout).await,
                None => Err(EnrichmentError::NotConfigured),
            };
            let latency_ms = start.elapsed().as_millis() as u64;

            match &outcome {
                Ok(text) => {
                    metrics.record_enrichment_success(latency_ms);
                    debug!(
                        request_id = %id,
                        kind = %kind.as_str(),
                        latency_ms = %latency_ms,
                        response_len = %text.len(),
                        "enrichment_completed"
                    );
                }
                Err(e) => {
                    metrics.record_enrichment_failure(matches!(e, EnrichmentError::Timeout(_)));
                    warn!(request_id = %id, kind = %kind.as_str(), error = %e, "enrichment_failed");
                }
            }

            callback(EnrichmentResult { id, kind, outcome });
        });

        id
    }
}

async fn run_generator(
    generator: &dyn TextGenerator,
    prompt: &str,
    timeout: Duration,
) -> Result<String, EnrichmentError> {
    if timeout.is_zero() {
        return generator.generate(prompt).await;
    }
    match tokio::time::timeout(timeout, generator.generate(prompt)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(EnrichmentError::Timeout(timeout.as_millis() as u64)),
    }
}
