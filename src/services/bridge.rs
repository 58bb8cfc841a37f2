//! Presentation bridge - forwards reconciled state and enrichment output
//!
//! Subscribes to the registry like any other observer. Updates and
//! emergencies are forwarded immediately; text enrichment is requested in the
//! background and routed back to the presentation when it completes.

use crate::domain::geo::{filter_within_radius, GeoPoint};
use crate::domain::types::{FeedError, JunctionId, JunctionRecord};
use crate::infra::config::Config;
use crate::services::enrichment::{
    EnrichmentDispatcher, EnrichmentError, EnrichmentKind, EnrichmentRequest, EnrichmentResult,
    RequestId,
};
use crate::services::registry::Subscriber;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outward boundary for everything the pipeline produces
pub trait Presentation: Send + Sync {
    fn on_update(&self, records: &[JunctionRecord]);

    /// Subset of an update within the proximity radius of `centre`
    fn on_nearby(&self, _centre: GeoPoint, _records: &[JunctionRecord]) {}

    fn on_emergency(&self, record: &JunctionRecord);

    fn on_analysis(&self, _id: RequestId, _text: &str) {}

    fn on_prediction(&self, _id: RequestId, _text: &str) {}

    fn on_voice_alert(&self, _id: RequestId, _junction_id: &JunctionId, _text: &str) {}

    fn on_enrichment_error(&self, _id: RequestId, _kind: EnrichmentKind, _error: &EnrichmentError) {}
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub centre: Option<GeoPoint>,
    pub radius_m: f64,
    pub analysis: bool,
    pub analysis_min_interval: Duration,
    pub voice_alerts: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            centre: None,
            radius_m: crate::infra::config::DEFAULT_PROXIMITY_RADIUS_M,
            analysis: true,
            analysis_min_interval: Duration::ZERO,
            voice_alerts: true,
        }
    }
}

impl From<&Config> for BridgeOptions {
    fn from(config: &Config) -> Self {
        Self {
            centre: config.proximity_centre(),
            radius_m: config.proximity_radius_m(),
            analysis: config.enrichment_analysis(),
            analysis_min_interval: Duration::from_millis(config.enrichment_analysis_min_interval_ms()),
            voice_alerts: config.enrichment_voice_alerts(),
        }
    }
}

/// Limits analysis + prediction requests to one pair per interval
struct AnalysisThrottle {
    last_dispatch: Option<Instant>,
    min_interval: Duration,
}

impl AnalysisThrottle {
    fn new(min_interval: Duration) -> Self {
        Self { last_dispatch: None, min_interval }
    }

    /// Returns true and records the dispatch if the interval has elapsed
    fn try_acquire(&mut self) -> bool {
        match self.last_dispatch {
            Some(last) if last.elapsed() < self.min_interval => false,
            _ => {
                self.last_dispatch = Some(Instant::now());
                true
            }
        }
    }
}

/// Newest analysis and prediction ids already shown
#[derive(Default)]
struct LatestShown {
    analysis: Option<RequestId>,
    prediction: Option<RequestId>,
}

impl LatestShown {
    /// Request ids are time-ordered; an older result than the one shown is stale
    fn accept(&mut self, kind: EnrichmentKind, id: RequestId) -> bool {
        let slot = match kind {
            EnrichmentKind::PatternAnalysis => &mut self.analysis,
            EnrichmentKind::Prediction => &mut self.prediction,
            EnrichmentKind::VoiceAlert => return true,
        };
        match slot {
            Some(shown) if *shown > id => false,
            _ => {
                *slot = Some(id);
                true
            }
        }
    }
}

pub struct PresentationBridge {
    presentation: Arc<dyn Presentation>,
    dispatcher: EnrichmentDispatcher,
    options: BridgeOptions,
    throttle: Mutex<AnalysisThrottle>,
    latest: Arc<Mutex<LatestShown>>,
}

impl PresentationBridge {
    pub fn new(
        presentation: Arc<dyn Presentation>,
        dispatcher: EnrichmentDispatcher,
        options: BridgeOptions,
    ) -> Self {
        let throttle = Mutex::new(AnalysisThrottle::new(options.analysis_min_interval));
        Self {
            presentation,
            dispatcher,
            options,
            throttle,
            latest: Arc::new(Mutex::new(LatestShown::default())),
        }
    }

    fn request(&self, request: EnrichmentRequest) -> RequestId {
        let presentation = self.presentation.clone();
        let latest = self.latest.clone();
        let junction_id = match &request {
            EnrichmentRequest::VoiceAlert(record) => Some(record.junction_id.clone()),
            _ => None,
        };
        self.dispatcher.dispatch_with(request, move |result| {
            route_result(presentation.as_ref(), &latest, junction_id.as_ref(), result);
        })
    }
}

fn route_result(
    presentation: &dyn Presentation,
    latest: &Mutex<LatestShown>,
    junction_id: Option<&JunctionId>,
    result: EnrichmentResult,
) {
    if !latest.lock().accept(result.kind, result.id) {
        debug!(request_id = %result.id, kind = %result.kind.as_str(), "enrichment_result_superseded");
        return;
    }

    match (result.kind, result.outcome) {
        (kind, Err(e)) => presentation.on_enrichment_error(result.id, kind, &e),
        (EnrichmentKind::PatternAnalysis, Ok(text)) => presentation.on_analysis(result.id, &text),
        (EnrichmentKind::Prediction, Ok(text)) => presentation.on_prediction(result.id, &text),
        (EnrichmentKind::VoiceAlert, Ok(text)) => match junction_id {
            Some(id) => presentation.on_voice_alert(result.id, id, &text),
            None => warn!(request_id = %result.id, "voice_alert_without_junction"),
        },
    }
}

impl Subscriber for PresentationBridge {
    fn on_update(&self, records: &[JunctionRecord]) {
        self.presentation.on_update(records);

        if let Some(centre) = self.options.centre {
            let nearby = filter_within_radius(records, centre, self.options.radius_m);
            self.presentation.on_nearby(centre, &nearby);
        }

        if !self.options.analysis || records.is_empty() || !self.dispatcher.is_configured() {
            return;
        }
        if !self.throttle.lock().try_acquire() {
            debug!(junctions = %records.len(), "analysis_throttled");
            return;
        }
        self.request(EnrichmentRequest::PatternAnalysis(records.to_vec()));
        self.request(EnrichmentRequest::Prediction(records.to_vec()));
    }

    fn on_emergency(&self, record: &JunctionRecord) {
        self.presentation.on_emergency(record);

        if self.options.voice_alerts && self.dispatcher.is_configured() {
            self.request(EnrichmentRequest::VoiceAlert(record.clone()));
        }
    }

    fn on_error(&self, error: &FeedError) {
        warn!(error = %error, "presentation_feed_error");
    }
}
