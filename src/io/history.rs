//! Traffic history - write-only log of junction measurements
//!
//! Records are keyed by `traffic_history/{junctionId}/{timestampMillis}`.
//! Sinks are fire-and-forget: a failed write is logged and never reaches
//! the caller.

use crate::domain::types::{FeedError, JunctionId, JunctionRecord};
use crate::infra::metrics::Metrics;
use crate::services::registry::Subscriber;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

pub const HISTORY_ROOT: &str = "traffic_history";

/// History key for one measurement
pub fn history_path(record: &JunctionRecord) -> String {
    format!("{HISTORY_ROOT}/{}/{}", record.junction_id, record.timestamp_ms)
}

pub trait HistorySink: Send + Sync {
    fn log_history(&self, record: &JunctionRecord);
}

#[derive(Serialize)]
struct HistoryLine<'a> {
    path: String,
    record: &'a JunctionRecord,
}

/// Appends history records to a JSONL file
pub struct JsonlHistory {
    file_path: PathBuf,
    metrics: Arc<Metrics>,
    // Serializes appends from concurrent deliveries
    write_lock: Mutex<()>,
}

impl JsonlHistory {
    pub fn new(file_path: impl AsRef<Path>, metrics: Arc<Metrics>) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        info!(file_path = %file_path.display(), "history_file_initialized");
        Self { file_path, metrics, write_lock: Mutex::new(()) }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        writeln!(file, "{}", line)
    }
}

impl HistorySink for JsonlHistory {
    fn log_history(&self, record: &JunctionRecord) {
        let line = HistoryLine { path: history_path(record), record };
        let json = match serde_json::to_string(&line) {
            Ok(json) => json,
            Err(e) => {
                error!(junction = %record.junction_id, error = %e, "history_serialize_failed");
                return;
            }
        };

        match self.append_line(&json) {
            Ok(()) => {
                self.metrics.record_history_written();
                debug!(path = %line.path, bytes = %json.len(), "history_written");
            }
            Err(e) => {
                error!(
                    junction = %record.junction_id,
                    file = %self.file_path.display(),
                    error = %e,
                    "history_write_failed"
                );
            }
        }
    }
}

/// Registry subscriber that logs each measurement once
///
/// Updates carry every stored junction; a record is only logged when its
/// timestamp moved past the one logged last for that junction.
pub struct HistoryRecorder {
    sinks: Vec<Arc<dyn HistorySink>>,
    last_logged: Mutex<FxHashMap<JunctionId, u64>>,
}

impl HistoryRecorder {
    pub fn new(sinks: Vec<Arc<dyn HistorySink>>) -> Self {
        Self { sinks, last_logged: Mutex::new(FxHashMap::default()) }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    fn advanced(&self, record: &JunctionRecord) -> bool {
        let mut last_logged = self.last_logged.lock();
        match last_logged.get(&record.junction_id) {
            Some(&ts) if ts >= record.timestamp_ms => false,
            _ => {
                last_logged.insert(record.junction_id.clone(), record.timestamp_ms);
                true
            }
        }
    }
}

impl Subscriber for HistoryRecorder {
    fn on_update(&self, records: &[JunctionRecord]) {
        for record in records.iter().filter(|r| self.advanced(r)) {
            for sink in &self.sinks {
                sink.log_history(record);
            }
        }
    }

    fn on_emergency(&self, _record: &JunctionRecord) {}

    fn on_error(&self, error: &FeedError) {
        debug!(error = %error, "history_feed_error");
    }
}
