//! Density summary over a set of junction records

use crate::domain::geo::{classify_density, Congestion};
use crate::domain::types::JunctionRecord;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DensityStats {
    pub samples: usize,
    pub average: f64,
    pub peak: i64,
    pub light: usize,
    pub moderate: usize,
    pub heavy: usize,
}

impl DensityStats {
    pub fn from_records(records: &[JunctionRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let mut stats = Self { samples: records.len(), peak: i64::MIN, ..Self::default() };
        let mut sum = 0i64;

        for record in records {
            sum = sum.saturating_add(record.vehicle_density);
            stats.peak = stats.peak.max(record.vehicle_density);
            match classify_density(record.vehicle_density) {
                Congestion::Light => stats.light += 1,
                Congestion::Moderate => stats.moderate += 1,
                Congestion::Heavy => stats.heavy += 1,
            }
        }

        stats.average = sum as f64 / records.len() as f64;
        stats
    }
}
